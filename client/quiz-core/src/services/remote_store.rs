use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;

use super::api_client::ApiClient;
use super::session_service::SessionStore;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::track_session_operation;
use crate::models::wire::{parse_session, parse_session_list, SessionPayload};
use crate::models::{AttemptState, CompletionData, SessionPatch, StoredSession};

const SESSIONS: &str = "quiz-sessions";

/// Session store backed by the Quiz Session API.
#[derive(Clone, Debug)]
pub struct RemoteSessionStore {
    api: ApiClient,
    ttl: Duration,
}

impl RemoteSessionStore {
    pub fn new(api: ApiClient, ttl: Duration) -> Self {
        Self { api, ttl }
    }

    fn session(&self, value: Value) -> GatewayResult<StoredSession> {
        parse_session(value, Utc::now(), self.ttl)
    }

    async fn create_remote(&self, state: &AttemptState) -> GatewayResult<StoredSession> {
        let body = self
            .api
            .post_json(&[SESSIONS], &SessionPayload::from(state))
            .await?;
        let stored = self.session(body)?;
        tracing::info!("Created session {} for quiz {}", stored.id, state.quiz_id);
        Ok(stored)
    }

    async fn replace_remote(&self, id: &str, state: &AttemptState) -> GatewayResult<StoredSession> {
        let body = self
            .api
            .put_json(&[SESSIONS, id], &SessionPayload::from(state))
            .await?;
        self.session(body)
    }
}

#[async_trait]
impl SessionStore for RemoteSessionStore {
    fn name(&self) -> &'static str {
        "remote"
    }

    /// PUT when the session is known (by id or by quiz), POST otherwise.
    async fn save(&self, state: &AttemptState) -> GatewayResult<StoredSession> {
        track_session_operation("save", self.name(), async {
            let known_id = match &state.session_id {
                Some(id) => Some(id.clone()),
                None => self
                    .find_active_for_quiz(&state.quiz_id)
                    .await?
                    .map(|s| s.id),
            };

            match known_id {
                Some(id) => match self.replace_remote(&id, state).await {
                    Err(GatewayError::NotFound(_)) => {
                        tracing::warn!("Session {} vanished on the server, recreating", id);
                        self.create_remote(state).await
                    }
                    other => other,
                },
                None => self.create_remote(state).await,
            }
        })
        .await
    }

    async fn load_active(&self) -> GatewayResult<Vec<StoredSession>> {
        track_session_operation("load_active", self.name(), async {
            let body = self.api.get_json(&[SESSIONS, "active"]).await?;
            let sessions = parse_session_list(body, Utc::now(), self.ttl)?;
            Ok(sessions
                .into_iter()
                .filter(|s| s.state.is_active() && !s.is_expired)
                .collect())
        })
        .await
    }

    async fn get(&self, id: &str) -> GatewayResult<StoredSession> {
        track_session_operation("get", self.name(), async {
            let body = self.api.get_json(&[SESSIONS, id]).await?;
            self.session(body)
        })
        .await
    }

    async fn update(&self, id: &str, patch: &SessionPatch) -> GatewayResult<StoredSession> {
        track_session_operation("update", self.name(), async {
            let body = self.api.put_json(&[SESSIONS, id], patch).await?;
            self.session(body)
        })
        .await
    }

    async fn delete(&self, id: &str) -> GatewayResult<()> {
        track_session_operation("delete", self.name(), self.api.delete(&[SESSIONS, id])).await
    }

    async fn complete(&self, id: &str, data: &CompletionData) -> GatewayResult<StoredSession> {
        track_session_operation("complete", self.name(), async {
            let body = self.api.post_json(&[SESSIONS, id, "complete"], data).await?;
            let stored = self.session(body)?;
            tracing::info!("Completed session {} with score {}", id, data.score);
            Ok(stored)
        })
        .await
    }
}
