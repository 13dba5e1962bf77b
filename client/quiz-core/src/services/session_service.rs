//! Session persistence gateway.
//!
//! Callers talk to [`SessionGateway`], which routes to the remote Quiz
//! Session API once a learner is authenticated and to the local buffer
//! otherwise. Progress buffered while offline is pushed to the server by
//! [`SessionGateway::reconcile`].

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::local_store::LocalSessionStore;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::record_reconcile;
use crate::models::{
    buffer_key, AttemptState, CompletionData, SessionOrigin, SessionPatch, StoredSession,
    BUFFER_KEY_PREFIX,
};
use crate::utils::keyed_lock::KeyedLocks;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Creates or updates the session of `state.quiz_id`.
    async fn save(&self, state: &AttemptState) -> GatewayResult<StoredSession>;

    /// Active, non-expired sessions.
    async fn load_active(&self) -> GatewayResult<Vec<StoredSession>>;

    async fn get(&self, id: &str) -> GatewayResult<StoredSession>;

    async fn update(&self, id: &str, patch: &SessionPatch) -> GatewayResult<StoredSession>;

    async fn delete(&self, id: &str) -> GatewayResult<()>;

    async fn complete(&self, id: &str, data: &CompletionData) -> GatewayResult<StoredSession>;

    async fn find_active_for_quiz(&self, quiz_id: &str) -> GatewayResult<Option<StoredSession>> {
        let sessions = self.load_active().await?;
        Ok(resolve_most_recent(
            sessions.into_iter().filter(|s| s.quiz_id() == quiz_id),
        ))
    }

    /// Like `save`, but refuses to open a second active session for a quiz.
    async fn create(&self, state: &AttemptState) -> GatewayResult<StoredSession> {
        if let Some(existing) = self.find_active_for_quiz(&state.quiz_id).await? {
            if state.session_id.as_deref() != Some(existing.id.as_str()) {
                let err = GatewayError::DuplicateActive(state.quiz_id.clone());
                tracing::error!("{} (existing session {})", err, existing.id);
                return Err(err);
            }
        }
        self.save(state).await
    }
}

/// Latest activity wins; ties go to the greater id.
pub fn resolve_most_recent<I>(sessions: I) -> Option<StoredSession>
where
    I: IntoIterator<Item = StoredSession>,
{
    sessions.into_iter().max_by(|a, b| {
        a.last_activity_at()
            .cmp(&b.last_activity_at())
            .then_with(|| a.id.cmp(&b.id))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileFailure {
    pub key: String,
    pub error: String,
}

/// Outcome of pushing buffered progress to the server.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub synced: Vec<StoredSession>,
    pub failed: Vec<ReconcileFailure>,
    pub discarded_corrupt: Vec<String>,
    /// The single session to offer for resumption.
    pub resume: Option<StoredSession>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SessionGateway {
    local: LocalSessionStore,
    remote: RwLock<Option<Arc<dyn SessionStore>>>,
    /// Quiz of every server session id seen so far.
    session_quizzes: RwLock<HashMap<String, String>>,
    locks: KeyedLocks,
}

impl SessionGateway {
    pub fn new(local: LocalSessionStore) -> Self {
        Self {
            local,
            remote: RwLock::new(None),
            session_quizzes: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_remote(local: LocalSessionStore, remote: Arc<dyn SessionStore>) -> Self {
        Self {
            local,
            remote: RwLock::new(Some(remote)),
            session_quizzes: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    pub fn local(&self) -> &LocalSessionStore {
        &self.local
    }

    pub async fn is_authenticated(&self) -> bool {
        self.remote.read().await.is_some()
    }

    async fn remote(&self) -> Option<Arc<dyn SessionStore>> {
        self.remote.read().await.clone()
    }

    /// Remote store for `id`. Buffered ids always resolve locally.
    async fn remote_for(&self, id: &str) -> Option<Arc<dyn SessionStore>> {
        if id.starts_with(BUFFER_KEY_PREFIX) {
            return None;
        }
        self.remote().await
    }

    async fn remember(&self, sessions: &[StoredSession]) {
        let mut known = self.session_quizzes.write().await;
        for session in sessions.iter().filter(|s| s.origin == SessionOrigin::Remote) {
            known.insert(session.id.clone(), session.state.quiz_id.clone());
        }
    }

    /// Lock key of the session `id`: the buffer key of its quiz, so saves
    /// and id-based calls on one attempt never interleave.
    async fn lock_key(&self, id: &str) -> String {
        let Some(remote) = self.remote_for(id).await else {
            return id.to_string();
        };
        if let Some(quiz_id) = self.session_quizzes.read().await.get(id) {
            return buffer_key(quiz_id);
        }
        match remote.get(id).await {
            Ok(stored) => {
                self.remember(std::slice::from_ref(&stored)).await;
                stored.state.buffer_key()
            }
            Err(e) => {
                tracing::debug!("Cannot resolve quiz of session {}: {}", id, e);
                id.to_string()
            }
        }
    }

    /// Switches to the remote store and pushes buffered progress to it.
    pub async fn authenticate(
        &self,
        remote: Arc<dyn SessionStore>,
    ) -> GatewayResult<ReconcileReport> {
        *self.remote.write().await = Some(remote);
        tracing::info!("Session gateway authenticated, reconciling local buffer");
        self.reconcile().await
    }

    pub async fn sign_out(&self) {
        *self.remote.write().await = None;
        tracing::info!("Session gateway signed out, buffering locally");
    }

    pub async fn reconcile(&self) -> GatewayResult<ReconcileReport> {
        let remote = self.remote().await.ok_or(GatewayError::Unauthenticated)?;
        let mut report = ReconcileReport::default();
        let keys = self.local.keys().await?;
        tracing::info!("Reconciling {} buffered sessions", keys.len());

        for key in keys {
            let _guard = self.locks.lock(&key).await;

            let mut state = match self.local.read_record(&key).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(GatewayError::CorruptRecord(_)) => {
                    tracing::warn!("Discarding corrupt buffered session {}", key);
                    if let Err(e) = self.local.remove_key(&key).await {
                        tracing::warn!("Failed to remove corrupt record {}: {}", key, e);
                    }
                    record_reconcile("corrupt");
                    report.discarded_corrupt.push(key);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Failed to read buffered session {}: {}", key, e);
                    record_reconcile("failed");
                    report.failed.push(ReconcileFailure {
                        key,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            state.expire_if_stale(Utc::now());
            match remote.save(&state).await {
                Ok(stored) => {
                    if let Err(e) = self.local.remove_key(&key).await {
                        tracing::warn!("Synced {} but failed to clear it locally: {}", key, e);
                    }
                    tracing::info!("Synced buffered session {} as {}", key, stored.id);
                    record_reconcile("synced");
                    report.synced.push(stored);
                }
                Err(e) => {
                    tracing::error!("Failed to sync buffered session {}: {}", key, e);
                    record_reconcile("failed");
                    report.failed.push(ReconcileFailure {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.resume = self.resume_candidate(remote.as_ref(), &report.synced).await;
        tracing::info!(
            "Reconciliation done: {} synced, {} failed, {} corrupt",
            report.synced.len(),
            report.failed.len(),
            report.discarded_corrupt.len()
        );
        Ok(report)
    }

    async fn resume_candidate(
        &self,
        remote: &dyn SessionStore,
        synced: &[StoredSession],
    ) -> Option<StoredSession> {
        let latest_quiz = resolve_most_recent(synced.iter().cloned()).map(|s| s.state.quiz_id);

        let candidate = match latest_quiz {
            Some(quiz_id) => remote.find_active_for_quiz(&quiz_id).await,
            None => Ok(None),
        };
        let candidate = match candidate {
            Ok(Some(session)) => return Some(session),
            Ok(None) => remote.load_active().await.map(resolve_most_recent),
            Err(e) => Err(e),
        };
        candidate.unwrap_or_else(|e| {
            tracing::warn!("Could not fetch resume candidate: {}", e);
            None
        })
    }

    /// Most recent buffered attempt, for unauthenticated learners.
    /// Corrupt records are removed along the way.
    pub async fn resume_local(&self) -> GatewayResult<Option<StoredSession>> {
        let now = Utc::now();
        let mut candidates = Vec::new();
        for key in self.local.keys().await? {
            match self.local.read_record(&key).await {
                Ok(Some(state)) if state.is_active() && !state.is_expired_at(now) => {
                    candidates.push(StoredSession::local(state, now));
                }
                Ok(_) => {}
                Err(GatewayError::CorruptRecord(_)) => {
                    tracing::warn!("Removing corrupt buffered session {}", key);
                    self.local.remove_key(&key).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolve_most_recent(candidates))
    }

    async fn save_unlocked(&self, state: &AttemptState) -> GatewayResult<StoredSession> {
        let Some(remote) = self.remote().await else {
            return self.local.save(state).await;
        };

        match remote.save(state).await {
            Ok(stored) => {
                self.remember(std::slice::from_ref(&stored)).await;
                // Server copy is authoritative now.
                if let Err(e) = self.local.remove_key(&state.buffer_key()).await {
                    tracing::warn!("Failed to clear buffered copy of {}: {}", state.quiz_id, e);
                }
                Ok(stored)
            }
            Err(e) => {
                tracing::warn!(
                    "Remote save of quiz {} failed, buffering locally: {}",
                    state.quiz_id,
                    e
                );
                self.local.save(state).await
            }
        }
    }
}

#[async_trait]
impl SessionStore for SessionGateway {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn save(&self, state: &AttemptState) -> GatewayResult<StoredSession> {
        let _guard = self.locks.lock(&state.buffer_key()).await;
        self.save_unlocked(state).await
    }

    async fn load_active(&self) -> GatewayResult<Vec<StoredSession>> {
        match self.remote().await {
            Some(remote) => {
                let sessions = remote.load_active().await?;
                self.remember(&sessions).await;
                Ok(sessions)
            }
            None => self.local.load_active().await,
        }
    }

    async fn get(&self, id: &str) -> GatewayResult<StoredSession> {
        match self.remote_for(id).await {
            Some(remote) => {
                let stored = remote.get(id).await?;
                self.remember(std::slice::from_ref(&stored)).await;
                Ok(stored)
            }
            None => self.local.get(id).await,
        }
    }

    async fn update(&self, id: &str, patch: &SessionPatch) -> GatewayResult<StoredSession> {
        let _guard = self.locks.lock(&self.lock_key(id).await).await;
        match self.remote_for(id).await {
            Some(remote) => remote.update(id, patch).await,
            None => self.local.update(id, patch).await,
        }
    }

    async fn delete(&self, id: &str) -> GatewayResult<()> {
        let _guard = self.locks.lock(&self.lock_key(id).await).await;
        match self.remote_for(id).await {
            Some(remote) => remote.delete(id).await,
            None => self.local.delete(id).await,
        }
    }

    async fn complete(&self, id: &str, data: &CompletionData) -> GatewayResult<StoredSession> {
        let _guard = self.locks.lock(&self.lock_key(id).await).await;
        match self.remote_for(id).await {
            Some(remote) => remote.complete(id, data).await,
            None => self.local.complete(id, data).await,
        }
    }

    async fn find_active_for_quiz(&self, quiz_id: &str) -> GatewayResult<Option<StoredSession>> {
        let remote = match self.remote().await {
            Some(remote) => remote,
            None => return self.local.find_active_for_quiz(quiz_id).await,
        };
        match remote.find_active_for_quiz(quiz_id).await {
            Ok(Some(session)) => {
                self.remember(std::slice::from_ref(&session)).await;
                Ok(Some(session))
            }
            // Progress buffered after a failed remote save is still resumable.
            Ok(None) => self.local.find_active_for_quiz(quiz_id).await,
            Err(e) => {
                tracing::warn!("Remote lookup for quiz {} failed: {}", quiz_id, e);
                self.local.find_active_for_quiz(quiz_id).await
            }
        }
    }

    async fn create(&self, state: &AttemptState) -> GatewayResult<StoredSession> {
        let _guard = self.locks.lock(&buffer_key(&state.quiz_id)).await;
        if let Some(existing) = self.find_active_for_quiz(&state.quiz_id).await? {
            if state.session_id.as_deref() != Some(existing.id.as_str()) {
                let err = GatewayError::DuplicateActive(state.quiz_id.clone());
                tracing::error!("{} (existing session {})", err, existing.id);
                return Err(err);
            }
        }
        self.save_unlocked(state).await
    }
}
