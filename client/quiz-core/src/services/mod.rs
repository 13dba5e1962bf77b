use std::sync::Arc;

use crate::config::Config;
use crate::error::GatewayResult;
use crate::models::Quiz;
use crate::utils::time::ttl_from_seconds;

use self::api_client::ApiClient;
use self::catalog_service::{playable_quizzes, PortalClient};
use self::filter_service::QuizFilter;
use self::level_service::{AccessPolicy, LevelClassifier};
use self::local_store::LocalSessionStore;
use self::play_service::{PlayerSettings, QuizPlayer};
use self::remote_store::RemoteSessionStore;
use self::session_service::{ReconcileReport, SessionGateway};

pub mod api_client;
pub mod catalog_service;
pub mod countdown;
pub mod filter_service;
pub mod level_service;
pub mod local_store;
pub mod play_service;
pub mod remote_store;
pub mod scoring_service;
pub mod session_service;

/// Everything a client needs to browse and play quizzes.
pub struct CoreState {
    pub config: Config,
    pub api: ApiClient,
    pub portal: PortalClient,
    pub gateway: Arc<SessionGateway>,
    pub filter: QuizFilter,
}

impl CoreState {
    /// Builds the state. With a token in the configuration the gateway
    /// starts authenticated; call [`CoreState::authenticate`] to reconcile.
    pub fn new(config: Config) -> GatewayResult<Self> {
        let api = ApiClient::from_config(&config)?;
        let ttl = ttl_from_seconds(config.session_ttl_seconds);
        let local = LocalSessionStore::new(config.buffer_dir.clone(), ttl);

        let gateway = if api.is_authenticated() {
            let remote = RemoteSessionStore::new(api.clone(), ttl);
            SessionGateway::with_remote(local, Arc::new(remote))
        } else {
            SessionGateway::new(local)
        };

        let filter = QuizFilter::new(
            LevelClassifier::default(),
            AccessPolicy::new(
                config.intermediate_unlock_points,
                config.advanced_unlock_points,
            ),
        );

        tracing::info!(
            "Quiz core ready: api={}, buffer={}, authenticated={}",
            config.api_base_url,
            config.buffer_dir.display(),
            api.is_authenticated()
        );

        Ok(Self {
            portal: PortalClient::new(api.clone()),
            api,
            gateway: Arc::new(gateway),
            filter,
            config,
        })
    }

    /// Signs the learner in and pushes buffered progress to the server.
    pub async fn authenticate(&mut self, token: &str) -> GatewayResult<ReconcileReport> {
        self.api = self.api.clone().with_token(token);
        self.portal = PortalClient::new(self.api.clone());
        let ttl = ttl_from_seconds(self.config.session_ttl_seconds);
        let remote = RemoteSessionStore::new(self.api.clone(), ttl);
        self.gateway.authenticate(Arc::new(remote)).await
    }

    pub async fn playable_quizzes(&self, points: u32) -> GatewayResult<Vec<Quiz>> {
        playable_quizzes(&self.portal, &self.portal, &self.portal, &self.filter, points).await
    }

    /// Loads the questions if needed and starts (or resumes) the quiz.
    pub async fn play(&self, quiz: Quiz) -> GatewayResult<QuizPlayer> {
        let quiz = self.portal.with_questions(quiz).await?;
        let settings = PlayerSettings::from(&self.config);
        Ok(QuizPlayer::start(quiz, self.gateway.clone(), settings).await)
    }
}
