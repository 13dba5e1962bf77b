//! The quiz-play flow: one attempt, one scorer, checkpointed through a
//! session store after every change.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::catalog_service::QuizCatalog;
use super::countdown::Countdown;
use super::scoring_service::{
    AttemptScorer, Evaluation, MultiSelectRule, ScorerPhase, ScoringError, SelectOutcome,
};
use super::session_service::SessionStore;
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics::record_attempt;
use crate::models::result::SubmissionPayload;
use crate::models::timer::TimerEvent;
use crate::models::{
    buffer_key, AttemptState, AttemptSummary, CompletionData, Quiz, QuizResult, SessionOrigin,
};
use crate::utils::time::ttl_from_seconds;

#[derive(Debug, Error)]
pub enum PlayError {
    #[error(transparent)]
    Scoring(#[from] ScoringError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Where the last checkpoint landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Persisted by the server.
    Saved,
    /// Kept in the local buffer only.
    Buffered,
    NotSaved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceNotice {
    ProgressNotSaved { quiz_id: String, error: String },
}

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub rule: MultiSelectRule,
    pub session_ttl: chrono::Duration,
    /// Wall-clock length of one counted second. Every tick adds exactly one
    /// second to `time_spent`, so anything but one second is only for tests.
    pub tick_interval: Duration,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            rule: MultiSelectRule::default(),
            session_ttl: chrono::Duration::hours(1),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for PlayerSettings {
    fn from(config: &Config) -> Self {
        Self {
            rule: config.multi_select_rule,
            session_ttl: ttl_from_seconds(config.session_ttl_seconds),
            ..Self::default()
        }
    }
}

pub struct QuizPlayer {
    quiz: Quiz,
    scorer: AttemptScorer,
    state: AttemptState,
    store: Arc<dyn SessionStore>,
    settings: PlayerSettings,
    countdown: Option<Countdown>,
    stored_id: Option<String>,
    last_checkpoint: Option<CheckpointStatus>,
    save_failing: bool,
    notices: Vec<PersistenceNotice>,
}

impl QuizPlayer {
    /// Resumes the active session of the quiz if there is one, otherwise
    /// opens a new attempt. Either way the attempt is checkpointed and the
    /// countdown started.
    pub async fn start(quiz: Quiz, store: Arc<dyn SessionStore>, settings: PlayerSettings) -> Self {
        let now = Utc::now();
        let existing = match store.find_active_for_quiz(&quiz.id).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!("Could not look up an active session for quiz {}: {}", quiz.id, e);
                None
            }
        };

        let resumed = existing.and_then(|stored| {
            let mut state = stored.state;
            if stored.origin == SessionOrigin::Remote && state.session_id.is_none() {
                state.session_id = Some(stored.id.clone());
            }
            let scorer =
                AttemptScorer::from_checkpoint(quiz.questions.clone(), &state, settings.rule);
            if scorer.total_questions() == 0 && !quiz.questions.is_empty() {
                tracing::warn!(
                    "Session {} no longer matches quiz {}, starting over",
                    stored.id,
                    quiz.id
                );
                return None;
            }
            Some((stored.id, state, scorer))
        });

        let (stored_id, state, scorer) = match resumed {
            Some((id, state, scorer)) => {
                tracing::info!("Resuming quiz {} at {}", quiz.id, scorer.phase());
                record_attempt("resumed");
                (Some(id), state, scorer)
            }
            None => {
                tracing::info!("Starting quiz {} ({} questions)", quiz.id, quiz.questions.len());
                record_attempt("started");
                let state = AttemptState::start(&quiz, now, settings.session_ttl);
                let scorer = AttemptScorer::new(quiz.questions.clone(), settings.rule);
                (None, state, scorer)
            }
        };

        let mut player = Self {
            quiz,
            scorer,
            state,
            store,
            settings,
            countdown: None,
            stored_id,
            last_checkpoint: None,
            save_failing: false,
            notices: Vec::new(),
        };
        player.start_countdown();
        player.checkpoint().await;
        player
    }

    fn start_countdown(&mut self) {
        if self.scorer.is_finished() {
            return;
        }
        let limit = match self.quiz.duration_seconds {
            0 => None,
            duration => {
                let left = duration.saturating_sub(self.state.time_spent);
                if left == 0 {
                    tracing::info!("Quiz {} resumed with no time left", self.quiz.id);
                    self.scorer.time_up();
                    return;
                }
                Some(left)
            }
        };
        self.countdown = Some(Countdown::start(
            self.quiz.id.clone(),
            limit,
            self.settings.tick_interval,
        ));
    }

    fn stop_countdown(&mut self) {
        if let Some(mut countdown) = self.countdown.take() {
            countdown.stop();
        }
    }

    pub fn quiz(&self) -> &Quiz {
        &self.quiz
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    pub fn scorer(&self) -> &AttemptScorer {
        &self.scorer
    }

    pub fn phase(&self) -> ScorerPhase {
        self.scorer.phase()
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointStatus> {
        self.last_checkpoint
    }

    pub fn take_notices(&mut self) -> Vec<PersistenceNotice> {
        std::mem::take(&mut self.notices)
    }

    pub async fn select_answer(
        &mut self,
        question_id: &str,
        answer_id: &str,
    ) -> Result<SelectOutcome, ScoringError> {
        let outcome = self.scorer.select_answer(question_id, answer_id)?;
        self.checkpoint().await;
        Ok(outcome)
    }

    pub async fn check(&mut self) -> Result<Evaluation, ScoringError> {
        let evaluation = self.scorer.check()?;
        self.checkpoint().await;
        Ok(evaluation)
    }

    pub async fn advance(&mut self) -> Result<ScorerPhase, ScoringError> {
        let phase = self.scorer.advance()?;
        if phase == ScorerPhase::Finished {
            self.stop_countdown();
        }
        self.checkpoint().await;
        Ok(phase)
    }

    /// Applies a countdown event. Events of other quizzes are ignored.
    pub async fn handle_timer_event(&mut self, event: &TimerEvent) {
        if event.quiz_id() != self.quiz.id {
            tracing::debug!("Ignoring {} for quiz {}", event.event_name(), event.quiz_id());
            return;
        }
        match event {
            TimerEvent::TimerTick(_) => self.scorer.tick(1),
            TimerEvent::TimeExpired(_) => {
                self.scorer.time_up();
                self.stop_countdown();
                self.checkpoint().await;
            }
        }
    }

    /// Waits for the next countdown event and applies it.
    pub async fn next_timer_event(&mut self) -> Option<TimerEvent> {
        let event = self.countdown.as_mut()?.next_event().await?;
        self.handle_timer_event(&event).await;
        Some(event)
    }

    /// Applies countdown events emitted so far without waiting.
    pub async fn pump_timer(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.countdown.as_mut().and_then(Countdown::try_next) {
            self.handle_timer_event(&event).await;
            applied += 1;
        }
        applied
    }

    /// Stops the clock and saves, for when the learner navigates away.
    pub async fn suspend(&mut self) -> CheckpointStatus {
        self.pump_timer().await;
        self.stop_countdown();
        tracing::info!("Suspending quiz {} at {}", self.quiz.id, self.scorer.phase());
        record_attempt("suspended");
        self.checkpoint().await
    }

    /// Saves the attempt. A failure is reported once until a save succeeds.
    pub async fn checkpoint(&mut self) -> CheckpointStatus {
        self.scorer.write_checkpoint(&mut self.state);
        self.state.touch(Utc::now(), self.settings.session_ttl);

        let status = match self.store.save(&self.state).await {
            Ok(stored) if stored.quiz_id() != self.quiz.id => {
                tracing::warn!(
                    "Dropping checkpoint response for quiz {} while playing {}",
                    stored.quiz_id(),
                    self.quiz.id
                );
                CheckpointStatus::NotSaved
            }
            Ok(stored) => {
                self.save_failing = false;
                let status = match stored.origin {
                    SessionOrigin::Remote => {
                        self.state.session_id = Some(stored.id.clone());
                        CheckpointStatus::Saved
                    }
                    SessionOrigin::Local => CheckpointStatus::Buffered,
                };
                self.stored_id = Some(stored.id);
                status
            }
            Err(e) => {
                if !self.save_failing {
                    tracing::warn!("Progress of quiz {} not saved: {}", self.quiz.id, e);
                    self.notices.push(PersistenceNotice::ProgressNotSaved {
                        quiz_id: self.quiz.id.clone(),
                        error: e.to_string(),
                    });
                }
                self.save_failing = true;
                CheckpointStatus::NotSaved
            }
        };
        self.last_checkpoint = Some(status);
        status
    }

    /// Submits a finished attempt, then closes its session and clears the
    /// local buffer. The submission result is authoritative.
    pub async fn finish(&mut self, catalog: &dyn QuizCatalog) -> Result<QuizResult, PlayError> {
        let summary = self.scorer.summary().ok_or(ScoringError::InvalidPhase {
            action: "finish",
            phase: self.scorer.phase(),
        })?;
        self.stop_countdown();
        self.checkpoint().await;

        let payload = self.submission(&summary);
        let result = catalog.submit(&payload, &summary).await?;

        if let Some(id) = self.stored_id.clone() {
            let data = self.completion(&summary);
            if let Err(e) = self.store.complete(&id, &data).await {
                tracing::warn!("Could not close session {}: {}", id, e);
            }
        }
        if let Err(e) = self.store.delete(&buffer_key(&self.quiz.id)).await {
            tracing::warn!("Could not clear buffered quiz {}: {}", self.quiz.id, e);
        }

        record_attempt("completed");
        Ok(result)
    }

    fn submission(&self, summary: &AttemptSummary) -> SubmissionPayload {
        SubmissionPayload {
            quiz_id: self.quiz.id.clone(),
            formation_id: self.quiz.formation_id.clone(),
            session_id: self.state.session_id.clone(),
            answers: self.state.answers.clone(),
            score: summary.score,
            percentage: summary.percentage,
            correct_count: summary.correct_count,
            total_questions: summary.total_questions,
            max_streak: summary.max_streak,
            time_spent: summary.time_spent,
        }
    }

    fn completion(&self, summary: &AttemptSummary) -> CompletionData {
        CompletionData {
            score: summary.score,
            percentage: summary.percentage,
            correct_count: summary.correct_count,
            total_questions: summary.total_questions,
            max_streak: summary.max_streak,
            time_spent: summary.time_spent,
            answers: self.state.answers.clone(),
            completed_at: Utc::now(),
        }
    }
}
