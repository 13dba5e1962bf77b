use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use quiz_core::models::{SessionStatus, BUFFER_KEY_PREFIX};
use quiz_core::services::local_store::LocalSessionStore;
use quiz_core::services::play_service::{CheckpointStatus, PlayerSettings, QuizPlayer};
use quiz_core::services::remote_store::RemoteSessionStore;
use quiz_core::services::scoring_service::{ScorerPhase, SelectOutcome};
use quiz_core::services::session_service::{SessionGateway, SessionStore};
use quiz_core::CoreState;

mod common;

fn signed_in_core(backend: &common::MockBackend) -> CoreState {
    let quiz = common::sample_quiz("q1", "beginner", "F1");
    backend.state.publish(&quiz);
    backend
        .state
        .enrollments
        .lock()
        .unwrap()
        .push(json!({"formation_id": "F1"}));

    let mut config = backend.config();
    config.api_token = Some(common::TOKEN.to_string());
    CoreState::new(config).unwrap()
}

fn fast_settings() -> PlayerSettings {
    PlayerSettings {
        tick_interval: std::time::Duration::from_millis(5),
        ..Default::default()
    }
}

async fn answer(player: &mut QuizPlayer, question_id: &str, answer_id: &str) -> bool {
    match player.select_answer(question_id, answer_id).await.unwrap() {
        SelectOutcome::Evaluated(evaluation) => evaluation.correct,
        other => panic!("single choice should evaluate, got {:?}", other),
    }
}

#[tokio::test]
async fn test_full_play_through_submits_and_closes_session() {
    let backend = common::MockBackend::start().await;
    let core = signed_in_core(&backend);

    let quizzes = core.playable_quizzes(0).await.unwrap();
    assert_eq!(quizzes.len(), 1);

    let mut player = core.play(quizzes[0].clone()).await.unwrap();
    assert_eq!(player.quiz().questions.len(), 3);
    assert_eq!(player.last_checkpoint(), Some(CheckpointStatus::Saved));
    let session_id = player.state().session_id.clone().unwrap();

    assert!(answer(&mut player, "q1-q1", "a").await);
    player.advance().await.unwrap();
    assert!(!answer(&mut player, "q1-q2", "b").await);
    player.advance().await.unwrap();
    assert!(answer(&mut player, "q1-q3", "a").await);
    assert_eq!(player.advance().await.unwrap(), ScorerPhase::Finished);

    let result = player.finish(&core.portal).await.unwrap();

    assert_eq!(result.quiz_id, "q1");
    assert_eq!(result.percentage, 67);
    assert_eq!(result.score, 20);
    assert_eq!(result.correct_count, 2);
    assert_eq!(result.total_questions, 3);
    assert_eq!(result.passed, Some(true));

    let submissions = backend.state.submissions.lock().unwrap().clone();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0]["session_id"], session_id.as_str());
    assert_eq!(submissions[0]["answers"]["q1-q2"], json!(["b"]));

    let session = backend.state.session(&session_id).unwrap();
    assert_eq!(session["status"], "completed");
    assert!(backend.state.active_sessions_for("q1").is_empty());
    assert!(core.gateway.local().keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_suspended_attempt_resumes_where_it_stopped() {
    let backend = common::MockBackend::start().await;
    let core = signed_in_core(&backend);
    let quiz = core.playable_quizzes(0).await.unwrap().remove(0);

    let mut player = core.play(quiz.clone()).await.unwrap();
    assert!(answer(&mut player, "q1-q1", "a").await);
    assert_eq!(player.suspend().await, CheckpointStatus::Saved);
    drop(player);

    let mut resumed = core.play(quiz).await.unwrap();

    assert_eq!(resumed.phase(), ScorerPhase::Explaining(0));
    assert_eq!(resumed.scorer().score(), 10);
    assert_eq!(resumed.scorer().streak(), 1);
    assert_eq!(resumed.advance().await.unwrap(), ScorerPhase::Presenting(1));
    assert_eq!(backend.state.active_sessions_for("q1").len(), 1);
}

#[tokio::test]
async fn test_offline_attempt_is_buffered_then_synced() {
    let backend = common::MockBackend::start().await;
    let ttl = Duration::hours(1);
    let gateway = Arc::new(SessionGateway::new(LocalSessionStore::new(
        common::temp_buffer_dir(),
        ttl,
    )));
    let quiz = common::sample_quiz("q1", "beginner", "F1");

    let mut player = QuizPlayer::start(quiz, gateway.clone(), fast_settings()).await;
    assert_eq!(player.last_checkpoint(), Some(CheckpointStatus::Buffered));
    assert!(answer(&mut player, "q1-q1", "a").await);
    player.advance().await.unwrap();
    assert_eq!(player.suspend().await, CheckpointStatus::Buffered);

    let buffered = gateway.find_active_for_quiz("q1").await.unwrap().unwrap();
    assert!(buffered.id.starts_with(BUFFER_KEY_PREFIX));
    assert_eq!(buffered.state.current_index, 1);

    let remote = RemoteSessionStore::new(backend.api(Some(common::TOKEN)), ttl);
    let report = gateway.authenticate(Arc::new(remote)).await.unwrap();

    assert!(report.is_clean());
    let resume = report.resume.unwrap();
    assert_eq!(resume.quiz_id(), "q1");
    assert_eq!(resume.state.current_index, 1);
    assert_eq!(resume.state.score, 10);
}

#[tokio::test]
async fn test_countdown_expiry_finishes_attempt() {
    let gateway = Arc::new(SessionGateway::new(LocalSessionStore::new(
        common::temp_buffer_dir(),
        Duration::hours(1),
    )));
    let mut quiz = common::sample_quiz("timed", "beginner", "F1");
    quiz.duration_seconds = 3;

    let mut player = QuizPlayer::start(quiz, gateway.clone(), fast_settings()).await;
    assert!(answer(&mut player, "timed-q1", "a").await);

    while player.phase() != ScorerPhase::Finished {
        player.next_timer_event().await.unwrap();
    }

    assert_eq!(player.scorer().time_spent(), 3);
    assert_eq!(player.state().status, SessionStatus::Completed);
    assert_eq!(player.last_checkpoint(), Some(CheckpointStatus::Buffered));
    let summary = player.scorer().summary().unwrap();
    assert_eq!(summary.correct_count, 1);
    assert_eq!(summary.percentage, 33);
}
