use serde_json::json;

use quiz_core::services::catalog_service::{PlayHistorySource, PortalClient, QuizCatalog};
use quiz_core::CoreState;
use quiz_core::GatewayError;

mod common;

fn enroll(backend: &common::MockBackend, formation: &str) {
    backend
        .state
        .enrollments
        .lock()
        .unwrap()
        .push(json!({"formation_id": formation}));
}

fn core_for(backend: &common::MockBackend) -> CoreState {
    let mut config = backend.config();
    config.api_token = Some(common::TOKEN.to_string());
    CoreState::new(config).unwrap()
}

fn titles(quizzes: &[quiz_core::models::Quiz]) -> Vec<&str> {
    quizzes.iter().map(|q| q.title.as_str()).collect()
}

#[tokio::test]
async fn test_points_below_intermediate_show_only_beginner_quizzes() {
    let backend = common::MockBackend::start().await;
    for (id, title, level) in [
        ("1", "Verbs", "beginner"),
        ("2", "Articles", "débutant"),
        ("3", "Nouns", ""),
        ("4", "Subjunctive", "advanced"),
        ("5", "Idioms", "expert"),
    ] {
        let mut quiz = common::sample_quiz(id, level, "F");
        quiz.title = title.to_string();
        backend.state.publish(&quiz);
    }
    enroll(&backend, "F");
    let core = core_for(&backend);

    let quizzes = core.playable_quizzes(45).await.unwrap();

    assert_eq!(titles(&quizzes), vec!["Articles", "Nouns", "Verbs"]);
}

#[tokio::test]
async fn test_unreachable_tiers_fall_back_to_every_enrolled_quiz() {
    let backend = common::MockBackend::start().await;
    backend.state.publish(&common::sample_quiz("a1", "advanced", "F"));
    backend.state.publish(&common::sample_quiz("a2", "expert", "F"));
    backend.state.publish(&common::sample_quiz("other", "advanced", "G"));
    enroll(&backend, "F");
    let core = core_for(&backend);

    let quizzes = core.playable_quizzes(0).await.unwrap();

    let ids: Vec<&str> = quizzes.iter().map(|q| q.id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2"]);
}

#[tokio::test]
async fn test_fallback_stops_once_a_tier_is_reachable() {
    let backend = common::MockBackend::start().await;
    backend.state.publish(&common::sample_quiz("i1", "intermediate", "F"));
    backend.state.publish(&common::sample_quiz("a1", "advanced", "F"));
    enroll(&backend, "F");
    let core = core_for(&backend);

    let below = core.playable_quizzes(49).await.unwrap();
    let at = core.playable_quizzes(50).await.unwrap();

    assert_eq!(below.len(), 2);
    let ids: Vec<&str> = at.iter().map(|q| q.id.as_str()).collect();
    assert_eq!(ids, vec!["i1"]);
}

#[tokio::test]
async fn test_played_quizzes_are_hidden() {
    let backend = common::MockBackend::start().await;
    backend.state.publish(&common::sample_quiz("1", "beginner", "F"));
    backend.state.publish(&common::sample_quiz("2", "beginner", "F"));
    backend
        .state
        .history
        .lock()
        .unwrap()
        .push(json!({"quiz_id": "1", "played_at": "2024-05-01T10:00:00Z"}));
    enroll(&backend, "F");
    let core = core_for(&backend);

    let portal = PortalClient::new(backend.api(Some(common::TOKEN)));
    let history = tokio_test::assert_ok!(portal.play_history().await);
    assert_eq!(history.len(), 1);

    let quizzes = core.playable_quizzes(0).await.unwrap();
    let ids: Vec<&str> = quizzes.iter().map(|q| q.id.as_str()).collect();
    assert_eq!(ids, vec!["2"]);
}

#[tokio::test]
async fn test_questions_are_loaded_for_a_listed_quiz() {
    let backend = common::MockBackend::start().await;
    backend.state.publish(&common::sample_quiz("q1", "beginner", "F"));
    let portal = PortalClient::new(backend.api(Some(common::TOKEN)));

    let listed = tokio_test::assert_ok!(portal.list_quizzes().await).remove(0);
    assert!(listed.questions.is_empty());

    let quiz = portal.with_questions(listed).await.unwrap();
    assert_eq!(quiz.questions.len(), 3);
    assert_eq!(quiz.total_points, 30);
    assert_eq!(
        quiz.questions[0].explanation.as_deref(),
        Some("Because of rule 1")
    );
}

#[tokio::test]
async fn test_catalog_requires_a_valid_token() {
    let backend = common::MockBackend::start().await;

    let anonymous = PortalClient::new(backend.api(None));
    let err = tokio_test::assert_err!(anonymous.list_quizzes().await);
    assert!(matches!(err, GatewayError::Unauthenticated));

    let rejected = PortalClient::new(backend.api(Some("stale-token")));
    let err = tokio_test::assert_err!(rejected.list_quizzes().await);
    assert!(matches!(err, GatewayError::Unauthenticated));
}

#[tokio::test]
async fn test_unknown_quiz_questions_are_not_found() {
    let backend = common::MockBackend::start().await;
    let portal = PortalClient::new(backend.api(Some(common::TOKEN)));

    let err = portal.questions("missing").await.unwrap_err();

    assert!(matches!(err, GatewayError::NotFound(_)));
    assert!(!err.is_transient());
}
