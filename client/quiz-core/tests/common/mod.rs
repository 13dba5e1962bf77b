#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use quiz_core::config::Config;
use quiz_core::models::{Answer, Question, QuestionType, Quiz};
use quiz_core::services::api_client::ApiClient;
use quiz_core::utils::retry::RetryConfig;

pub const TOKEN: &str = "learner-token";

type Reply = (StatusCode, Json<Value>);

/// In-memory stand-in for the portal backend.
#[derive(Default)]
pub struct MockState {
    pub sessions: Mutex<BTreeMap<String, Value>>,
    pub failing_quizzes: Mutex<HashSet<String>>,
    pub quizzes: Mutex<Vec<Value>>,
    pub questions: Mutex<BTreeMap<String, Value>>,
    pub history: Mutex<Vec<Value>>,
    pub enrollments: Mutex<Vec<Value>>,
    pub submissions: Mutex<Vec<Value>>,
    next_id: AtomicUsize,
}

impl MockState {
    pub fn fail_quiz(&self, quiz_id: &str) {
        self.failing_quizzes
            .lock()
            .unwrap()
            .insert(quiz_id.to_string());
    }

    pub fn recover_quiz(&self, quiz_id: &str) {
        self.failing_quizzes.lock().unwrap().remove(quiz_id);
    }

    /// Publishes a quiz in the catalog, its questions served separately.
    pub fn publish(&self, quiz: &Quiz) {
        let questions: Vec<Value> = quiz
            .questions
            .iter()
            .map(|q| {
                let answers: Vec<Value> = q
                    .answers
                    .iter()
                    .map(|a| json!({"id": a.id, "text": a.text, "is_correct": a.is_correct}))
                    .collect();
                json!({
                    "_id": q.id,
                    "question": q.text,
                    "type": q.question_type.as_str(),
                    "points": q.points,
                    "explanation": q.explanation,
                    "answers": answers,
                })
            })
            .collect();
        self.quizzes.lock().unwrap().push(json!({
            "_id": quiz.id,
            "title": quiz.title,
            "level": quiz.level,
            "formation_id": quiz.formation_id,
            "duration": quiz.duration_seconds,
        }));
        self.questions
            .lock()
            .unwrap()
            .insert(quiz.id.clone(), json!({"data": questions}));
    }

    pub fn session(&self, id: &str) -> Option<Value> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn active_sessions_for(&self, quiz_id: &str) -> Vec<Value> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s["quiz_id"] == quiz_id && s["status"] == "active")
            .cloned()
            .collect()
    }

    fn is_failing(&self, quiz_id: &Value) -> bool {
        quiz_id
            .as_str()
            .is_some_and(|id| self.failing_quizzes.lock().unwrap().contains(id))
    }
}

pub struct MockBackend {
    pub base_url: String,
    pub state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        init_tracing();
        let state = Arc::new(MockState::default());
        let app = router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/api/", addr),
            state,
            handle,
        }
    }

    pub fn config(&self) -> Config {
        Config::with_base_url(&self.base_url, temp_buffer_dir()).unwrap()
    }

    pub fn api(&self, token: Option<&str>) -> ApiClient {
        let api = ApiClient::new(
            self.base_url.parse().unwrap(),
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap();
        api.with_retry(RetryConfig {
            max_attempts: 2,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            jitter_max: None,
        })
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn temp_buffer_dir() -> PathBuf {
    std::env::temp_dir()
        .join("quiz-core-it")
        .join(Uuid::new_v4().to_string())
}

/// Three single-choice questions worth 10 points, answer `a` is correct.
pub fn sample_quiz(id: &str, level: &str, formation: &str) -> Quiz {
    let questions = (1..=3)
        .map(|n| Question {
            id: format!("{}-q{}", id, n),
            text: format!("Question {}", n),
            question_type: QuestionType::SingleChoice,
            answers: vec![
                Answer {
                    id: "a".to_string(),
                    text: "Right".to_string(),
                    is_correct: true,
                },
                Answer {
                    id: "b".to_string(),
                    text: "Wrong".to_string(),
                    is_correct: false,
                },
            ],
            points: 10,
            explanation: Some(format!("Because of rule {}", n)),
            media_url: None,
        })
        .collect();
    Quiz {
        id: id.to_string(),
        title: format!("Quiz {}", id),
        description: String::new(),
        level: Some(level.to_string()),
        formation_id: Some(formation.to_string()),
        questions,
        total_points: 30,
        duration_seconds: 0,
    }
}

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/api/quiz", get(list_quizzes))
        .route("/api/quiz/history", get(history))
        .route("/api/quiz/submit", post(submit))
        .route("/api/quiz/{id}/questions", get(questions))
        .route("/api/catalogue/enrollments", get(enrollments))
        .route("/api/quiz-sessions", post(create_session))
        .route("/api/quiz-sessions/active", get(active_sessions))
        .route(
            "/api/quiz-sessions/{id}",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route("/api/quiz-sessions/{id}/complete", post(complete_session))
        .with_state(state)
}

fn authorized(headers: &HeaderMap) -> Result<(), Reply> {
    let expected = format!("Bearer {}", TOKEN);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )),
    }
}

fn ok(value: Value) -> Reply {
    (StatusCode::OK, Json(value))
}

fn not_found() -> Reply {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
}

fn unavailable() -> Reply {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "database unavailable"})),
    )
}

async fn list_quizzes(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    ok(json!({"data": state.quizzes.lock().unwrap().clone()}))
}

async fn questions(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    match state.questions.lock().unwrap().get(&id) {
        Some(questions) => ok(questions.clone()),
        None => not_found(),
    }
}

async fn history(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    ok(Value::Array(state.history.lock().unwrap().clone()))
}

async fn enrollments(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    ok(json!({"enrollments": state.enrollments.lock().unwrap().clone()}))
}

async fn submit(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    state.submissions.lock().unwrap().push(body.clone());
    let passed = body["percentage"].as_u64().unwrap_or(0) >= 50;
    let message = if passed { "Bravo" } else { "Keep practicing" };
    ok(json!({
        "data": {
            "quiz_id": body["quiz_id"],
            "score": body["score"],
            "percentage": body["percentage"],
            "success": passed,
            "message": message,
        }
    }))
}

/// Copies the fields of `patch` over `target`.
fn merge(target: &mut Value, patch: &Value) {
    if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn with_server_fields(mut session: Value, id: &str) -> Value {
    merge(&mut session, &json!({"id": id, "is_expired": false}));
    session
}

/// Creates a session, or updates the active one of the same quiz.
async fn create_session(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    if state.is_failing(&body["quiz_id"]) {
        return unavailable();
    }

    let mut sessions = state.sessions.lock().unwrap();
    let existing = sessions
        .iter()
        .find(|(_, s)| s["quiz_id"] == body["quiz_id"] && s["status"] == "active")
        .map(|(id, _)| id.clone());

    let id = existing.unwrap_or_else(|| {
        format!("s{}", state.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    });
    let session = match sessions.remove(&id) {
        Some(mut current) => {
            merge(&mut current, &body);
            current
        }
        None => with_server_fields(body, &id),
    };
    sessions.insert(id, session.clone());
    (StatusCode::CREATED, Json(json!({"data": session})))
}

async fn active_sessions(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    let active: Vec<Value> = state
        .sessions
        .lock()
        .unwrap()
        .values()
        .filter(|s| s["status"] == "active")
        .cloned()
        .collect();
    ok(json!({"sessions": active}))
}

async fn get_session(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    match state.sessions.lock().unwrap().get(&id) {
        Some(session) => ok(json!({"data": session})),
        None => not_found(),
    }
}

async fn update_session(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    let mut sessions = state.sessions.lock().unwrap();
    let Some(session) = sessions.get_mut(&id) else {
        return not_found();
    };
    if state.is_failing(&session["quiz_id"]) {
        return unavailable();
    }
    merge(session, &body);
    ok(json!({"data": session.clone()}))
}

async fn delete_session(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    if authorized(&headers).is_err() {
        return StatusCode::UNAUTHORIZED;
    }
    match state.sessions.lock().unwrap().remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn complete_session(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    if let Err(reply) = authorized(&headers) {
        return reply;
    }
    let mut sessions = state.sessions.lock().unwrap();
    let Some(session) = sessions.get_mut(&id) else {
        return not_found();
    };
    merge(session, &body);
    merge(session, &json!({"status": "completed"}));
    ok(json!({"data": session.clone()}))
}
