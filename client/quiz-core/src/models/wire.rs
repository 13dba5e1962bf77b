//! Parse-and-validate boundary for backend and local-buffer payloads.
//!
//! Backend responses are loosely typed: ids come as numbers or strings,
//! French and camelCase field names appear next to snake_case ones, and
//! optional figures are often missing. Everything is normalized here, once,
//! into the canonical models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use validator::{Validate, ValidationError};

use super::result::{AttemptSummary, QuizResult};
use super::session::{AnswerMap, AttemptState, SessionOrigin, SessionStatus, StoredSession};
use super::{Answer, EnrollmentSet, PlayHistoryEntry, Question, QuestionType, Quiz};
use crate::error::{GatewayError, GatewayResult};
use crate::utils::time::timestamp_from_json;

pub fn id_from_json(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 {
                        format!("{}", f as i64)
                    } else {
                        f.to_string()
                    }
                })
            }
        }
        Value::Object(map) => ["id", "_id"]
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(id_from_json),
        _ => None,
    }
}

fn u32_from_json(value: &Value) -> Option<u32> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !number.is_finite() || number < 0.0 {
        return Some(0);
    }
    Some(number.round().min(u32::MAX as f64) as u32)
}

fn bool_from_json(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "1" | "yes" | "vrai" | "oui"
        ),
        _ => false,
    }
}

fn answers_from_json(value: &Value) -> AnswerMap {
    let mut answers = AnswerMap::new();
    match value {
        Value::Object(map) => {
            for (question_id, selected) in map {
                let question_id = question_id.trim();
                if question_id.is_empty() {
                    continue;
                }
                let ids: BTreeSet<String> = match selected {
                    Value::Array(items) => items.iter().filter_map(id_from_json).collect(),
                    Value::Null => continue,
                    other => id_from_json(other).into_iter().collect(),
                };
                answers.insert(question_id.to_string(), ids);
            }
        }
        Value::Array(items) => {
            for item in items {
                let Some(question_id) = item
                    .get("question_id")
                    .or_else(|| item.get("questionId"))
                    .and_then(id_from_json)
                else {
                    continue;
                };
                let ids = match item.get("answer_ids").or_else(|| item.get("answerIds")) {
                    Some(Value::Array(ids)) => ids.iter().filter_map(id_from_json).collect(),
                    _ => item
                        .get("answer_id")
                        .or_else(|| item.get("answerId"))
                        .and_then(id_from_json)
                        .into_iter()
                        .collect(),
                };
                answers.insert(question_id, ids);
            }
        }
        _ => {}
    }
    answers
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(id_from_json(&value).unwrap_or_default())
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.as_ref().and_then(id_from_json))
}

fn de_id_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Array(items) => Ok(items.iter().filter_map(id_from_json).collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a list of ids, got {}",
            other
        ))),
    }
}

fn de_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(u32_from_json(&value).unwrap_or(0))
}

fn de_opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.as_ref().and_then(u32_from_json))
}

fn de_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(bool_from_json(&value))
}

fn de_opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.filter(|v| !v.is_null()).map(|v| bool_from_json(&v)))
}

fn de_answers<'de, D: Deserializer<'de>>(d: D) -> Result<AnswerMap, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(answers_from_json(&value))
}

fn de_opt_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.as_ref().and_then(timestamp_from_json))
}

fn de_opt_status<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SessionStatus>, D::Error> {
    let value = Option::<Value>::deserialize(d)?;
    Ok(value.and_then(|v| serde_json::from_value::<SessionStatus>(v).ok()))
}

/// Takes the payload out of a `{"data": ...}` style wrapper, if present.
pub fn unwrap_envelope(value: Value, keys: &[&str]) -> Value {
    match value {
        Value::Object(mut map) => {
            for key in keys {
                if let Some(inner) = map.remove(*key) {
                    return inner;
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

fn into_array(value: Value, what: &str) -> GatewayResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(GatewayError::InvalidPayload(format!(
            "expected a list of {}, got {}",
            what,
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct WireAnswer {
    #[serde(alias = "_id", deserialize_with = "de_id")]
    #[validate(length(min = 1, message = "answer id is empty"))]
    pub id: String,
    #[serde(default, alias = "texte", alias = "reponse", alias = "label")]
    pub text: Option<String>,
    #[serde(
        default,
        alias = "isCorrect",
        alias = "correct",
        alias = "est_correcte",
        deserialize_with = "de_bool"
    )]
    pub is_correct: bool,
}

fn validate_unique_answers(question: &WireQuestion) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    if question.answers.iter().all(|a| seen.insert(a.id.as_str())) {
        Ok(())
    } else {
        Err(ValidationError::new("duplicate_answer_id"))
    }
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_unique_answers"))]
pub struct WireQuestion {
    #[serde(alias = "_id", deserialize_with = "de_id")]
    #[validate(length(min = 1, message = "question id is empty"))]
    pub id: String,
    #[serde(
        default,
        alias = "question",
        alias = "prompt",
        alias = "texte",
        alias = "libelle"
    )]
    pub text: Option<String>,
    #[serde(
        default,
        rename = "type",
        alias = "question_type",
        alias = "questionType"
    )]
    pub kind: Option<String>,
    #[serde(default, alias = "reponses", alias = "options", alias = "choices")]
    #[validate(nested)]
    pub answers: Vec<WireAnswer>,
    #[serde(default, alias = "point", deserialize_with = "de_u32")]
    pub points: u32,
    #[serde(default, alias = "explication")]
    pub explanation: Option<String>,
    #[serde(default, alias = "mediaUrl", alias = "media", alias = "image")]
    pub media_url: Option<String>,
}

impl WireQuestion {
    fn into_question(self) -> Question {
        Question {
            id: self.id,
            text: self.text.unwrap_or_default(),
            question_type: QuestionType::parse(self.kind.as_deref()),
            answers: self
                .answers
                .into_iter()
                .map(|a| Answer {
                    id: a.id,
                    text: a.text.unwrap_or_default(),
                    is_correct: a.is_correct,
                })
                .collect(),
            points: self.points,
            explanation: self.explanation.filter(|e| !e.trim().is_empty()),
            media_url: self.media_url.filter(|m| !m.trim().is_empty()),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct WireQuiz {
    #[serde(alias = "_id", alias = "quizId", deserialize_with = "de_id")]
    #[validate(length(min = 1, message = "quiz id is empty"))]
    pub id: String,
    #[serde(default, alias = "titre", alias = "quizTitle", alias = "name")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "niveau", alias = "difficulty")]
    pub level: Option<String>,
    #[serde(
        default,
        alias = "formationId",
        alias = "formation",
        deserialize_with = "de_opt_id"
    )]
    pub formation_id: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub questions: Vec<WireQuestion>,
    #[serde(
        default,
        alias = "totalPoints",
        alias = "points",
        deserialize_with = "de_u32"
    )]
    pub total_points: u32,
    #[serde(
        default,
        alias = "duree",
        alias = "duration_seconds",
        deserialize_with = "de_u32"
    )]
    pub duration: u32,
}

impl TryFrom<WireQuiz> for Quiz {
    type Error = GatewayError;

    fn try_from(wire: WireQuiz) -> Result<Self, Self::Error> {
        wire.validate()
            .map_err(|e| GatewayError::InvalidPayload(format!("quiz {}: {}", wire.id, e)))?;
        let questions: Vec<Question> = wire
            .questions
            .into_iter()
            .map(WireQuestion::into_question)
            .collect();
        let total_points = if wire.total_points == 0 {
            questions.iter().map(|q| q.points).sum()
        } else {
            wire.total_points
        };
        Ok(Quiz {
            id: wire.id,
            title: wire.title.map(|t| t.trim().to_string()).unwrap_or_default(),
            description: wire.description.unwrap_or_default(),
            level: wire.level.filter(|l| !l.trim().is_empty()),
            formation_id: wire.formation_id,
            questions,
            total_points,
            duration_seconds: wire.duration,
        })
    }
}

/// Parses `GET /quiz`. Malformed entries are skipped.
pub fn parse_quiz_list(value: Value) -> GatewayResult<Vec<Quiz>> {
    let items = into_array(unwrap_envelope(value, &["data", "quizzes", "quiz"]), "quizzes")?;
    let mut quizzes = Vec::with_capacity(items.len());
    for item in items {
        let parsed = serde_json::from_value::<WireQuiz>(item)
            .map_err(GatewayError::from)
            .and_then(Quiz::try_from);
        match parsed {
            Ok(quiz) => quizzes.push(quiz),
            Err(e) => tracing::warn!("Skipping malformed quiz entry: {}", e),
        }
    }
    Ok(quizzes)
}

/// Parses `GET /quiz/{id}/questions`. Malformed questions are skipped.
pub fn parse_questions(value: Value) -> GatewayResult<Vec<Question>> {
    let items = into_array(unwrap_envelope(value, &["data", "questions"]), "questions")?;
    let mut questions = Vec::with_capacity(items.len());
    for item in items {
        let parsed = serde_json::from_value::<WireQuestion>(item)
            .map_err(GatewayError::from)
            .and_then(|q| {
                q.validate().map_err(|e| {
                    GatewayError::InvalidPayload(format!("question {}: {}", q.id, e))
                })?;
                Ok(q.into_question())
            });
        match parsed {
            Ok(question) => questions.push(question),
            Err(e) => tracing::warn!("Skipping malformed question: {}", e),
        }
    }
    Ok(questions)
}

/// Parses the play history. Entries may be bare ids or objects.
pub fn parse_history(value: Value) -> GatewayResult<Vec<PlayHistoryEntry>> {
    let items = into_array(
        unwrap_envelope(value, &["data", "history", "results"]),
        "history entries",
    )?;
    let entries = items
        .iter()
        .filter_map(|item| {
            let quiz_id = match item {
                Value::Object(map) => ["quiz_id", "quizId", "quiz", "id"]
                    .iter()
                    .find_map(|key| map.get(*key))
                    .and_then(id_from_json),
                other => id_from_json(other),
            };
            let Some(quiz_id) = quiz_id else {
                tracing::warn!("Skipping history entry without quiz id");
                return None;
            };
            let played_at = ["played_at", "playedAt", "completed_at", "created_at"]
                .iter()
                .find_map(|key| item.get(*key))
                .and_then(timestamp_from_json);
            Some(PlayHistoryEntry { quiz_id, played_at })
        })
        .collect();
    Ok(entries)
}

/// Parses the enrolled formations. Entries may be bare ids or objects.
pub fn parse_enrollment(value: Value) -> GatewayResult<EnrollmentSet> {
    let items = into_array(
        unwrap_envelope(value, &["data", "enrollments", "formations"]),
        "enrollments",
    )?;
    Ok(items
        .iter()
        .filter_map(|item| match item {
            Value::Object(map) => ["formation_id", "formationId", "formation", "id"]
                .iter()
                .find_map(|key| map.get(*key))
                .and_then(id_from_json),
            other => id_from_json(other),
        })
        .collect())
}

fn validate_session_shape(session: &WireSession) -> Result<(), ValidationError> {
    let total = session.question_ids.len();
    let index = session.current_index as usize;
    if (total == 0 && index != 0) || (total > 0 && index >= total) {
        return Err(ValidationError::new("current_index_out_of_range"));
    }
    Ok(())
}

/// A session record as returned by the Quiz Session API.
#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_session_shape"))]
pub struct WireSession {
    #[serde(alias = "_id", alias = "session_id", deserialize_with = "de_id")]
    #[validate(length(min = 1, message = "session id is empty"))]
    pub id: String,
    #[serde(alias = "quizId", deserialize_with = "de_id")]
    #[validate(length(min = 1, message = "quiz id is empty"))]
    pub quiz_id: String,
    #[serde(default, alias = "formationId", deserialize_with = "de_opt_id")]
    pub formation_id: Option<String>,
    #[serde(default, alias = "questionIds", deserialize_with = "de_id_list")]
    pub question_ids: Vec<String>,
    #[serde(
        default,
        alias = "currentIndex",
        alias = "current_question_index",
        deserialize_with = "de_u32"
    )]
    pub current_index: u32,
    #[serde(default, deserialize_with = "de_answers")]
    pub answers: AnswerMap,
    #[serde(default, deserialize_with = "de_u32")]
    pub score: u32,
    #[serde(default, deserialize_with = "de_u32")]
    pub streak: u32,
    #[serde(default, alias = "maxStreak", deserialize_with = "de_u32")]
    pub max_streak: u32,
    #[serde(default, alias = "timeSpent", deserialize_with = "de_u32")]
    pub time_spent: u32,
    #[serde(default, deserialize_with = "de_opt_status")]
    pub status: Option<SessionStatus>,
    #[serde(default, alias = "startedAt", deserialize_with = "de_opt_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "lastActivityAt",
        alias = "updated_at",
        deserialize_with = "de_opt_timestamp"
    )]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "expiresAt", deserialize_with = "de_opt_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "correctQuestionIds", deserialize_with = "de_id_list")]
    pub correct_question_ids: Vec<String>,
    #[serde(default, deserialize_with = "de_bool")]
    pub revealed: bool,
    #[serde(default, alias = "progressPercentage", deserialize_with = "de_opt_u32")]
    pub progress_percentage: Option<u32>,
    #[serde(default, alias = "isExpired", deserialize_with = "de_bool")]
    pub is_expired: bool,
}

impl WireSession {
    pub fn into_stored(self, now: DateTime<Utc>, ttl: Duration) -> GatewayResult<StoredSession> {
        self.validate()
            .map_err(|e| GatewayError::InvalidPayload(format!("session {}: {}", self.id, e)))?;

        let started_at = self.started_at.unwrap_or(now);
        let last_activity_at = self.last_activity_at.unwrap_or(started_at);
        let expires_at = self.expires_at.unwrap_or(last_activity_at + ttl);
        let mut status = self.status.unwrap_or(SessionStatus::Active);
        if self.is_expired && status == SessionStatus::Active {
            status = SessionStatus::Expired;
        }

        let question_ids = self.question_ids;
        let answers: AnswerMap = self
            .answers
            .into_iter()
            .filter(|(qid, _)| question_ids.contains(qid))
            .collect();
        let correct_question_ids = self
            .correct_question_ids
            .into_iter()
            .filter(|qid| question_ids.contains(qid))
            .collect();

        let state = AttemptState {
            session_id: Some(self.id.clone()),
            quiz_id: self.quiz_id,
            formation_id: self.formation_id,
            question_ids,
            current_index: self.current_index as usize,
            answers,
            score: self.score,
            streak: self.streak,
            max_streak: self.max_streak.max(self.streak),
            time_spent: self.time_spent,
            status,
            started_at,
            last_activity_at,
            expires_at,
            correct_question_ids,
            revealed: self.revealed,
        };
        let progress_percentage = self
            .progress_percentage
            .map(|p| p.min(100) as u8)
            .unwrap_or_else(|| state.progress_percentage());
        let is_expired = self.is_expired || state.is_expired_at(now);

        Ok(StoredSession {
            id: self.id,
            origin: SessionOrigin::Remote,
            state,
            progress_percentage,
            is_expired,
        })
    }
}

pub fn parse_session(
    value: Value,
    now: DateTime<Utc>,
    ttl: Duration,
) -> GatewayResult<StoredSession> {
    let wire: WireSession = serde_json::from_value(unwrap_envelope(value, &["data", "session"]))
        .map_err(|e| GatewayError::InvalidPayload(format!("session: {}", e)))?;
    wire.into_stored(now, ttl)
}

/// Parses a session listing. Invalid entries are skipped.
pub fn parse_session_list(
    value: Value,
    now: DateTime<Utc>,
    ttl: Duration,
) -> GatewayResult<Vec<StoredSession>> {
    let items = into_array(unwrap_envelope(value, &["data", "sessions"]), "sessions")?;
    let mut sessions = Vec::with_capacity(items.len());
    for item in items {
        match parse_session(item, now, ttl) {
            Ok(session) => sessions.push(session),
            Err(e) => tracing::warn!("Skipping invalid session entry: {}", e),
        }
    }
    Ok(sessions)
}

/// Body of `POST /quiz-sessions` and `PUT /quiz-sessions/{id}`.
#[derive(Debug, Serialize)]
pub struct SessionPayload<'a> {
    pub quiz_id: &'a str,
    pub formation_id: Option<&'a str>,
    pub question_ids: &'a [String],
    pub current_index: usize,
    pub answers: &'a AnswerMap,
    pub score: u32,
    pub streak: u32,
    pub max_streak: u32,
    pub time_spent: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub correct_question_ids: &'a BTreeSet<String>,
    pub revealed: bool,
    pub progress_percentage: u8,
}

impl<'a> From<&'a AttemptState> for SessionPayload<'a> {
    fn from(state: &'a AttemptState) -> Self {
        Self {
            quiz_id: &state.quiz_id,
            formation_id: state.formation_id.as_deref(),
            question_ids: &state.question_ids,
            current_index: state.current_index,
            answers: &state.answers,
            score: state.score,
            streak: state.streak,
            max_streak: state.max_streak,
            time_spent: state.time_spent,
            status: state.status,
            started_at: state.started_at,
            last_activity_at: state.last_activity_at,
            expires_at: state.expires_at,
            correct_question_ids: &state.correct_question_ids,
            revealed: state.revealed,
            progress_percentage: state.progress_percentage(),
        }
    }
}

/// Record stored under `quiz_session_{quizId}` in the local buffer.
///
/// Only `questionIds` is required; older records carry just the
/// `questionIds`/`answers`/`currentIndex`/`timeSpent` subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferedSession {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_id")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_id")]
    pub quiz_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_id")]
    pub formation_id: Option<String>,
    #[serde(deserialize_with = "de_id_list")]
    pub question_ids: Vec<String>,
    #[serde(default, deserialize_with = "de_answers")]
    pub answers: AnswerMap,
    #[serde(default)]
    pub current_index: usize,
    #[serde(default)]
    pub time_spent: u32,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub streak: u32,
    #[serde(default)]
    pub max_streak: u32,
    #[serde(default)]
    pub correct_question_ids: BTreeSet<String>,
    #[serde(default)]
    pub revealed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de_opt_status")]
    pub status: Option<SessionStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_timestamp"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_timestamp"
    )]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_timestamp"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BufferedSession {
    pub fn from_state(state: &AttemptState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            quiz_id: Some(state.quiz_id.clone()),
            formation_id: state.formation_id.clone(),
            question_ids: state.question_ids.clone(),
            answers: state.answers.clone(),
            current_index: state.current_index,
            time_spent: state.time_spent,
            score: state.score,
            streak: state.streak,
            max_streak: state.max_streak,
            correct_question_ids: state.correct_question_ids.clone(),
            revealed: state.revealed,
            status: Some(state.status),
            started_at: Some(state.started_at),
            last_activity_at: Some(state.last_activity_at),
            expires_at: Some(state.expires_at),
        }
    }

    /// Rebuilds the attempt. `fallback_at` stands in for missing timestamps.
    pub fn into_state(
        self,
        key_quiz_id: &str,
        fallback_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<AttemptState, String> {
        let started_at = self.started_at.unwrap_or(fallback_at);
        let last_activity_at = self.last_activity_at.unwrap_or(fallback_at).max(started_at);
        let state = AttemptState {
            session_id: self.session_id,
            quiz_id: self.quiz_id.unwrap_or_else(|| key_quiz_id.to_string()),
            formation_id: self.formation_id,
            question_ids: self.question_ids,
            current_index: self.current_index,
            answers: self.answers,
            score: self.score,
            streak: self.streak,
            max_streak: self.max_streak.max(self.streak),
            time_spent: self.time_spent,
            status: self.status.unwrap_or(SessionStatus::Active),
            started_at,
            last_activity_at,
            expires_at: self.expires_at.unwrap_or(last_activity_at + ttl),
            correct_question_ids: self.correct_question_ids,
            revealed: self.revealed,
        };
        state.check_shape()?;
        Ok(state)
    }
}

/// Parses a raw local record; any failure marks the record corrupt.
pub fn parse_buffered(
    key: &str,
    raw: &str,
    fallback_at: DateTime<Utc>,
    ttl: Duration,
) -> GatewayResult<AttemptState> {
    let quiz_id = key
        .strip_prefix(super::session::BUFFER_KEY_PREFIX)
        .unwrap_or(key);
    let record: BufferedSession = serde_json::from_str(raw).map_err(|e| {
        tracing::debug!("Buffered session {} does not parse: {}", key, e);
        GatewayError::CorruptRecord(key.to_string())
    })?;
    record.into_state(quiz_id, fallback_at, ttl).map_err(|e| {
        tracing::debug!("Buffered session {} is inconsistent: {}", key, e);
        GatewayError::CorruptRecord(key.to_string())
    })
}

#[derive(Debug, Deserialize)]
pub struct WireQuizResult {
    #[serde(default, alias = "quizId", deserialize_with = "de_opt_id")]
    pub quiz_id: Option<String>,
    #[serde(
        default,
        alias = "total_score",
        alias = "points",
        deserialize_with = "de_opt_u32"
    )]
    pub score: Option<u32>,
    #[serde(
        default,
        alias = "percent",
        alias = "pourcentage",
        deserialize_with = "de_opt_u32"
    )]
    pub percentage: Option<u32>,
    #[serde(
        default,
        alias = "correctCount",
        alias = "correct_answers",
        deserialize_with = "de_opt_u32"
    )]
    pub correct_count: Option<u32>,
    #[serde(default, alias = "totalQuestions", deserialize_with = "de_opt_u32")]
    pub total_questions: Option<u32>,
    #[serde(default, alias = "success", alias = "reussi", deserialize_with = "de_opt_bool")]
    pub passed: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

impl WireQuizResult {
    /// Missing figures fall back to the local tally.
    pub fn into_result(self, quiz_id: &str, summary: &AttemptSummary) -> QuizResult {
        QuizResult {
            quiz_id: self.quiz_id.unwrap_or_else(|| quiz_id.to_string()),
            score: self.score.unwrap_or(summary.score),
            percentage: self
                .percentage
                .map(|p| p.min(100) as u8)
                .unwrap_or(summary.percentage),
            correct_count: self
                .correct_count
                .map(|c| c as usize)
                .unwrap_or(summary.correct_count),
            total_questions: self
                .total_questions
                .map(|t| t as usize)
                .unwrap_or(summary.total_questions),
            passed: self.passed,
            message: self.message,
        }
    }
}

pub fn parse_quiz_result(
    value: Value,
    quiz_id: &str,
    summary: &AttemptSummary,
) -> GatewayResult<QuizResult> {
    let wire: WireQuizResult =
        serde_json::from_value(unwrap_envelope(value, &["data", "result"]))
            .map_err(|e| GatewayError::InvalidPayload(format!("quiz result: {}", e)))?;
    Ok(wire.into_result(quiz_id, summary))
}
