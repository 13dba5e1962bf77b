use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub mod result;
pub mod session;
pub mod timer;
pub mod wire;

pub use result::{AttemptSummary, QuizResult};
pub use session::{
    buffer_key, AttemptState, CompletionData, SessionOrigin, SessionPatch, SessionStatus,
    StoredSession, BUFFER_KEY_PREFIX,
};

/// Canonical difficulty tier. Ordering is the tier rank used for sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelTier {
    Beginner,
    Intermediate,
    Advanced,
}

impl LevelTier {
    pub const ALL: [LevelTier; 3] = [
        LevelTier::Beginner,
        LevelTier::Intermediate,
        LevelTier::Advanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LevelTier::Beginner => "beginner",
            LevelTier::Intermediate => "intermediate",
            LevelTier::Advanced => "advanced",
        }
    }
}

impl fmt::Display for LevelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Question kind. Only exclusive kinds are evaluated on selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QuestionType {
    TrueFalse,
    SingleChoice,
    MultipleChoice,
    Other(String),
}

impl QuestionType {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return QuestionType::MultipleChoice;
        };
        let normalized = raw.to_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "true-false" | "truefalse" | "vrai-faux" | "boolean" => QuestionType::TrueFalse,
            "single-choice" | "single" | "radio" => QuestionType::SingleChoice,
            "multiple-choice" | "multiple" | "checkbox" | "qcm" => QuestionType::MultipleChoice,
            _ => QuestionType::Other(raw.to_string()),
        }
    }

    /// Exclusive kinds replace the selection and evaluate immediately.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, QuestionType::TrueFalse | QuestionType::SingleChoice)
    }

    pub fn as_str(&self) -> &str {
        match self {
            QuestionType::TrueFalse => "true-false",
            QuestionType::SingleChoice => "single-choice",
            QuestionType::MultipleChoice => "multiple-choice",
            QuestionType::Other(raw) => raw,
        }
    }
}

impl From<String> for QuestionType {
    fn from(value: String) -> Self {
        QuestionType::parse(Some(&value))
    }
}

impl From<QuestionType> for String {
    fn from(value: QuestionType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    pub text: String,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub question_type: QuestionType,
    pub answers: Vec<Answer>,
    pub points: u32,
    pub explanation: Option<String>,
    pub media_url: Option<String>,
}

impl Question {
    pub fn answer(&self, answer_id: &str) -> Option<&Answer> {
        self.answers.iter().find(|a| a.id == answer_id)
    }

    pub fn correct_answer_ids(&self) -> BTreeSet<String> {
        self.answers
            .iter()
            .filter(|a| a.is_correct)
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn is_exclusive(&self) -> bool {
        self.question_type.is_exclusive()
    }
}

/// A quiz as fetched from the catalog. Read-only for the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub id: String,
    pub title: String,
    pub description: String,
    pub level: Option<String>,
    pub formation_id: Option<String>,
    pub questions: Vec<Question>,
    pub total_points: u32,
    pub duration_seconds: u32,
}

impl Quiz {
    pub fn question_ids(&self) -> Vec<String> {
        self.questions.iter().map(|q| q.id.clone()).collect()
    }

    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayHistoryEntry {
    pub quiz_id: String,
    pub played_at: Option<DateTime<Utc>>,
}

impl PlayHistoryEntry {
    pub fn new(quiz_id: impl Into<String>) -> Self {
        Self {
            quiz_id: quiz_id.into(),
            played_at: None,
        }
    }
}

/// Formation ids the learner is enrolled in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentSet(BTreeSet<String>);

impl EnrollmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, formation_id: impl Into<String>) -> bool {
        let id = formation_id.into();
        let id = id.trim();
        if id.is_empty() {
            return false;
        }
        self.0.insert(id.to_string())
    }

    pub fn contains(&self, formation_id: &str) -> bool {
        self.0.contains(formation_id.trim())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl<S: Into<String>> FromIterator<S> for EnrollmentSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = EnrollmentSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}
