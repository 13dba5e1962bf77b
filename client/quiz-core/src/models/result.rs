use serde::{Deserialize, Serialize};

use super::session::AnswerMap;

/// Local tally of a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub percentage: u8,
    pub correct_count: usize,
    pub total_questions: usize,
    pub score: u32,
    pub max_streak: u32,
    pub time_spent: u32,
}

impl AttemptSummary {
    pub fn percentage_of(correct_count: usize, total_questions: usize) -> u8 {
        if total_questions == 0 {
            return 0;
        }
        (100.0 * correct_count as f64 / total_questions as f64).round() as u8
    }
}

/// Body of `POST /quiz/submit`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionPayload {
    pub quiz_id: String,
    pub formation_id: Option<String>,
    pub session_id: Option<String>,
    pub answers: AnswerMap,
    pub score: u32,
    pub percentage: u8,
    pub correct_count: usize,
    pub total_questions: usize,
    pub max_streak: u32,
    pub time_spent: u32,
}

/// Authoritative result returned by the submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizResult {
    pub quiz_id: String,
    pub score: u32,
    pub percentage: u8,
    pub correct_count: usize,
    pub total_questions: usize,
    pub passed: Option<bool>,
    pub message: Option<String>,
}
