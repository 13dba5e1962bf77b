use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::Quiz;

/// Prefix of the per-quiz key used by the local buffer.
pub const BUFFER_KEY_PREFIX: &str = "quiz_session_";

pub fn buffer_key(quiz_id: &str) -> String {
    format!("{}{}", BUFFER_KEY_PREFIX, quiz_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[serde(alias = "in_progress", alias = "started")]
    Active,
    #[serde(alias = "finished", alias = "done")]
    Completed,
    #[serde(alias = "abandoned")]
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
        }
    }
}

/// Where a stored session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Local,
    Remote,
}

pub type AnswerMap = BTreeMap<String, BTreeSet<String>>;

/// Progress of a single quiz attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptState {
    /// Server-assigned id once the attempt has been persisted remotely.
    pub session_id: Option<String>,
    pub quiz_id: String,
    pub formation_id: Option<String>,
    pub question_ids: Vec<String>,
    pub current_index: usize,
    pub answers: AnswerMap,
    pub score: u32,
    pub streak: u32,
    pub max_streak: u32,
    pub time_spent: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Questions answered correctly so far.
    #[serde(default)]
    pub correct_question_ids: BTreeSet<String>,
    /// The current question has been evaluated and its explanation is shown.
    #[serde(default)]
    pub revealed: bool,
}

impl AttemptState {
    pub fn start(quiz: &Quiz, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            session_id: None,
            quiz_id: quiz.id.clone(),
            formation_id: quiz.formation_id.clone(),
            question_ids: quiz.question_ids(),
            current_index: 0,
            answers: AnswerMap::new(),
            score: 0,
            streak: 0,
            max_streak: 0,
            time_spent: 0,
            status: SessionStatus::Active,
            started_at: now,
            last_activity_at: now,
            expires_at: now + ttl,
            correct_question_ids: BTreeSet::new(),
            revealed: false,
        }
    }

    pub fn buffer_key(&self) -> String {
        buffer_key(&self.quiz_id)
    }

    /// Records activity and slides the expiry window forward.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
        let sliding = self.last_activity_at + ttl;
        if sliding > self.expires_at {
            self.expires_at = sliding;
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SessionStatus::Expired => true,
            SessionStatus::Active => self.expires_at <= now,
            SessionStatus::Completed => false,
        }
    }

    /// Marks an idle active attempt as expired. Returns true on transition.
    pub fn expire_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == SessionStatus::Active && self.expires_at <= now {
            self.status = SessionStatus::Expired;
            return true;
        }
        false
    }

    pub fn progress_percentage(&self) -> u8 {
        if self.status == SessionStatus::Completed {
            return 100;
        }
        let total = self.question_ids.len();
        if total == 0 {
            return 0;
        }
        let done = self.current_index + usize::from(self.revealed);
        ((done.min(total) * 100) as f64 / total as f64).round() as u8
    }

    /// Checks the index and answer keys against the question list.
    pub fn check_shape(&self) -> Result<(), String> {
        let total = self.question_ids.len();
        if self.quiz_id.trim().is_empty() {
            return Err("quiz_id is empty".to_string());
        }
        if (total == 0 && self.current_index != 0) || (total > 0 && self.current_index >= total)
        {
            return Err(format!(
                "current_index {} out of range for {} questions",
                self.current_index, total
            ));
        }
        if let Some(unknown) = self
            .answers
            .keys()
            .find(|qid| !self.question_ids.contains(qid))
        {
            return Err(format!("answer for unknown question {}", unknown));
        }
        Ok(())
    }
}

/// A persisted attempt, as returned by a session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredSession {
    pub id: String,
    pub origin: SessionOrigin,
    pub state: AttemptState,
    pub progress_percentage: u8,
    pub is_expired: bool,
}

impl StoredSession {
    pub fn local(state: AttemptState, now: DateTime<Utc>) -> Self {
        Self {
            id: state.buffer_key(),
            origin: SessionOrigin::Local,
            progress_percentage: state.progress_percentage(),
            is_expired: state.is_expired_at(now),
            state,
        }
    }

    pub fn quiz_id(&self) -> &str {
        &self.state.quiz_id
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.state.last_activity_at
    }
}

/// Partial update applied to a stored session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answers: Option<AnswerMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streak: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_streak: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_spent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    /// Applies the patch. Score, time and activity never move backwards.
    pub fn apply_to(&self, state: &mut AttemptState) -> Result<(), String> {
        let mut next = state.clone();
        if let Some(index) = self.current_index {
            next.current_index = index;
        }
        if let Some(answers) = &self.answers {
            next.answers = answers.clone();
        }
        if let Some(score) = self.score {
            next.score = next.score.max(score);
        }
        if let Some(streak) = self.streak {
            next.streak = streak;
        }
        if let Some(max_streak) = self.max_streak {
            next.max_streak = next.max_streak.max(max_streak);
        }
        if let Some(time_spent) = self.time_spent {
            next.time_spent = next.time_spent.max(time_spent);
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(at) = self.last_activity_at {
            next.last_activity_at = next.last_activity_at.max(at);
        }
        next.check_shape()?;
        *state = next;
        Ok(())
    }
}

/// Final figures sent when completing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionData {
    pub score: u32,
    pub percentage: u8,
    pub correct_count: usize,
    pub total_questions: usize,
    pub max_streak: u32,
    pub time_spent: u32,
    pub answers: AnswerMap,
    pub completed_at: DateTime<Utc>,
}
