//! Per-attempt scoring state machine.
//!
//! `Presenting(i)` → `Explaining(i)` → `Presenting(i + 1)` → … → `Finished`.
//! Exclusive questions (true/false, single choice) are evaluated as soon as
//! an answer is picked; every other kind toggles answers and waits for
//! [`AttemptScorer::check`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::metrics::ANSWERS_EVALUATED_TOTAL;
use crate::models::session::AnswerMap;
use crate::models::{AttemptState, AttemptSummary, Question, SessionStatus};

/// How a multi-select answer is judged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultiSelectRule {
    /// Non-empty selection where every selected answer is correct.
    #[default]
    AllSelectedCorrect,
    /// Selection equals the set of correct answers.
    ExactMatch,
}

impl FromStr for MultiSelectRule {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('_', "-").as_str() {
            "all-selected-correct" => Ok(MultiSelectRule::AllSelectedCorrect),
            "exact-match" => Ok(MultiSelectRule::ExactMatch),
            _ => Err(format!("Invalid multi-select rule: {}", value)),
        }
    }
}

impl MultiSelectRule {
    pub fn is_correct(&self, question: &Question, selection: &BTreeSet<String>) -> bool {
        if selection.is_empty() {
            return false;
        }
        let all_selected_correct = selection
            .iter()
            .all(|id| question.answer(id).is_some_and(|a| a.is_correct));
        match self {
            MultiSelectRule::AllSelectedCorrect => all_selected_correct,
            MultiSelectRule::ExactMatch => {
                all_selected_correct && *selection == question.correct_answer_ids()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerPhase {
    Presenting(usize),
    Explaining(usize),
    Finished,
}

impl fmt::Display for ScorerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScorerPhase::Presenting(i) => write!(f, "presenting question {}", i),
            ScorerPhase::Explaining(i) => write!(f, "explaining question {}", i),
            ScorerPhase::Finished => f.write_str("finished"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScoringError {
    #[error("Question {0} is not the current question")]
    NotCurrentQuestion(String),

    #[error("Answer {answer_id} does not belong to question {question_id}")]
    ForeignAnswer {
        question_id: String,
        answer_id: String,
    },

    #[error("Cannot {action} while {phase}")]
    InvalidPhase {
        action: &'static str,
        phase: ScorerPhase,
    },
}

/// Outcome of evaluating one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub question_id: String,
    pub correct: bool,
    pub points_awarded: u32,
    pub correct_answer_ids: BTreeSet<String>,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Multi-select toggle; `selected` is the new membership of the answer.
    Toggled { selected: bool },
    /// Exclusive question, evaluated immediately.
    Evaluated(Evaluation),
}

#[derive(Debug, Clone)]
pub struct AttemptScorer {
    questions: Vec<Question>,
    rule: MultiSelectRule,
    phase: ScorerPhase,
    selections: AnswerMap,
    correct: BTreeSet<String>,
    score: u32,
    streak: u32,
    max_streak: u32,
    time_spent: u32,
    last_evaluation: Option<Evaluation>,
}

impl AttemptScorer {
    pub fn new(questions: Vec<Question>, rule: MultiSelectRule) -> Self {
        let phase = if questions.is_empty() {
            ScorerPhase::Finished
        } else {
            ScorerPhase::Presenting(0)
        };
        Self {
            questions,
            rule,
            phase,
            selections: AnswerMap::new(),
            correct: BTreeSet::new(),
            score: 0,
            streak: 0,
            max_streak: 0,
            time_spent: 0,
            last_evaluation: None,
        }
    }

    /// Rebuilds a scorer from a checkpoint. Questions follow the checkpoint
    /// order; ids the quiz no longer knows are dropped.
    pub fn from_checkpoint(
        questions: Vec<Question>,
        state: &AttemptState,
        rule: MultiSelectRule,
    ) -> Self {
        let mut by_id: BTreeMap<String, Question> =
            questions.into_iter().map(|q| (q.id.clone(), q)).collect();
        let ordered: Vec<Question> = state
            .question_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();

        let mut scorer = Self::new(ordered, rule);
        if scorer.questions.is_empty() {
            return scorer;
        }

        let index = state.current_index.min(scorer.questions.len() - 1);
        scorer.selections = state
            .answers
            .iter()
            .filter(|(qid, _)| scorer.position_of(qid).is_some())
            .map(|(qid, ids)| (qid.clone(), ids.clone()))
            .collect();
        scorer.score = state.score;
        scorer.streak = state.streak;
        scorer.max_streak = state.max_streak.max(state.streak);
        scorer.time_spent = state.time_spent;
        scorer.correct = state
            .correct_question_ids
            .iter()
            .filter(|qid| scorer.position_of(qid).is_some())
            .cloned()
            .collect();

        let evaluated_up_to = index + usize::from(state.revealed);
        if scorer.correct.is_empty() && state.score == 0 && evaluated_up_to > 0 {
            // Older buffered records carry answers only; re-derive the tally.
            scorer.recover_tally(evaluated_up_to);
        }

        scorer.phase = match state.status {
            SessionStatus::Active if state.revealed => ScorerPhase::Explaining(index),
            SessionStatus::Active => ScorerPhase::Presenting(index),
            SessionStatus::Completed | SessionStatus::Expired => ScorerPhase::Finished,
        };
        scorer
    }

    fn recover_tally(&mut self, evaluated: usize) {
        for i in 0..evaluated.min(self.questions.len()) {
            let question = &self.questions[i];
            let selection = self.selections.get(&question.id).cloned().unwrap_or_default();
            if self.rule.is_correct(question, &selection) {
                self.score += question.points;
                self.streak += 1;
                self.max_streak = self.max_streak.max(self.streak);
                self.correct.insert(question.id.clone());
            } else {
                self.streak = 0;
            }
        }
    }

    fn position_of(&self, question_id: &str) -> Option<usize> {
        self.questions.iter().position(|q| q.id == question_id)
    }

    pub fn phase(&self) -> ScorerPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == ScorerPhase::Finished
    }

    pub fn current_index(&self) -> Option<usize> {
        match self.phase {
            ScorerPhase::Presenting(i) | ScorerPhase::Explaining(i) => Some(i),
            ScorerPhase::Finished => None,
        }
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.current_index().and_then(|i| self.questions.get(i))
    }

    pub fn selection(&self, question_id: &str) -> BTreeSet<String> {
        self.selections.get(question_id).cloned().unwrap_or_default()
    }

    /// Explanation of the question being explained, if it has one.
    pub fn explanation(&self) -> Option<&str> {
        match self.phase {
            ScorerPhase::Explaining(i) => self.questions[i].explanation.as_deref(),
            _ => None,
        }
    }

    pub fn last_evaluation(&self) -> Option<&Evaluation> {
        self.last_evaluation.as_ref()
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn max_streak(&self) -> u32 {
        self.max_streak
    }

    pub fn time_spent(&self) -> u32 {
        self.time_spent
    }

    pub fn correct_count(&self) -> usize {
        self.correct.len()
    }

    pub fn total_questions(&self) -> usize {
        self.questions.len()
    }

    fn reject(&self, error: ScoringError) -> ScoringError {
        tracing::error!("Scorer invariant violation: {}", error);
        error
    }

    fn presenting_index(&self, action: &'static str) -> Result<usize, ScoringError> {
        match self.phase {
            ScorerPhase::Presenting(i) => Ok(i),
            phase => Err(self.reject(ScoringError::InvalidPhase { action, phase })),
        }
    }

    pub fn select_answer(
        &mut self,
        question_id: &str,
        answer_id: &str,
    ) -> Result<SelectOutcome, ScoringError> {
        let index = self.presenting_index("select an answer")?;
        let question = &self.questions[index];
        if question.id != question_id {
            return Err(self.reject(ScoringError::NotCurrentQuestion(question_id.to_string())));
        }
        if question.answer(answer_id).is_none() {
            return Err(self.reject(ScoringError::ForeignAnswer {
                question_id: question_id.to_string(),
                answer_id: answer_id.to_string(),
            }));
        }

        if question.is_exclusive() {
            self.selections.insert(
                question_id.to_string(),
                BTreeSet::from([answer_id.to_string()]),
            );
            return Ok(SelectOutcome::Evaluated(self.evaluate(index)));
        }

        let selection = self.selections.entry(question_id.to_string()).or_default();
        let selected = if selection.remove(answer_id) {
            false
        } else {
            selection.insert(answer_id.to_string());
            true
        };
        Ok(SelectOutcome::Toggled { selected })
    }

    /// Explicit evaluation trigger for the current question.
    pub fn check(&mut self) -> Result<Evaluation, ScoringError> {
        let index = self.presenting_index("check")?;
        Ok(self.evaluate(index))
    }

    fn evaluate(&mut self, index: usize) -> Evaluation {
        let question = &self.questions[index];
        let selection = self.selections.get(&question.id).cloned().unwrap_or_default();
        let correct = self.rule.is_correct(question, &selection);

        let points_awarded = if correct {
            self.score += question.points;
            self.streak += 1;
            self.max_streak = self.max_streak.max(self.streak);
            self.correct.insert(question.id.clone());
            question.points
        } else {
            self.streak = 0;
            0
        };

        ANSWERS_EVALUATED_TOTAL
            .with_label_values(&[if correct { "true" } else { "false" }])
            .inc();

        let evaluation = Evaluation {
            question_id: question.id.clone(),
            correct,
            points_awarded,
            correct_answer_ids: question.correct_answer_ids(),
            explanation: question.explanation.clone(),
        };
        tracing::debug!(
            "Question {} evaluated: correct={}, score={}, streak={}",
            evaluation.question_id,
            correct,
            self.score,
            self.streak
        );

        self.phase = ScorerPhase::Explaining(index);
        self.last_evaluation = Some(evaluation.clone());
        evaluation
    }

    pub fn advance(&mut self) -> Result<ScorerPhase, ScoringError> {
        let index = match self.phase {
            ScorerPhase::Explaining(i) => i,
            phase => {
                return Err(self.reject(ScoringError::InvalidPhase {
                    action: "advance",
                    phase,
                }))
            }
        };

        self.phase = if index + 1 >= self.questions.len() {
            ScorerPhase::Finished
        } else {
            let next = &self.questions[index + 1];
            self.selections.remove(&next.id);
            ScorerPhase::Presenting(index + 1)
        };
        self.last_evaluation = None;
        Ok(self.phase)
    }

    /// Ends the attempt regardless of remaining questions.
    pub fn time_up(&mut self) {
        if self.phase != ScorerPhase::Finished {
            tracing::info!("Time is up at {}", self.phase);
            self.phase = ScorerPhase::Finished;
        }
    }

    pub fn tick(&mut self, seconds: u32) {
        if self.phase != ScorerPhase::Finished {
            self.time_spent = self.time_spent.saturating_add(seconds);
        }
    }

    /// Final tally, once finished.
    pub fn summary(&self) -> Option<AttemptSummary> {
        if !self.is_finished() {
            return None;
        }
        Some(AttemptSummary {
            percentage: AttemptSummary::percentage_of(self.correct.len(), self.questions.len()),
            correct_count: self.correct.len(),
            total_questions: self.questions.len(),
            score: self.score,
            max_streak: self.max_streak,
            time_spent: self.time_spent,
        })
    }

    /// Copies progress into a persisted state.
    pub fn write_checkpoint(&self, state: &mut AttemptState) {
        state.question_ids = self.questions.iter().map(|q| q.id.clone()).collect();
        state.answers = self.selections.clone();
        state.score = self.score;
        state.streak = self.streak;
        state.max_streak = self.max_streak;
        state.time_spent = state.time_spent.max(self.time_spent);
        state.correct_question_ids = self.correct.clone();
        match self.phase {
            ScorerPhase::Presenting(i) => {
                state.current_index = i;
                state.revealed = false;
            }
            ScorerPhase::Explaining(i) => {
                state.current_index = i;
                state.revealed = true;
            }
            ScorerPhase::Finished => {
                state.current_index = self.questions.len().saturating_sub(1);
                state.revealed = false;
                state.status = SessionStatus::Completed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Answer, QuestionType};

    fn question(
        id: &str,
        kind: QuestionType,
        points: u32,
        correct: &[&str],
        wrong: &[&str],
    ) -> Question {
        let answers = correct
            .iter()
            .map(|a| (a, true))
            .chain(wrong.iter().map(|a| (a, false)))
            .map(|(a, is_correct)| Answer {
                id: a.to_string(),
                text: a.to_uppercase(),
                is_correct,
            })
            .collect();
        Question {
            id: id.to_string(),
            text: format!("Question {}", id),
            question_type: kind,
            answers,
            points,
            explanation: Some(format!("Because {}", id)),
            media_url: None,
        }
    }

    fn tf(id: &str) -> Question {
        question(id, QuestionType::TrueFalse, 10, &["t"], &["f"])
    }

    #[test]
    fn exclusive_choice_scenario_rounds_percentage() {
        let questions = vec![tf("q1"), tf("q2"), tf("q3")];
        let mut scorer = AttemptScorer::new(questions, MultiSelectRule::default());

        for (qid, answer) in [("q1", "t"), ("q2", "t"), ("q3", "f")] {
            assert_eq!(scorer.current_question().map(|q| q.id.as_str()), Some(qid));
            let outcome = scorer.select_answer(qid, answer).unwrap();
            assert!(matches!(outcome, SelectOutcome::Evaluated(_)));
            assert!(scorer.explanation().is_some());
            scorer.advance().unwrap();
        }

        let summary = scorer.summary().unwrap();
        assert_eq!(summary.percentage, 67);
        assert_eq!(summary.correct_count, 2);
        assert_eq!(summary.max_streak, 2);
        assert_eq!(summary.score, 20);
        assert_eq!(scorer.streak(), 0);
        assert!(scorer.current_question().is_none());
    }

    #[test]
    fn multi_select_defers_evaluation_until_check() {
        let q = question("m", QuestionType::MultipleChoice, 5, &["a", "b"], &["c"]);
        let mut scorer = AttemptScorer::new(vec![q], MultiSelectRule::default());

        assert_eq!(
            scorer.select_answer("m", "a").unwrap(),
            SelectOutcome::Toggled { selected: true }
        );
        assert_eq!(
            scorer.select_answer("m", "c").unwrap(),
            SelectOutcome::Toggled { selected: true }
        );
        assert_eq!(
            scorer.select_answer("m", "c").unwrap(),
            SelectOutcome::Toggled { selected: false }
        );
        assert_eq!(scorer.phase(), ScorerPhase::Presenting(0));
        assert_eq!(scorer.score(), 0);

        let evaluation = scorer.check().unwrap();
        assert!(evaluation.correct);
        assert_eq!(evaluation.points_awarded, 5);
        assert_eq!(scorer.phase(), ScorerPhase::Explaining(0));
        assert_eq!(scorer.explanation(), Some("Because m"));
    }

    #[test]
    fn incorrect_selection_resets_streak_and_keeps_score() {
        let q1 = tf("q1");
        let q2 = question("q2", QuestionType::MultipleChoice, 10, &["a"], &["b"]);
        let mut scorer = AttemptScorer::new(vec![q1, q2], MultiSelectRule::default());

        scorer.select_answer("q1", "t").unwrap();
        scorer.advance().unwrap();
        assert_eq!((scorer.score(), scorer.streak()), (10, 1));

        scorer.select_answer("q2", "a").unwrap();
        scorer.select_answer("q2", "b").unwrap();
        let evaluation = scorer.check().unwrap();

        assert!(!evaluation.correct);
        assert_eq!(scorer.score(), 10);
        assert_eq!(scorer.streak(), 0);
        assert_eq!(scorer.max_streak(), 1);
    }

    #[test]
    fn empty_selection_is_never_correct() {
        let q = question("m", QuestionType::Other("matching".to_string()), 5, &["a"], &[]);
        let mut scorer = AttemptScorer::new(vec![q], MultiSelectRule::default());

        assert!(!scorer.check().unwrap().correct);
    }

    #[test]
    fn partial_selection_depends_on_rule() {
        let q = question("m", QuestionType::MultipleChoice, 5, &["a", "b"], &["c"]);

        let mut lenient = AttemptScorer::new(vec![q.clone()], MultiSelectRule::AllSelectedCorrect);
        lenient.select_answer("m", "a").unwrap();
        assert!(lenient.check().unwrap().correct);

        let mut strict = AttemptScorer::new(vec![q], MultiSelectRule::ExactMatch);
        strict.select_answer("m", "a").unwrap();
        assert!(!strict.check().unwrap().correct);
        assert_eq!(strict.streak(), 0);
    }

    #[test]
    fn foreign_answer_is_rejected_without_side_effects() {
        let mut scorer = AttemptScorer::new(vec![tf("q1"), tf("q2")], MultiSelectRule::default());

        let err = scorer.select_answer("q1", "nope").unwrap_err();
        assert!(matches!(err, ScoringError::ForeignAnswer { .. }));
        let err = scorer.select_answer("q2", "t").unwrap_err();
        assert_eq!(err, ScoringError::NotCurrentQuestion("q2".to_string()));
        assert_eq!(scorer.phase(), ScorerPhase::Presenting(0));
        assert!(scorer.selection("q1").is_empty());
    }

    #[test]
    fn actions_outside_their_phase_are_rejected() {
        let mut scorer = AttemptScorer::new(vec![tf("q1")], MultiSelectRule::default());

        assert!(matches!(scorer.advance(), Err(ScoringError::InvalidPhase { .. })));
        scorer.select_answer("q1", "t").unwrap();
        assert!(matches!(scorer.check(), Err(ScoringError::InvalidPhase { .. })));
        assert!(matches!(
            scorer.select_answer("q1", "f"),
            Err(ScoringError::InvalidPhase { .. })
        ));
        assert_eq!(scorer.advance().unwrap(), ScorerPhase::Finished);
    }

    #[test]
    fn time_up_finishes_early_and_freezes_clock() {
        let questions = vec![tf("q1"), tf("q2"), tf("q3")];
        let mut scorer = AttemptScorer::new(questions, MultiSelectRule::default());
        scorer.tick(3);
        scorer.select_answer("q1", "t").unwrap();
        scorer.time_up();
        scorer.tick(5);

        let summary = scorer.summary().unwrap();
        assert_eq!(summary.time_spent, 3);
        assert_eq!(summary.correct_count, 1);
        assert_eq!(summary.total_questions, 3);
        assert_eq!(summary.percentage, 33);
    }

    #[test]
    fn empty_quiz_starts_finished() {
        let scorer = AttemptScorer::new(Vec::new(), MultiSelectRule::default());
        assert_eq!(scorer.summary().unwrap().percentage, 0);
    }

    #[test]
    fn checkpoint_round_trip_resumes_mid_explanation() {
        let questions = vec![tf("q1"), tf("q2"), tf("q3")];
        let mut scorer = AttemptScorer::new(questions.clone(), MultiSelectRule::default());
        scorer.select_answer("q1", "t").unwrap();
        scorer.advance().unwrap();
        scorer.select_answer("q2", "t").unwrap();
        scorer.tick(12);

        let now = chrono::Utc::now();
        let mut state = AttemptState {
            session_id: None,
            quiz_id: "quiz".to_string(),
            formation_id: None,
            question_ids: Vec::new(),
            current_index: 0,
            answers: AnswerMap::new(),
            score: 0,
            streak: 0,
            max_streak: 0,
            time_spent: 0,
            status: SessionStatus::Active,
            started_at: now,
            last_activity_at: now,
            expires_at: now,
            correct_question_ids: BTreeSet::new(),
            revealed: false,
        };
        scorer.write_checkpoint(&mut state);
        assert_eq!(state.current_index, 1);
        assert!(state.revealed);

        let resumed = AttemptScorer::from_checkpoint(questions, &state, MultiSelectRule::default());
        assert_eq!(resumed.phase(), ScorerPhase::Explaining(1));
        assert_eq!(resumed.score(), 20);
        assert_eq!(resumed.streak(), 2);
        assert_eq!(resumed.correct_count(), 2);
        assert_eq!(resumed.time_spent(), 12);
    }

    #[test]
    fn legacy_checkpoint_recovers_tally_from_answers() {
        let questions = vec![tf("q1"), tf("q2"), tf("q3")];
        let now = chrono::Utc::now();
        let state = AttemptState {
            session_id: None,
            quiz_id: "quiz".to_string(),
            formation_id: None,
            question_ids: vec!["q1".into(), "q2".into(), "q3".into()],
            current_index: 2,
            answers: AnswerMap::from([
                ("q1".to_string(), BTreeSet::from(["t".to_string()])),
                ("q2".to_string(), BTreeSet::from(["f".to_string()])),
            ]),
            score: 0,
            streak: 0,
            max_streak: 0,
            time_spent: 30,
            status: SessionStatus::Active,
            started_at: now,
            last_activity_at: now,
            expires_at: now,
            correct_question_ids: BTreeSet::new(),
            revealed: false,
        };

        let resumed = AttemptScorer::from_checkpoint(questions, &state, MultiSelectRule::default());
        assert_eq!(resumed.phase(), ScorerPhase::Presenting(2));
        assert_eq!(resumed.score(), 10);
        assert_eq!(resumed.correct_count(), 1);
        assert_eq!(resumed.streak(), 0);
        assert_eq!(resumed.max_streak(), 1);
    }
}
