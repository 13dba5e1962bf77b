use std::collections::HashSet;

use super::level_service::{AccessPolicy, LevelClassifier};
use crate::models::{EnrollmentSet, LevelTier, PlayHistoryEntry, Quiz};

/// Produces the ordered list of quizzes a learner may start.
#[derive(Debug, Clone, Default)]
pub struct QuizFilter {
    classifier: LevelClassifier,
    policy: AccessPolicy,
}

impl QuizFilter {
    pub fn new(classifier: LevelClassifier, policy: AccessPolicy) -> Self {
        Self { classifier, policy }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn tier_of(&self, quiz: &Quiz) -> LevelTier {
        self.classifier.classify(quiz.level.as_deref())
    }

    /// Unplayed quizzes of enrolled formations whose tier the points unlock,
    /// sorted by tier then title. Falls back to every unplayed enrolled quiz
    /// when no tier is reachable.
    pub fn select(
        &self,
        all_quizzes: &[Quiz],
        history: &[PlayHistoryEntry],
        enrollment: &EnrollmentSet,
        points: u32,
    ) -> Vec<Quiz> {
        let played: HashSet<&str> = history.iter().map(|h| h.quiz_id.trim()).collect();
        let mut seen: HashSet<&str> = HashSet::new();

        let eligible: Vec<(LevelTier, &Quiz)> = all_quizzes
            .iter()
            .filter(|quiz| !played.contains(quiz.id.trim()))
            .filter(|quiz| {
                quiz.formation_id
                    .as_deref()
                    .is_some_and(|formation| enrollment.contains(formation))
            })
            .filter(|quiz| seen.insert(quiz.id.trim()))
            .map(|quiz| (self.tier_of(quiz), quiz))
            .collect();

        let unlocked = self.policy.unlocked_tiers(points);
        let mut selected: Vec<(LevelTier, &Quiz)> = eligible
            .iter()
            .filter(|(tier, _)| unlocked.contains(tier))
            .copied()
            .collect();

        if selected.is_empty() && !eligible.is_empty() {
            tracing::info!(
                "No quiz unlocked at {} points, showing all {} enrolled quizzes",
                points,
                eligible.len()
            );
            selected = eligible;
        }

        selected.sort_by(|(tier_a, a), (tier_b, b)| {
            tier_a
                .cmp(tier_b)
                .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        });

        tracing::debug!(
            "Selected {} playable quizzes out of {} at {} points",
            selected.len(),
            all_quizzes.len(),
            points
        );

        selected.into_iter().map(|(_, quiz)| quiz.clone()).collect()
    }
}

/// Runs [`QuizFilter::select`] with the default classifier and thresholds.
pub fn select_playable_quizzes(
    all_quizzes: &[Quiz],
    history: &[PlayHistoryEntry],
    enrollment: &EnrollmentSet,
    points: u32,
) -> Vec<Quiz> {
    QuizFilter::default().select(all_quizzes, history, enrollment, points)
}
