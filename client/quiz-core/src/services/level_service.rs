//! Level classification and point-based access policy.

use lazy_static::lazy_static;
use std::collections::BTreeSet;

use crate::models::LevelTier;

/// Points needed to unlock intermediate quizzes.
pub const INTERMEDIATE_UNLOCK_POINTS: u32 = 50;
/// Points needed to unlock advanced quizzes.
pub const ADVANCED_UNLOCK_POINTS: u32 = 100;

pub const DEFAULT_INTERMEDIATE_SYNONYMS: &[&str] = &["inter", "moyen"];
pub const DEFAULT_ADVANCED_SYNONYMS: &[&str] = &["advanced", "expert", "avancé", "avance"];

lazy_static! {
    static ref DEFAULT_CLASSIFIER: LevelClassifier = LevelClassifier::default();
}

/// Maps free-text levels ("Intermédiaire", "Expert", "niveau moyen") to tiers.
#[derive(Debug, Clone)]
pub struct LevelClassifier {
    intermediate: Vec<String>,
    advanced: Vec<String>,
}

impl Default for LevelClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_INTERMEDIATE_SYNONYMS.iter().copied(),
            DEFAULT_ADVANCED_SYNONYMS.iter().copied(),
        )
    }
}

impl LevelClassifier {
    pub fn new<I, A>(intermediate: I, advanced: A) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        Self {
            intermediate: normalize_synonyms(intermediate),
            advanced: normalize_synonyms(advanced),
        }
    }

    /// Adds synonyms on top of the current lists.
    pub fn with_synonyms<I, A>(mut self, intermediate: I, advanced: A) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        self.intermediate.extend(normalize_synonyms(intermediate));
        self.advanced.extend(normalize_synonyms(advanced));
        self
    }

    pub fn classify(&self, raw: Option<&str>) -> LevelTier {
        let Some(level) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return LevelTier::Beginner;
        };
        let level = level.to_lowercase();

        if self.intermediate.iter().any(|s| level.contains(s.as_str())) {
            LevelTier::Intermediate
        } else if self.advanced.iter().any(|s| level.contains(s.as_str())) {
            LevelTier::Advanced
        } else {
            LevelTier::Beginner
        }
    }
}

fn normalize_synonyms<I>(synonyms: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    synonyms
        .into_iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Classifies with the default synonym lists.
pub fn normalize_level(raw: Option<&str>) -> LevelTier {
    DEFAULT_CLASSIFIER.classify(raw)
}

/// Point thresholds gating each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    intermediate_at: u32,
    advanced_at: u32,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            intermediate_at: INTERMEDIATE_UNLOCK_POINTS,
            advanced_at: ADVANCED_UNLOCK_POINTS,
        }
    }
}

impl AccessPolicy {
    /// The advanced threshold is raised to the intermediate one if lower.
    pub fn new(intermediate_at: u32, advanced_at: u32) -> Self {
        Self {
            intermediate_at,
            advanced_at: advanced_at.max(intermediate_at),
        }
    }

    pub fn unlock_points(&self, tier: LevelTier) -> u32 {
        match tier {
            LevelTier::Beginner => 0,
            LevelTier::Intermediate => self.intermediate_at,
            LevelTier::Advanced => self.advanced_at,
        }
    }

    pub fn is_unlocked(&self, tier: LevelTier, points: u32) -> bool {
        points >= self.unlock_points(tier)
    }

    pub fn unlocked_tiers(&self, points: u32) -> BTreeSet<LevelTier> {
        LevelTier::ALL
            .into_iter()
            .filter(|tier| self.is_unlocked(*tier, points))
            .collect()
    }

    /// Next locked tier and the points still missing for it.
    pub fn points_to_next_tier(&self, points: u32) -> Option<(LevelTier, u32)> {
        LevelTier::ALL
            .into_iter()
            .find(|tier| !self.is_unlocked(*tier, points))
            .map(|tier| (tier, self.unlock_points(tier) - points))
    }
}

pub fn unlocked_tiers(points: u32) -> BTreeSet<LevelTier> {
    AccessPolicy::default().unlocked_tiers(points)
}

pub fn points_to_next_tier(points: u32) -> Option<(LevelTier, u32)> {
    AccessPolicy::default().points_to_next_tier(points)
}
