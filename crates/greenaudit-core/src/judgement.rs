use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Valid judge scores.
pub const SCORE_RANGE: RangeInclusive<u8> = 1..=10;

/// Conservative score used when the judge call fails.
pub const DEFAULT_FALLBACK_SCORE: u8 = 7;

/// Reason recorded when the judge call fails.
pub const SCORING_FAILED: &str = "scoring_failed";

/// Outcome of scoring one response.
///
/// A failed judge call is not an error: it becomes `Fallback` and the run
/// continues with the fallback score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Judgement {
    Scored { score: u8, reason: String },
    Fallback { score: u8, reason: String, error: String },
}

impl Judgement {
    pub fn fallback(score: u8, error: impl Into<String>) -> Self {
        Judgement::Fallback {
            score,
            reason: SCORING_FAILED.to_string(),
            error: error.into(),
        }
    }

    pub fn score(&self) -> u8 {
        match self {
            Judgement::Scored { score, .. } | Judgement::Fallback { score, .. } => *score,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Judgement::Scored { reason, .. } | Judgement::Fallback { reason, .. } => reason,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Judgement::Fallback { .. })
    }
}
