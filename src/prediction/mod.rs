// =============================================================================
// Prediction Gateway — feature projection, caching, breaker, model, fallback
// =============================================================================

pub mod breaker;
pub mod cache;
pub mod features;
pub mod gateway;
pub mod predictor;

use serde::{Deserialize, Serialize};

use crate::types::SignalDirection;

/// Recommendation tier derived from (confidence, strength).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Strong,
    Moderate,
    Weak,
    Neutral,
}

impl Recommendation {
    /// Tier boundaries: STRONG (>0.8, >0.3), MODERATE (>0.7, >0.2),
    /// WEAK (>0.6, >0.1), NEUTRAL otherwise.
    pub fn from_scores(confidence: f64, strength: f64) -> Self {
        if confidence > 0.8 && strength > 0.3 {
            Self::Strong
        } else if confidence > 0.7 && strength > 0.2 {
            Self::Moderate
        } else if confidence > 0.6 && strength > 0.1 {
            Self::Weak
        } else {
            Self::Neutral
        }
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Strong => "STRONG",
            Self::Moderate => "MODERATE",
            Self::Weak => "WEAK",
            Self::Neutral => "NEUTRAL",
        };
        write!(f, "{s}")
    }
}

/// The normalized output of the prediction gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub direction: SignalDirection,
    pub long_prob: f64,
    pub short_prob: f64,
    pub confidence: f64,
    pub strength: f64,
    pub recommendation: Recommendation,
    pub processing_ms: u64,
    pub model_versions: Vec<String>,
    pub cache_hit: bool,
    pub fallback_used: bool,
    /// Epoch milliseconds; refreshed on every cache hit.
    pub timestamp: i64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommendation_tiers() {
        assert_eq!(Recommendation::from_scores(0.85, 0.35), Recommendation::Strong);
        assert_eq!(Recommendation::from_scores(0.75, 0.25), Recommendation::Moderate);
        assert_eq!(Recommendation::from_scores(0.65, 0.15), Recommendation::Weak);
        assert_eq!(Recommendation::from_scores(0.55, 0.5), Recommendation::Neutral);
        // Strength gate applies even at high confidence.
        assert_eq!(Recommendation::from_scores(0.9, 0.05), Recommendation::Neutral);
    }
}
