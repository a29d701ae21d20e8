// =============================================================================
// Predictor Contract — the external model behind a narrow seam
// =============================================================================
//
// The gateway only ever sees `Predictor`; the concrete model (an HTTP model
// service, or the built-in rule evaluator when none is configured) is
// chosen at startup. The rule evaluator doubles as the fallback path when
// the model errs, times out, or the breaker is open.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::features::{FeatureVector, FEATURE_NAMES};
use crate::types::SignalDirection;

/// Raw, un-normalized model output. The gateway clamps and rescales.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPrediction {
    pub direction: SignalDirection,
    #[serde(default)]
    pub long_prob: f64,
    #[serde(default)]
    pub short_prob: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub strength: f64,
    #[serde(default)]
    pub model_versions: Vec<String>,
}

/// The external predictor contract.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, instrument: &str, features: &FeatureVector) -> Result<RawPrediction>;

    fn name(&self) -> &'static str;
}

// =============================================================================
// Rule-based evaluation (also the fallback path)
// =============================================================================

/// Deterministic rule evaluation:
///   rsi < 30 and price > ema5  -> LONG,  strength 0.45
///   rsi > 70 and price < ema5  -> SHORT, strength 0.45
///   otherwise                  -> NEUTRAL, strength 0.30
/// Confidence is always 0.40.
pub fn rule_based(features: &FeatureVector) -> RawPrediction {
    let rsi = features.rsi();
    let price = features.price();
    let ema5 = features.ema5();

    let (direction, strength, long_prob, short_prob) = if rsi < 30.0 && price > ema5 {
        (SignalDirection::Long, 0.45, 0.60, 0.20)
    } else if rsi > 70.0 && price < ema5 {
        (SignalDirection::Short, 0.45, 0.20, 0.60)
    } else {
        (SignalDirection::Neutral, 0.30, 0.40, 0.40)
    };

    RawPrediction {
        direction,
        long_prob,
        short_prob,
        confidence: 0.40,
        strength,
        model_versions: vec!["rule_v1".to_string()],
    }
}

/// Predictor that only ever runs the rules. Used when no model service is
/// configured; it satisfies the full contract.
pub struct RulePredictor;

#[async_trait]
impl Predictor for RulePredictor {
    async fn predict(&self, _instrument: &str, features: &FeatureVector) -> Result<RawPrediction> {
        Ok(rule_based(features))
    }

    fn name(&self) -> &'static str {
        "rule"
    }
}

// =============================================================================
// HTTP model service
// =============================================================================

/// Predictor backed by an external model service: POSTs the feature vector
/// as JSON and expects a `RawPrediction` body. The request deadline is
/// enforced by the gateway; the client timeout here is a backstop.
pub struct HttpPredictor {
    client: reqwest::Client,
    url: String,
}

impl HttpPredictor {
    pub fn new(url: String, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build predictor HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, instrument: &str, features: &FeatureVector) -> Result<RawPrediction> {
        let body = serde_json::json!({
            "instrument": instrument,
            "feature_names": FEATURE_NAMES,
            "features": features.as_slice(),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("predictor request failed")?
            .error_for_status()
            .context("predictor returned error status")?;

        response
            .json::<RawPrediction>()
            .await
            .context("predictor response was not a valid prediction")
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::features::project;
    use crate::protocol::messages::MarketFrame;

    fn frame(price: f64, rsi: f64, ema5: f64) -> MarketFrame {
        MarketFrame {
            instrument: "ES 03-25".to_string(),
            price,
            rsi: Some(rsi),
            ema5: Some(ema5),
            ..Default::default()
        }
    }

    #[test]
    fn oversold_above_ema_is_long() {
        let raw = rule_based(&project(&frame(21500.0, 25.0, 21499.0)));
        assert_eq!(raw.direction, SignalDirection::Long);
        assert!((raw.strength - 0.45).abs() < f64::EPSILON);
        assert!((raw.confidence - 0.40).abs() < f64::EPSILON);
    }

    #[test]
    fn overbought_below_ema_is_short() {
        let raw = rule_based(&project(&frame(21490.0, 75.0, 21495.0)));
        assert_eq!(raw.direction, SignalDirection::Short);
        assert!((raw.strength - 0.45).abs() < f64::EPSILON);
    }

    #[test]
    fn anything_else_is_neutral() {
        // Oversold but below EMA: the filter disagrees, stay neutral.
        let raw = rule_based(&project(&frame(21490.0, 25.0, 21495.0)));
        assert_eq!(raw.direction, SignalDirection::Neutral);
        assert!((raw.strength - 0.30).abs() < f64::EPSILON);

        let raw = rule_based(&project(&frame(21500.0, 50.0, 21500.0)));
        assert_eq!(raw.direction, SignalDirection::Neutral);
    }
}
