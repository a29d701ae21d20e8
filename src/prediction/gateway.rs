// =============================================================================
// Prediction Gateway — the pipeline in front of the external model
// =============================================================================
//
// predict(frame):
//   1. project the frame into the fixed feature order
//   2. cache lookup on (instrument, second bucket) — a hit skips the model
//   3. circuit breaker admission
//   4. model call under the 5 s deadline
//   5. rule-based fallback when the model is skipped or fails
//   6. normalization: clamp, rescale additivity, derive the recommendation
//
// Callers always receive a valid Prediction; model failures never cross
// this boundary. Only successful model results are cached, so the model is
// retried on the next tick instead of a fallback being served for the full
// TTL.
// =============================================================================

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use super::breaker::{BreakerState, CircuitBreaker};
use super::cache::PredictionCache;
use super::features::project;
use super::predictor::{rule_based, Predictor, RawPrediction};
use super::{Prediction, Recommendation};
use crate::protocol::messages::MarketFrame;

/// Gateway counters surfaced in `/metrics` and the health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub predictions_total: u64,
    pub prediction_errors: u64,
    pub prediction_fallbacks: u64,
    pub cache_hits: u64,
    pub cache_size: usize,
    pub cache_hit_rate: f64,
    pub breaker_state: BreakerState,
    pub in_flight: usize,
}

pub struct PredictionGateway {
    predictor: Arc<dyn Predictor>,
    cache: PredictionCache,
    breaker: CircuitBreaker,
    deadline: Duration,
    in_flight: AtomicUsize,
    total: AtomicU64,
    errors: AtomicU64,
    fallbacks: AtomicU64,
}

impl PredictionGateway {
    pub fn new(
        predictor: Arc<dyn Predictor>,
        cache_capacity: usize,
        cache_ttl: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            predictor,
            cache: PredictionCache::new(cache_capacity, cache_ttl),
            breaker: CircuitBreaker::standard(),
            deadline,
            in_flight: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Evaluate one market frame. Infallible by design.
    pub async fn predict(&self, frame: &MarketFrame) -> Prediction {
        let started = Instant::now();
        let features = project(frame);

        let ts = if frame.ts > 0 {
            frame.ts
        } else {
            Utc::now().timestamp_millis()
        };
        let key = (frame.instrument.clone(), PredictionCache::bucket(ts));

        if let Some(hit) = self.cache.get(&key) {
            debug!(instrument = %frame.instrument, "prediction served from cache");
            return hit;
        }

        self.total.fetch_add(1, Ordering::Relaxed);

        if self.breaker.allow() {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let outcome = tokio::time::timeout(
                self.deadline,
                self.predictor.predict(&frame.instrument, &features),
            )
            .await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                Ok(Ok(raw)) => {
                    self.breaker.record(false);
                    let prediction = normalize(raw, started.elapsed(), false);
                    self.cache.put(key, prediction.clone());
                    return prediction;
                }
                Ok(Err(e)) => {
                    self.breaker.record(true);
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        instrument = %frame.instrument,
                        predictor = self.predictor.name(),
                        error = %e,
                        "predictor failed — using fallback"
                    );
                }
                Err(_) => {
                    self.breaker.record(true);
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        instrument = %frame.instrument,
                        predictor = self.predictor.name(),
                        deadline_ms = self.deadline.as_millis() as u64,
                        "predictor deadline exceeded — using fallback"
                    );
                }
            }
        } else {
            debug!(
                instrument = %frame.instrument,
                "circuit breaker open — skipping model call"
            );
        }

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        normalize(rule_based(&features), started.elapsed(), true)
    }

    /// Model calls currently awaiting a result. The shutdown drain polls
    /// this down to zero.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            predictions_total: self.total.load(Ordering::Relaxed),
            prediction_errors: self.errors.load(Ordering::Relaxed),
            prediction_fallbacks: self.fallbacks.load(Ordering::Relaxed),
            cache_hits: self.cache.hits(),
            cache_size: self.cache.len(),
            cache_hit_rate: self.cache.hit_rate(),
            breaker_state: self.breaker.state(),
            in_flight: self.in_flight(),
        }
    }
}

/// Clamp into [0, 1], scrubbing non-finite values to 0.
fn unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Normalize a raw model output into the bridge's Prediction contract.
fn normalize(raw: RawPrediction, elapsed: Duration, fallback_used: bool) -> Prediction {
    let mut long_prob = unit(raw.long_prob);
    let mut short_prob = unit(raw.short_prob);

    let sum = long_prob + short_prob;
    if sum > 1.0 + 1e-6 {
        long_prob /= sum;
        short_prob /= sum;
    }

    let mut confidence = unit(raw.confidence);
    if fallback_used {
        confidence = confidence.min(0.5);
    }
    let strength = unit(raw.strength);

    let model_versions = if raw.model_versions.is_empty() {
        vec!["unversioned".to_string()]
    } else {
        raw.model_versions
    };

    Prediction {
        direction: raw.direction,
        long_prob,
        short_prob,
        confidence,
        strength,
        recommendation: Recommendation::from_scores(confidence, strength),
        processing_ms: elapsed.as_millis() as u64,
        model_versions,
        cache_hit: false,
        fallback_used,
        timestamp: Utc::now().timestamp_millis(),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalDirection;
    use anyhow::anyhow;
    use async_trait::async_trait;

    enum Mode {
        Ok(RawPrediction),
        Fail,
        Slow(Duration),
    }

    struct StubPredictor {
        calls: AtomicUsize,
        mode: Mode,
    }

    impl StubPredictor {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                mode,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Predictor for StubPredictor {
        async fn predict(
            &self,
            _instrument: &str,
            _features: &crate::prediction::features::FeatureVector,
        ) -> anyhow::Result<RawPrediction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.mode {
                Mode::Ok(raw) => Ok(raw.clone()),
                Mode::Fail => Err(anyhow!("model exploded")),
                Mode::Slow(d) => {
                    tokio::time::sleep(*d).await;
                    Err(anyhow!("unreachable"))
                }
            }
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    fn raw_long(confidence: f64) -> RawPrediction {
        RawPrediction {
            direction: SignalDirection::Long,
            long_prob: 0.7,
            short_prob: 0.3,
            confidence,
            strength: 0.4,
            model_versions: vec!["lstm_v3".to_string()],
        }
    }

    fn frame(instrument: &str, ts: i64) -> MarketFrame {
        MarketFrame {
            instrument: instrument.to_string(),
            ts,
            price: 21500.0,
            rsi: Some(25.0),
            ema5: Some(21499.0),
            ..Default::default()
        }
    }

    fn gateway(predictor: Arc<dyn Predictor>, deadline: Duration) -> PredictionGateway {
        PredictionGateway::new(predictor, 64, Duration::from_secs(300), deadline)
    }

    #[tokio::test]
    async fn second_identical_frame_is_a_cache_hit() {
        let stub = StubPredictor::new(Mode::Ok(raw_long(0.7)));
        let gw = gateway(stub.clone(), Duration::from_secs(5));

        let first = gw.predict(&frame("ES 03-25", 1_712_000_000_100)).await;
        let second = gw.predict(&frame("ES 03-25", 1_712_000_000_800)).await;

        assert_eq!(stub.calls(), 1);
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        // Identical apart from the flag and timestamp.
        assert_eq!(first.direction, second.direction);
        assert!((first.confidence - second.confidence).abs() < f64::EPSILON);
        assert!((first.long_prob - second.long_prob).abs() < f64::EPSILON);
        assert_eq!(first.recommendation, second.recommendation);
    }

    #[tokio::test]
    async fn timeout_yields_clamped_fallback_and_counts_as_error() {
        let stub = StubPredictor::new(Mode::Slow(Duration::from_millis(200)));
        let gw = gateway(stub.clone(), Duration::from_millis(20));

        let prediction = gw.predict(&frame("ES 03-25", 1_000)).await;
        assert!(prediction.fallback_used);
        assert!(prediction.confidence <= 0.5);
        // rsi 25 and price above ema5: the rules say LONG.
        assert_eq!(prediction.direction, SignalDirection::Long);

        let stats = gw.stats();
        assert_eq!(stats.prediction_errors, 1);
        assert_eq!(stats.prediction_fallbacks, 1);
        // Fallbacks are not cached.
        assert_eq!(stats.cache_size, 0);
    }

    #[tokio::test]
    async fn open_breaker_skips_the_model() {
        let stub = StubPredictor::new(Mode::Fail);
        let gw = gateway(stub.clone(), Duration::from_secs(1));

        // Five failures open the breaker (min observation floor).
        for n in 0..5 {
            let p = gw.predict(&frame("ES 03-25", 1_000 + n * 1_000)).await;
            assert!(p.fallback_used);
        }
        assert_eq!(gw.stats().breaker_state, BreakerState::Open);
        assert_eq!(stub.calls(), 5);

        // Breaker open: fallback without touching the model.
        let p = gw.predict(&frame("ES 03-25", 60_000)).await;
        assert!(p.fallback_used);
        assert_eq!(stub.calls(), 5);
    }

    #[tokio::test]
    async fn probabilities_are_rescaled_and_bounded() {
        let stub = StubPredictor::new(Mode::Ok(RawPrediction {
            direction: SignalDirection::Long,
            long_prob: 0.9,
            short_prob: 0.6,
            confidence: 1.7,
            strength: f64::NAN,
            model_versions: vec![],
        }));
        let gw = gateway(stub, Duration::from_secs(5));

        let p = gw.predict(&frame("ES 03-25", 1_000)).await;
        assert!(p.long_prob + p.short_prob <= 1.0 + 1e-6);
        assert!((0.0..=1.0).contains(&p.long_prob));
        assert!((0.0..=1.0).contains(&p.short_prob));
        assert!((p.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(p.strength, 0.0);
        // Ratio is preserved by the rescale.
        assert!((p.long_prob / p.short_prob - 1.5).abs() < 1e-9);
        assert_eq!(p.model_versions, vec!["unversioned".to_string()]);
    }

    #[tokio::test]
    async fn recommendation_follows_tiers() {
        let stub = StubPredictor::new(Mode::Ok(raw_long(0.85)));
        let gw = gateway(stub, Duration::from_secs(5));
        let p = gw.predict(&frame("ES 03-25", 1_000)).await;
        assert_eq!(p.recommendation, Recommendation::Strong);
    }
}
