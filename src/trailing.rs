// =============================================================================
// Trailing Controller — adaptive stop updates for open positions
// =============================================================================
//
// On each accepted market frame for an instrument with an open position the
// controller may propose a new stop:
//
//   - throttled to one update per 15 s unless a significance trigger fires
//     (favorable move >= 0.5 ATR since the last update, a volume spike, or
//     an EMA5/EMA8 cross);
//   - candidate distance = 1.5 ATR scaled by a volatility factor in
//     [0.8, 1.6], tightened 0.8x in a strong trend and again once the
//     position is more than 3% in profit;
//   - snapped to a detected support/resistance level (rolling 20-frame
//     low/high) with an ATR/3 buffer when price is within 0.3 ATR of it;
//   - monotonic: a long stop only ever rises, a short stop only ever
//     falls — a violating candidate is not emitted;
//   - bounded: the stop moves at most `max_move_atr` ATR per update;
//   - gated on the update confidence.
//
// The controller never owns the stop itself: the caller passes the current
// stop (from the trade book or the host request) and applies the result.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::protocol::messages::MarketFrame;
use crate::types::TradeDirection;

/// Name reported in the `algorithm` field of every update.
pub const ALGORITHM_NAME: &str = "adaptive_atr";

/// Base ATR multiplier before adjustments.
const BASE_ATR_MULT: f64 = 1.5;
/// Tightening factor for strong trends and profit locking.
const TIGHTEN_FACTOR: f64 = 0.8;
/// Volatility scaling bounds.
const VOL_FACTOR_MIN: f64 = 0.8;
const VOL_FACTOR_MAX: f64 = 1.6;
/// Profit percentage beyond which the trail tightens.
const PROFIT_LOCK_PCT: f64 = 3.0;
/// Strong-trend detection thresholds.
const TREND_ALIGNMENT_MIN: f64 = 0.6;
const TREND_STRENGTH_MIN: f64 = 0.7;
/// Support/resistance snap distance in ATR multiples, and the buffer.
const SR_SNAP_ATR: f64 = 0.3;
const SR_BUFFER_DIV: f64 = 3.0;
/// Rolling price window used for level detection.
const SR_WINDOW: usize = 20;
/// Significance triggers.
const SIGNIFICANT_MOVE_ATR: f64 = 0.5;
const VOLUME_SPIKE_RATIO: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct TrailingConfig {
    pub throttle: Duration,
    pub max_move_atr: f64,
    pub min_confidence: f64,
}

/// One accepted stop update.
#[derive(Debug, Clone, Serialize)]
pub struct TrailingUpdate {
    pub instrument: String,
    pub new_stop_price: f64,
    pub algorithm: String,
    pub confidence: f64,
    pub reasoning: String,
}

/// Per-instrument trigger memory and level window.
struct TrailState {
    last_emit: Option<Instant>,
    last_emit_price: f64,
    prev_volume: Option<f64>,
    prev_ema_spread: Option<f64>,
    avg_atr: Option<f64>,
    prices: VecDeque<f64>,
}

impl TrailState {
    fn new() -> Self {
        Self {
            last_emit: None,
            last_emit_price: 0.0,
            prev_volume: None,
            prev_ema_spread: None,
            avg_atr: None,
            prices: VecDeque::with_capacity(SR_WINDOW),
        }
    }
}

pub struct TrailingController {
    config: TrailingConfig,
    states: Mutex<HashMap<String, TrailState>>,
}

impl TrailingController {
    pub fn new(config: TrailingConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate one frame against an open position. Returns the update to
    /// apply, or `None` when throttled, non-monotonic, or low-confidence.
    pub fn evaluate(
        &self,
        frame: &MarketFrame,
        direction: TradeDirection,
        entry_px: f64,
        current_stop: f64,
    ) -> Option<TrailingUpdate> {
        let price = frame.price;
        let atr = frame.atr.filter(|a| a.is_finite() && *a > 0.0)?;

        let mut states = self.states.lock();
        let state = states
            .entry(frame.instrument.clone())
            .or_insert_with(TrailState::new);

        // ── Rolling context updates (always, even when not emitting) ────
        let support = state.prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let resistance = state.prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let have_levels = state.prices.len() >= SR_WINDOW / 2;

        if state.prices.len() == SR_WINDOW {
            state.prices.pop_front();
        }
        state.prices.push_back(price);

        let vol_factor = match state.avg_atr {
            Some(avg) if avg > 0.0 => (atr / avg).clamp(VOL_FACTOR_MIN, VOL_FACTOR_MAX),
            _ => 1.0,
        };
        state.avg_atr = Some(match state.avg_atr {
            Some(avg) => avg * 0.9 + atr * 0.1,
            None => atr,
        });

        // ── Significance triggers ───────────────────────────────────────
        let favorable_move = if state.last_emit.is_some() {
            let moved = match direction {
                TradeDirection::Long => price - state.last_emit_price,
                TradeDirection::Short => state.last_emit_price - price,
            };
            moved >= SIGNIFICANT_MOVE_ATR * atr
        } else {
            false
        };

        let volume_spike = match (frame.volume, state.prev_volume) {
            (Some(v), Some(prev)) if prev > 0.0 => v > VOLUME_SPIKE_RATIO * prev,
            _ => false,
        };
        state.prev_volume = frame.volume.or(state.prev_volume);

        let ema_spread = match (frame.ema5, frame.ema8) {
            (Some(e5), Some(e8)) => Some(e5 - e8),
            _ => None,
        };
        let ema_cross = match (ema_spread, state.prev_ema_spread) {
            (Some(now), Some(prev)) => now.signum() != prev.signum() && prev != 0.0,
            _ => false,
        };
        if ema_spread.is_some() {
            state.prev_ema_spread = ema_spread;
        }

        let triggered = favorable_move || volume_spike || ema_cross;

        // ── Throttle ────────────────────────────────────────────────────
        if let Some(last) = state.last_emit {
            if last.elapsed() < self.config.throttle && !triggered {
                return None;
            }
        }

        // ── Candidate stop ──────────────────────────────────────────────
        let mut reasons: Vec<&str> = Vec::new();
        let mut mult = BASE_ATR_MULT * vol_factor;

        let trend_strength = frame
            .extra
            .get("trend_strength")
            .and_then(|v| v.as_f64())
            .unwrap_or_else(|| frame.adx.map(|a| (a / 50.0).clamp(0.0, 1.0)).unwrap_or(0.0));
        let strong_trend = frame
            .ema_alignment
            .map(|a| a.abs() > TREND_ALIGNMENT_MIN)
            .unwrap_or(false)
            && trend_strength > TREND_STRENGTH_MIN;
        if strong_trend {
            mult *= TIGHTEN_FACTOR;
            reasons.push("strong_trend");
        }

        let profit_pct = match direction {
            TradeDirection::Long => (price - entry_px) / entry_px * 100.0,
            TradeDirection::Short => (entry_px - price) / entry_px * 100.0,
        };
        if profit_pct > PROFIT_LOCK_PCT {
            mult *= TIGHTEN_FACTOR;
            reasons.push("profit_lock");
        }

        let mut candidate = match direction {
            TradeDirection::Long => price - mult * atr,
            TradeDirection::Short => price + mult * atr,
        };

        // ── Support/resistance snap ─────────────────────────────────────
        let mut snapped = false;
        if have_levels {
            match direction {
                TradeDirection::Long if support.is_finite() => {
                    if (price - support).abs() < SR_SNAP_ATR * atr {
                        candidate = support - atr / SR_BUFFER_DIV;
                        snapped = true;
                    }
                }
                TradeDirection::Short if resistance.is_finite() => {
                    if (price - resistance).abs() < SR_SNAP_ATR * atr {
                        candidate = resistance + atr / SR_BUFFER_DIV;
                        snapped = true;
                    }
                }
                _ => {}
            }
            if snapped {
                reasons.push("level_snap");
            }
        }

        // ── Monotonicity ────────────────────────────────────────────────
        let improves = match direction {
            TradeDirection::Long => candidate > current_stop,
            TradeDirection::Short => candidate < current_stop,
        };
        if !improves {
            debug!(
                instrument = %frame.instrument,
                candidate,
                current_stop,
                "trailing candidate not monotonic — dropped"
            );
            return None;
        }

        // ── Bounded movement ────────────────────────────────────────────
        let max_move = self.config.max_move_atr * atr;
        if (candidate - current_stop).abs() > max_move {
            candidate = match direction {
                TradeDirection::Long => current_stop + max_move,
                TradeDirection::Short => current_stop - max_move,
            };
            reasons.push("move_capped");
        }

        // ── Confidence gate ─────────────────────────────────────────────
        let mut confidence: f64 = 0.65;
        if strong_trend {
            confidence += 0.15;
        }
        if snapped {
            confidence += 0.05;
        }
        if profit_pct > PROFIT_LOCK_PCT {
            confidence += 0.05;
        }
        if vol_factor > 1.4 {
            confidence -= 0.15;
        }
        let confidence = confidence.clamp(0.0, 0.95);

        if confidence < self.config.min_confidence {
            debug!(
                instrument = %frame.instrument,
                confidence,
                "trailing update below confidence floor — dropped"
            );
            return None;
        }

        state.last_emit = Some(Instant::now());
        state.last_emit_price = price;

        if reasons.is_empty() {
            reasons.push("atr_trail");
        }
        Some(TrailingUpdate {
            instrument: frame.instrument.clone(),
            new_stop_price: candidate,
            algorithm: ALGORITHM_NAME.to_string(),
            confidence,
            reasoning: reasons.join("+"),
        })
    }

    /// Drop the trigger memory for an instrument (position closed).
    pub fn reset(&self, instrument: &str) {
        self.states.lock().remove(instrument);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrailingConfig {
        TrailingConfig {
            throttle: Duration::ZERO,
            max_move_atr: 0.5,
            min_confidence: 0.6,
        }
    }

    fn frame(price: f64, atr: f64) -> MarketFrame {
        MarketFrame {
            instrument: "ES 03-25".to_string(),
            price,
            atr: Some(atr),
            ..Default::default()
        }
    }

    #[test]
    fn long_stop_only_ever_rises() {
        let ctrl = TrailingController::new(config());

        // Price well above the stop: candidate 21510 - 15 = 21495,
        // capped to current_stop + 0.5 * ATR = 21485.
        let update = ctrl
            .evaluate(&frame(21510.0, 10.0), TradeDirection::Long, 21500.0, 21480.0)
            .expect("update expected");
        assert!(update.new_stop_price > 21480.0);
        assert!((update.new_stop_price - 21485.0).abs() < 1e-9);

        // From a stop already above the candidate: no emission.
        let update = ctrl.evaluate(&frame(21505.0, 10.0), TradeDirection::Long, 21500.0, 21497.0);
        assert!(update.is_none());
    }

    #[test]
    fn short_stop_only_ever_falls() {
        let ctrl = TrailingController::new(config());

        let update = ctrl
            .evaluate(&frame(79.0, 1.0), TradeDirection::Short, 80.0, 81.0)
            .expect("update expected");
        // Candidate 79 + 1.5 = 80.5, capped to 81 - 0.5 = 80.5.
        assert!(update.new_stop_price < 81.0);

        let update = ctrl.evaluate(&frame(80.4, 1.0), TradeDirection::Short, 80.0, 80.5);
        assert!(update.is_none());
    }

    #[test]
    fn movement_is_bounded_per_update() {
        let ctrl = TrailingController::new(config());
        let update = ctrl
            .evaluate(&frame(21600.0, 10.0), TradeDirection::Long, 21500.0, 21480.0)
            .expect("update expected");
        // max_move = 0.5 * 10 = 5.
        assert!((update.new_stop_price - 21485.0).abs() < 1e-9);
        assert!(update.reasoning.contains("move_capped"));
    }

    #[test]
    fn throttle_blocks_until_significance_trigger() {
        let cfg = TrailingConfig {
            throttle: Duration::from_secs(3600),
            ..config()
        };
        let ctrl = TrailingController::new(cfg);

        let first = ctrl.evaluate(&frame(21510.0, 10.0), TradeDirection::Long, 21500.0, 21480.0);
        assert!(first.is_some());

        // Within the throttle window, small move: blocked.
        let second = ctrl.evaluate(&frame(21511.0, 10.0), TradeDirection::Long, 21500.0, 21485.0);
        assert!(second.is_none());

        // A favorable move of >= 0.5 ATR bypasses the throttle.
        let third = ctrl.evaluate(&frame(21516.0, 10.0), TradeDirection::Long, 21500.0, 21485.0);
        assert!(third.is_some());
    }

    #[test]
    fn volume_spike_bypasses_throttle() {
        let cfg = TrailingConfig {
            throttle: Duration::from_secs(3600),
            ..config()
        };
        let ctrl = TrailingController::new(cfg);

        let mut f = frame(21510.0, 10.0);
        f.volume = Some(1000.0);
        assert!(ctrl
            .evaluate(&f, TradeDirection::Long, 21500.0, 21480.0)
            .is_some());

        let mut f = frame(21511.0, 10.0);
        f.volume = Some(2000.0); // 2x the previous volume
        assert!(ctrl
            .evaluate(&f, TradeDirection::Long, 21500.0, 21485.0)
            .is_some());
    }

    #[test]
    fn missing_atr_yields_nothing() {
        let ctrl = TrailingController::new(config());
        let mut f = frame(21510.0, 10.0);
        f.atr = None;
        assert!(ctrl
            .evaluate(&f, TradeDirection::Long, 21500.0, 21480.0)
            .is_none());
    }

    #[test]
    fn strong_trend_tightens_the_trail() {
        let ctrl = TrailingController::new(config());
        let loose = ctrl
            .evaluate(&frame(21510.0, 2.0), TradeDirection::Long, 21500.0, 21400.0)
            .expect("update expected");

        let ctrl = TrailingController::new(config());
        let mut f = frame(21510.0, 2.0);
        f.ema_alignment = Some(0.8);
        f.adx = Some(40.0); // trend_strength 0.8
        let tight = ctrl
            .evaluate(&f, TradeDirection::Long, 21500.0, 21400.0)
            .expect("update expected");

        // With a distant stop the movement cap bites for both, so assert
        // the tighter multiplier via the reasoning tag and the confidence.
        assert!(tight.reasoning.contains("strong_trend"));
        assert!(tight.confidence > loose.confidence);
    }

    #[test]
    fn profit_lock_tightens_and_raises_confidence() {
        let ctrl = TrailingController::new(config());
        // 4% in profit on a long.
        let update = ctrl
            .evaluate(&frame(22360.0, 10.0), TradeDirection::Long, 21500.0, 22300.0)
            .expect("update expected");
        assert!(update.reasoning.contains("profit_lock"));
    }

    #[test]
    fn level_snap_near_rolling_support() {
        let ctrl = TrailingController::new(config());

        // Build a support level at ~21490 over enough frames.
        for _ in 0..12 {
            let _ = ctrl.evaluate(&frame(21490.0, 10.0), TradeDirection::Long, 21500.0, 21450.0);
        }
        // Price sits within 0.3 ATR of the support: snap to level - ATR/3.
        let update = ctrl
            .evaluate(&frame(21491.0, 10.0), TradeDirection::Long, 21480.0, 21482.0)
            .expect("update expected");
        assert!(update.reasoning.contains("level_snap"));
        // Snapped target is 21490 - 10/3 ≈ 21486.67, within one max_move of
        // the current stop so no cap applies.
        assert!((update.new_stop_price - (21490.0 - 10.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn reset_clears_trigger_memory() {
        let cfg = TrailingConfig {
            throttle: Duration::from_secs(3600),
            ..config()
        };
        let ctrl = TrailingController::new(cfg);

        assert!(ctrl
            .evaluate(&frame(21510.0, 10.0), TradeDirection::Long, 21500.0, 21480.0)
            .is_some());
        assert!(ctrl
            .evaluate(&frame(21510.5, 10.0), TradeDirection::Long, 21500.0, 21485.0)
            .is_none());

        ctrl.reset("ES 03-25");
        assert!(ctrl
            .evaluate(&frame(21510.5, 10.0), TradeDirection::Long, 21500.0, 21485.0)
            .is_some());
    }
}
