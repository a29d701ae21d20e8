// =============================================================================
// Synthetic Market Feed — demo affordance, gated and OFF by default
// =============================================================================
//
// When `BRIDGE_SYNTHETIC_MODE=true` and no host session is connected, a
// deterministic oscillating price series for a simulated instrument is fed
// through the same market-data path the dashboard normally sees, so the UI
// can be exercised without an Execution Host. No commands are ever routed
// (there is no host to receive them) and the generator goes quiet the
// moment a real session appears.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app_state::BridgeState;
use crate::events::{channel, Event};
use crate::protocol::messages::MarketFrame;

const SYNTHETIC_INSTRUMENT: &str = "SIM 00-00";
const TICK_INTERVAL: Duration = Duration::from_secs(2);
const BASE_PRICE: f64 = 5000.0;

/// Deterministic pseudo-market frame for tick `n`.
fn synthetic_frame(n: u64) -> MarketFrame {
    let t = n as f64;
    // Slow drift plus two overlapping oscillations.
    let price = BASE_PRICE + 15.0 * (t / 7.0).sin() + 4.0 * (t / 2.3).sin() + t * 0.01;
    let rsi = 50.0 + 35.0 * (t / 9.0).sin();
    let ema5 = price - 2.0 * (t / 5.0).sin();

    MarketFrame {
        instrument: SYNTHETIC_INSTRUMENT.to_string(),
        ts: Utc::now().timestamp_millis(),
        price,
        volume: Some(1000.0 + 400.0 * (t / 4.0).sin().abs()),
        rsi: Some(rsi.clamp(0.0, 100.0)),
        ema5: Some(ema5),
        ema8: Some(ema5 - 1.0),
        ema_alignment: Some((t / 11.0).sin() * 0.8),
        atr: Some(8.0),
        ..Default::default()
    }
}

/// Run the synthetic feed until shutdown.
pub async fn run_synthetic_feed(state: Arc<BridgeState>, token: CancellationToken) {
    info!(instrument = SYNTHETIC_INSTRUMENT, "synthetic market feed enabled");
    let mut ticker = interval(TICK_INTERVAL);
    let mut n: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if state.registry.session_count() > 0 {
                    // A real host is connected; stay quiet.
                    continue;
                }
                n += 1;
                let frame = synthetic_frame(n);
                debug!(tick = n, price = frame.price, "synthetic frame");

                state.publish(Event::new(
                    channel::MARKET_DATA,
                    serde_json::to_value(&frame).unwrap_or_default(),
                ));

                let prediction = state.gateway.predict(&frame).await;
                state.metrics.record_latency_ms(prediction.processing_ms);
                state.publish(Event::new(
                    channel::ML_PREDICTION_RESULT,
                    serde_json::json!({
                        "instrument": frame.instrument,
                        "prediction": prediction,
                        "synthetic": true,
                    }),
                ));
            }
        }
    }
    info!("synthetic market feed stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_valid_and_vary() {
        let a = synthetic_frame(1);
        let b = synthetic_frame(50);
        assert!(a.validate().is_ok());
        assert!(b.validate().is_ok());
        assert!((a.price - b.price).abs() > f64::EPSILON);
        assert!(a.rsi.unwrap() >= 0.0 && a.rsi.unwrap() <= 100.0);
    }
}
