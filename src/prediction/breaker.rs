// =============================================================================
// Circuit Breaker — rolling-window guard around the external predictor
// =============================================================================
//
// Tracks the outcome of the last 20 model calls. The breaker opens when the
// error rate reaches 30% (with at least 5 observations, so one early error
// cannot trip it), rejects calls while open, and lets a single probe
// through after the 60 s cooldown. A successful probe closes the breaker;
// a failed probe re-opens it and restarts the cooldown.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

struct Inner {
    /// true = error, most recent at the back.
    outcomes: VecDeque<bool>,
    state: BreakerState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    window: usize,
    error_threshold: f64,
    min_calls: usize,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(window: usize, error_threshold: f64, min_calls: usize, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                outcomes: VecDeque::with_capacity(window),
                state: BreakerState::Closed,
                opened_at: None,
                probe_in_flight: false,
            }),
            window,
            error_threshold,
            min_calls,
            cooldown,
        }
    }

    /// Breaker with the production parameters: 20-call window, 30% error
    /// rate, minimum 5 observations, 60 s cooldown.
    pub fn standard() -> Self {
        Self::new(20, 0.30, 5, Duration::from_secs(60))
    }

    /// May a model call proceed right now? In half-open state only one
    /// probe at a time is admitted.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("prediction circuit breaker half-open — admitting probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record the outcome of an admitted call. Timeouts and cancellations
    /// are errors.
    pub fn record(&self, error: bool) {
        let mut inner = self.inner.lock();

        inner.outcomes.push_back(error);
        while inner.outcomes.len() > self.window {
            inner.outcomes.pop_front();
        }

        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                if error {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!("prediction circuit breaker re-opened after failed probe");
                } else {
                    inner.state = BreakerState::Closed;
                    inner.outcomes.clear();
                    info!("prediction circuit breaker closed after successful probe");
                }
            }
            BreakerState::Closed => {
                let total = inner.outcomes.len();
                let errors = inner.outcomes.iter().filter(|&&e| e).count();
                if total >= self.min_calls
                    && errors as f64 / total as f64 >= self.error_threshold
                {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        errors,
                        total,
                        "prediction circuit breaker opened"
                    );
                }
            }
            BreakerState::Open => {
                // A straggler finishing after the breaker opened; the
                // window already reflects it.
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_min_calls() {
        let breaker = CircuitBreaker::new(20, 0.30, 5, Duration::from_secs(60));
        // Four straight errors: under the observation floor.
        for _ in 0..4 {
            assert!(breaker.allow());
            breaker.record(true);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        // The fifth error crosses the floor at 100% error rate.
        assert!(breaker.allow());
        breaker.record(true);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn opens_at_thirty_percent_over_window() {
        let breaker = CircuitBreaker::new(20, 0.30, 5, Duration::from_secs(60));
        // 14 successes + 6 errors = 30% over 20 calls.
        for _ in 0..14 {
            breaker.record(false);
        }
        for _ in 0..5 {
            breaker.record(true);
        }
        assert_eq!(breaker.state(), BreakerState::Closed); // 5/19 < 30%
        breaker.record(true);
        assert_eq!(breaker.state(), BreakerState::Open); // 6/20 = 30%
    }

    #[test]
    fn successful_probe_closes_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(20, 0.30, 5, Duration::ZERO);
        for _ in 0..5 {
            breaker.record(true);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Cooldown is zero: the next allow() is the probe.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Only one probe at a time.
        assert!(!breaker.allow());

        breaker.record(true);
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow());
        breaker.record(false);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn window_slides_old_errors_out() {
        let breaker = CircuitBreaker::new(10, 0.30, 5, Duration::from_secs(60));
        for _ in 0..3 {
            breaker.record(true);
        }
        // Ten successes push the errors out of the 10-call window.
        for _ in 0..10 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
