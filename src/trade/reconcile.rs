// =============================================================================
// Position Reconciliation — host shadow vs bridge shadow
// =============================================================================
//
// Two independent views of the position are kept per instrument: what the
// Execution Host last reported (host shadow) and what the bridge derived
// from executed trades (bridge shadow). When they disagree on (direction,
// size) for longer than the reconciliation window, the discrepancy is
// surfaced once and the host view is adopted — the host keeps the real
// position, so the locally derived view is the one that yields.
//
// Nothing here ever cancels or closes anything on the host side.
// =============================================================================

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::types::PositionDirection;

/// Disagreement must persist this long before reconciliation kicks in.
pub const RECONCILE_WINDOW: Duration = Duration::from_secs(3);
/// Upper bound on reconciliation attempts per episode, surfaced in alerts.
pub const MAX_RECONCILE_ATTEMPTS: u32 = 3;
/// Size tolerance when comparing shadows.
const SIZE_EPSILON: f64 = 1e-6;

/// One view of the current position on an instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionShadow {
    pub direction: PositionDirection,
    pub size: f64,
    pub avg_price: f64,
    /// Epoch milliseconds of the update that produced this view.
    pub last_update: i64,
}

impl Default for PositionShadow {
    fn default() -> Self {
        Self {
            direction: PositionDirection::Flat,
            size: 0.0,
            avg_price: 0.0,
            last_update: 0,
        }
    }
}

impl PositionShadow {
    pub fn flat(last_update: i64) -> Self {
        Self {
            last_update,
            ..Default::default()
        }
    }

    /// Shadows agree when direction matches and size is within tolerance.
    /// A flat position agrees regardless of the stored size remnant.
    fn agrees_with(&self, other: &PositionShadow) -> bool {
        if self.direction != other.direction {
            return false;
        }
        if self.direction == PositionDirection::Flat {
            return true;
        }
        (self.size - other.size).abs() <= SIZE_EPSILON
    }
}

/// What a host report did to the reconciliation state.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Shadows agree; nothing was pending.
    InSync,
    /// Shadows agree again after a disagreement episode.
    Healed,
    /// Shadows disagree but the window has not elapsed yet.
    Pending,
    /// The window elapsed: the bridge shadow was overwritten from the
    /// host shadow. `first_alert` is true exactly once per episode.
    Adopted { attempts: u32, first_alert: bool },
}

/// Per-instrument reconciliation state. Lives inside the trade book so all
/// transitions for one instrument are serialized under a single lock.
#[derive(Debug)]
pub struct ReconcileState {
    pub host: PositionShadow,
    pub bridge: PositionShadow,
    mismatch_since: Option<Instant>,
    attempts: u32,
    alerted: bool,
    last_resolution: Option<Instant>,
}

impl Default for ReconcileState {
    fn default() -> Self {
        Self {
            host: PositionShadow::default(),
            bridge: PositionShadow::default(),
            mismatch_since: None,
            attempts: 0,
            alerted: false,
            last_resolution: None,
        }
    }
}

impl ReconcileState {
    /// Apply a host position report at time `now`.
    pub fn on_host_report(&mut self, host: PositionShadow, now: Instant) -> ReconcileOutcome {
        self.host = host;

        if self.host.agrees_with(&self.bridge) {
            let was_mismatched = self.mismatch_since.is_some();
            self.clear_episode(now);
            return if was_mismatched {
                ReconcileOutcome::Healed
            } else {
                ReconcileOutcome::InSync
            };
        }

        let since = *self.mismatch_since.get_or_insert(now);
        if now.duration_since(since) < RECONCILE_WINDOW {
            return ReconcileOutcome::Pending;
        }

        // Window elapsed: adopt the host view. The bridge shadow is locally
        // derived, so retrying cannot change it; the attempt counter is
        // kept for the alert payload and capped at the documented bound.
        self.attempts = (self.attempts + 1).min(MAX_RECONCILE_ATTEMPTS);
        let first_alert = !self.alerted;
        self.alerted = true;
        let attempts = self.attempts;

        self.bridge = self.host.clone();
        self.clear_episode(now);

        ReconcileOutcome::Adopted {
            attempts,
            first_alert,
        }
    }

    /// Update the bridge shadow from a trade fill or close. Agreement
    /// reached this way quietly ends any open episode.
    pub fn on_bridge_update(&mut self, bridge: PositionShadow) {
        self.bridge = bridge;
        if self.host.agrees_with(&self.bridge) {
            self.mismatch_since = None;
            self.attempts = 0;
            self.alerted = false;
        }
    }

    /// Seconds since the last resolution (heal or adoption), if any.
    pub fn last_resolution_age_s(&self) -> Option<u64> {
        self.last_resolution.map(|t| t.elapsed().as_secs())
    }

    fn clear_episode(&mut self, now: Instant) {
        self.mismatch_since = None;
        self.attempts = 0;
        self.alerted = false;
        self.last_resolution = Some(now);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn long(size: f64) -> PositionShadow {
        PositionShadow {
            direction: PositionDirection::Long,
            size,
            avg_price: 21500.0,
            last_update: 1,
        }
    }

    #[test]
    fn agreeing_shadows_stay_in_sync() {
        let mut state = ReconcileState::default();
        state.on_bridge_update(long(1.0));
        let t0 = Instant::now();
        assert_eq!(state.on_host_report(long(1.0), t0), ReconcileOutcome::InSync);
    }

    #[test]
    fn flat_agreement_ignores_size_remnant() {
        let mut state = ReconcileState::default();
        state.on_bridge_update(PositionShadow {
            direction: PositionDirection::Flat,
            size: 0.000001,
            ..Default::default()
        });
        let outcome = state.on_host_report(PositionShadow::flat(5), Instant::now());
        assert_eq!(outcome, ReconcileOutcome::InSync);
    }

    #[test]
    fn disagreement_within_window_is_pending() {
        let mut state = ReconcileState::default();
        state.on_bridge_update(long(1.0));
        let t0 = Instant::now();

        assert_eq!(
            state.on_host_report(PositionShadow::flat(2), t0),
            ReconcileOutcome::Pending
        );
        assert_eq!(
            state.on_host_report(PositionShadow::flat(3), t0 + Duration::from_secs(2)),
            ReconcileOutcome::Pending
        );
        // The bridge shadow is untouched while pending.
        assert_eq!(state.bridge.direction, PositionDirection::Long);
    }

    #[test]
    fn window_elapse_adopts_host_shadow() {
        // The S6 shape: bridge says LONG 1, three FLAT reports over 4 s.
        let mut state = ReconcileState::default();
        state.on_bridge_update(long(1.0));
        let t0 = Instant::now();

        assert_eq!(
            state.on_host_report(PositionShadow::flat(1), t0),
            ReconcileOutcome::Pending
        );
        assert_eq!(
            state.on_host_report(PositionShadow::flat(2), t0 + Duration::from_secs(2)),
            ReconcileOutcome::Pending
        );
        match state.on_host_report(PositionShadow::flat(3), t0 + Duration::from_secs(4)) {
            ReconcileOutcome::Adopted {
                attempts,
                first_alert,
            } => {
                assert!(attempts <= MAX_RECONCILE_ATTEMPTS);
                assert!(first_alert);
            }
            other => panic!("expected adoption, got {other:?}"),
        }
        assert_eq!(state.bridge.direction, PositionDirection::Flat);
    }

    #[test]
    fn bridge_update_heals_episode_quietly() {
        let mut state = ReconcileState::default();
        state.on_bridge_update(long(1.0));
        let t0 = Instant::now();
        assert_eq!(
            state.on_host_report(PositionShadow::flat(1), t0),
            ReconcileOutcome::Pending
        );

        // A close executes locally and the shadows agree again.
        state.on_bridge_update(PositionShadow::flat(2));
        assert_eq!(
            state.on_host_report(PositionShadow::flat(3), t0 + Duration::from_secs(10)),
            ReconcileOutcome::InSync
        );
    }

    #[test]
    fn heal_after_mismatch_is_reported_once() {
        let mut state = ReconcileState::default();
        state.on_bridge_update(long(1.0));
        let t0 = Instant::now();
        let _ = state.on_host_report(PositionShadow::flat(1), t0);

        // Host comes around to the bridge view before the window elapses.
        assert_eq!(
            state.on_host_report(long(1.0), t0 + Duration::from_secs(1)),
            ReconcileOutcome::Healed
        );
        assert_eq!(
            state.on_host_report(long(1.0), t0 + Duration::from_secs(2)),
            ReconcileOutcome::InSync
        );
    }

    #[test]
    fn size_mismatch_beyond_tolerance_counts() {
        let mut state = ReconcileState::default();
        state.on_bridge_update(long(1.0));
        let t0 = Instant::now();
        assert_eq!(
            state.on_host_report(long(2.0), t0),
            ReconcileOutcome::Pending
        );
    }
}
