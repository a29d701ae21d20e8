// =============================================================================
// Dashboard Events — named channels pushed to subscribers
// =============================================================================
//
// Every dashboard-visible occurrence is an `Event`: a channel name, a JSON
// payload, and a server timestamp. The hub fans these out; producers never
// block on a slow subscriber.
// =============================================================================

use chrono::Utc;
use serde::Serialize;

// ── Channel names ────────────────────────────────────────────────────────────

pub mod channel {
    pub const STRATEGY_STATE: &str = "strategy_state";
    pub const STRATEGY_STATUS: &str = "strategy_status";
    pub const MARKET_DATA: &str = "market_data";
    pub const TRADE_EXECUTION: &str = "trade_execution";
    pub const ML_PREDICTION_RESULT: &str = "ml_prediction_result";
    pub const SYSTEM_ALERT: &str = "system_alert";
    pub const PERFORMANCE_METRICS: &str = "performance_metrics";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const CONNECTION_STATUS: &str = "connection_status";
    pub const CURRENT_SETTINGS: &str = "current_settings";

    /// All channels, in the order the dashboard lists them.
    pub const ALL: [&str; 10] = [
        STRATEGY_STATE,
        STRATEGY_STATUS,
        MARKET_DATA,
        TRADE_EXECUTION,
        ML_PREDICTION_RESULT,
        SYSTEM_ALERT,
        PERFORMANCE_METRICS,
        HEARTBEAT,
        CONNECTION_STATUS,
        CURRENT_SETTINGS,
    ];
}

// ── Event envelope ───────────────────────────────────────────────────────────

/// One dashboard event on a named channel.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Channel name (see [`channel`]).
    pub channel: String,
    /// Arbitrary JSON payload.
    pub payload: serde_json::Value,
    /// Server timestamp, epoch milliseconds.
    pub ts: i64,
}

impl Event {
    /// Build an event stamped with the current server time.
    pub fn new(channel: &str, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.to_string(),
            payload,
            ts: Utc::now().timestamp_millis(),
        }
    }

    /// A `system_alert` event with the given alert type and detail payload.
    pub fn system_alert(alert_type: &str, mut detail: serde_json::Value) -> Self {
        if let Some(obj) = detail.as_object_mut() {
            obj.insert("type".to_string(), serde_json::json!(alert_type));
        } else {
            detail = serde_json::json!({ "type": alert_type, "detail": detail });
        }
        Self::new(channel::SYSTEM_ALERT, detail)
    }

    /// A `connection_status` event (`connected`, `disconnected`, `shutdown`).
    pub fn connection_status(status: &str, instrument: Option<&str>) -> Self {
        let payload = match instrument {
            Some(i) => serde_json::json!({ "status": status, "instrument": i }),
            None => serde_json::json!({ "status": status }),
        };
        Self::new(channel::CONNECTION_STATUS, payload)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_alert_injects_type_field() {
        let event = Event::system_alert(
            "position_discrepancy",
            serde_json::json!({ "instrument": "ES 03-25" }),
        );
        assert_eq!(event.channel, channel::SYSTEM_ALERT);
        assert_eq!(event.payload["type"], "position_discrepancy");
        assert_eq!(event.payload["instrument"], "ES 03-25");
    }

    #[test]
    fn connection_status_carries_instrument_when_present() {
        let event = Event::connection_status("connected", Some("NQ 06-25"));
        assert_eq!(event.payload["status"], "connected");
        assert_eq!(event.payload["instrument"], "NQ 06-25");

        let bare = Event::connection_status("shutdown", None);
        assert!(bare.payload.get("instrument").is_none());
    }

    #[test]
    fn all_channels_are_distinct() {
        let mut names: Vec<&str> = channel::ALL.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), channel::ALL.len());
    }
}
