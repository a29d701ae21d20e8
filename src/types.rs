// =============================================================================
// Shared types used across the Meridian trade bridge
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a prediction signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalDirection {
    Long,
    Short,
    Neutral,
}

impl Default for SignalDirection {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Direction of a tracked trade. Unlike a signal, a trade is never neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    /// Signed multiplier for pnl arithmetic: +1 for long, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Short tag used inside trade ids.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Direction of a position as reported by the host or derived from trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionDirection {
    Long,
    Short,
    Flat,
}

impl Default for PositionDirection {
    fn default() -> Self {
        Self::Flat
    }
}

impl std::fmt::Display for PositionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

impl From<TradeDirection> for PositionDirection {
    fn from(d: TradeDirection) -> Self {
        match d {
            TradeDirection::Long => Self::Long,
            TradeDirection::Short => Self::Short,
        }
    }
}

/// Origin of a tracked trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSource {
    Manual,
    Auto,
    Sync,
}

impl TradeSource {
    /// Short tag used inside trade ids.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Auto => "AUTO",
            Self::Sync => "SYNC",
        }
    }
}

impl std::fmt::Display for TradeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Lifecycle status of a tracked trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Filled,
    Partial,
    Closed,
    Failed,
    Cancelled,
}

impl TradeStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Filled => "FILLED",
            Self::Partial => "PARTIAL",
            Self::Closed => "CLOSED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_serialises_uppercase() {
        assert_eq!(serde_json::to_string(&SignalDirection::Long).unwrap(), "\"LONG\"");
        assert_eq!(serde_json::to_string(&PositionDirection::Flat).unwrap(), "\"FLAT\"");
        let d: TradeDirection = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(d, TradeDirection::Short);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TradeStatus::Closed.is_terminal());
        assert!(TradeStatus::Failed.is_terminal());
        assert!(TradeStatus::Cancelled.is_terminal());
        assert!(!TradeStatus::Pending.is_terminal());
        assert!(!TradeStatus::Filled.is_terminal());
        assert!(!TradeStatus::Partial.is_terminal());
    }

    #[test]
    fn trade_direction_sign() {
        assert!((TradeDirection::Long.sign() - 1.0).abs() < f64::EPSILON);
        assert!((TradeDirection::Short.sign() + 1.0).abs() < f64::EPSILON);
    }
}
