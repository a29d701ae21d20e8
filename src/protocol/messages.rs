// =============================================================================
// Wire Messages — the closed set of frames exchanged with the Execution Host
// =============================================================================
//
// Inbound frames are a tagged enum over the closed set of recognised `type`
// values; anything else is classified as `Unknown` and dropped by the
// session (logged at debug, not counted as a protocol error). Malformed
// JSON is a separate classification and DOES count toward the per-session
// error limit.
//
// Outbound frames carry `timestamp` (ISO-8601 with milliseconds) and
// `instrument`; frames that touch the trade lifecycle also carry
// `strategy_action: "CONTINUE_OPERATION"` for host compatibility.
// =============================================================================

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PositionDirection, TradeDirection};

/// Marker asserting to the host that a trade outcome never ends the session.
pub const STRATEGY_ACTION_CONTINUE: &str = "CONTINUE_OPERATION";

/// Current wall-clock time formatted for outbound frames.
pub fn wire_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// Market frame
// =============================================================================

/// One market update from the host. Unknown fields are preserved verbatim
/// in `extra` so the prediction gateway sees everything the host sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketFrame {
    pub instrument: String,
    /// Epoch milliseconds; 0 means "not provided" and is replaced with the
    /// receive time at ingress.
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema5: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema8: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_alignment: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adx: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MarketFrame {
    /// Validate the hard invariants: a positive, finite price and an RSI
    /// within [0, 100] when present.
    pub fn validate(&self) -> Result<(), String> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(format!("price must be positive, got {}", self.price));
        }
        if let Some(rsi) = self.rsi {
            if !rsi.is_finite() || !(0.0..=100.0).contains(&rsi) {
                return Err(format!("rsi out of range [0,100]: {rsi}"));
            }
        }
        Ok(())
    }

    /// Best-effort repair of an invalid frame. Recovers a missing price
    /// from `close`, the bid/ask midpoint, or `open`; clamps an out-of-range
    /// RSI. Returns `None` when no usable price can be recovered.
    pub fn sanitized(&self) -> Option<MarketFrame> {
        let mut frame = self.clone();

        if !frame.price.is_finite() || frame.price <= 0.0 {
            let recovered = frame
                .close
                .filter(|p| p.is_finite() && *p > 0.0)
                .or_else(|| match (frame.bid, frame.ask) {
                    (Some(b), Some(a)) if b.is_finite() && a.is_finite() && b > 0.0 && a > 0.0 => {
                        Some((b + a) / 2.0)
                    }
                    _ => None,
                })
                .or_else(|| frame.open.filter(|p| p.is_finite() && *p > 0.0))?;
            frame.price = recovered;
        }

        if let Some(rsi) = frame.rsi {
            if !rsi.is_finite() {
                frame.rsi = None;
            } else if !(0.0..=100.0).contains(&rsi) {
                frame.rsi = Some(rsi.clamp(0.0, 100.0));
            }
        }

        debug_assert!(frame.validate().is_ok());
        Some(frame)
    }
}

// =============================================================================
// Other inbound payloads
// =============================================================================

/// Host strategy/position status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStatus {
    pub instrument: String,
    #[serde(default)]
    pub position: PositionDirection,
    #[serde(default)]
    pub position_size: f64,
    #[serde(default)]
    pub avg_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_pnl: Option<f64>,
    #[serde(default)]
    pub ts: i64,
}

/// An order execution or update report from the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub instrument: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Synchronous prediction request; answered on the same session with an
/// `ml_prediction_response` echoing `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub request_id: String,
    #[serde(flatten)]
    pub frame: MarketFrame,
}

fn default_size() -> f64 {
    1.0
}

/// Synchronous trailing-stop evaluation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub direction: TradeDirection,
    pub entry_price: f64,
    #[serde(default = "default_size")]
    pub size: f64,
    pub current_stop: f64,
    #[serde(flatten)]
    pub frame: MarketFrame,
}

// =============================================================================
// Inbound classification
// =============================================================================

/// The closed set of recognised inbound frame types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostInbound {
    InstrumentRegistration {
        instrument: String,
    },
    MarketData(MarketFrame),
    StrategyStatus(StrategyStatus),
    TradeExecution(ExecutionReport),
    ExecutionUpdate(ExecutionReport),
    MlPredictionRequest(PredictionRequest),
    SmartTrailingRequest(TrailingRequest),
    Heartbeat {
        #[serde(default)]
        instrument: Option<String>,
    },
    Ping {
        #[serde(default)]
        instrument: Option<String>,
    },
}

/// Result of classifying one raw line from the host.
#[derive(Debug)]
pub enum InboundParse {
    /// A recognised, well-formed frame.
    Frame(HostInbound),
    /// Well-formed JSON with an unrecognised or missing `type`.
    Unknown(String),
    /// Not valid JSON at all. Counts toward the protocol-abuse limit.
    Malformed(String),
}

/// Classify a raw line. Distinguishes malformed JSON (a protocol error)
/// from a well-formed frame of an unknown type (dropped silently).
pub fn classify(line: &str) -> InboundParse {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return InboundParse::Malformed(e.to_string()),
    };

    let frame_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("<missing>")
        .to_string();

    match serde_json::from_value::<HostInbound>(value) {
        Ok(frame) => InboundParse::Frame(frame),
        Err(_) => InboundParse::Unknown(frame_type),
    }
}

// =============================================================================
// Outbound frames
// =============================================================================

/// Command verbs the bridge can send to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    GoLong,
    GoShort,
    ClosePosition,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GoLong => "go_long",
            Self::GoShort => "go_short",
            Self::ClosePosition => "close_position",
        };
        write!(f, "{s}")
    }
}

/// The closed set of frames the bridge writes to the host link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostOutbound {
    MlPredictionResponse {
        timestamp: String,
        instrument: String,
        request_id: String,
        prediction: serde_json::Value,
    },
    SmartTrailingResponse {
        timestamp: String,
        instrument: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_stop_price: Option<f64>,
        algorithm: String,
        confidence: f64,
        reasoning: String,
        strategy_action: String,
    },
    Command {
        timestamp: String,
        instrument: String,
        command: CommandKind,
        quantity: f64,
        price: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_loss: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<f64>,
        reason: String,
        strategy_action: String,
    },
    HeartbeatResponse {
        timestamp: String,
    },
}

impl HostOutbound {
    pub fn command(
        instrument: &str,
        command: CommandKind,
        quantity: f64,
        price: f64,
        stop_loss: Option<f64>,
        target: Option<f64>,
        reason: &str,
    ) -> Self {
        Self::Command {
            timestamp: wire_timestamp(),
            instrument: instrument.to_string(),
            command,
            quantity,
            price,
            stop_loss,
            target,
            reason: reason.to_string(),
            strategy_action: STRATEGY_ACTION_CONTINUE.to_string(),
        }
    }

    pub fn heartbeat_response() -> Self {
        Self::HeartbeatResponse {
            timestamp: wire_timestamp(),
        }
    }

    /// The instrument this frame is scoped to, if any.
    pub fn instrument(&self) -> Option<&str> {
        match self {
            Self::MlPredictionResponse { instrument, .. }
            | Self::SmartTrailingResponse { instrument, .. }
            | Self::Command { instrument, .. } => Some(instrument),
            Self::HeartbeatResponse { .. } => None,
        }
    }

    /// Serialize to the single-line JSON text the codec writes.
    pub fn to_wire(&self) -> String {
        // Outbound frames contain no map keys that can fail to serialise.
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "outbound frame serialisation failed");
            String::from("{}")
        })
    }
}
