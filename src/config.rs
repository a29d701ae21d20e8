// =============================================================================
// Bridge Configuration — static settings resolved once at startup
// =============================================================================
//
// Everything here is fixed for the lifetime of the process. Runtime-mutable
// risk settings live in `settings.rs` instead.
//
// Every field can be overridden through a `BRIDGE_*` environment variable
// (a `.env` file is honored). Unparseable values fall back to the default
// with a warning rather than aborting startup.
// =============================================================================

use std::collections::HashMap;

use tracing::warn;

/// Maximum accepted frame size on the host link (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Static bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// TCP port the Execution Host connects to.
    pub host_port: u16,
    /// HTTP/WebSocket port the dashboard connects to.
    pub dashboard_port: u16,
    /// Path of the persisted risk settings file.
    pub settings_path: String,
    /// Default minimum prediction confidence for auto trades.
    pub min_confidence_default: f64,
    /// Default auto-trading enable flag.
    pub auto_trade_default: bool,
    /// Per-subscriber outbound event queue capacity.
    pub subscriber_queue_capacity: usize,
    /// Prediction cache capacity (LRU entries).
    pub feature_cache_capacity: usize,
    /// Prediction cache entry TTL in milliseconds.
    pub prediction_cache_ttl_ms: u64,
    /// Close a host session after this long without any inbound frame.
    pub host_heartbeat_timeout_ms: u64,
    /// Minimum interval between trailing-stop updates per position.
    pub trailing_throttle_ms: u64,
    /// Maximum stop movement per update, in ATR multiples.
    pub trailing_max_move_atr: f64,
    /// Minimum confidence required to emit a trailing-stop update.
    pub trailing_min_confidence: f64,
    /// Optional model-service URL. Absent means rule-based predictions only.
    pub predictor_url: Option<String>,
    /// Optional JSONL event log path. Absent means no durable store.
    pub event_log_path: Option<String>,
    /// Per-instrument-root point values (e.g. "ES" -> 50.0).
    pub point_values: HashMap<String, f64>,
    /// Generate synthetic market frames when no host is connected.
    /// Demo affordance only; must never default to on.
    pub synthetic_mode: bool,
}

fn default_point_values() -> HashMap<String, f64> {
    let mut table = HashMap::new();
    table.insert("ES".to_string(), 50.0);
    table.insert("NQ".to_string(), 20.0);
    table.insert("YM".to_string(), 5.0);
    table.insert("RTY".to_string(), 50.0);
    table.insert("CL".to_string(), 1000.0);
    table.insert("GC".to_string(), 100.0);
    table
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host_port: 9999,
            dashboard_port: 8080,
            settings_path: "bridge_settings.json".to_string(),
            min_confidence_default: 0.6,
            auto_trade_default: false,
            subscriber_queue_capacity: 256,
            feature_cache_capacity: 1000,
            prediction_cache_ttl_ms: 5 * 60 * 1000,
            host_heartbeat_timeout_ms: 30_000,
            trailing_throttle_ms: 15_000,
            trailing_max_move_atr: 0.5,
            trailing_min_confidence: 0.6,
            predictor_url: None,
            event_log_path: None,
            point_values: default_point_values(),
            synthetic_mode: false,
        }
    }
}

impl BridgeConfig {
    /// Build the configuration from the environment, starting from defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        read_env("BRIDGE_HOST_PORT", &mut cfg.host_port);
        read_env("BRIDGE_DASHBOARD_PORT", &mut cfg.dashboard_port);
        if let Ok(v) = std::env::var("BRIDGE_SETTINGS_PATH") {
            if !v.trim().is_empty() {
                cfg.settings_path = v;
            }
        }
        read_env("BRIDGE_MIN_CONFIDENCE_DEFAULT", &mut cfg.min_confidence_default);
        read_env("BRIDGE_AUTO_TRADE_DEFAULT", &mut cfg.auto_trade_default);
        read_env("BRIDGE_SUBSCRIBER_QUEUE_CAPACITY", &mut cfg.subscriber_queue_capacity);
        read_env("BRIDGE_FEATURE_CACHE_CAPACITY", &mut cfg.feature_cache_capacity);
        read_env("BRIDGE_PREDICTION_CACHE_TTL_MS", &mut cfg.prediction_cache_ttl_ms);
        read_env("BRIDGE_HOST_HEARTBEAT_TIMEOUT_MS", &mut cfg.host_heartbeat_timeout_ms);
        read_env("BRIDGE_TRAILING_THROTTLE_MS", &mut cfg.trailing_throttle_ms);
        read_env("BRIDGE_TRAILING_MAX_MOVE_ATR", &mut cfg.trailing_max_move_atr);
        read_env("BRIDGE_TRAILING_MIN_CONFIDENCE", &mut cfg.trailing_min_confidence);
        read_env("BRIDGE_SYNTHETIC_MODE", &mut cfg.synthetic_mode);

        if let Ok(v) = std::env::var("BRIDGE_PREDICTOR_URL") {
            if !v.trim().is_empty() {
                cfg.predictor_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BRIDGE_EVENT_LOG_PATH") {
            if !v.trim().is_empty() {
                cfg.event_log_path = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BRIDGE_POINT_VALUES") {
            for (root, value) in parse_point_values(&v) {
                cfg.point_values.insert(root, value);
            }
        }

        cfg
    }

    /// Resolve the point value for an instrument, matching on its root
    /// symbol (the part before the first space, e.g. "ES 03-25" -> "ES").
    pub fn point_value(&self, instrument: &str) -> f64 {
        let root = instrument.split_whitespace().next().unwrap_or(instrument);
        self.point_values.get(root).copied().unwrap_or(1.0)
    }
}

/// Parse an env var into `target` if present and valid; warn otherwise.
fn read_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

/// Parse a "ES=50,NQ=20" style list, skipping malformed entries.
fn parse_point_values(raw: &str) -> Vec<(String, f64)> {
    raw.split(',')
        .filter_map(|pair| {
            let (root, value) = pair.split_once('=')?;
            let root = root.trim();
            let value: f64 = value.trim().parse().ok()?;
            if root.is_empty() || value <= 0.0 {
                return None;
            }
            Some((root.to_string(), value))
        })
        .collect()
}
