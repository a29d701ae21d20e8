// =============================================================================
// Central Bridge State — Meridian Trade Bridge
// =============================================================================
//
// The single composition point for the bridge. The supervisor (main.rs)
// owns one `Arc<BridgeState>`; every task reaches its collaborators through
// it. Components keep their own interior state — nothing here is a module
// global, and no component holds a back-pointer to a peer.
//
// Thread safety:
//   - Atomic counters for the wire/metrics counters.
//   - parking_lot::RwLock for the runtime risk settings.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::events::{channel, Event};
use crate::host::HostRegistry;
use crate::hub::SubscriberHub;
use crate::prediction::gateway::{GatewayStats, PredictionGateway};
use crate::prediction::predictor::{HttpPredictor, Predictor, RulePredictor};
use crate::prediction::Prediction;
use crate::settings::{RiskSettings, SettingsPatch};
use crate::store::{EventStore, JsonlStore, NoopStore};
use crate::trade::manager::TradeManager;
use crate::trailing::{TrailingConfig, TrailingController};
use crate::types::SignalDirection;

/// Deadline for one external model call.
pub const PREDICTION_DEADLINE: Duration = Duration::from_secs(5);

/// Latency histogram bucket upper bounds, in milliseconds.
const LATENCY_BUCKETS_MS: [u64; 6] = [1, 5, 25, 100, 1000, 5000];

// =============================================================================
// Wire metrics
// =============================================================================

/// Process-wide counters for the host link and prediction latency.
#[derive(Default)]
pub struct WireMetrics {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub unknown_frames: AtomicU64,
    latency_buckets: [AtomicU64; 6],
    latency_count: AtomicU64,
    latency_sum_ms: AtomicU64,
}

impl WireMetrics {
    pub fn record_latency_ms(&self, ms: u64) {
        for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if ms <= *bound {
                self.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn latency_snapshot(&self) -> LatencyHistogram {
        LatencyHistogram {
            bucket_bounds_ms: LATENCY_BUCKETS_MS.to_vec(),
            bucket_counts: self
                .latency_buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.latency_count.load(Ordering::Relaxed),
            sum_ms: self.latency_sum_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyHistogram {
    pub bucket_bounds_ms: Vec<u64>,
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
}

// =============================================================================
// Snapshots
// =============================================================================

/// Payload of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_s: u64,
    pub host_sessions: usize,
    pub registered_instruments: Vec<String>,
    pub subscribers: usize,
    pub active_trades: usize,
    pub cache_hit_rate: f64,
    pub feature_cache_size: usize,
    pub breaker_state: crate::prediction::breaker::BreakerState,
    pub events_dropped: u64,
    pub reconcile_ages_s: std::collections::HashMap<String, Option<u64>>,
}

/// Payload of `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub gateway: GatewayStats,
    pub latency_ms: LatencyHistogram,
    pub frames_in: u64,
    pub frames_out: u64,
    pub protocol_errors: u64,
    pub unknown_frames: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub host_sessions: usize,
    pub subscribers: usize,
    pub open_trades: usize,
}

// =============================================================================
// BridgeState
// =============================================================================

pub struct BridgeState {
    pub config: Arc<BridgeConfig>,
    settings: RwLock<RiskSettings>,
    pub hub: Arc<SubscriberHub>,
    pub registry: Arc<HostRegistry>,
    pub trades: Arc<TradeManager>,
    pub gateway: Arc<PredictionGateway>,
    pub trailing: Arc<TrailingController>,
    store: Arc<dyn EventStore>,
    pub shutdown: CancellationToken,
    pub metrics: WireMetrics,
    pub start_time: std::time::Instant,
}

impl BridgeState {
    /// Wire up every subsystem from the static configuration. Persisted
    /// risk settings are adopted when the settings file exists.
    pub fn new(config: BridgeConfig) -> Self {
        let config = Arc::new(config);

        let settings = match RiskSettings::load(&config.settings_path) {
            Ok(s) => s,
            Err(e) => {
                info!(error = %e, "no persisted settings — using configured defaults");
                RiskSettings {
                    min_confidence: config.min_confidence_default,
                    auto_trading_enabled: config.auto_trade_default,
                }
            }
        };

        let predictor: Arc<dyn Predictor> = match &config.predictor_url {
            Some(url) => match HttpPredictor::new(url.clone(), PREDICTION_DEADLINE) {
                Ok(p) => {
                    info!(url = %url, "using HTTP model service");
                    Arc::new(p)
                }
                Err(e) => {
                    warn!(error = %e, "model service client failed to build — using rules");
                    Arc::new(RulePredictor)
                }
            },
            None => {
                info!("no model service configured — using rule-based predictor");
                Arc::new(RulePredictor)
            }
        };

        let store: Arc<dyn EventStore> = match &config.event_log_path {
            Some(path) => {
                info!(path = %path, "event log enabled");
                Arc::new(JsonlStore::new(path))
            }
            None => Arc::new(NoopStore),
        };

        let hub = Arc::new(SubscriberHub::new(config.subscriber_queue_capacity));
        let registry = Arc::new(HostRegistry::new());
        let trades = Arc::new(TradeManager::new(
            config.clone(),
            registry.clone(),
            hub.clone(),
        ));
        let gateway = Arc::new(PredictionGateway::new(
            predictor,
            config.feature_cache_capacity,
            Duration::from_millis(config.prediction_cache_ttl_ms),
            PREDICTION_DEADLINE,
        ));
        let trailing = Arc::new(TrailingController::new(TrailingConfig {
            throttle: Duration::from_millis(config.trailing_throttle_ms),
            max_move_atr: config.trailing_max_move_atr,
            min_confidence: config.trailing_min_confidence,
        }));

        Self {
            config,
            settings: RwLock::new(settings),
            hub,
            registry,
            trades,
            gateway,
            trailing,
            store,
            shutdown: CancellationToken::new(),
            metrics: WireMetrics::default(),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Events ──────────────────────────────────────────────────────────

    /// Publish one event to every subscriber and the durable store.
    pub fn publish(&self, event: Event) {
        self.store.append(&event);
        self.hub.publish(event);
    }

    // ── Settings ────────────────────────────────────────────────────────

    pub fn settings(&self) -> RiskSettings {
        self.settings.read().clone()
    }

    /// Atomic read-modify-persist: the file write happens BEFORE the
    /// caller acks the RPC, and the new settings are broadcast after.
    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<RiskSettings, String> {
        let updated = {
            let mut settings = self.settings.write();
            let mut staged = settings.clone();
            let changes = staged.apply_patch(patch)?;

            if !changes.is_empty() {
                staged
                    .save(&self.config.settings_path)
                    .map_err(|e| format!("settings persistence failed: {e}"))?;
                info!(changes = ?changes, "risk settings updated");
                *settings = staged.clone();
            }
            staged
        };

        self.publish(Event::new(
            channel::CURRENT_SETTINGS,
            serde_json::to_value(&updated).unwrap_or_default(),
        ));

        Ok(updated)
    }

    /// Persist the current settings (shutdown step 6).
    pub fn persist_settings(&self) {
        let settings = self.settings.read().clone();
        if let Err(e) = settings.save(&self.config.settings_path) {
            warn!(error = %e, "failed to persist settings on shutdown");
        }
    }

    // ── Risk gates ──────────────────────────────────────────────────────

    /// The auto-trade gate: master switch, confidence floor, and a real
    /// directional signal.
    pub fn auto_trade_allowed(&self, prediction: &Prediction) -> bool {
        let settings = self.settings.read();
        settings.auto_trading_enabled
            && prediction.confidence > settings.min_confidence
            && matches!(
                prediction.direction,
                SignalDirection::Long | SignalDirection::Short
            )
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let gateway = self.gateway.stats();
        HealthSnapshot {
            status: "ok",
            uptime_s: self.start_time.elapsed().as_secs(),
            host_sessions: self.registry.session_count(),
            registered_instruments: self.registry.instruments(),
            subscribers: self.hub.subscriber_count(),
            active_trades: self.trades.open_trade_count(),
            cache_hit_rate: gateway.cache_hit_rate,
            feature_cache_size: gateway.cache_size,
            breaker_state: gateway.breaker_state,
            events_dropped: self.hub.dropped_total(),
            reconcile_ages_s: self.trades.reconcile_ages(),
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gateway: self.gateway.stats(),
            latency_ms: self.metrics.latency_snapshot(),
            frames_in: self.metrics.frames_in.load(Ordering::Relaxed),
            frames_out: self.metrics.frames_out.load(Ordering::Relaxed),
            protocol_errors: self.metrics.protocol_errors.load(Ordering::Relaxed),
            unknown_frames: self.metrics.unknown_frames.load(Ordering::Relaxed),
            events_published: self.hub.published_total(),
            events_dropped: self.hub.dropped_total(),
            host_sessions: self.registry.session_count(),
            subscribers: self.hub.subscriber_count(),
            open_trades: self.trades.open_trade_count(),
        }
    }

    /// Periodic `performance_metrics` event for the dashboard.
    pub fn publish_performance_metrics(&self) {
        let snapshot = self.metrics_snapshot();
        self.publish(Event::new(
            channel::PERFORMANCE_METRICS,
            serde_json::to_value(&snapshot).unwrap_or_default(),
        ));
    }
}
