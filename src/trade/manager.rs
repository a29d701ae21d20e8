// =============================================================================
// Trade Manager — lifecycle state machine for bridge-tracked trades
// =============================================================================
//
// Life-cycle:
//
//            enter_trade               entry match              exit match
//   (none) ─────────────▶ PENDING ─────────────────▶ FILLED ─────────────▶ CLOSED
//                            │                          │
//                            │ route fail / timeout     │ cancel / reject
//                            ▼                          ▼
//                          FAILED                   CANCELLED
//
// Trades are owned here and nowhere else. All transitions for one
// instrument are serialized under that instrument's book lock;
// cross-instrument progress is independent. A trade reaching a terminal
// state changes nothing outside its book — sessions, other trades, and the
// supervisor keep running.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::reconcile::{PositionShadow, ReconcileOutcome, ReconcileState};
use crate::config::BridgeConfig;
use crate::events::{channel, Event};
use crate::host::HostRegistry;
use crate::hub::SubscriberHub;
use crate::protocol::messages::{CommandKind, HostOutbound};
use crate::types::{PositionDirection, TradeDirection, TradeSource, TradeStatus};

/// Price proximity for matching an execution report against a trade.
pub const MATCH_EPSILON: f64 = 0.5;
/// A PENDING trade with no execution after this long is FAILED.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(10);

/// One tracked order lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: String,
    pub instrument: String,
    pub direction: TradeDirection,
    pub qty: f64,
    pub entry_px: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_px: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_px: Option<f64>,
    pub source: TradeSource,
    pub status: TradeStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_px: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    #[serde(skip)]
    created_instant: Instant,
}

/// A validated entry request.
#[derive(Debug, Clone)]
pub struct EnterTradeRequest {
    pub instrument: String,
    pub direction: TradeDirection,
    pub qty: f64,
    pub entry_px: f64,
    pub stop_px: Option<f64>,
    pub target_px: Option<f64>,
    pub source: TradeSource,
    pub reason: String,
}

/// Outcome of an entry attempt, returned to the originating ack.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    Accepted { trade_id: String },
    Rejected { reason: String },
}

/// Outcome of applying one execution report.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Filled { trade_id: String },
    Closed { trade_id: String, pnl: f64 },
    Cancelled { trade_id: String },
    Failed { trade_id: String },
    Unmatched,
}

/// Per-instrument book: trades plus reconciliation state, one lock.
struct Book {
    trades: Vec<Trade>,
    recon: ReconcileState,
}

impl Book {
    fn new() -> Self {
        Self {
            trades: Vec::new(),
            recon: ReconcileState::default(),
        }
    }

    /// Bridge shadow derived from currently FILLED trades.
    fn derive_shadow(&self) -> PositionShadow {
        let mut net = 0.0_f64;
        let mut weighted_px = 0.0_f64;
        let mut gross = 0.0_f64;

        for trade in self.trades.iter().filter(|t| t.status == TradeStatus::Filled) {
            net += trade.direction.sign() * trade.qty;
            weighted_px += trade.entry_px * trade.qty;
            gross += trade.qty;
        }

        let direction = if net > 1e-9 {
            PositionDirection::Long
        } else if net < -1e-9 {
            PositionDirection::Short
        } else {
            PositionDirection::Flat
        };

        PositionShadow {
            direction,
            size: net.abs(),
            avg_price: if gross > 0.0 { weighted_px / gross } else { 0.0 },
            last_update: Utc::now().timestamp_millis(),
        }
    }
}

pub struct TradeManager {
    config: Arc<BridgeConfig>,
    registry: Arc<HostRegistry>,
    hub: Arc<SubscriberHub>,
    books: RwLock<HashMap<String, Arc<Mutex<Book>>>>,
}

impl TradeManager {
    pub fn new(
        config: Arc<BridgeConfig>,
        registry: Arc<HostRegistry>,
        hub: Arc<SubscriberHub>,
    ) -> Self {
        Self {
            config,
            registry,
            hub,
            books: RwLock::new(HashMap::new()),
        }
    }

    fn book(&self, instrument: &str) -> Arc<Mutex<Book>> {
        if let Some(book) = self.books.read().get(instrument) {
            return book.clone();
        }
        self.books
            .write()
            .entry(instrument.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Book::new())))
            .clone()
    }

    // ── Entry ───────────────────────────────────────────────────────────

    /// Validate an entry request, record the PENDING trade, and emit the
    /// command frame to the session registered for the instrument.
    pub fn enter_trade(&self, req: EnterTradeRequest) -> EntryOutcome {
        if let Err(reason) = validate_entry(&req) {
            warn!(instrument = %req.instrument, %reason, "trade entry rejected");
            return EntryOutcome::Rejected { reason };
        }

        let handle = match self.registry.handle_for(&req.instrument) {
            Some(h) => h,
            None => {
                debug!(instrument = %req.instrument, "trade entry with no registered host");
                return EntryOutcome::Rejected {
                    reason: "no host for instrument".to_string(),
                };
            }
        };

        let trade = new_trade(&req);
        let trade_id = trade.id.clone();

        let command = HostOutbound::command(
            &req.instrument,
            match req.direction {
                TradeDirection::Long => CommandKind::GoLong,
                TradeDirection::Short => CommandKind::GoShort,
            },
            req.qty,
            req.entry_px,
            req.stop_px,
            req.target_px,
            &req.reason,
        );

        let book = self.book(&req.instrument);
        {
            let mut book = book.lock();
            book.trades.push(trade.clone());
        }

        if let Err(e) = handle.send_frame(&command) {
            // Route failure: the host never saw the command.
            let mut book = book.lock();
            if let Some(t) = book.trades.iter_mut().find(|t| t.id == trade_id) {
                t.status = TradeStatus::Failed;
                t.exit_reason = Some(format!("route failure: {e}"));
            }
            let failed = book
                .trades
                .iter()
                .find(|t| t.id == trade_id)
                .cloned();
            drop(book);
            if let Some(t) = failed {
                self.publish_trade(&t, "failed");
            }
            warn!(instrument = %req.instrument, trade_id = %trade_id, error = %e, "command route failed");
            return EntryOutcome::Rejected {
                reason: e.to_string(),
            };
        }

        info!(
            trade_id = %trade_id,
            instrument = %req.instrument,
            direction = %req.direction,
            qty = req.qty,
            entry_px = req.entry_px,
            source = %req.source,
            "trade entered (PENDING)"
        );
        self.publish_trade(&trade, "pending");

        EntryOutcome::Accepted { trade_id }
    }

    // ── Execution reports ───────────────────────────────────────────────

    /// Apply one execution report: match by order id, else by price
    /// proximity, and drive the state transition.
    pub fn on_execution(
        &self,
        instrument: &str,
        order_id: Option<&str>,
        price: f64,
        reason: Option<&str>,
    ) -> ExecutionOutcome {
        let book = self.book(instrument);
        let mut book = book.lock();

        let idx = match find_match(&book.trades, order_id, price) {
            Some(i) => i,
            None => {
                debug!(
                    instrument,
                    ?order_id,
                    price,
                    "execution report matched no open trade"
                );
                return ExecutionOutcome::Unmatched;
            }
        };

        let reason_lower = reason.map(|r| r.to_lowercase()).unwrap_or_default();
        let cancelish = reason_lower.contains("cancel") || reason_lower.contains("reject");

        let status = book.trades[idx].status;
        let outcome = match (status, cancelish) {
            (TradeStatus::Pending, true) => {
                let trade = &mut book.trades[idx];
                trade.status = TradeStatus::Failed;
                trade.exit_reason = Some(reason.unwrap_or("rejected").to_string());
                ExecutionOutcome::Failed {
                    trade_id: trade.id.clone(),
                }
            }
            (TradeStatus::Filled, true) => {
                let trade = &mut book.trades[idx];
                trade.status = TradeStatus::Cancelled;
                trade.exit_reason = Some(reason.unwrap_or("cancelled").to_string());
                ExecutionOutcome::Cancelled {
                    trade_id: trade.id.clone(),
                }
            }
            (TradeStatus::Pending, false) => {
                let trade = &mut book.trades[idx];
                trade.status = TradeStatus::Filled;
                if price > 0.0 {
                    trade.entry_px = price;
                }
                ExecutionOutcome::Filled {
                    trade_id: trade.id.clone(),
                }
            }
            (TradeStatus::Filled, false) => {
                let point_value = self.config.point_value(instrument);
                let trade = &mut book.trades[idx];
                let exit_px = if price > 0.0 { price } else { trade.entry_px };
                let pnl =
                    (exit_px - trade.entry_px) * trade.qty * point_value * trade.direction.sign();
                let exit_reason = derive_exit_reason(trade, exit_px, reason);

                trade.status = TradeStatus::Closed;
                trade.exit_px = Some(exit_px);
                trade.exited_at = Some(Utc::now().to_rfc3339());
                trade.exit_reason = Some(exit_reason);
                trade.pnl = Some(pnl);
                ExecutionOutcome::Closed {
                    trade_id: trade.id.clone(),
                    pnl,
                }
            }
            _ => ExecutionOutcome::Unmatched,
        };

        if outcome != ExecutionOutcome::Unmatched {
            let shadow = book.derive_shadow();
            book.recon.on_bridge_update(shadow);

            let trade = book.trades[idx].clone();
            drop(book);

            let transition = match &outcome {
                ExecutionOutcome::Filled { .. } => "filled",
                ExecutionOutcome::Closed { .. } => "closed",
                ExecutionOutcome::Cancelled { .. } => "cancelled",
                ExecutionOutcome::Failed { .. } => "failed",
                ExecutionOutcome::Unmatched => unreachable!(),
            };
            info!(
                trade_id = %trade.id,
                instrument,
                transition,
                price,
                pnl = ?trade.pnl,
                "trade transition"
            );
            self.publish_trade(&trade, transition);
        }

        outcome
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    /// Apply a host position report for the instrument.
    pub fn reconcile(&self, instrument: &str, host: PositionShadow) -> ReconcileOutcome {
        self.reconcile_at(instrument, host, Instant::now())
    }

    fn reconcile_at(
        &self,
        instrument: &str,
        host: PositionShadow,
        now: Instant,
    ) -> ReconcileOutcome {
        let book = self.book(instrument);
        let outcome = {
            let mut book = book.lock();
            book.recon.on_host_report(host.clone(), now)
        };

        match &outcome {
            ReconcileOutcome::Adopted {
                attempts,
                first_alert,
            } => {
                warn!(
                    instrument,
                    attempts,
                    host_direction = %host.direction,
                    host_size = host.size,
                    "position discrepancy — bridge shadow overwritten from host"
                );
                if *first_alert {
                    self.hub.publish(Event::system_alert(
                        "position_discrepancy",
                        serde_json::json!({
                            "instrument": instrument,
                            "host_position": host,
                            "attempts": attempts,
                        }),
                    ));
                }
                self.hub.publish(Event::system_alert(
                    "position_reconciled",
                    serde_json::json!({
                        "instrument": instrument,
                        "position": host,
                        "adopted_from_host": true,
                    }),
                ));
            }
            ReconcileOutcome::Healed => {
                info!(instrument, "position shadows back in sync");
                self.hub.publish(Event::system_alert(
                    "position_reconciled",
                    serde_json::json!({
                        "instrument": instrument,
                        "position": host,
                        "adopted_from_host": false,
                    }),
                ));
            }
            ReconcileOutcome::InSync | ReconcileOutcome::Pending => {}
        }

        outcome
    }

    /// Apply a trailing-stop update to a FILLED trade. Monotonicity and
    /// bounds are the trailing controller's responsibility; the book only
    /// records the new level.
    pub fn update_stop(&self, instrument: &str, trade_id: &str, new_stop: f64) -> bool {
        let book = self.book(instrument);
        let mut book = book.lock();
        match book
            .trades
            .iter_mut()
            .find(|t| t.id == trade_id && t.status == TradeStatus::Filled)
        {
            Some(trade) => {
                debug!(
                    trade_id,
                    instrument,
                    old_stop = ?trade.stop_px,
                    new_stop,
                    "trailing stop applied"
                );
                trade.stop_px = Some(new_stop);
                true
            }
            None => false,
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// All non-terminal trades for the instrument.
    pub fn active_trades(&self, instrument: &str) -> Vec<Trade> {
        let book = self.book(instrument);
        let book = book.lock();
        book.trades
            .iter()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Non-terminal trade count across every instrument.
    pub fn open_trade_count(&self) -> usize {
        let books: Vec<Arc<Mutex<Book>>> = self.books.read().values().cloned().collect();
        books
            .iter()
            .map(|b| {
                b.lock()
                    .trades
                    .iter()
                    .filter(|t| !t.status.is_terminal())
                    .count()
            })
            .sum()
    }

    /// The bridge-derived position shadow for an instrument.
    pub fn bridge_shadow(&self, instrument: &str) -> PositionShadow {
        let book = self.book(instrument);
        let book = book.lock();
        book.recon.bridge.clone()
    }

    /// Seconds since the last reconciliation resolution, per instrument.
    pub fn reconcile_ages(&self) -> HashMap<String, Option<u64>> {
        let books: Vec<(String, Arc<Mutex<Book>>)> = self
            .books
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        books
            .into_iter()
            .map(|(instrument, book)| {
                let age = book.lock().recon.last_resolution_age_s();
                (instrument, age)
            })
            .collect()
    }

    // ── Sweepers ────────────────────────────────────────────────────────

    /// Fail PENDING trades that never saw an execution. Returns the number
    /// of trades transitioned.
    pub fn sweep_pending(&self, max_age: Duration) -> usize {
        let books: Vec<Arc<Mutex<Book>>> = self.books.read().values().cloned().collect();
        let mut swept = Vec::new();

        for book in books {
            let mut book = book.lock();
            for trade in book
                .trades
                .iter_mut()
                .filter(|t| t.status == TradeStatus::Pending)
            {
                if trade.created_instant.elapsed() >= max_age {
                    trade.status = TradeStatus::Failed;
                    trade.exit_reason = Some("no execution within timeout".to_string());
                    swept.push(trade.clone());
                }
            }
        }

        for trade in &swept {
            warn!(trade_id = %trade.id, instrument = %trade.instrument, "pending trade timed out");
            self.publish_trade(trade, "failed");
        }
        swept.len()
    }

    /// Shutdown path: cancel every PENDING trade that is still waiting.
    pub fn cancel_all_pending(&self) -> usize {
        let books: Vec<Arc<Mutex<Book>>> = self.books.read().values().cloned().collect();
        let mut cancelled = 0;

        for book in books {
            let mut book = book.lock();
            for trade in book
                .trades
                .iter_mut()
                .filter(|t| t.status == TradeStatus::Pending)
            {
                trade.status = TradeStatus::Cancelled;
                trade.exit_reason = Some("bridge shutdown".to_string());
                cancelled += 1;
            }
        }
        cancelled
    }

    fn publish_trade(&self, trade: &Trade, transition: &str) {
        self.hub.publish(Event::new(
            channel::TRADE_EXECUTION,
            serde_json::json!({
                "transition": transition,
                "trade": trade,
            }),
        ));
    }
}

// ── Free helpers ─────────────────────────────────────────────────────────────

fn validate_entry(req: &EnterTradeRequest) -> Result<(), String> {
    if !req.qty.is_finite() || req.qty <= 0.0 {
        return Err(format!("qty must be positive, got {}", req.qty));
    }
    if !req.entry_px.is_finite() || req.entry_px <= 0.0 {
        return Err(format!("entry price must be positive, got {}", req.entry_px));
    }
    for (name, px) in [("stop", req.stop_px), ("target", req.target_px)] {
        if let Some(px) = px {
            if !px.is_finite() || px <= 0.0 {
                return Err(format!("{name} price must be positive, got {px}"));
            }
        }
    }

    match req.direction {
        TradeDirection::Long => {
            if let Some(stop) = req.stop_px {
                if stop >= req.entry_px {
                    return Err(format!(
                        "long stop {} must be below entry {}",
                        stop, req.entry_px
                    ));
                }
            }
            if let Some(target) = req.target_px {
                if target <= req.entry_px {
                    return Err(format!(
                        "long target {} must be above entry {}",
                        target, req.entry_px
                    ));
                }
            }
        }
        TradeDirection::Short => {
            if let Some(stop) = req.stop_px {
                if stop <= req.entry_px {
                    return Err(format!(
                        "short stop {} must be above entry {}",
                        stop, req.entry_px
                    ));
                }
            }
            if let Some(target) = req.target_px {
                if target >= req.entry_px {
                    return Err(format!(
                        "short target {} must be below entry {}",
                        target, req.entry_px
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Trade id format: `<source>_<direction>_<HHMMSS>_<6-hex>`.
fn generate_trade_id(source: TradeSource, direction: TradeDirection) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}_{}",
        source.tag(),
        direction.tag(),
        Utc::now().format("%H%M%S"),
        &hex[..6]
    )
}

fn new_trade(req: &EnterTradeRequest) -> Trade {
    Trade {
        id: generate_trade_id(req.source, req.direction),
        instrument: req.instrument.clone(),
        direction: req.direction,
        qty: req.qty,
        entry_px: req.entry_px,
        stop_px: req.stop_px,
        target_px: req.target_px,
        source: req.source,
        status: TradeStatus::Pending,
        created_at: Utc::now().to_rfc3339(),
        exited_at: None,
        exit_px: None,
        exit_reason: None,
        pnl: None,
        created_instant: Instant::now(),
    }
}

/// Match an execution report to a trade: by id first, by price proximity
/// against entry (PENDING) or stop/target (FILLED) otherwise.
fn find_match(trades: &[Trade], order_id: Option<&str>, price: f64) -> Option<usize> {
    if let Some(oid) = order_id {
        if let Some(i) = trades
            .iter()
            .position(|t| t.id == oid && !t.status.is_terminal())
        {
            return Some(i);
        }
    }

    trades.iter().position(|t| match t.status {
        TradeStatus::Pending => (price - t.entry_px).abs() < MATCH_EPSILON,
        TradeStatus::Filled => {
            let near_stop = t
                .stop_px
                .map(|s| (price - s).abs() < MATCH_EPSILON)
                .unwrap_or(false);
            let near_target = t
                .target_px
                .map(|s| (price - s).abs() < MATCH_EPSILON)
                .unwrap_or(false);
            let near_entry = (price - t.entry_px).abs() < MATCH_EPSILON;
            near_stop || near_target || near_entry
        }
        _ => false,
    })
}

fn derive_exit_reason(trade: &Trade, exit_px: f64, reason: Option<&str>) -> String {
    if let Some(r) = reason {
        if !r.trim().is_empty() {
            return r.to_string();
        }
    }
    if let Some(stop) = trade.stop_px {
        if (exit_px - stop).abs() < MATCH_EPSILON {
            return "stop_loss".to_string();
        }
    }
    if let Some(target) = trade.target_px {
        if (exit_px - target).abs() < MATCH_EPSILON {
            return "target".to_string();
        }
    }
    "exit".to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SessionHandle, SESSION_WRITE_QUEUE};
    use tokio::sync::mpsc;

    fn manager() -> (Arc<TradeManager>, Arc<HostRegistry>, Arc<SubscriberHub>) {
        let config = Arc::new(BridgeConfig::default());
        let registry = Arc::new(HostRegistry::new());
        let hub = Arc::new(SubscriberHub::new(64));
        let manager = Arc::new(TradeManager::new(config, registry.clone(), hub.clone()));
        (manager, registry, hub)
    }

    fn register_host(registry: &HostRegistry, instrument: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SESSION_WRITE_QUEUE);
        let handle = SessionHandle::new(registry.allocate_session_id(), tx);
        registry.register_instrument(instrument, handle);
        rx
    }

    fn long_request(instrument: &str) -> EnterTradeRequest {
        EnterTradeRequest {
            instrument: instrument.to_string(),
            direction: TradeDirection::Long,
            qty: 1.0,
            entry_px: 21500.0,
            stop_px: Some(21490.0),
            target_px: Some(21520.0),
            source: TradeSource::Auto,
            reason: "test entry".to_string(),
        }
    }

    #[test]
    fn entry_records_pending_and_emits_command() {
        let (manager, registry, _hub) = manager();
        let mut rx = register_host(&registry, "ES 03-25");

        let outcome = manager.enter_trade(long_request("ES 03-25"));
        let trade_id = match outcome {
            EntryOutcome::Accepted { trade_id } => trade_id,
            other => panic!("expected acceptance, got {other:?}"),
        };

        let active = manager.active_trades("ES 03-25");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, trade_id);
        assert_eq!(active[0].status, TradeStatus::Pending);

        let wire = rx.try_recv().unwrap();
        assert!(wire.contains(r#""command":"go_long""#));
        assert!(wire.contains("ES 03-25"));
        assert!(wire.contains("CONTINUE_OPERATION"));
    }

    #[test]
    fn entry_without_host_is_rejected() {
        let (manager, _registry, _hub) = manager();
        match manager.enter_trade(long_request("NQ 06-25")) {
            EntryOutcome::Rejected { reason } => {
                assert_eq!(reason, "no host for instrument");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(manager.active_trades("NQ 06-25").is_empty());
    }

    #[test]
    fn entry_invariants_enforced() {
        let (manager, registry, _hub) = manager();
        let _rx = register_host(&registry, "ES 03-25");

        // Long with stop above entry.
        let mut req = long_request("ES 03-25");
        req.stop_px = Some(21510.0);
        assert!(matches!(
            manager.enter_trade(req),
            EntryOutcome::Rejected { .. }
        ));

        // Short invariants are the mirror image.
        let req = EnterTradeRequest {
            direction: TradeDirection::Short,
            stop_px: Some(21510.0),
            target_px: Some(21480.0),
            ..long_request("ES 03-25")
        };
        assert!(matches!(
            manager.enter_trade(req),
            EntryOutcome::Accepted { .. }
        ));

        // Zero quantity.
        let mut req = long_request("ES 03-25");
        req.qty = 0.0;
        assert!(matches!(
            manager.enter_trade(req),
            EntryOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn trade_ids_are_unique_and_well_formed() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let id = generate_trade_id(TradeSource::Auto, TradeDirection::Long);
            let parts: Vec<&str> = id.split('_').collect();
            assert_eq!(parts.len(), 4);
            assert_eq!(parts[0], "AUTO");
            assert_eq!(parts[1], "LONG");
            assert_eq!(parts[2].len(), 6);
            assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
            assert_eq!(parts[3].len(), 6);
            assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn fill_then_close_computes_pnl_with_point_value() {
        let (manager, registry, _hub) = manager();
        let _rx = register_host(&registry, "ES 03-25");

        let trade_id = match manager.enter_trade(long_request("ES 03-25")) {
            EntryOutcome::Accepted { trade_id } => trade_id,
            other => panic!("{other:?}"),
        };

        // Entry execution by id.
        let outcome = manager.on_execution("ES 03-25", Some(&trade_id), 21500.0, None);
        assert_eq!(
            outcome,
            ExecutionOutcome::Filled {
                trade_id: trade_id.clone()
            }
        );
        assert_eq!(
            manager.bridge_shadow("ES 03-25").direction,
            PositionDirection::Long
        );

        // Exit at the target, matched by proximity.
        let outcome = manager.on_execution("ES 03-25", None, 21520.0, None);
        match outcome {
            ExecutionOutcome::Closed { trade_id: id, pnl } => {
                assert_eq!(id, trade_id);
                // (21520 - 21500) * 1 * 50 (ES point value).
                assert!((pnl - 1000.0).abs() < 1e-9);
            }
            other => panic!("expected close, got {other:?}"),
        }

        assert!(manager.active_trades("ES 03-25").is_empty());
        assert_eq!(
            manager.bridge_shadow("ES 03-25").direction,
            PositionDirection::Flat
        );
    }

    #[test]
    fn short_close_inverts_pnl() {
        let (manager, registry, _hub) = manager();
        let _rx = register_host(&registry, "CL 05-25");

        let req = EnterTradeRequest {
            direction: TradeDirection::Short,
            entry_px: 80.0,
            stop_px: Some(80.5),
            target_px: Some(79.0),
            ..long_request("CL 05-25")
        };
        let trade_id = match manager.enter_trade(req) {
            EntryOutcome::Accepted { trade_id } => trade_id,
            other => panic!("{other:?}"),
        };

        manager.on_execution("CL 05-25", Some(&trade_id), 80.0, None);
        match manager.on_execution("CL 05-25", None, 79.0, Some("target")) {
            ExecutionOutcome::Closed { pnl, .. } => {
                // (79 - 80) * 1 * 1000 * (-1) = +1000.
                assert!((pnl - 1000.0).abs() < 1e-9);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn reject_report_fails_pending_trade() {
        let (manager, registry, _hub) = manager();
        let _rx = register_host(&registry, "ES 03-25");

        let trade_id = match manager.enter_trade(long_request("ES 03-25")) {
            EntryOutcome::Accepted { trade_id } => trade_id,
            other => panic!("{other:?}"),
        };

        let outcome =
            manager.on_execution("ES 03-25", Some(&trade_id), 0.0, Some("order rejected"));
        assert_eq!(outcome, ExecutionOutcome::Failed { trade_id });
        assert!(manager.active_trades("ES 03-25").is_empty());
    }

    #[test]
    fn unmatched_report_changes_nothing() {
        let (manager, registry, _hub) = manager();
        let _rx = register_host(&registry, "ES 03-25");
        manager.enter_trade(long_request("ES 03-25"));

        // Price nowhere near entry, no id.
        let outcome = manager.on_execution("ES 03-25", None, 30_000.0, None);
        assert_eq!(outcome, ExecutionOutcome::Unmatched);
        assert_eq!(manager.active_trades("ES 03-25").len(), 1);
    }

    #[test]
    fn closed_trade_leaves_other_trades_and_books_operational() {
        let (manager, registry, _hub) = manager();
        let _rx_es = register_host(&registry, "ES 03-25");
        let _rx_nq = register_host(&registry, "NQ 06-25");

        let es_id = match manager.enter_trade(long_request("ES 03-25")) {
            EntryOutcome::Accepted { trade_id } => trade_id,
            other => panic!("{other:?}"),
        };
        let nq_req = EnterTradeRequest {
            entry_px: 18000.0,
            stop_px: Some(17990.0),
            target_px: Some(18020.0),
            ..long_request("NQ 06-25")
        };
        let nq_id = match manager.enter_trade(nq_req) {
            EntryOutcome::Accepted { trade_id } => trade_id,
            other => panic!("{other:?}"),
        };

        manager.on_execution("ES 03-25", Some(&es_id), 21500.0, None);
        manager.on_execution("ES 03-25", None, 21490.0, Some("stop_loss"));

        // The other instrument is untouched and the manager still accepts
        // new entries.
        let nq_active = manager.active_trades("NQ 06-25");
        assert_eq!(nq_active.len(), 1);
        assert_eq!(nq_active[0].id, nq_id);
        assert!(matches!(
            manager.enter_trade(long_request("ES 03-25")),
            EntryOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn pending_sweep_fails_stale_trades() {
        let (manager, registry, _hub) = manager();
        let _rx = register_host(&registry, "ES 03-25");
        manager.enter_trade(long_request("ES 03-25"));

        // Nothing is stale yet.
        assert_eq!(manager.sweep_pending(Duration::from_secs(10)), 0);
        // With a zero age bound everything pending is stale.
        assert_eq!(manager.sweep_pending(Duration::ZERO), 1);
        assert!(manager.active_trades("ES 03-25").is_empty());
    }

    #[test]
    fn shutdown_cancels_pending() {
        let (manager, registry, _hub) = manager();
        let _rx = register_host(&registry, "ES 03-25");
        manager.enter_trade(long_request("ES 03-25"));

        assert_eq!(manager.cancel_all_pending(), 1);
        assert!(manager.active_trades("ES 03-25").is_empty());
    }

    #[test]
    fn discrepancy_alert_and_adoption() {
        let (manager, registry, hub) = manager();
        let _rx = register_host(&registry, "ES 03-25");
        let sub = hub.register();

        // Build a FILLED long so the bridge shadow says LONG 1.
        let trade_id = match manager.enter_trade(long_request("ES 03-25")) {
            EntryOutcome::Accepted { trade_id } => trade_id,
            other => panic!("{other:?}"),
        };
        manager.on_execution("ES 03-25", Some(&trade_id), 21500.0, None);
        sub.drain();

        let t0 = Instant::now();
        let flat = PositionShadow::flat(1);

        assert_eq!(
            manager.reconcile_at("ES 03-25", flat.clone(), t0),
            ReconcileOutcome::Pending
        );
        assert_eq!(
            manager.reconcile_at("ES 03-25", flat.clone(), t0 + Duration::from_secs(2)),
            ReconcileOutcome::Pending
        );
        match manager.reconcile_at("ES 03-25", flat, t0 + Duration::from_secs(4)) {
            ReconcileOutcome::Adopted { first_alert, .. } => assert!(first_alert),
            other => panic!("expected adoption, got {other:?}"),
        }

        assert_eq!(
            manager.bridge_shadow("ES 03-25").direction,
            PositionDirection::Flat
        );

        let alerts: Vec<String> = sub
            .drain()
            .into_iter()
            .filter(|e| e.channel == channel::SYSTEM_ALERT)
            .map(|e| e.payload["type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(alerts.contains(&"position_discrepancy".to_string()));
        assert!(alerts.contains(&"position_reconciled".to_string()));
    }
}
