// =============================================================================
// Host Session — one Execution Host connection over the frame codec
// =============================================================================
//
// Each accepted connection runs one session task. The read half drives the
// dispatch loop over the closed inbound frame set; the write half is owned
// by a writer task fed through a bounded queue, so concurrent producers
// (prediction replies, trade commands, trailing updates) never interleave
// bytes on the wire.
//
// Instrument guard: market/status/execution frames are dropped unless their
// instrument was registered on THIS session. Outbound commands are routed
// through the registry, which only ever resolves to the registering
// session.
//
// Failure policy: 50 consecutive malformed lines close the session with
// reason `protocol_abuse`; 30 s without any inbound frame closes it with
// `heartbeat_timeout`; a write error closes it immediately. Closing a
// session never touches trades, other sessions, or the supervisor.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SessionHandle, SESSION_WRITE_QUEUE};
use crate::app_state::BridgeState;
use crate::events::{channel, Event};
use crate::protocol::codec::{FrameReader, FrameWriter, ReadFrame};
use crate::protocol::messages::{
    classify, wire_timestamp, HostInbound, HostOutbound, InboundParse, MarketFrame,
    PredictionRequest, StrategyStatus, TrailingRequest,
};
use crate::trade::manager::{EnterTradeRequest, EntryOutcome, ExecutionOutcome};
use crate::trade::reconcile::PositionShadow;
use crate::trailing::ALGORITHM_NAME;
use crate::types::{SignalDirection, TradeDirection, TradeSource, TradeStatus};

/// Consecutive malformed lines tolerated before the session is closed.
const MALFORMED_LIMIT: u32 = 50;
/// Bounded wait when handing a frame to the writer queue.
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(100);

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Eof,
    ProtocolAbuse,
    HeartbeatTimeout,
    Shutdown,
    ReadError,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eof => "eof",
            Self::ProtocolAbuse => "protocol_abuse",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
            Self::ReadError => "read_error",
        };
        write!(f, "{s}")
    }
}

/// Run one host session to completion. Generic over the stream so tests
/// can drive it with an in-memory duplex.
pub async fn run_host_session<S>(stream: S, peer: String, state: Arc<BridgeState>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let session_id = state.registry.allocate_session_id();
    state.registry.session_opened();
    info!(session_id, peer = %peer, "host session opened");

    let token = state.shutdown.child_token();
    let (read_half, write_half) = tokio::io::split(stream);

    // ── Writer task: sole owner of the write half ───────────────────────
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_WRITE_QUEUE);
    let writer_token = token.clone();
    let writer_state = state.clone();
    let writer = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        loop {
            tokio::select! {
                _ = writer_token.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(json) => {
                        if let Err(e) = writer.write_frame(&json).await {
                            warn!(session_id, error = %e, "host write failed — closing session");
                            writer_token.cancel();
                            break;
                        }
                        writer_state.metrics.frames_out.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
    });

    let handle = SessionHandle::new(session_id, tx.clone());
    let mut session = Session {
        state: state.clone(),
        session_id,
        handle,
        tx,
        registered: HashSet::new(),
        announced: HashSet::new(),
        malformed_streak: 0,
    };

    // ── Read loop ───────────────────────────────────────────────────────
    let heartbeat_timeout = Duration::from_millis(state.config.host_heartbeat_timeout_ms);
    let mut reader = FrameReader::new(read_half);
    let mut last_seen = Instant::now();

    let reason = loop {
        let idle_deadline = last_seen + heartbeat_timeout;
        tokio::select! {
            _ = token.cancelled() => break CloseReason::Shutdown,
            _ = tokio::time::sleep_until(idle_deadline) => {
                warn!(session_id, "no inbound frame within heartbeat timeout");
                break CloseReason::HeartbeatTimeout;
            }
            next = reader.next_frame() => match next {
                Ok(ReadFrame::Frame(line)) => {
                    last_seen = Instant::now();
                    state.metrics.frames_in.fetch_add(1, Ordering::Relaxed);
                    if !session.on_line(&line).await {
                        break CloseReason::ProtocolAbuse;
                    }
                }
                Ok(ReadFrame::Oversize { discarded }) => {
                    last_seen = Instant::now();
                    state.metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(session_id, discarded, "oversize frame discarded — resynchronising");
                }
                Ok(ReadFrame::Eof) => break CloseReason::Eof,
                Err(e) => {
                    warn!(session_id, error = %e, "host read failed");
                    break CloseReason::ReadError;
                }
            },
        }
    };

    // ── Teardown ────────────────────────────────────────────────────────
    token.cancel();
    let _ = writer.await;

    let removed = state.registry.unregister_session(session_id);
    for instrument in &removed {
        state.publish(Event::connection_status("disconnected", Some(instrument)));
    }
    state.registry.session_closed();

    if reason == CloseReason::ProtocolAbuse {
        state.publish(Event::system_alert(
            "protocol_abuse",
            serde_json::json!({ "session_id": session_id, "peer": peer }),
        ));
    }

    info!(session_id, peer = %peer, %reason, "host session closed");
}

// =============================================================================
// Per-session dispatch
// =============================================================================

struct Session {
    state: Arc<BridgeState>,
    session_id: u64,
    handle: SessionHandle,
    tx: mpsc::Sender<String>,
    registered: HashSet<String>,
    /// Instruments that already produced a `connection_status:connected`.
    announced: HashSet<String>,
    malformed_streak: u32,
}

impl Session {
    /// Classify and dispatch one line. Returns false when the session must
    /// close for protocol abuse.
    async fn on_line(&mut self, line: &str) -> bool {
        match classify(line) {
            InboundParse::Frame(frame) => {
                self.malformed_streak = 0;
                self.dispatch(frame).await;
                true
            }
            InboundParse::Unknown(frame_type) => {
                self.malformed_streak = 0;
                self.state
                    .metrics
                    .unknown_frames
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = self.session_id,
                    frame_type, "unknown frame type dropped"
                );
                true
            }
            InboundParse::Malformed(error) => {
                self.malformed_streak += 1;
                self.state
                    .metrics
                    .protocol_errors
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = self.session_id,
                    streak = self.malformed_streak,
                    %error,
                    "malformed frame"
                );
                self.malformed_streak < MALFORMED_LIMIT
            }
        }
    }

    async fn dispatch(&mut self, frame: HostInbound) {
        match frame {
            HostInbound::InstrumentRegistration { instrument } => {
                self.registered.insert(instrument.clone());
                self.state
                    .registry
                    .register_instrument(&instrument, self.handle.clone());
            }
            HostInbound::MarketData(frame) => self.on_market_data(frame).await,
            HostInbound::StrategyStatus(status) => self.on_strategy_status(status),
            HostInbound::TradeExecution(report) | HostInbound::ExecutionUpdate(report) => {
                if !self.guard(&report.instrument, "execution") {
                    return;
                }
                let outcome = self.state.trades.on_execution(
                    &report.instrument,
                    report.order_id.as_deref(),
                    report.price,
                    report.reason.as_deref(),
                );
                if let ExecutionOutcome::Closed { .. } = outcome {
                    self.state.trailing.reset(&report.instrument);
                }
            }
            HostInbound::MlPredictionRequest(request) => self.on_prediction_request(request),
            HostInbound::SmartTrailingRequest(request) => self.on_trailing_request(request).await,
            HostInbound::Heartbeat { instrument } | HostInbound::Ping { instrument } => {
                self.send(HostOutbound::heartbeat_response()).await;
                self.state.publish(Event::new(
                    channel::HEARTBEAT,
                    serde_json::json!({
                        "session_id": self.session_id,
                        "instrument": instrument,
                        "ts": wire_timestamp(),
                    }),
                ));
            }
        }
    }

    // ── market_data ─────────────────────────────────────────────────────

    async fn on_market_data(&mut self, mut frame: MarketFrame) {
        if !self.guard(&frame.instrument, "market_data") {
            return;
        }

        if let Err(reason) = frame.validate() {
            warn!(
                session_id = self.session_id,
                instrument = %frame.instrument,
                %reason,
                "invalid market frame"
            );
            match frame.sanitized() {
                Some(fixed) => frame = fixed,
                None => return,
            }
        }
        if frame.ts <= 0 {
            frame.ts = Utc::now().timestamp_millis();
        }

        self.state.publish(Event::new(
            channel::MARKET_DATA,
            serde_json::to_value(&frame).unwrap_or_default(),
        ));

        self.trail_open_position(&frame).await;

        // The model path runs off the read loop so a slow predictor never
        // stalls frame intake.
        let state = self.state.clone();
        tokio::spawn(async move {
            let prediction = state.gateway.predict(&frame).await;
            state.metrics.record_latency_ms(prediction.processing_ms);

            state.publish(Event::new(
                channel::ML_PREDICTION_RESULT,
                serde_json::json!({
                    "instrument": frame.instrument,
                    "prediction": prediction,
                }),
            ));

            if !state.auto_trade_allowed(&prediction) {
                return;
            }
            if !state.trades.active_trades(&frame.instrument).is_empty() {
                debug!(instrument = %frame.instrument, "auto entry skipped — trade already active");
                return;
            }

            let direction = match prediction.direction {
                SignalDirection::Long => TradeDirection::Long,
                SignalDirection::Short => TradeDirection::Short,
                SignalDirection::Neutral => return,
            };
            let atr = frame.atr.filter(|a| a.is_finite() && *a > 0.0).unwrap_or(1.0);
            let (stop, target) = match direction {
                TradeDirection::Long => (frame.price - atr, frame.price + 2.0 * atr),
                TradeDirection::Short => (frame.price + atr, frame.price - 2.0 * atr),
            };

            let outcome = state.trades.enter_trade(EnterTradeRequest {
                instrument: frame.instrument.clone(),
                direction,
                qty: 1.0,
                entry_px: frame.price,
                stop_px: Some(stop),
                target_px: Some(target),
                source: TradeSource::Auto,
                reason: format!(
                    "auto: {} confidence {:.2}",
                    prediction.recommendation, prediction.confidence
                ),
            });
            match outcome {
                EntryOutcome::Accepted { trade_id } => {
                    info!(instrument = %frame.instrument, trade_id = %trade_id, "auto trade entered");
                }
                EntryOutcome::Rejected { reason } => {
                    debug!(instrument = %frame.instrument, %reason, "auto trade rejected");
                }
            }
        });
    }

    /// Trailing pass for an open FILLED position on this instrument.
    async fn trail_open_position(&mut self, frame: &MarketFrame) {
        let open = self
            .state
            .trades
            .active_trades(&frame.instrument)
            .into_iter()
            .find(|t| t.status == TradeStatus::Filled && t.stop_px.is_some());

        let Some(trade) = open else { return };
        let current_stop = trade.stop_px.unwrap_or_default();

        let Some(update) =
            self.state
                .trailing
                .evaluate(frame, trade.direction, trade.entry_px, current_stop)
        else {
            return;
        };

        self.state
            .trades
            .update_stop(&frame.instrument, &trade.id, update.new_stop_price);

        self.send(HostOutbound::SmartTrailingResponse {
            timestamp: wire_timestamp(),
            instrument: frame.instrument.clone(),
            request_id: None,
            accepted: true,
            new_stop_price: Some(update.new_stop_price),
            algorithm: update.algorithm.clone(),
            confidence: update.confidence,
            reasoning: update.reasoning.clone(),
            strategy_action: crate::protocol::messages::STRATEGY_ACTION_CONTINUE.to_string(),
        })
        .await;

        self.state.publish(Event::new(
            channel::STRATEGY_STATE,
            serde_json::json!({
                "type": "smart_trailing_update",
                "trade_id": trade.id,
                "update": update,
            }),
        ));
    }

    // ── strategy_status ─────────────────────────────────────────────────

    fn on_strategy_status(&mut self, status: StrategyStatus) {
        if !self.guard(&status.instrument, "strategy_status") {
            return;
        }

        let ts = if status.ts > 0 {
            status.ts
        } else {
            Utc::now().timestamp_millis()
        };
        self.state.trades.reconcile(
            &status.instrument,
            PositionShadow {
                direction: status.position,
                size: status.position_size,
                avg_price: status.avg_price,
                last_update: ts,
            },
        );

        self.state.publish(Event::new(
            channel::STRATEGY_STATUS,
            serde_json::to_value(&status).unwrap_or_default(),
        ));

        if self.announced.insert(status.instrument.clone()) {
            self.state.publish(Event::connection_status(
                "connected",
                Some(&status.instrument),
            ));
        }
    }

    // ── Synchronous RPC frames ──────────────────────────────────────────

    fn on_prediction_request(&self, request: PredictionRequest) {
        // Diagnostics path: answered even for unregistered instruments —
        // the reply only ever flows back to the requesting session.
        let state = self.state.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let prediction = state.gateway.predict(&request.frame).await;
            state.metrics.record_latency_ms(prediction.processing_ms);

            state.publish(Event::new(
                channel::ML_PREDICTION_RESULT,
                serde_json::json!({
                    "instrument": request.frame.instrument,
                    "request_id": request.request_id,
                    "prediction": prediction,
                }),
            ));

            let reply = HostOutbound::MlPredictionResponse {
                timestamp: wire_timestamp(),
                instrument: request.frame.instrument.clone(),
                request_id: request.request_id.clone(),
                prediction: serde_json::to_value(&prediction).unwrap_or_default(),
            };
            if let Err(e) = handle.send_frame(&reply) {
                debug!(error = %e, "prediction reply dropped");
            }
        });
    }

    async fn on_trailing_request(&mut self, request: TrailingRequest) {
        if !self.guard(&request.frame.instrument, "smart_trailing_request") {
            return;
        }

        let update = self.state.trailing.evaluate(
            &request.frame,
            request.direction,
            request.entry_price,
            request.current_stop,
        );

        let reply = match update {
            Some(update) => HostOutbound::SmartTrailingResponse {
                timestamp: wire_timestamp(),
                instrument: request.frame.instrument.clone(),
                request_id: request.request_id.clone(),
                accepted: true,
                new_stop_price: Some(update.new_stop_price),
                algorithm: update.algorithm,
                confidence: update.confidence,
                reasoning: update.reasoning,
                strategy_action: crate::protocol::messages::STRATEGY_ACTION_CONTINUE.to_string(),
            },
            None => HostOutbound::SmartTrailingResponse {
                timestamp: wire_timestamp(),
                instrument: request.frame.instrument.clone(),
                request_id: request.request_id.clone(),
                accepted: false,
                new_stop_price: None,
                algorithm: ALGORITHM_NAME.to_string(),
                confidence: 0.0,
                reasoning: "no update: throttled, non-monotonic, or low confidence".to_string(),
                strategy_action: crate::protocol::messages::STRATEGY_ACTION_CONTINUE.to_string(),
            },
        };
        self.send(reply).await;
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Instrument guard: frames for instruments this session never
    /// registered are dropped and logged.
    fn guard(&self, instrument: &str, kind: &str) -> bool {
        if self.registered.contains(instrument) {
            return true;
        }
        warn!(
            session_id = self.session_id,
            instrument, kind, "frame for unregistered instrument dropped"
        );
        false
    }

    /// Enqueue an outbound frame with the bounded dispatch wait; a full
    /// queue drops the frame, a closed queue is left for the read loop to
    /// notice via cancellation.
    async fn send(&self, frame: HostOutbound) {
        let json = frame.to_wire();
        match tokio::time::timeout(DISPATCH_TIMEOUT, self.tx.send(json)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(session_id = self.session_id, "writer gone — frame dropped"),
            Err(_) => warn!(
                session_id = self.session_id,
                "writer queue full — frame dropped"
            ),
        }
    }
}
