// =============================================================================
// WebSocket Handler — dashboard subscriber sessions
// =============================================================================
//
// Clients connect to `/ws` and receive named events as JSON texts:
//
//   {"event": "<channel>", "data": <payload>, "ts": <epoch ms>}
//
// Client-to-server messages use the same envelope plus an optional ack id;
// every RPC is answered with
//
//   {"event": "ack", "ack": <id>, "data": {"success": bool, ...}}
//
// RPCs: get_settings, update_settings, manual_trade, subscribe.
//
// The handler runs two concurrent arms via `tokio::select!`:
//   1. Drain loop — waits on the subscriber queue and pushes batches.
//   2. Recv loop — handles RPCs, Ping/Pong, and Close.
//
// The hub enforces the bounded-queue drop-oldest policy; this handler only
// drains in order.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::BridgeState;
use crate::events::{channel, Event};
use crate::hub::Subscriber;
use crate::protocol::messages::{CommandKind, HostOutbound};
use crate::settings::SettingsPatch;
use crate::trade::manager::{EnterTradeRequest, EntryOutcome};
use crate::types::{TradeDirection, TradeSource};

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct ClientMessage {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    ack: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ManualTradeData {
    instrument: String,
    command: CommandKind,
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    target: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeData {
    #[serde(default)]
    channels: Vec<String>,
}

fn event_text(event: &Event) -> Option<String> {
    serde_json::to_string(&serde_json::json!({
        "event": event.channel,
        "data": event.payload,
        "ts": event.ts,
    }))
    .ok()
}

fn ack_text(ack: u64, data: serde_json::Value) -> String {
    serde_json::json!({ "event": "ack", "ack": ack, "data": data }).to_string()
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BridgeState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<BridgeState>) {
    let subscriber = state.hub.register();
    let (mut sender, mut receiver) = socket.split();

    // Greet the new session with its connection state and the current
    // settings so the dashboard renders without waiting for a change.
    for event in [
        Event::connection_status("connected", None),
        Event::new(
            channel::CURRENT_SETTINGS,
            serde_json::to_value(state.settings()).unwrap_or_default(),
        ),
    ] {
        if let Some(text) = event_text(&event) {
            if sender.send(Message::Text(text.into())).await.is_err() {
                state.hub.unregister(subscriber.id);
                return;
            }
        }
    }

    loop {
        tokio::select! {
            // ── Drain loop: deliver queued events in order ──────────────
            batch = subscriber.next_batch() => {
                if batch.is_empty() {
                    // The subscriber was closed under us (shutdown path).
                    break;
                }
                let mut failed = false;
                for event in &batch {
                    let Some(text) = event_text(event) else { continue };
                    if let Err(e) = sender.send(Message::Text(text.into())).await {
                        debug!(subscriber_id = subscriber.id, error = %e, "dashboard send failed");
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }

            // ── Recv loop: RPCs and socket control frames ───────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_text(&state, &subscriber, &text) {
                            if sender.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(subscriber_id = subscriber.id, "dashboard close frame");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(subscriber_id = subscriber.id, "binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(subscriber_id = subscriber.id, error = %e, "dashboard receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.unregister(subscriber.id);
}

/// Parse and execute one client text message. Returns the ack to send, if
/// the client asked for one.
fn handle_client_text(
    state: &Arc<BridgeState>,
    subscriber: &Arc<Subscriber>,
    text: &str,
) -> Option<String> {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(subscriber_id = subscriber.id, error = %e, "unparseable dashboard message");
            return None;
        }
    };

    let ack = msg.ack;
    let data = dispatch_rpc(state, subscriber, &msg);
    ack.map(|id| ack_text(id, data))
}

/// Execute an RPC and build its ack payload.
fn dispatch_rpc(
    state: &Arc<BridgeState>,
    subscriber: &Arc<Subscriber>,
    msg: &ClientMessage,
) -> serde_json::Value {
    match msg.event.as_str() {
        "get_settings" => serde_json::json!({
            "success": true,
            "settings": state.settings(),
        }),

        "update_settings" => {
            let patch: SettingsPatch = match serde_json::from_value(msg.data.clone()) {
                Ok(p) => p,
                Err(e) => {
                    return serde_json::json!({
                        "success": false,
                        "reason": format!("invalid settings patch: {e}"),
                    })
                }
            };
            match state.update_settings(&patch) {
                Ok(effective) => serde_json::json!({
                    "success": true,
                    "effective": effective,
                }),
                Err(reason) => serde_json::json!({ "success": false, "reason": reason }),
            }
        }

        "manual_trade" => {
            let data: ManualTradeData = match serde_json::from_value(msg.data.clone()) {
                Ok(d) => d,
                Err(e) => {
                    return serde_json::json!({
                        "success": false,
                        "reason": format!("invalid manual trade: {e}"),
                    })
                }
            };
            manual_trade(state, data)
        }

        "subscribe" => {
            let data: SubscribeData = match serde_json::from_value(msg.data.clone()) {
                Ok(d) => d,
                Err(e) => {
                    return serde_json::json!({
                        "success": false,
                        "reason": format!("invalid subscription: {e}"),
                    })
                }
            };
            if data.channels.is_empty() {
                subscriber.set_channels(None);
            } else {
                subscriber.set_channels(Some(data.channels.into_iter().collect()));
            }
            serde_json::json!({ "success": true })
        }

        other => {
            debug!(subscriber_id = subscriber.id, rpc = other, "unknown dashboard rpc");
            serde_json::json!({ "success": false, "reason": format!("unknown rpc: {other}") })
        }
    }
}

fn manual_trade(state: &Arc<BridgeState>, data: ManualTradeData) -> serde_json::Value {
    match data.command {
        CommandKind::ClosePosition => {
            let frame = HostOutbound::command(
                &data.instrument,
                CommandKind::ClosePosition,
                data.quantity.unwrap_or(0.0),
                data.price.unwrap_or(0.0),
                None,
                None,
                data.reason.as_deref().unwrap_or("manual close"),
            );
            match state.registry.send_to_instrument(&data.instrument, &frame) {
                Ok(()) => {
                    info!(instrument = %data.instrument, "manual close routed to host");
                    serde_json::json!({ "success": true })
                }
                Err(e) => serde_json::json!({ "success": false, "reason": e.to_string() }),
            }
        }

        CommandKind::GoLong | CommandKind::GoShort => {
            let direction = match data.command {
                CommandKind::GoLong => TradeDirection::Long,
                _ => TradeDirection::Short,
            };
            let Some(price) = data.price.filter(|p| p.is_finite() && *p > 0.0) else {
                return serde_json::json!({
                    "success": false,
                    "reason": "price is required for a manual entry",
                });
            };

            let outcome = state.trades.enter_trade(EnterTradeRequest {
                instrument: data.instrument.clone(),
                direction,
                qty: data.quantity.unwrap_or(1.0),
                entry_px: price,
                stop_px: data.stop_loss,
                target_px: data.target,
                source: TradeSource::Manual,
                reason: data.reason.unwrap_or_else(|| "manual entry".to_string()),
            });
            match outcome {
                EntryOutcome::Accepted { trade_id } => {
                    serde_json::json!({ "success": true, "trade_id": trade_id })
                }
                EntryOutcome::Rejected { reason } => {
                    serde_json::json!({ "success": false, "reason": reason })
                }
            }
        }
    }
}
