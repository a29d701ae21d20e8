// =============================================================================
// Meridian Trade Bridge — Main Entry Point
// =============================================================================
//
// The supervisor: builds the shared state, starts the host listener and the
// dashboard server, runs the background sweepers, and owns the graceful
// shutdown ladder:
//
//   1. stop accepting new connections
//   2. announce `connection_status:shutdown` to subscribers
//   3. wait up to 5 s for in-flight predictions
//   4. close host sessions
//   5. drain subscriber queues up to 2 s
//   6. cancel leftover PENDING trades, persist settings
//   7. exit
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod events;
mod host;
mod hub;
mod prediction;
mod protocol;
mod settings;
mod store;
mod synthetic;
mod trade;
mod trailing;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::BridgeState;
use crate::config::BridgeConfig;
use crate::events::Event;
use crate::trade::manager::PENDING_TIMEOUT;

/// Shutdown step 3: in-flight prediction drain budget.
const PREDICTION_DRAIN: Duration = Duration::from_secs(5);
/// Shutdown step 5: subscriber queue drain budget.
const SUBSCRIBER_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trade Bridge — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = BridgeConfig::from_env();
    info!(
        host_port = config.host_port,
        dashboard_port = config.dashboard_port,
        settings_path = %config.settings_path,
        synthetic_mode = config.synthetic_mode,
        "bridge configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(BridgeState::new(config));
    let accept_token = CancellationToken::new();

    // ── 3. Host listener (Execution Host link) ───────────────────────────
    let host_listener = TcpListener::bind(("0.0.0.0", state.config.host_port)).await?;
    info!(port = state.config.host_port, "host link listening");

    {
        let state = state.clone();
        let token = accept_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = host_listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let session_state = state.clone();
                            tokio::spawn(host::session::run_host_session(
                                stream,
                                addr.to_string(),
                                session_state,
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "host accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
            info!("host listener stopped");
        });
    }

    // ── 4. Dashboard server (WebSocket + HTTP surface) ───────────────────
    let dashboard_listener = TcpListener::bind(("0.0.0.0", state.config.dashboard_port)).await?;
    info!(port = state.config.dashboard_port, "dashboard listening");

    {
        let app = api::rest::router(state.clone());
        let token = accept_token.clone();
        tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(dashboard_listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "dashboard server failed");
            }
        });
    }

    // ── 5. Background sweepers ───────────────────────────────────────────
    {
        // PENDING trades with no execution time out into FAILED.
        let state = state.clone();
        let token = accept_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        state.trades.sweep_pending(PENDING_TIMEOUT);
                    }
                }
            }
        });
    }
    {
        // Periodic performance metrics for the dashboard.
        let state = state.clone();
        let token = accept_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => state.publish_performance_metrics(),
                }
            }
        });
    }

    // ── 6. Synthetic feed (explicitly gated, off by default) ─────────────
    if state.config.synthetic_mode {
        let state = state.clone();
        let token = accept_token.clone();
        tokio::spawn(synthetic::run_synthetic_feed(state, token));
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 7. Graceful shutdown ladder ──────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // Step 1: stop accepting new connections and background work.
    accept_token.cancel();

    // Step 2: announce shutdown to every subscriber.
    state.publish(Event::connection_status("shutdown", None));

    // Step 3: wait for in-flight predictions, bounded.
    let drain_started = std::time::Instant::now();
    while state.gateway.in_flight() > 0 && drain_started.elapsed() < PREDICTION_DRAIN {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if state.gateway.in_flight() > 0 {
        warn!(
            in_flight = state.gateway.in_flight(),
            "prediction drain deadline reached"
        );
    }

    // Step 4: close host sessions.
    state.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Step 5: let subscriber queues flush, bounded.
    state.hub.drain_with_deadline(SUBSCRIBER_DRAIN).await;

    // Step 6: tidy trade state and persist settings.
    let cancelled = state.trades.cancel_all_pending();
    if cancelled > 0 {
        info!(cancelled, "pending trades cancelled on shutdown");
    }
    state.persist_settings();

    info!("Meridian Trade Bridge shut down complete.");
    Ok(())
}
