// =============================================================================
// Host Registry — instrument-scoped routing to Execution Host sessions
// =============================================================================
//
// The supervisor owns the registry; sessions insert their instrument
// registrations and remove them on close. Producers route outbound frames
// by instrument and never hold a reference to the session itself, only to
// its writer queue.
// =============================================================================

pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::messages::HostOutbound;

/// Writer queue depth per host session.
pub const SESSION_WRITE_QUEUE: usize = 64;

/// Why a frame could not be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No session has registered the instrument.
    NoHost,
    /// The session's writer queue is full.
    Busy,
    /// The session closed under us.
    Closed,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoHost => "no host for instrument",
            Self::Busy => "host session write queue full",
            Self::Closed => "host session closed",
        };
        write!(f, "{s}")
    }
}

/// A cloneable handle to one session's writer queue.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    tx: mpsc::Sender<String>,
}

impl SessionHandle {
    pub fn new(session_id: u64, tx: mpsc::Sender<String>) -> Self {
        Self { session_id, tx }
    }

    /// Non-blocking enqueue of one outbound frame.
    pub fn send_frame(&self, frame: &HostOutbound) -> Result<(), RouteError> {
        match self.tx.try_send(frame.to_wire()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RouteError::Busy),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RouteError::Closed),
        }
    }
}

/// Registry of live host sessions keyed by registered instrument.
pub struct HostRegistry {
    routes: RwLock<HashMap<String, SessionHandle>>,
    next_session_id: AtomicU64,
    session_count: AtomicUsize,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            session_count: AtomicUsize::new(0),
        }
    }

    pub fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn session_opened(&self) {
        self.session_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.session_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    /// Register an instrument for a session. A later session claiming the
    /// same instrument takes over the route (host reconnect).
    pub fn register_instrument(&self, instrument: &str, handle: SessionHandle) {
        let mut routes = self.routes.write();
        if let Some(previous) = routes.insert(instrument.to_string(), handle) {
            warn!(
                instrument,
                previous_session = previous.session_id,
                "instrument re-registered by a newer session"
            );
        } else {
            info!(instrument, "instrument registered");
        }
    }

    /// Remove every route owned by a closing session.
    pub fn unregister_session(&self, session_id: u64) -> Vec<String> {
        let mut routes = self.routes.write();
        let removed: Vec<String> = routes
            .iter()
            .filter(|(_, h)| h.session_id == session_id)
            .map(|(i, _)| i.clone())
            .collect();
        for instrument in &removed {
            routes.remove(instrument);
        }
        removed
    }

    pub fn handle_for(&self, instrument: &str) -> Option<SessionHandle> {
        self.routes.read().get(instrument).cloned()
    }

    pub fn instruments(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }

    /// Route an outbound frame to the session registered for its
    /// instrument.
    pub fn send_to_instrument(
        &self,
        instrument: &str,
        frame: &HostOutbound,
    ) -> Result<(), RouteError> {
        let handle = self.handle_for(instrument).ok_or(RouteError::NoHost)?;
        handle.send_frame(frame)
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}
