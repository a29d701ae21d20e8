// =============================================================================
// Event Store — optional durable log behind a replaceable seam
// =============================================================================
//
// The bridge runs correctly with no durable store at all: `NoopStore` is
// the default. When `BRIDGE_EVENT_LOG_PATH` is set, a JSONL appender keeps
// a flat audit trail of every published event. Store failures are logged
// and swallowed — persistence is best-effort and never blocks the bridge.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::warn;

use crate::events::Event;

pub trait EventStore: Send + Sync {
    fn append(&self, event: &Event);
}

/// The default store: drops everything.
pub struct NoopStore;

impl EventStore for NoopStore {
    fn append(&self, _event: &Event) {}
}

/// Appends one JSON line per event to a flat file.
pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

impl EventStore for JsonlStore {
    fn append(&self, event: &Event) {
        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "event serialisation for store failed");
                return;
            }
        };

        let mut guard = self.file.lock();
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "event log open failed");
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                warn!(path = %self.path.display(), error = %e, "event log append failed");
                *guard = None;
            }
        }
    }
}
