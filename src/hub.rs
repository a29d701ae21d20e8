// =============================================================================
// Subscriber Hub — fan-out of named events to dashboard sessions
// =============================================================================
//
// Each subscriber owns a bounded outbound queue. Broadcast never blocks the
// producer: a full queue evicts its OLDEST event (newest-wins for a live
// dashboard) and the eviction is counted, per subscriber and process-wide.
//
// Ordering: a single drain task per subscriber empties the queue in FIFO
// order, so delivery order per subscriber and channel matches enqueue
// order. There is no cross-channel guarantee.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::events::Event;

/// One dashboard session's hub-side state.
pub struct Subscriber {
    pub id: u64,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    /// `None` means subscribed to every channel (the default).
    channels: RwLock<Option<HashSet<String>>>,
    dropped: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl Subscriber {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            channels: RwLock::new(None),
            dropped: AtomicU64::new(0),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    fn wants(&self, channel: &str) -> bool {
        match &*self.channels.read() {
            None => true,
            Some(set) => set.contains(channel),
        }
    }

    /// Non-blocking enqueue. Returns `true` if an older event was evicted.
    fn enqueue(&self, event: Event) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        let evicted = {
            let mut queue = self.queue.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Replace the channel filter. `None` restores the subscribe-all default.
    pub fn set_channels(&self, channels: Option<HashSet<String>>) {
        *self.channels.write() = channels;
    }

    /// Drain everything currently queued, FIFO.
    pub fn drain(&self) -> Vec<Event> {
        self.queue.lock().drain(..).collect()
    }

    /// Wait until at least one event is queued, then drain the batch.
    /// Returns an empty batch once the subscriber is closed.
    pub async fn next_batch(&self) -> Vec<Event> {
        loop {
            let notified = self.notify.notified();
            let batch = self.drain();
            if !batch.is_empty() {
                return batch;
            }
            if self.closed.load(Ordering::Relaxed) {
                return Vec::new();
            }
            notified.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

/// Registry of all connected dashboard sessions.
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
    published_total: AtomicU64,
    dropped_total: AtomicU64,
}

impl SubscriberHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
            published_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber with the default subscribe-all filter.
    pub fn register(&self) -> Arc<Subscriber> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscriber::new(id, self.capacity));
        self.subscribers.write().insert(id, sub.clone());
        info!(subscriber_id = id, "dashboard subscriber registered");
        sub
    }

    /// Remove a subscriber and wake its drain task so it can exit.
    pub fn unregister(&self, id: u64) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            sub.close();
            info!(
                subscriber_id = id,
                dropped = sub.dropped(),
                "dashboard subscriber unregistered"
            );
        }
    }

    /// Broadcast one event to every interested subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        self.published_total.fetch_add(1, Ordering::Relaxed);

        let subs: Vec<Arc<Subscriber>> = self.subscribers.read().values().cloned().collect();
        for sub in subs {
            if !sub.wants(&event.channel) {
                continue;
            }
            if sub.enqueue(event.clone()) {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subscriber_id = sub.id,
                    channel = %event.channel,
                    "subscriber queue full — oldest event dropped"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn published_total(&self) -> u64 {
        self.published_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// True when no subscriber has anything queued.
    pub fn queues_empty(&self) -> bool {
        self.subscribers.read().values().all(|s| s.pending() == 0)
    }

    /// Shutdown helper: wait until every queue drains or the deadline
    /// passes, polling at a short interval.
    pub async fn drain_with_deadline(&self, deadline: std::time::Duration) {
        let started = std::time::Instant::now();
        while started.elapsed() < deadline {
            if self.queues_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        debug!("subscriber drain deadline reached with events still queued");
    }
}
