//! Non-blocking fan-out of job events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::types::JobEvent;

/// External consumer of job events (dashboards, webhooks, stores).
///
/// Called synchronously from the publishing task for every event, so
/// implementations must hand off quickly and never block.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: &JobEvent);

    /// Name used in logs.
    fn name(&self) -> &str {
        "sink"
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<JobEvent>,
}

/// Receiving end of one subscription.
///
/// Events missed while the buffer was full are gone; poll the registry
/// for authoritative state.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<JobEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the broadcaster has dropped this
    /// subscriber.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub subscribers: usize,
    pub published: u64,
    /// Per-subscriber deliveries skipped because a buffer was full.
    pub dropped: u64,
}

/// Fans events out to subscribers and sinks without ever waiting.
///
/// Each subscriber gets its own bounded channel. A full channel drops the
/// event for that subscriber only; a closed one is unsubscribed.
pub struct EventBroadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
    buffer: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBroadcaster {
    /// `buffer` is the per-subscriber channel capacity (at least 1).
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber { id, tx });
        tracing::debug!(subscriber = id, "Subscribed to job events");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        tracing::debug!(sink = sink.name(), "Registered notification sink");
        self.sinks.write().push(sink);
    }

    /// Deliver an event to every subscriber and sink. Never waits.
    pub fn publish(&self, event: JobEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        subscriber = subscriber.id,
                        job_id = %event.job_id,
                        kind = %event.kind,
                        "Subscriber buffer full, dropped event"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = subscriber.id, "Subscriber gone, removing");
                    false
                }
            });
        }

        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink.publish(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            subscribers: self.subscriber_count(),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
