//! Best-effort fan-out of frames to live subscribers.
//!
//! Every subscriber owns a bounded queue. [`Broadcaster::publish`] encodes a
//! frame once and offers the same payload to each queue without waiting. A
//! subscriber whose queue is closed or full is dropped on the spot, so the
//! ingestion loop never feels a slow or dead consumer. Delivery is
//! at-most-once and nothing is replayed to late subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::telemetry::TelemetryFrame;

/// An encoded frame, shared between all subscriber queues.
pub type Payload = Arc<str>;

/// Anything the link feeds after a frame has been stored.
pub trait FrameSink: Send + Sync {
    /// Name of this sink (for logging/debugging).
    fn name(&self) -> &'static str;

    /// Take a freshly stored frame.
    ///
    /// Must not block for long and must not fail: sinks deal with their own
    /// errors.
    fn accept(&self, frame: &TelemetryFrame);

    /// Whether zeroed frames stored for unrecognized lines reach this sink.
    fn accepts_unrecognized(&self) -> bool {
        true
    }
}

/// Opaque handle identifying one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// The receiving end of a registered subscriber.
///
/// Yields payloads in the order they were published. Once the broadcaster
/// drops the subscriber, the queue drains and then reports closed.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Payload>,
}

impl Subscription {
    /// The handle this subscription was registered under.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next payload. Returns `None` once the subscriber has
    /// been removed and its queue is empty.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    /// Take the next payload if one is queued.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] if nothing is queued, or
    /// [`TryRecvError::Disconnected`] once the subscriber was removed.
    pub fn try_recv(&mut self) -> Result<Payload, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Outcome of one [`Broadcaster::publish`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers the payload was queued for.
    pub delivered: usize,
    /// Subscribers removed during this call.
    pub dropped: Vec<SubscriberId>,
}

/// Why a subscriber was removed during a publish.
#[derive(Debug, Clone, Copy)]
enum DropReason {
    Closed,
    Full,
}

/// Fans each published frame out to every registered subscriber.
#[derive(Debug)]
pub struct Broadcaster {
    capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Payload>>>,
}

impl Broadcaster {
    /// Create a broadcaster whose subscriber queues hold `capacity` payloads.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn register(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.lock().insert(id, sender);
        debug!(subscriber = %id, "subscriber registered");
        Subscription { id, receiver }
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "subscriber unregistered");
        }
        removed
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of frames published so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Offer `frame` to every subscriber without waiting on any of them.
    ///
    /// Never fails: subscribers that cannot take the payload are removed and
    /// listed in the returned report.
    pub fn publish(&self, frame: &TelemetryFrame) -> PublishReport {
        let payload: Payload = match frame.encode() {
            Ok(text) => Arc::from(text),
            Err(err) => {
                warn!(error = %err, "failed to encode telemetry frame");
                return PublishReport::default();
            }
        };
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut dropped = Vec::new();
        self.lock()
            .retain(|id, sender| match sender.try_send(Arc::clone(&payload)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    dropped.push((*id, DropReason::Closed));
                    false
                }
                Err(TrySendError::Full(_)) => {
                    dropped.push((*id, DropReason::Full));
                    false
                }
            });

        for (id, reason) in &dropped {
            match reason {
                DropReason::Closed => debug!(subscriber = %id, "subscriber closed; removed"),
                DropReason::Full => {
                    warn!(subscriber = %id, capacity = self.capacity, "subscriber queue full; removed");
                }
            }
        }
        trace!(delivered, dropped = dropped.len(), "frame published");

        PublishReport {
            delivered,
            dropped: dropped.into_iter().map(|(id, _)| id).collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<Payload>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl FrameSink for Broadcaster {
    fn name(&self) -> &'static str {
        "broadcaster"
    }

    fn accept(&self, frame: &TelemetryFrame) {
        self.publish(frame);
    }
}
