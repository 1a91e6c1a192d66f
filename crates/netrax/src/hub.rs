//! Event fan-out to live subscribers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::DeliveryError;
use crate::frame::Event;

/// Identifies one subscription. Allocated monotonically, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Something that can accept events on behalf of one subscriber.
///
/// `deliver` must not block: a subscriber that cannot take an event right
/// now reports an error and is dropped by the hub.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError>;
}

/// Bounded queue sink; the receiving half lives in the connection task
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Hub counters (snapshot of atomics)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub events_published: u64,
    pub events_delivered: u64,
    pub subscribers_dropped: u64,
}

struct AtomicHubStats {
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    subscribers_dropped: AtomicU64,
}

struct HubInner {
    subscribers: Mutex<HashMap<SubscriberId, Arc<dyn EventSink>>>,
    /// Serialises publishers so each subscriber sees events in publish order
    publish_lock: Mutex<()>,
    next_id: AtomicU64,
    stats: AtomicHubStats,
}

/// Delivers each published event to every current subscriber.
///
/// A subscriber whose delivery fails is removed; the failure never reaches
/// other subscribers or the publisher. The subscriber set is locked only to
/// insert, remove or take a snapshot, never while delivering.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                publish_lock: Mutex::new(()),
                next_id: AtomicU64::new(0),
                stats: AtomicHubStats {
                    events_published: AtomicU64::new(0),
                    events_delivered: AtomicU64::new(0),
                    subscribers_dropped: AtomicU64::new(0),
                },
            }),
        }
    }

    /// Add a subscriber
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriberId {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut subs = self.lock_subscribers();
            subs.insert(id, sink);
            subs.len()
        };
        debug!(subscriber = %id, total = count, "Subscriber added");
        id
    }

    /// Add a subscriber backed by a bounded queue of `capacity` events.
    ///
    /// The receiver yields events in publish order and returns `None` once
    /// the hub has dropped the subscription.
    pub fn subscribe_channel(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.subscribe(Arc::new(ChannelSink::new(tx))), rx)
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock_subscribers().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every subscriber. Returns the number of successful
    /// deliveries.
    pub fn publish(&self, event: &Event) -> usize {
        let _order = self
            .inner
            .publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let targets: Vec<(SubscriberId, Arc<dyn EventSink>)> = self
            .lock_subscribers()
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sink) in targets {
            match sink.deliver(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(subscriber = %id, error = %e, "Delivery failed");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subs = self.lock_subscribers();
            let mut dropped = 0;
            for id in &failed {
                if subs.remove(id).is_some() {
                    dropped += 1;
                }
            }
            drop(subs);
            self.inner
                .stats
                .subscribers_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            info!("Dropped {} subscriber(s) after failed delivery", dropped);
        }

        self.inner
            .stats
            .events_published
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .stats
            .events_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock_subscribers().contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.subscriber_count(),
            events_published: self.inner.stats.events_published.load(Ordering::Relaxed),
            events_delivered: self.inner.stats.events_delivered.load(Ordering::Relaxed),
            subscribers_dropped: self.inner.stats.subscribers_dropped.load(Ordering::Relaxed),
        }
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, Arc<dyn EventSink>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
