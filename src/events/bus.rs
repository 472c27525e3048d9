//! Topic-filtered fan-out of push events to subscribers.
//!
//! `publish` never blocks and never awaits: each subscriber owns a bounded
//! queue, and a full queue drops its oldest event. A slow subscriber
//! therefore loses history but never stalls the publisher or its peers.
//! Events published by one call are appended to every matching queue before
//! the call returns, so two publishes ordered in time arrive in that order
//! at every subscriber.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tokio::sync::Notify;
use tracing::{debug, trace};

use super::model::{PushEvent, Topic};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Slot {
    topics: Mutex<BTreeSet<Topic>>,
    queue: Mutex<VecDeque<PushEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Slot {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct BusInner {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, Arc<Slot>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let subs = self.subscribers.get_mut().unwrap_or_else(|e| e.into_inner());
        for slot in subs.values() {
            slot.close();
        }
    }
}

/// Cheaply cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose subscriber queues hold at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a subscriber for `topics`. Dropping the returned handle
    /// unsubscribes it.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = Topic>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            topics: Mutex::new(topics.into_iter().collect()),
            queue: Mutex::new(VecDeque::with_capacity(self.inner.capacity.min(64))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, slot.clone());
        debug!(subscriber = id, "Bus subscriber registered");

        Subscription {
            id,
            slot,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every subscriber of its topic.
    pub fn publish(&self, event: PushEvent) {
        let topic = event.topic();
        let subs = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner());

        for (id, slot) in subs.iter() {
            if !lock(&slot.topics).contains(&topic) {
                continue;
            }
            {
                let mut queue = lock(&slot.queue);
                if queue.len() >= self.inner.capacity {
                    queue.pop_front();
                    let dropped = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(subscriber = id, dropped, "Subscriber queue full, dropped oldest event");
                }
                queue.push_back(event.clone());
            }
            slot.notify.notify_one();
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Number of live subscribers interested in `topic`.
    pub fn subscribers_for(&self, topic: Topic) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|slot| lock(&slot.topics).contains(&topic))
            .count()
    }

    /// Close every subscription; pending `recv` calls drain and then end.
    pub fn close(&self) {
        let subs = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        for slot in subs.values() {
            slot.close();
        }
    }
}

/// A subscriber's handle. Owns its queue; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    slot: Arc<Slot>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, waiting if the queue is empty. `None` once the bus is
    /// closed and the queue drained.
    pub async fn recv(&self) -> Option<PushEvent> {
        loop {
            let notified = self.slot.notify.notified();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.slot.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Next event without waiting.
    pub fn try_recv(&self) -> Option<PushEvent> {
        lock(&self.slot.queue).pop_front()
    }

    pub fn add_topics(&self, topics: impl IntoIterator<Item = Topic>) {
        lock(&self.slot.topics).extend(topics);
    }

    pub fn remove_topics(&self, topics: impl IntoIterator<Item = Topic>) {
        let mut current = lock(&self.slot.topics);
        for topic in topics {
            current.remove(&topic);
        }
    }

    pub fn topics(&self) -> BTreeSet<Topic> {
        lock(&self.slot.topics).clone()
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
            debug!(subscriber = self.id, "Bus subscriber removed");
        }
    }
}
