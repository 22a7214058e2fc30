//! Fan-out of events to independent subscribers.
//!
//! Each subscriber owns a bounded queue. Lossy events (receipts, typing,
//! protocol errors, connectivity) are dropped oldest-first once the lossy
//! budget is used up and the subscriber observes [`RecvError::Lagged`].
//! Messages, linking and contact events are never dropped: if a subscriber
//! falls so far behind that the whole queue is full of them, the
//! subscription is closed with [`RecvError::Overflowed`].

use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::Notify;

use super::events::{Event, EventFilter};
use crate::config::EventConfig;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    #[error("subscriber lagged behind, {0} events dropped")]
    Lagged(u64),
    #[error("subscriber queue overflowed with undeliverable messages")]
    Overflowed,
    #[error("event stream closed")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    lossy_len: usize,
    dropped: u64,
    overflowed: bool,
    closed: bool,
}

#[derive(Debug)]
struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    lossy_capacity: usize,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(lossy_capacity: usize, capacity: usize) -> Self {
        let lossy_capacity = lossy_capacity.max(1);
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            lossy_capacity,
            capacity: capacity.max(lossy_capacity),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drop_oldest_lossy(st: &mut QueueState) -> bool {
        match st.events.iter().position(Event::is_lossy) {
            Some(pos) => {
                st.events.remove(pos);
                st.lossy_len -= 1;
                st.dropped += 1;
                true
            }
            None => false,
        }
    }

    /// Returns false once the subscriber can no longer receive anything.
    fn push(&self, event: Event) -> bool {
        let mut st = self.lock();
        if st.closed || st.overflowed {
            return false;
        }

        let lossy = event.is_lossy();
        if lossy && st.lossy_len >= self.lossy_capacity {
            Self::drop_oldest_lossy(&mut st);
        }
        if st.events.len() >= self.capacity && !Self::drop_oldest_lossy(&mut st) {
            if lossy {
                st.dropped += 1;
                return true;
            }
            tracing::error!(
                "Event subscriber fell {} messages behind, closing subscription",
                st.events.len()
            );
            st.overflowed = true;
            drop(st);
            self.notify.notify_one();
            return false;
        }

        st.events.push_back(event);
        if lossy {
            st.lossy_len += 1;
        }
        drop(st);
        self.notify.notify_one();
        true
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

struct Slot {
    filter: EventFilter,
    queue: Weak<SubscriberQueue>,
}

struct HubInner {
    slots: Vec<Slot>,
    closed: bool,
}

/// Owned by the client facade; survives reconnects so subscriptions do too.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Mutex<HubInner>>,
    lossy_capacity: usize,
    capacity: usize,
}

impl EventHub {
    pub fn new(lossy_capacity: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                slots: Vec::new(),
                closed: false,
            })),
            lossy_capacity,
            capacity,
        }
    }

    pub fn from_config(config: &EventConfig) -> Self {
        Self::new(config.buffer, config.message_buffer)
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new(self.lossy_capacity, self.capacity));
        let mut inner = self.lock();
        if inner.closed {
            queue.close();
        } else {
            inner.slots.push(Slot {
                filter,
                queue: Arc::downgrade(&queue),
            });
        }
        Subscription { queue }
    }

    /// Deliver to every matching subscriber. Returns how many accepted it.
    pub fn publish(&self, event: Event) -> usize {
        let mut inner = self.lock();
        if inner.closed {
            return 0;
        }
        let mut delivered = 0;
        inner.slots.retain(|slot| {
            let Some(queue) = slot.queue.upgrade() else {
                return false;
            };
            if !slot.filter.matches(&event) {
                return true;
            }
            let alive = queue.push(event.clone());
            if alive {
                delivered += 1;
            }
            alive
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.slots.retain(|s| s.queue.strong_count() > 0);
        inner.slots.len()
    }

    /// End every subscription; later subscribers start closed.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for slot in inner.slots.drain(..) {
            if let Some(queue) = slot.queue.upgrade() {
                queue.close();
            }
        }
    }
}

/// Receiving end of one subscriber queue. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// An already-finished subscription, for transports without events.
    pub fn closed() -> Self {
        let queue = Arc::new(SubscriberQueue::new(1, 1));
        queue.close();
        Self { queue }
    }

    pub fn try_recv(&mut self) -> Option<Result<Event, RecvError>> {
        let mut st = self.queue.lock();
        if st.dropped > 0 {
            let n = st.dropped;
            st.dropped = 0;
            return Some(Err(RecvError::Lagged(n)));
        }
        if let Some(event) = st.events.pop_front() {
            if event.is_lossy() {
                st.lossy_len -= 1;
            }
            return Some(Ok(event));
        }
        if st.overflowed {
            return Some(Err(RecvError::Overflowed));
        }
        if st.closed {
            return Some(Err(RecvError::Closed));
        }
        None
    }

    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        loop {
            if let Some(item) = self.try_recv() {
                return item;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Stream that ends after `Closed` or `Overflowed`.
    pub fn into_stream(self) -> impl Stream<Item = Result<Event, RecvError>> {
        stream::unfold(Some(self), |sub| async move {
            let mut sub = sub?;
            match sub.recv().await {
                Err(RecvError::Closed) => None,
                Err(RecvError::Overflowed) => Some((Err(RecvError::Overflowed), None)),
                item => Some((item, Some(sub))),
            }
        })
    }
}
