//! Queue between the flow controller and the consumer's caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::connection::ConnectionId;
use crate::protocol::{Message, MessageId};

/// A registered message waiting to be handed to the caller.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Connection the message arrived on.
    pub connection: ConnectionId,
    /// The message.
    pub message: Message,
    /// After this instant the broker will have requeued the message.
    pub deadline: Option<Instant>,
}

impl Delivery {
    /// Whether the broker-side timeout has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// FIFO of deliveries with an async `pop`.
///
/// The queue has no capacity of its own. Only messages registered in flight
/// are pushed, and entries leave when they are popped, scrubbed or
/// deregistered, so its length never exceeds the in-flight registry. That
/// registry is in turn held to `max_in_flight` by the readiness announced to
/// brokers.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    items: Mutex<VecDeque<Delivery>>,
    notify: Notify,
    closed: AtomicBool,
}

impl DeliveryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Delivery>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a delivery and wake one waiter. Ignored once closed.
    pub fn push(&self, delivery: Delivery) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.items().push_back(delivery);
        self.notify.notify_one();
    }

    /// Take the oldest delivery without waiting.
    pub fn try_pop(&self) -> Option<Delivery> {
        self.items().pop_front()
    }

    /// Wait for the next delivery. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_pop() {
                return Some(delivery);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Remove a queued copy of `id`. Returns whether one was found.
    pub fn scrub(&self, id: &MessageId) -> bool {
        let mut items = self.items();
        match items.iter().position(|delivery| delivery.message.id == *id) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop every delivery from `connection`; returns how many were dropped.
    pub fn deregister(&self, connection: &ConnectionId) -> usize {
        let mut items = self.items();
        let before = items.len();
        items.retain(|delivery| delivery.connection != *connection);
        before - items.len()
    }

    /// Number of queued deliveries.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Stop accepting deliveries and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
