//! Outbound message queue between a session and its writer task.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::protocol::Message;

/// Bounded FIFO that never blocks the sender.
///
/// When full, the oldest queued audio packet is discarded to make room, or
/// the oldest message when nothing but control messages is queued. A slow
/// link therefore loses stale audio instead of building latency.
pub struct DeliveryChannel {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl DeliveryChannel {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `msg`. Returns false once the channel is closed.
    pub fn push(&self, msg: Message) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = match self.queue.lock() {
                Ok(q) => q,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.capacity {
                match queue.iter().position(|m| matches!(m, Message::Audio(_))) {
                    Some(oldest_audio) => {
                        queue.remove(oldest_audio);
                    }
                    None => {
                        queue.pop_front();
                    }
                }
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!("Delivery queue full, {} messages dropped so far", dropped);
                }
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
        true
    }

    /// Next message in FIFO order, or `None` after [`close`](Self::close)
    /// once the queue has drained.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            if let Some(msg) = self.pop() {
                return Some(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        match self.queue.lock() {
            Ok(q) => q.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Option<Message> {
        match self.queue.lock() {
            Ok(mut q) => q.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}
