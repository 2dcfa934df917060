// ── Notification queue ──
//
// The one structure shared between the server's delivery threads and the
// consumer. The sink pushes decoded batches (or in-band decode failures) from
// whatever thread the server calls it on; consumers pop them with blocking,
// timed, non-blocking or async reads. A full queue is resolved by the
// configured `Backpressure` policy, never by blocking the producer without
// bound.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_core::Stream;
use opcae_api::{BatchHandler, DecodeError, EventBatch};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, trace, warn};

use crate::config::Backpressure;
use crate::error::CoreError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a read returned no batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("notification queue is empty")]
    Empty,

    #[error("timed out waiting for a notification")]
    Timeout,

    /// The subscription was released and everything queued before that has
    /// been read.
    #[error("subscription released; no further notifications")]
    Closed,

    /// A callback arrived whose records could not be decoded. Reported in
    /// the position the batch would have had.
    #[error("notification could not be decoded: {0}")]
    Decode(DecodeError),
}

/// Counters for one queue, read as a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Batches accepted into the queue.
    pub delivered: u64,
    /// Batches (or failure notices) dropped by the backpressure policy.
    pub dropped: u64,
    /// Callbacks whose records failed to decode.
    pub decode_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
}

#[derive(Debug)]
enum Item {
    Batch(EventBatch),
    Failed(DecodeError),
}

impl Item {
    fn into_result(self) -> Result<EventBatch, RecvError> {
        match self {
            Self::Batch(batch) => Ok(batch),
            Self::Failed(err) => Err(RecvError::Decode(err)),
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    items: VecDeque<Item>,
    closed: bool,
}

/// Bounded FIFO between a subscription's sink and its consumers.
#[derive(Debug)]
pub struct NotificationQueue {
    handle: u32,
    capacity: usize,
    policy: Backpressure,
    slots: Mutex<Slots>,
    not_empty: Condvar,
    not_full: Condvar,
    /// Wakes async readers; the condvars serve blocking ones.
    readable: Notify,
    counters: Counters,
}

impl NotificationQueue {
    /// A queue for the subscription with client handle `handle`. A zero
    /// capacity is raised to one.
    pub fn new(handle: u32, capacity: usize, policy: Backpressure) -> Self {
        Self {
            handle,
            capacity: capacity.max(1),
            policy,
            slots: Mutex::new(Slots::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            readable: Notify::new(),
            counters: Counters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> Backpressure {
        self.policy
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.slots).closed
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
        }
    }

    /// Refuse further items and wake every waiting producer and reader.
    /// Items already queued stay readable.
    pub fn close(&self) {
        let was_open = {
            let mut slots = lock(&self.slots);
            !std::mem::replace(&mut slots.closed, true)
        };
        if was_open {
            trace!(handle = self.handle, "notification queue closed");
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.readable.notify_waiters();
    }

    // ── Producer side ────────────────────────────────────────────────

    /// Enqueue under the backpressure policy. `true` when `item` was
    /// accepted.
    fn push(&self, item: Item) -> bool {
        let mut slots = lock(&self.slots);
        if slots.closed {
            trace!(handle = self.handle, "queue closed; notification discarded");
            return false;
        }

        if slots.items.len() >= self.capacity {
            match self.policy {
                Backpressure::DropNewest => {
                    drop(slots);
                    self.note_drop("newest");
                    return false;
                }
                Backpressure::DropOldest => {
                    slots.items.pop_front();
                    self.note_drop("oldest");
                }
                Backpressure::Wait { timeout } => {
                    let (guard, _) = self
                        .not_full
                        .wait_timeout_while(slots, timeout, |s| {
                            !s.closed && s.items.len() >= self.capacity
                        })
                        .unwrap_or_else(PoisonError::into_inner);
                    slots = guard;
                    if slots.closed {
                        trace!(handle = self.handle, "queue closed while waiting; notification discarded");
                        return false;
                    }
                    if slots.items.len() >= self.capacity {
                        drop(slots);
                        self.note_drop("newest after wait");
                        return false;
                    }
                }
            }
        }

        slots.items.push_back(item);
        drop(slots);
        self.not_empty.notify_one();
        self.readable.notify_waiters();
        true
    }

    fn note_drop(&self, which: &'static str) {
        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            handle = self.handle,
            capacity = self.capacity,
            policy = %self.policy,
            dropped,
            "notification queue full; dropped {which} batch"
        );
    }

    // ── Consumer side ────────────────────────────────────────────────

    fn pop(&self, slots: &mut Slots) -> Option<Result<EventBatch, RecvError>> {
        let item = slots.items.pop_front()?;
        self.not_full.notify_one();
        Some(item.into_result())
    }

    fn try_recv(&self) -> Result<EventBatch, RecvError> {
        let mut slots = lock(&self.slots);
        match self.pop(&mut slots) {
            Some(result) => result,
            None if slots.closed => Err(RecvError::Closed),
            None => Err(RecvError::Empty),
        }
    }

    fn recv(&self) -> Result<EventBatch, RecvError> {
        let slots = lock(&self.slots);
        let mut slots = self
            .not_empty
            .wait_while(slots, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        self.pop(&mut slots).unwrap_or(Err(RecvError::Closed))
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<EventBatch, RecvError> {
        let slots = lock(&self.slots);
        let (mut slots, _) = self
            .not_empty
            .wait_timeout_while(slots, timeout, |s| s.items.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        match self.pop(&mut slots) {
            Some(result) => result,
            None if slots.closed => Err(RecvError::Closed),
            None => Err(RecvError::Timeout),
        }
    }

    async fn recv_async(&self) -> Result<EventBatch, RecvError> {
        loop {
            let mut notified = pin!(self.readable.notified());
            notified.as_mut().enable();
            match self.try_recv() {
                Err(RecvError::Empty) => notified.await,
                other => return other,
            }
        }
    }

    fn drain(&self) -> Vec<Result<EventBatch, DecodeError>> {
        let items: Vec<Item> = lock(&self.slots).items.drain(..).collect();
        self.not_full.notify_all();
        items
            .into_iter()
            .map(|item| match item {
                Item::Batch(batch) => Ok(batch),
                Item::Failed(err) => Err(err),
            })
            .collect()
    }
}

impl BatchHandler for NotificationQueue {
    fn deliver(&self, batch: EventBatch) {
        trace!(
            handle = batch.client_handle(),
            count = batch.len(),
            refresh = batch.is_refresh(),
            last_refresh = batch.is_last_refresh(),
            "notification received"
        );
        if self.push(Item::Batch(batch)) {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn decode_failed(&self, client_handle: u32, err: DecodeError) {
        error!(handle = client_handle, error = %err, "notification batch could not be decoded");
        self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
        self.push(Item::Failed(err));
    }
}

// ── Consumer handle ──────────────────────────────────────────────────

/// Read side of a subscription's notification queue.
///
/// Cheap to clone. Ordering is guaranteed only to a single reader.
#[derive(Debug, Clone)]
pub struct EventReceiver {
    queue: Arc<NotificationQueue>,
}

impl EventReceiver {
    pub(crate) fn new(queue: Arc<NotificationQueue>) -> Self {
        Self { queue }
    }

    /// Block until a batch arrives or the subscription is released.
    pub fn recv(&self) -> Result<EventBatch, RecvError> {
        self.queue.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<EventBatch, RecvError> {
        self.queue.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<EventBatch, RecvError> {
        self.queue.try_recv()
    }

    /// Wait for the next batch without blocking the executor thread.
    pub async fn recv_async(&self) -> Result<EventBatch, RecvError> {
        self.queue.recv_async().await
    }

    /// Everything queued right now, in order, without waiting.
    pub fn drain(&self) -> Vec<Result<EventBatch, DecodeError>> {
        self.queue.drain()
    }

    /// Convert into a `Stream` that ends once the subscription is released
    /// and the queue is empty. Decode failures are yielded in place.
    pub fn into_stream(self) -> impl Stream<Item = Result<EventBatch, DecodeError>> + Send + 'static {
        async_stream::stream! {
            loop {
                match self.queue.recv_async().await {
                    Ok(batch) => yield Ok(batch),
                    Err(RecvError::Decode(err)) => yield Err(err),
                    Err(_) => break,
                }
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Fail with [`CoreError::Capacity`] if any batch has been dropped so
    /// far.
    pub fn ensure_lossless(&self) -> Result<(), CoreError> {
        let dropped = self.queue.stats().dropped;
        if dropped == 0 {
            Ok(())
        } else {
            Err(CoreError::Capacity {
                handle: self.queue.handle,
                dropped,
            })
        }
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use pretty_assertions::assert_eq;

    use super::*;

    fn batch(tag: u32) -> EventBatch {
        EventBatch::new(tag, false, false, Vec::new())
    }

    fn receiver(capacity: usize, policy: Backpressure) -> (Arc<NotificationQueue>, EventReceiver) {
        let queue = Arc::new(NotificationQueue::new(1, capacity, policy));
        let rx = EventReceiver::new(Arc::clone(&queue));
        (queue, rx)
    }

    fn tags(rx: &EventReceiver) -> Vec<u32> {
        rx.drain().into_iter().map(|b| b.unwrap().client_handle()).collect()
    }

    #[test]
    fn drop_oldest_keeps_the_newest() {
        let (queue, rx) = receiver(2, Backpressure::DropOldest);
        for tag in 1..=4 {
            queue.deliver(batch(tag));
        }
        assert_eq!(tags(&rx), vec![3, 4]);
        assert_eq!(rx.stats().dropped, 2);
        assert_eq!(rx.stats().delivered, 4);
        assert!(matches!(rx.ensure_lossless(), Err(CoreError::Capacity { dropped: 2, .. })));
    }

    #[test]
    fn drop_newest_keeps_the_oldest() {
        let (queue, rx) = receiver(2, Backpressure::DropNewest);
        for tag in 1..=4 {
            queue.deliver(batch(tag));
        }
        assert_eq!(tags(&rx), vec![1, 2]);
        assert_eq!(
            rx.stats(),
            QueueStats {
                delivered: 2,
                dropped: 2,
                decode_failures: 0,
            }
        );
    }

    #[test]
    fn wait_gives_up_after_the_timeout() {
        let (queue, rx) = receiver(
            1,
            Backpressure::Wait {
                timeout: Duration::from_millis(20),
            },
        );
        queue.deliver(batch(1));
        let started = Instant::now();
        queue.deliver(batch(2));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(tags(&rx), vec![1]);
        assert_eq!(rx.stats().dropped, 1);
    }

    #[test]
    fn wait_resumes_when_a_reader_makes_room() {
        let (queue, rx) = receiver(
            1,
            Backpressure::Wait {
                timeout: Duration::from_secs(10),
            },
        );
        queue.deliver(batch(1));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.deliver(batch(2)))
        };
        assert_eq!(rx.recv().unwrap().client_handle(), 1);
        producer.join().unwrap();
        assert_eq!(rx.recv().unwrap().client_handle(), 2);
        rx.ensure_lossless().unwrap();
    }

    #[test]
    fn close_releases_a_waiting_producer() {
        let (queue, rx) = receiver(
            1,
            Backpressure::Wait {
                timeout: Duration::from_secs(60),
            },
        );
        queue.deliver(batch(1));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.deliver(batch(2)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        producer.join().unwrap();
        assert_eq!(rx.recv().unwrap().client_handle(), 1);
        assert_eq!(rx.recv(), Err(RecvError::Closed));
        assert_eq!(rx.stats().dropped, 0);
    }

    #[test]
    fn decode_failures_arrive_in_order() {
        let (queue, rx) = receiver(8, Backpressure::default());
        queue.deliver(batch(1));
        queue.decode_failed(1, DecodeError::UnsupportedVariantType(0x24));
        queue.deliver(batch(2));
        assert_eq!(rx.try_recv().unwrap().client_handle(), 1);
        assert_eq!(
            rx.try_recv(),
            Err(RecvError::Decode(DecodeError::UnsupportedVariantType(0x24)))
        );
        assert_eq!(rx.try_recv().unwrap().client_handle(), 2);
        assert_eq!(rx.try_recv(), Err(RecvError::Empty));
        assert_eq!(rx.stats().decode_failures, 1);
    }

    #[test]
    fn timed_read_on_an_empty_queue() {
        let (_queue, rx) = receiver(1, Backpressure::default());
        assert_eq!(rx.recv_timeout(Duration::from_millis(5)), Err(RecvError::Timeout));
    }

    #[test]
    fn closed_queue_drains_then_reports_closed() {
        let (queue, rx) = receiver(4, Backpressure::default());
        queue.deliver(batch(1));
        queue.close();
        queue.deliver(batch(2));
        assert_eq!(rx.try_recv().unwrap().client_handle(), 1);
        assert_eq!(rx.try_recv(), Err(RecvError::Closed));
        assert_eq!(rx.recv_timeout(Duration::from_millis(1)), Err(RecvError::Closed));
        assert_eq!(rx.stats().delivered, 1);
    }

    #[tokio::test]
    async fn async_reader_wakes_on_delivery() {
        let (queue, rx) = receiver(4, Backpressure::default());
        let reader = tokio::spawn(async move { rx.recv_async().await });
        tokio::task::yield_now().await;
        thread::spawn(move || queue.deliver(batch(9))).join().unwrap();
        assert_eq!(reader.await.unwrap().unwrap().client_handle(), 9);
    }

    #[test]
    fn pending_async_read_is_woken_by_close() {
        let (queue, rx) = receiver(4, Backpressure::default());
        let mut read = tokio_test::task::spawn(rx.recv_async());
        tokio_test::assert_pending!(read.poll());

        queue.close();
        assert!(read.is_woken());
        assert_eq!(tokio_test::assert_ready!(read.poll()), Err(RecvError::Closed));
    }

    #[tokio::test]
    async fn stream_ends_after_close() {
        use futures_util::StreamExt;

        let (queue, rx) = receiver(4, Backpressure::default());
        queue.deliver(batch(1));
        queue.decode_failed(1, DecodeError::NestingTooDeep(8));
        queue.close();
        let items: Vec<_> = rx.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().client_handle(), 1);
        assert_eq!(items[1], Err(DecodeError::NestingTooDeep(8)));
    }
}
