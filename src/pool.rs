use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::level::Level;
use crate::message::{Message, Origin};
use crate::segment::{Segment, SegmentPool};

/// What [`MessagePool::acquire`] does when no message is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExhaustionStrategy {
    /// Skip the event and report it with one synthetic warning.
    #[default]
    DropAndNotify,
    /// Skip the event silently.
    Drop,
    /// Block the producer until a message is released or the pool closes.
    WaitUntilAvailable,
    /// Build a transient message outside the pool. This allocates.
    Allocate,
}

/// Result of [`MessagePool::acquire`].
#[derive(Debug)]
pub enum Acquired {
    /// A reset message ready to be filled.
    Message(Box<Message>),
    /// The pool was exhausted under [`ExhaustionStrategy::DropAndNotify`];
    /// the caller should report the drop.
    Dropped,
    /// No message and nothing to report.
    Skipped,
}

/// Counters for pool monitoring.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    acquired: AtomicU64,
    dropped: AtomicU64,
    allocated: AtomicU64,
    waited: AtomicU64,
    released: AtomicU64,
}

impl PoolMetrics {
    pub const fn new() -> Self {
        Self {
            acquired: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            waited: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_acquire(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_allocate(&self) {
        self.allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_wait(&self) {
        self.waited.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            waited: self.waited.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    /// Messages handed to producers, transient ones included.
    pub acquired: u64,
    /// Events skipped because no message was available.
    pub dropped: u64,
    /// Transient messages built under [`ExhaustionStrategy::Allocate`].
    pub allocated: u64,
    /// Times a producer had to block for a free message.
    pub waited: u64,
    pub released: u64,
}

/// A fixed set of reusable messages.
///
/// Every message and its buffer is created in [`MessagePool::new`]; after
/// that the pool only moves boxed messages between its free list and the
/// threads using them. A message leaves through [`acquire`](Self::acquire)
/// and comes back through [`release`](Self::release), which the dispatcher
/// calls once the message has been written to every sink.
///
/// One extra message is held back for the exhaustion warning, so reporting
/// a drop never competes with the events that caused it. While that warning
/// is in flight further drops are not reported again.
///
/// # Examples
///
/// ```
/// # use pooled_logger::pool::{Acquired, ExhaustionStrategy, MessagePool};
/// # use pooled_logger::level::Level;
/// let pool = MessagePool::new(1, 64, 4, ExhaustionStrategy::Drop);
/// let Acquired::Message(message) = pool.acquire(Level::Info, None) else {
///     panic!("pool should have a free message");
/// };
/// assert!(matches!(pool.acquire(Level::Info, None), Acquired::Skipped));
///
/// pool.release(message);
/// assert_eq!(pool.available(), 1);
/// ```
pub struct MessagePool {
    free_tx: Sender<Box<Message>>,
    free_rx: Receiver<Box<Message>>,
    notice: Mutex<Option<Box<Message>>>,
    closed: AtomicBool,
    // Dropped on close; waiting producers see the disconnect.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    strategy: ExhaustionStrategy,
    capacity: usize,
    segment_size: usize,
    string_capacity: usize,
    metrics: PoolMetrics,
}

impl MessagePool {
    /// Builds `capacity` messages with `segment_size`-byte buffers and
    /// `string_capacity` string slots each, plus the reserved warning
    /// message. All buffers come from a single backing block.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `segment_size` is zero.
    pub fn new(
        capacity: usize,
        segment_size: usize,
        string_capacity: usize,
        strategy: ExhaustionStrategy,
    ) -> Self {
        assert!(capacity > 0, "pool capacity must be non-zero");

        let mut segments = SegmentPool::new(segment_size, capacity + 1);
        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            let message = Box::new(Message::new(segments.acquire(), string_capacity, Origin::Pooled));
            // Cannot fail: the channel was sized for exactly this many.
            let _ = free_tx.try_send(message);
        }
        let notice = Box::new(Message::new(segments.acquire(), string_capacity, Origin::Reserved));
        let (close_tx, close_rx) = bounded(0);

        Self {
            free_tx,
            free_rx,
            notice: Mutex::new(Some(notice)),
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            strategy,
            capacity,
            segment_size,
            string_capacity,
            metrics: PoolMetrics::new(),
        }
    }

    /// Takes a free message, reset for an event at `level` from `logger`.
    ///
    /// When none is free the pool's [`ExhaustionStrategy`] decides what
    /// happens. Only [`ExhaustionStrategy::WaitUntilAvailable`] blocks, and
    /// it stops waiting when the pool is closed.
    pub fn acquire(&self, level: Level, logger: Option<&Arc<str>>) -> Acquired {
        if self.is_closed() {
            self.metrics.record_drop();
            return Acquired::Skipped;
        }

        let mut message = match self.free_rx.try_recv() {
            Ok(message) => message,
            Err(_) => match self.strategy {
                ExhaustionStrategy::DropAndNotify => {
                    self.metrics.record_drop();
                    return Acquired::Dropped;
                }
                ExhaustionStrategy::Drop => {
                    self.metrics.record_drop();
                    return Acquired::Skipped;
                }
                ExhaustionStrategy::WaitUntilAvailable => {
                    self.metrics.record_wait();
                    match self.wait_for_free() {
                        Some(message) => message,
                        None => {
                            self.metrics.record_drop();
                            return Acquired::Skipped;
                        }
                    }
                }
                ExhaustionStrategy::Allocate => {
                    self.metrics.record_allocate();
                    Box::new(Message::new(
                        Segment::standalone(self.segment_size),
                        self.string_capacity,
                        Origin::Transient,
                    ))
                }
            },
        };

        message.reset(level, logger);
        self.metrics.record_acquire();
        Acquired::Message(message)
    }

    fn wait_for_free(&self) -> Option<Box<Message>> {
        select! {
            recv(self.free_rx) -> message => message.ok(),
            recv(self.close_rx) -> _ => None,
        }
    }

    /// Takes the reserved warning message, if it is not already in flight.
    pub fn take_notice(&self, logger: Option<&Arc<str>>) -> Option<Box<Message>> {
        let mut message = self.notice.lock().take()?;
        message.reset(Level::Warn, logger);
        Some(message)
    }

    /// Returns a message to where it came from. Transient messages are
    /// dropped.
    pub fn release(&self, message: Box<Message>) {
        self.metrics.record_release();
        match message.origin() {
            Origin::Pooled => {
                if self.free_tx.try_send(message).is_err() {
                    tracing::warn!(capacity = self.capacity, "free list full, discarding released message");
                }
            }
            Origin::Reserved => *self.notice.lock() = Some(message),
            Origin::Transient => {}
        }
    }

    /// Stops handing out messages and wakes every blocked producer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_tx.lock().take();
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of messages currently on the free list.
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> ExhaustionStrategy {
        self.strategy
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn take(pool: &MessagePool) -> Box<Message> {
        match pool.acquire(Level::Info, None) {
            Acquired::Message(message) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_acquire_resets_message() {
        let pool = MessagePool::new(1, 32, 2, ExhaustionStrategy::Drop);
        let mut message = take(&pool);
        message.append(1u64);
        pool.release(message);

        let name: Arc<str> = Arc::from("svc");
        let Acquired::Message(message) = pool.acquire(Level::Error, Some(&name)) else {
            panic!("expected a message");
        };
        assert!(message.encoded().is_empty());
        assert_eq!(message.level(), Level::Error);
        assert_eq!(message.logger_name(), Some("svc"));
    }

    #[test]
    fn test_drop_and_notify_reports_drop() {
        let pool = MessagePool::new(1, 32, 2, ExhaustionStrategy::DropAndNotify);
        let _held = take(&pool);
        assert!(matches!(pool.acquire(Level::Info, None), Acquired::Dropped));
        assert_eq!(pool.metrics().snapshot().dropped, 1);
    }

    #[test]
    fn test_notice_is_single_flight() {
        let pool = MessagePool::new(1, 32, 2, ExhaustionStrategy::DropAndNotify);
        let notice = pool.take_notice(None).unwrap();
        assert_eq!(notice.level(), Level::Warn);
        assert!(pool.take_notice(None).is_none());
        pool.release(notice);
        assert!(pool.take_notice(None).is_some());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_allocate_builds_transient_message() {
        let pool = MessagePool::new(1, 32, 2, ExhaustionStrategy::Allocate);
        let held = take(&pool);
        let extra = take(&pool);
        assert_eq!(extra.origin(), Origin::Transient);
        assert_eq!(extra.buffer_capacity(), 32);

        pool.release(extra);
        assert_eq!(pool.available(), 0);
        pool.release(held);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.metrics().snapshot().allocated, 1);
    }

    #[test]
    fn test_wait_is_cancelled_by_close() {
        let pool = Arc::new(MessagePool::new(1, 32, 2, ExhaustionStrategy::WaitUntilAvailable));
        let _held = take(&pool);

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || matches!(pool.acquire(Level::Info, None), Acquired::Skipped))
        };
        thread::sleep(Duration::from_millis(50));
        pool.close();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_closed_pool_hands_out_nothing() {
        let pool = MessagePool::new(2, 32, 2, ExhaustionStrategy::Allocate);
        pool.close();
        assert!(matches!(pool.acquire(Level::Info, None), Acquired::Skipped));
    }
}
