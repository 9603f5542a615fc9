use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

use crate::message::Message;

// How often a producer blocked on a full queue rechecks for shutdown.
const CLOSE_POLL: Duration = Duration::from_millis(20);

/// An item travelling from producers to the dispatcher.
pub enum Envelope {
    Message(Box<Message>),
    /// Flush every sink, then signal the sender.
    Flush(Sender<()>),
    /// Drain what is left, flush, dispose sinks and stop.
    Shutdown,
}

/// Multi-producer, single-consumer FIFO between producers and the
/// dispatcher.
///
/// Items come out in the order they went in; nothing is reordered or
/// prioritised. Producers normally use [`try_enqueue`](Self::try_enqueue)
/// and get their message back when the queue is full. An
/// [`unbounded`](Self::unbounded) queue is never full.
pub struct HandoffQueue {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    capacity: Option<usize>,
    closed: AtomicBool,
    // Set once the dispatcher has taken its last envelope.
    drained: AtomicBool,
}

impl HandoffQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let (tx, rx) = bounded(capacity);
        Self::with_channel(tx, rx, Some(capacity))
    }

    /// A queue that always accepts messages until it is closed.
    pub fn unbounded() -> Self {
        let (tx, rx) = unbounded();
        Self::with_channel(tx, rx, None)
    }

    fn with_channel(tx: Sender<Envelope>, rx: Receiver<Envelope>, capacity: Option<usize>) -> Self {
        Self {
            tx,
            rx,
            capacity,
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// Enqueues without blocking. Gives the message back if the queue is
    /// full or closed.
    #[inline]
    pub fn try_enqueue(&self, message: Box<Message>) -> Result<(), Box<Message>> {
        if self.is_closed() {
            return Err(message);
        }
        match self.tx.try_send(Envelope::Message(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(envelope) | TrySendError::Disconnected(envelope)) => Err(into_message(envelope)),
        }
    }

    /// Enqueues, waiting for room. Gives the message back if the queue is
    /// closed before room frees up.
    pub fn enqueue(&self, message: Box<Message>) -> Result<(), Box<Message>> {
        let mut envelope = Envelope::Message(message);
        loop {
            if self.is_closed() {
                return Err(into_message(envelope));
            }
            match self.tx.send_timeout(envelope, CLOSE_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => envelope = back,
                Err(SendTimeoutError::Disconnected(back)) => return Err(into_message(back)),
            }
        }
    }

    /// Sends a control envelope, waiting for room. Works after
    /// [`close`](Self::close).
    pub(crate) fn send_control(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Refuses further messages. Control envelopes still go through.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Called by the dispatcher after its final drain. Anything sent from
    /// now on is never received.
    pub(crate) fn mark_drained(&self) {
        self.drained.store(true, Ordering::Release);
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// `None` for an unbounded queue.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

fn into_message(envelope: Envelope) -> Box<Message> {
    match envelope {
        Envelope::Message(message) => message,
        // Only message envelopes are handed back by the enqueue paths.
        Envelope::Flush(_) | Envelope::Shutdown => unreachable!("control envelope returned from message enqueue"),
    }
}
