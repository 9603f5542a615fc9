use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::clock::Clock;
use crate::level::Level;
use crate::render::RenderedMessage;

/// Errors a sink can report. The dispatcher never propagates them; a
/// failing sink is quarantined instead.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sink refused the message.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// The sink was used after being disposed.
    #[error("sink closed")]
    Closed,

    /// The sink panicked; the payload is kept as text.
    #[error("sink panicked: {0}")]
    Panicked(String),
}

impl SinkError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// Destination for rendered messages.
///
/// Sinks are owned by the dispatcher thread and only ever called from it,
/// so they take `&mut self` and need no internal locking.
pub trait Sink: Send {
    /// Name used by logger rules to route messages here.
    fn name(&self) -> &str;

    /// Messages below this level are not written to the sink.
    fn minimum_level(&self) -> Level {
        Level::Trace
    }

    fn write(&mut self, message: &RenderedMessage) -> Result<(), SinkError>;

    /// Called after each batch of messages and on explicit flush.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Called once at shutdown, after the final flush.
    fn dispose(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// What happened to a message handed to a [`SinkGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The sink failed and is now quarantined.
    Failed,
    /// The sink is quarantined; it was not called.
    Skipped,
}

/// Wraps a sink and takes it out of service for a while after it fails.
///
/// A failure (an error or a panic) stamps a deadline `delay` past the
/// current time. Until the deadline passes every write and flush is skipped
/// without calling the sink. The first call after the deadline goes through
/// again; if it succeeds the sink is back in service, if not a new
/// quarantine starts.
///
/// # Examples
///
/// ```
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use pooled_logger::clock::ManualClock;
/// # use pooled_logger::render::RenderedMessage;
/// # use pooled_logger::sink::{Sink, SinkError, SinkGuard, WriteOutcome};
/// struct Broken;
/// impl Sink for Broken {
///     fn name(&self) -> &str { "broken" }
///     fn write(&mut self, _: &RenderedMessage) -> Result<(), SinkError> {
///         Err(SinkError::rejected("disk full"))
///     }
/// }
///
/// let clock = ManualClock::new();
/// let mut guard = SinkGuard::new(Box::new(Broken), Arc::new(clock.clone()), Duration::from_secs(15));
/// # let mut renderer = pooled_logger::render::Renderer::new(Arc::new(pooled_logger::type_registry::TypeRegistry::new()));
/// # let mut message = pooled_logger::message::Message::standalone(32, 2);
/// # message.reset(pooled_logger::level::Level::Info, None);
/// let rendered = renderer.render(&message);
///
/// assert_eq!(guard.write(rendered), WriteOutcome::Failed);
/// assert_eq!(guard.write(rendered), WriteOutcome::Skipped);
/// clock.advance(Duration::from_secs(15));
/// assert_eq!(guard.write(rendered), WriteOutcome::Failed);
/// ```
pub struct SinkGuard {
    sink: Box<dyn Sink>,
    clock: Arc<dyn Clock>,
    delay: Duration,
    quarantined_until: Option<Instant>,
    failures: u64,
    skipped: u64,
}

impl SinkGuard {
    pub fn new(sink: Box<dyn Sink>, clock: Arc<dyn Clock>, delay: Duration) -> Self {
        Self {
            sink,
            clock,
            delay,
            quarantined_until: None,
            failures: 0,
            skipped: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub fn minimum_level(&self) -> Level {
        self.sink.minimum_level()
    }

    pub fn quarantined_until(&self) -> Option<Instant> {
        self.quarantined_until
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined_until
            .is_some_and(|until| self.clock.now() < until)
    }

    /// Number of failures seen so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Number of writes skipped while quarantined.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn write(&mut self, message: &RenderedMessage) -> WriteOutcome {
        let now = self.clock.now();
        if self.in_quarantine(now) {
            self.skipped += 1;
            return WriteOutcome::Skipped;
        }

        let sink = &mut self.sink;
        match guarded(|| sink.write(message)) {
            Ok(()) => {
                self.recover();
                WriteOutcome::Written
            }
            Err(err) => {
                self.quarantine(now, "write", &err);
                WriteOutcome::Failed
            }
        }
    }

    /// Flushes the sink unless it is quarantined.
    pub fn flush(&mut self) {
        let now = self.clock.now();
        if self.in_quarantine(now) {
            return;
        }
        let sink = &mut self.sink;
        if let Err(err) = guarded(|| sink.flush()) {
            self.quarantine(now, "flush", &err);
        }
    }

    /// Disposes the sink. Runs even while quarantined; errors are only
    /// logged.
    pub fn dispose(&mut self) {
        let sink = &mut self.sink;
        if let Err(err) = guarded(|| sink.dispose()) {
            tracing::warn!(sink = self.sink.name(), error = %err, "sink dispose failed");
        }
    }

    fn in_quarantine(&self, now: Instant) -> bool {
        self.quarantined_until.is_some_and(|until| now < until)
    }

    fn recover(&mut self) {
        if self.quarantined_until.take().is_some() {
            tracing::info!(sink = self.sink.name(), "sink back in service");
        }
    }

    fn quarantine(&mut self, now: Instant, operation: &str, err: &SinkError) {
        self.failures += 1;
        self.quarantined_until = Some(now + self.delay);
        tracing::warn!(
            sink = self.sink.name(),
            operation,
            error = %err,
            delay_ms = self.delay.as_millis() as u64,
            "sink failed, quarantined"
        );
    }
}

fn guarded<F>(f: F) -> Result<(), SinkError>
where
    F: FnOnce() -> Result<(), SinkError>,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(SinkError::Panicked(panic_text(&*payload))))
}

pub(crate) fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
