use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::argument::{Encode, StrRef};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{LoggerRule, PipelineConfig, ResolutionCache, Resolver};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{Error, Result};
use crate::level::Level;
use crate::message::{Message, SharedError};
use crate::pool::{Acquired, ExhaustionStrategy, MessagePool, PoolMetricsSnapshot};
use crate::queue::{Envelope, HandoffQueue};
use crate::render::Renderer;
use crate::sink::{Sink, SinkGuard};
use crate::type_registry::{GlobalTypeRegistry, LogEnum, TypeLookup, UnmanagedStruct};

/// Text of the warning emitted when events are dropped for lack of a free
/// message.
pub const POOL_EXHAUSTED_WARNING: &str = "Log message skipped due to pool exhaustion";

// How often a waiting flush checks whether the dispatcher has stopped.
const FLUSH_POLL: Duration = Duration::from_millis(50);

struct Shared {
    pool: Arc<MessagePool>,
    queue: Arc<HandoffQueue>,
    resolver: Arc<Resolver>,
    stats: Arc<DispatchStats>,
    shut_down: AtomicBool,
}

/// Owner of a running pipeline: the message pool, the handoff queue and the
/// dispatcher thread.
///
/// Dropping the manager shuts the pipeline down. [`Logger`]s handed out
/// before that keep working but their events are discarded.
///
/// # Examples
///
/// ```
/// # use pooled_logger::config::PipelineConfig;
/// # use pooled_logger::level::Level;
/// # use pooled_logger::manager::LogManager;
/// # use pooled_logger::sinks::MemorySink;
/// let sink = MemorySink::new("memory", Level::Trace);
/// let manager = LogManager::initialize(
///     PipelineConfig { pool_size: 4, ..PipelineConfig::default() },
///     vec![Box::new(sink.clone())],
///     Vec::new(),
/// ).unwrap();
///
/// let logger = manager.logger("app");
/// logger.info().append("Count ").append(42i32).submit();
/// manager.flush().unwrap();
///
/// assert_eq!(sink.texts(), vec!["Count 42".to_string()]);
/// manager.shutdown().unwrap();
/// ```
pub struct LogManager {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    /// Starts a pipeline with the process-wide type registry and the system
    /// clock.
    pub fn initialize(config: PipelineConfig, sinks: Vec<Box<dyn Sink>>, rules: Vec<LoggerRule>) -> Result<Self> {
        let mut builder = LogManager::builder(config);
        builder.sinks = sinks;
        builder.rules = rules;
        builder.build()
    }

    pub fn builder(config: PipelineConfig) -> LogManagerBuilder {
        LogManagerBuilder {
            config,
            sinks: Vec::new(),
            rules: Vec::new(),
            types: Arc::new(GlobalTypeRegistry),
            clock: Arc::new(MonotonicClock),
        }
    }

    /// A logger for `name`. Its minimum level is computed once, here.
    pub fn logger(&self, name: &str) -> Logger {
        let resolved = self.shared.resolver.resolve(name);
        Logger {
            name: (!name.is_empty()).then(|| Arc::from(name)),
            min_level: resolved.producer_min,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn root_logger(&self) -> Logger {
        self.logger("")
    }

    /// Waits until everything submitted before this call has been written
    /// and every sink flushed.
    pub fn flush(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let (done_tx, done_rx) = bounded(1);
        if !self.shared.queue.send_control(Envelope::Flush(done_tx)) {
            return Err(Error::ShutDown);
        }
        self.await_flush(&done_rx)
    }

    // A flush that lands in the queue after the dispatcher's final drain is
    // never acknowledged, so the wait gives up once the queue is drained.
    fn await_flush(&self, done_rx: &Receiver<()>) -> Result<()> {
        loop {
            match done_rx.recv_timeout(FLUSH_POLL) {
                Ok(()) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::ShutDown),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.queue.is_drained() {
                        return done_rx.try_recv().map_err(|_| Error::ShutDown);
                    }
                }
            }
        }
    }

    /// Stops the pipeline: wakes blocked producers, drains the queue, then
    /// flushes and disposes every sink. Calling it again does nothing.
    pub fn shutdown(&self) -> Result<()> {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.pool.close();
        self.shared.queue.close();
        self.shared.queue.send_control(Envelope::Shutdown);

        let Some(handle) = self.dispatcher.lock().take() else {
            return Ok(());
        };
        handle.join().map_err(|_| Error::DispatcherPanicked)?;
        tracing::debug!(pool = ?self.shared.pool.metrics().snapshot(), "log manager shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.shared.pool.metrics().snapshot()
    }

    pub fn dispatch_stats(&self) -> &DispatchStats {
        &self.shared.stats
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "log manager shutdown failed");
        }
    }
}

/// Assembles a [`LogManager`].
///
/// Sinks are attached at the root, so every logger reaches every sink,
/// unless one of the rules has the empty prefix; then the root only gets
/// the sinks that rule names.
pub struct LogManagerBuilder {
    config: PipelineConfig,
    sinks: Vec<Box<dyn Sink>>,
    rules: Vec<LoggerRule>,
    types: Arc<dyn TypeLookup>,
    clock: Arc<dyn Clock>,
}

impl LogManagerBuilder {
    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn rule(mut self, rule: LoggerRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Renders enums and structs with `types` instead of the process-wide
    /// registry.
    pub fn type_lookup(mut self, types: Arc<dyn TypeLookup>) -> Self {
        self.types = types;
        self
    }

    /// Times sink quarantines with `clock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<LogManager> {
        let config = self.config;
        config.validate()?;

        let mut names = HashSet::new();
        let mut sink_levels = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            if !names.insert(sink.name().to_string()) {
                return Err(Error::Config(format!("duplicate sink name `{}`", sink.name())));
            }
            sink_levels.push((sink.name().to_string(), sink.minimum_level()));
        }

        let root_gets_all_sinks = !self.rules.iter().any(|rule| rule.prefix.is_empty());
        let resolver = Arc::new(Resolver::new(
            config.root_level,
            &sink_levels,
            &self.rules,
            root_gets_all_sinks,
        )?);

        let pool = Arc::new(MessagePool::new(
            config.pool_size,
            config.segment_size,
            config.string_capacity,
            config.exhaustion_strategy,
        ));
        let queue = Arc::new(match config.queue_capacity() {
            Some(capacity) => HandoffQueue::new(capacity),
            None => HandoffQueue::unbounded(),
        });
        let stats = Arc::new(DispatchStats::default());

        let guards = self
            .sinks
            .into_iter()
            .map(|sink| SinkGuard::new(sink, Arc::clone(&self.clock), config.quarantine_delay()))
            .collect::<Vec<_>>();
        let sink_count = guards.len();
        let renderer = Renderer::new(self.types)
            .with_null_display(config.null_display.clone())
            .with_truncated_suffix(config.truncated_suffix.clone());

        let handle = Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            guards,
            ResolutionCache::new(Arc::clone(&resolver)),
            renderer,
            config.idle_flush(),
            Arc::clone(&stats),
        )
        .spawn()?;

        tracing::info!(
            pool_size = config.pool_size,
            segment_size = config.segment_size,
            queue_capacity = ?config.queue_capacity(),
            strategy = ?config.exhaustion_strategy,
            sinks = sink_count,
            "log manager initialized"
        );

        Ok(LogManager {
            shared: Arc::new(Shared {
                pool,
                queue,
                resolver,
                stats,
                shut_down: AtomicBool::new(false),
            }),
            dispatcher: Mutex::new(Some(handle)),
        })
    }
}

/// Producer-side handle for one logger name. Cheap to clone and safe to
/// share between threads.
#[derive(Clone)]
pub struct Logger {
    name: Option<Arc<str>>,
    // Lowest enabled level as u8, LEVEL_OFF when no sink is reachable.
    min_level: u8,
    shared: Arc<Shared>,
}

macro_rules! level_methods {
    ($($name:ident => $level:ident),* $(,)?) => {$(
        #[inline]
        pub fn $name(&self) -> LogMessage<'_> {
            self.log(Level::$level)
        }
    )*};
}

impl Logger {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    #[inline(always)]
    pub fn is_enabled(&self, level: Level) -> bool {
        level.as_u8() >= self.min_level
    }

    /// Starts an event at `level`. Disabled levels return a handle that
    /// ignores everything without touching the pool.
    pub fn log(&self, level: Level) -> LogMessage<'_> {
        if !self.is_enabled(level) {
            return LogMessage::disabled(self);
        }
        match self.shared.pool.acquire(level, self.name.as_ref()) {
            Acquired::Message(message) => LogMessage {
                logger: self,
                message: Some(message),
            },
            Acquired::Dropped => {
                self.report_drop();
                LogMessage::disabled(self)
            }
            Acquired::Skipped => LogMessage::disabled(self),
        }
    }

    level_methods! {
        trace => Trace,
        debug => Debug,
        info => Info,
        warn => Warn,
        error => Error,
        fatal => Fatal,
    }

    fn report_drop(&self) {
        if !self.is_enabled(Level::Warn) {
            return;
        }
        let Some(mut notice) = self.shared.pool.take_notice(self.name.as_ref()) else {
            return;
        };
        notice.append(POOL_EXHAUSTED_WARNING);
        if let Err(notice) = self.shared.queue.try_enqueue(notice) {
            self.shared.pool.release(notice);
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name())
            .field("min_level", &Level::from_u8(self.min_level))
            .finish()
    }
}

/// An event being built.
///
/// Every `append*` call is a no-op on a disabled handle. Nothing is logged
/// until [`submit`](Self::submit); dropping the handle without submitting
/// gives the message back to the pool.
///
/// ```
/// # use pooled_logger::config::PipelineConfig;
/// # use pooled_logger::level::Level;
/// # use pooled_logger::manager::LogManager;
/// # use pooled_logger::sinks::MemorySink;
/// # let sink = MemorySink::new("memory", Level::Info);
/// # let manager = LogManager::initialize(PipelineConfig::default(), vec![Box::new(sink.clone())], vec![]).unwrap();
/// let logger = manager.logger("orders");
/// logger
///     .warn()
///     .format("order {0} rejected after {1}ms")
///     .append(1042u64)
///     .append(37u32)
///     .append_key_value("venue", "XNAS")
///     .submit();
///
/// // Debug is below the sink's level: no message is taken from the pool.
/// assert!(!logger.debug().is_enabled());
/// # manager.flush().unwrap();
/// # assert_eq!(sink.texts(), vec!["order 1042 rejected after 37ms".to_string()]);
/// ```
#[must_use = "events are only logged once `submit` is called"]
pub struct LogMessage<'a> {
    logger: &'a Logger,
    message: Option<Box<Message>>,
}

impl<'a> LogMessage<'a> {
    fn disabled(logger: &'a Logger) -> Self {
        Self { logger, message: None }
    }

    /// False when the level is disabled or the event was dropped.
    pub fn is_enabled(&self) -> bool {
        self.message.is_some()
    }

    /// The underlying message, for direct access to its append methods.
    pub fn message(&mut self) -> Option<&mut Message> {
        self.message.as_deref_mut()
    }

    #[inline]
    pub fn append<T: Encode>(&mut self, value: T) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append(value);
        }
        self
    }

    #[inline]
    pub fn append_formatted<T: Encode>(&mut self, value: T, format: &'static str) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_formatted(value, format);
        }
        self
    }

    #[inline]
    pub fn append_string(&mut self, value: impl Into<StrRef>) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_string(value);
        }
        self
    }

    pub fn append_inline_str(&mut self, value: &str) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_inline_str(value);
        }
        self
    }

    #[inline]
    pub fn append_enum<E: LogEnum>(&mut self, value: E) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_enum(value);
        }
        self
    }

    pub fn append_enum_option<E: LogEnum>(&mut self, value: Option<E>) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_enum_option(value);
        }
        self
    }

    pub fn append_unmanaged<T: UnmanagedStruct>(&mut self, value: &T) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_unmanaged(value);
        }
        self
    }

    pub fn append_unmanaged_formatted<T: UnmanagedStruct>(&mut self, value: &T, format: &'static str) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_unmanaged_formatted(value, format);
        }
        self
    }

    pub fn append_unmanaged_option<T: UnmanagedStruct>(&mut self, value: Option<&T>) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_unmanaged_option(value);
        }
        self
    }

    pub fn append_key_value<T: Encode>(&mut self, key: &'static str, value: T) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_key_value(key, value);
        }
        self
    }

    /// Captures a `{0}`, `{1}`, … template for the arguments appended after
    /// it.
    pub fn format(&mut self, template: impl Into<StrRef>) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.append_template(template);
        }
        self
    }

    pub fn with_error(&mut self, error: SharedError) -> &mut Self {
        if let Some(message) = self.message.as_mut() {
            message.with_error(error);
        }
        self
    }

    /// Hands the event to the dispatcher.
    ///
    /// Under `Drop` and `DropAndNotify` a full queue drops the event like an
    /// empty pool would. `WaitUntilAvailable` waits for room. `Allocate`
    /// never waits: its queue is unbounded.
    pub fn submit(&mut self) {
        let Some(message) = self.message.take() else {
            return;
        };
        let shared = &self.logger.shared;
        let strategy = shared.pool.strategy();
        let result = match strategy {
            ExhaustionStrategy::WaitUntilAvailable => shared.queue.enqueue(message),
            ExhaustionStrategy::Allocate | ExhaustionStrategy::Drop | ExhaustionStrategy::DropAndNotify => {
                shared.queue.try_enqueue(message)
            }
        };
        if let Err(message) = result {
            shared.pool.release(message);
            if strategy == ExhaustionStrategy::DropAndNotify && !shared.queue.is_closed() {
                self.logger.report_drop();
            }
        }
    }
}

impl Drop for LogMessage<'_> {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.logger.shared.pool.release(message);
        }
    }
}
