use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::config::ResolutionCache;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::pool::MessagePool;
use crate::queue::{Envelope, HandoffQueue};
use crate::render::Renderer;
use crate::sink::{panic_text, SinkGuard};

// Upper bound on messages handled between two sink flushes.
const MAX_BATCH: usize = 256;

/// Counters kept by the dispatcher thread.
#[derive(Debug, Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    filtered: AtomicU64,
    render_failures: AtomicU64,
}

impl DispatchStats {
    /// Messages taken off the queue and released, whether or not any sink
    /// wanted them.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Messages no resolved sink accepted.
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Messages that could not be decoded cleanly or whose rendering
    /// panicked. Both still reach the sinks as a fallback line.
    pub fn render_failures(&self) -> u64 {
        self.render_failures.load(Ordering::Relaxed)
    }
}

/// The consumer half of the pipeline. Runs on its own thread and is the
/// only code that touches sinks.
pub(crate) struct Dispatcher {
    queue: Arc<HandoffQueue>,
    pool: Arc<MessagePool>,
    guards: Vec<SinkGuard>,
    cache: ResolutionCache,
    renderer: Renderer,
    idle_flush: Duration,
    dirty: bool,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: Arc<HandoffQueue>,
        pool: Arc<MessagePool>,
        guards: Vec<SinkGuard>,
        cache: ResolutionCache,
        renderer: Renderer,
        idle_flush: Duration,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            queue,
            pool,
            guards,
            cache,
            renderer,
            idle_flush,
            dirty: false,
            stats,
        }
    }

    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("log-dispatcher".into())
            .spawn(move || self.run())
            .map_err(Error::Spawn)
    }

    fn run(mut self) {
        tracing::debug!(sinks = self.guards.len(), "dispatcher started");
        loop {
            let envelope = match self.queue.recv_timeout(self.idle_flush) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => {
                    self.flush_sinks(false);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !self.handle(envelope) {
                break;
            }

            let mut stop = false;
            for _ in 0..MAX_BATCH {
                let Some(envelope) = self.queue.try_recv() else {
                    break;
                };
                if !self.handle(envelope) {
                    stop = true;
                    break;
                }
            }
            self.flush_sinks(false);
            if stop {
                break;
            }
        }
        self.finish();
    }

    /// Returns false on the shutdown sentinel.
    fn handle(&mut self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Message(message) => {
                self.dispatch(message);
                true
            }
            Envelope::Flush(done) => {
                self.flush_sinks(true);
                let _ = done.send(());
                true
            }
            Envelope::Shutdown => false,
        }
    }

    fn dispatch(&mut self, message: Box<Message>) {
        let level = message.level();
        let resolved = self.cache.get(message.logger_arc());

        if resolved.is_enabled(level) {
            let source: &Message = &message;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.renderer.render(source);
            }));
            let rendered = match outcome {
                Ok(()) => {
                    let rendered = self.renderer.last();
                    if let Some(err) = rendered.decode_error() {
                        self.stats.render_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(logger = rendered.logger_name(), error = %err, "message only partly decoded");
                    }
                    rendered
                }
                Err(payload) => {
                    let reason = panic_text(&*payload);
                    self.stats.render_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        logger = source.logger_name().unwrap_or(""),
                        panic = %reason,
                        "rendering panicked, writing fallback line"
                    );
                    self.renderer.render_fallback(source, &reason)
                }
            };
            for &index in &resolved.sinks {
                let guard = &mut self.guards[index];
                if level >= resolved.level && level >= guard.minimum_level() {
                    guard.write(rendered);
                }
            }
            self.dirty = true;
        } else {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        self.pool.release(message);
    }

    fn flush_sinks(&mut self, force: bool) {
        if !self.dirty && !force {
            return;
        }
        for guard in &mut self.guards {
            guard.flush();
        }
        self.dirty = false;
    }

    /// Drains whatever is still queued, then flushes and disposes every
    /// sink.
    fn finish(&mut self) {
        let mut drained = 0usize;
        while let Some(envelope) = self.queue.try_recv() {
            match envelope {
                Envelope::Message(message) => {
                    self.dispatch(message);
                    drained += 1;
                }
                Envelope::Flush(done) => {
                    self.flush_sinks(true);
                    let _ = done.send(());
                }
                Envelope::Shutdown => {}
            }
        }
        self.flush_sinks(true);
        for guard in &mut self.guards {
            guard.dispose();
        }
        tracing::debug!(drained, dispatched = self.stats.dispatched(), "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    // Runs after the final drain, or while unwinding from a panic.
    fn drop(&mut self) {
        self.queue.mark_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Resolver;
    use crate::level::Level;
    use crate::pool::{Acquired, ExhaustionStrategy};
    use crate::sinks::MemorySink;
    use crate::type_registry::TypeRegistry;

    fn dispatcher(sink: &MemorySink) -> (Dispatcher, Arc<MessagePool>) {
        let pool = Arc::new(MessagePool::new(2, 64, 4, ExhaustionStrategy::Drop));
        let resolver = Resolver::new(Level::Info, &[("memory".to_string(), Level::Info)], &[], true).unwrap();
        let guard = SinkGuard::new(
            Box::new(sink.clone()),
            Arc::new(ManualClock::new()),
            Duration::from_secs(15),
        );
        let dispatcher = Dispatcher::new(
            Arc::new(HandoffQueue::new(4)),
            Arc::clone(&pool),
            vec![guard],
            ResolutionCache::new(Arc::new(resolver)),
            Renderer::new(Arc::new(TypeRegistry::new())),
            Duration::from_millis(100),
            Arc::new(DispatchStats::default()),
        );
        (dispatcher, pool)
    }

    #[test]
    fn test_malformed_message_is_written_with_decoded_prefix() {
        let sink = MemorySink::new("memory", Level::Info);
        let (mut dispatcher, pool) = dispatcher(&sink);
        let Acquired::Message(mut message) = pool.acquire(Level::Info, None) else {
            panic!("pool should have a free message");
        };
        message.append("ok ").append(5u32);
        message.encoded_mut()[3] = 0x60;

        dispatcher.dispatch(message);

        assert_eq!(
            sink.texts(),
            vec!["ok [undecodable message: unknown discriminant 0x60 at offset 3]"]
        );
        assert_eq!(dispatcher.stats.render_failures(), 1);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_dropping_dispatcher_marks_queue_drained() {
        let sink = MemorySink::new("memory", Level::Info);
        let (dispatcher, _pool) = dispatcher(&sink);
        let queue = Arc::clone(&dispatcher.queue);
        assert!(!queue.is_drained());
        drop(dispatcher);
        assert!(queue.is_drained());
    }
}
