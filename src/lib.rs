//! # Pooled Logger
//!
//! A logging pipeline that keeps formatting and I/O off the threads that log.
//!
//! * **No allocation on the hot path**: events are written into buffers taken
//!   from a fixed pool created at startup
//! * **No blocking I/O on the hot path**: a single dispatcher thread decodes
//!   events and writes them to sinks
//! * **Fault isolation**: a sink that fails is quarantined for a while
//!   without affecting the other sinks or the producers
//!
//! ## How it works
//!
//! A producer asks a [`Logger`] for an event at some level. If the level is
//! enabled the logger takes a [`Message`](message::Message) from the
//! [`MessagePool`](pool::MessagePool), the producer appends typed values to
//! it, and `submit` moves it onto the [`HandoffQueue`](queue::HandoffQueue).
//! Each value is stored as a one-byte type tag followed by its raw bytes;
//! strings are kept by reference. The dispatcher takes messages off the
//! queue in order, renders each one once, hands the result to every sink
//! routed for the logger, and returns the message to the pool.
//!
//! ## Main Components
//!
//! * [`LogManager`]: owns the pool, the queue and the dispatcher thread
//! * [`Logger`] / [`LogMessage`]: producer API
//! * [`message`]: the buffer encoding
//! * [`decoder`] and [`render`]: turning buffers back into text
//! * [`sink`]: the [`Sink`] trait and the quarantine wrapper
//! * [`config`]: pipeline settings and logger-name routing
//!
//! ## Quick Start
//!
//! ```
//! use pooled_logger::{Level, LogManager, PipelineConfig};
//! use pooled_logger::sinks::MemorySink;
//!
//! let sink = MemorySink::new("memory", Level::Info);
//! let manager = LogManager::initialize(
//!     PipelineConfig::default(),
//!     vec![Box::new(sink.clone())],
//!     Vec::new(),
//! )?;
//!
//! let logger = manager.logger("app.startup");
//! logger.info().append("Loaded ").append(12u32).append(" plugins").submit();
//! logger
//!     .warn()
//!     .format("{0} took {1}ms")
//!     .append("config")
//!     .append_formatted(3.5f64, ".1")
//!     .submit();
//!
//! manager.shutdown()?;
//! assert_eq!(sink.texts(), vec!["Loaded 12 plugins", "config took 3.5ms"]);
//! # Ok::<(), pooled_logger::Error>(())
//! ```

pub mod argument;
pub mod clock;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod format_spec;
pub mod level;
pub mod manager;
pub mod message;
pub mod pool;
pub mod queue;
pub mod render;
pub mod segment;
pub mod sink;
pub mod sinks;
pub mod type_registry;

pub use argument::{Decimal, EnumArg, StrRef};
pub use config::{LoggerRule, PipelineConfig};
pub use error::{Error, Result};
pub use level::Level;
pub use manager::{LogManager, LogMessage, Logger};
pub use pool::ExhaustionStrategy;
pub use sink::{Sink, SinkError};
pub use type_registry::{register_enum, register_struct, LogEnum, UnmanagedStruct};
