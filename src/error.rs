use thiserror::Error;

/// Errors raised while setting up or tearing down a pipeline.
///
/// Nothing on the logging hot path returns this type: pool exhaustion,
/// buffer overflow and sink failures are all handled in place.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A logger rule refers to a sink that was never supplied.
    #[error("logger rule `{rule}` references unknown sink `{sink}`")]
    UnknownSink { rule: String, sink: String },

    /// Two different types were registered under the same type id.
    #[error("type id {type_id:#010x} already registered for `{existing}`, cannot register `{new}`")]
    TypeIdConflict {
        type_id: u32,
        existing: &'static str,
        new: &'static str,
    },

    /// The dispatcher thread could not be started.
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The pipeline has already been shut down.
    #[error("log manager is shut down")]
    ShutDown,

    /// The dispatcher thread panicked.
    #[error("dispatcher thread panicked")]
    DispatcherPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
