//! Error handling for procpulse.
use thiserror::Error;

/// Errors raised while loading or resolving the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A `${VAR}` reference in the configuration could not be resolved.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
}

/// Errors raised by the history segment writer.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The segment directory could not be created.
    #[error("failed to create history directory: {0}")]
    CreateDir(std::io::Error),

    /// A segment could not be opened or appended to.
    #[error("failed to write history segment: {0}")]
    SegmentWrite(std::io::Error),

    /// A snapshot could not be encoded as JSON.
    #[error("failed to serialise history record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Umbrella error for fallible setup paths of the telemetry engine.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Configuration failure.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// History persistence failure.
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `TelemetryError`.
impl<T> From<std::sync::PoisonError<T>> for TelemetryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TelemetryError::MutexPoisonError(err.to_string())
    }
}

/// Errors raised when delivering a payload to an observer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ObserverError {
    /// The observer was closed or its consumer went away.
    #[error("observer is closed")]
    Closed,

    /// The observer could not accept the payload without blocking.
    #[error("observer is not keeping up")]
    Full,
}
