use thiserror::Error;

/// Error types for change-data-capture streaming
///
/// Errors fall into two groups. `Config`, `Spawn` and `InvalidState` are
/// returned synchronously from `Stream::start()`. `Decode` and
/// `UnexpectedTermination` are only ever delivered through
/// `Stream::finished()`, exactly once per stream.
#[derive(Error, Debug)]
pub enum CdcError {
    /// Invalid connection parameters or slot name
    #[error("Configuration error: {0}")]
    Config(String),

    /// The reader subprocess could not be created
    #[error("Failed to spawn reader process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A frame length or payload could not be parsed
    #[error("Decode error: {0}")]
    Decode(String),

    /// The reader exited or closed its output while the stream was running
    #[error("Reader terminated unexpectedly: {0}")]
    UnexpectedTermination(String),

    /// The consumer left the queue full past the shutdown deadline
    #[error("{0} events were dropped because the event queue stayed full past the shutdown deadline")]
    EventsDropped(u64),

    /// Malformed textual log position
    #[error("Invalid log position '{input}': {reason}")]
    LogPosFormat { input: String, reason: String },

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid stream state: {0}")]
    InvalidState(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdcError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CdcError::Config(msg.into())
    }

    /// Create a new spawn error for the given program
    pub fn spawn<S: Into<String>>(program: S, source: std::io::Error) -> Self {
        CdcError::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        CdcError::Decode(msg.into())
    }

    /// Create a new unexpected termination error
    pub fn unexpected_termination<S: Into<String>>(msg: S) -> Self {
        CdcError::UnexpectedTermination(msg.into())
    }

    /// Create a new log position format error
    pub fn log_pos_format<I: Into<String>, R: Into<String>>(input: I, reason: R) -> Self {
        CdcError::LogPosFormat {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        CdcError::InvalidState(msg.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, CdcError::Config(_))
    }

    pub fn is_spawn(&self) -> bool {
        matches!(self, CdcError::Spawn { .. })
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, CdcError::Decode(_))
    }

    pub fn is_unexpected_termination(&self) -> bool {
        matches!(self, CdcError::UnexpectedTermination(_))
    }

    pub fn is_events_dropped(&self) -> bool {
        matches!(self, CdcError::EventsDropped(_))
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CdcError::config("bad port").is_config());
        assert!(CdcError::decode("short frame").is_decode());
        assert!(CdcError::unexpected_termination("eof").is_unexpected_termination());
        assert!(CdcError::EventsDropped(4).is_events_dropped());
        assert!(CdcError::EventsDropped(4).to_string().starts_with("4 events"));

        let err = CdcError::spawn(
            "pg_logical_stream",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.is_spawn());
        assert!(!err.is_decode());
        assert!(err.to_string().contains("pg_logical_stream"));
    }

    #[test]
    fn test_log_pos_format_message() {
        let err = CdcError::log_pos_format("0/XYZ", "invalid hex digit");
        assert_eq!(
            err.to_string(),
            "Invalid log position '0/XYZ': invalid hex digit"
        );
    }
}
