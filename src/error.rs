//! Error types for the adaptive optimization subsystem
//!
//! Most conditions in the feedback loop are not errors at all: lookup
//! failures, policy rejections, stale cache entries and missing type feedback
//! all degrade to ordinary results. What remains here is the small set of
//! conditions that must surface to the embedder.

use std::fmt;
use thiserror::Error;

/// Kind of handle that failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Class id not present in the class table
    Class,
    /// Method id not present in the class table
    Method,
    /// Native method id not present in the code table
    NativeMethod,
    /// Process id not present in the process table
    Process,
    /// Frame index outside of a process stack
    Frame,
    /// Call-site cache index outside of a native method
    CallSite,
    /// Uncommon trap index outside of a native method
    Trap,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Class => write!(f, "class"),
            HandleKind::Method => write!(f, "method"),
            HandleKind::NativeMethod => write!(f, "native method"),
            HandleKind::Process => write!(f, "process"),
            HandleKind::Frame => write!(f, "frame"),
            HandleKind::CallSite => write!(f, "call site"),
            HandleKind::Trap => write!(f, "uncommon trap"),
        }
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// Unrecoverable VM condition; the embedder must terminate
    #[error("FatalError: {0}")]
    Fatal(String),

    /// A handle did not name a live object
    #[error("InvalidHandle: unknown {kind} {index}")]
    InvalidHandle { kind: HandleKind, index: usize },

    /// No method answers a send and no fallback applies
    #[error("LookupError: {0} not understood")]
    NotUnderstood(String),

    /// Invalid configuration value
    #[error("ConfigError: {0}")]
    Config(String),

    /// Inlining database content could not be decoded or applied
    #[error("DatabaseError: {0}")]
    Database(String),

    /// JSON encoding/decoding error
    #[error("JsonError: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Binary encoding/decoding error
    #[error("BincodeError: {source}")]
    Bincode {
        #[from]
        source: bincode::Error,
    },

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Error::Fatal(message.into())
    }

    /// Create an invalid-handle error
    pub fn invalid_handle(kind: HandleKind, index: usize) -> Self {
        Error::InvalidHandle { kind, index }
    }

    /// Create a message-not-understood error
    pub fn not_understood(message: impl Into<String>) -> Self {
        Error::NotUnderstood(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Error::Database(message.into())
    }

    /// Whether the embedder must terminate after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::fatal("lookup failure in scheduler");
        assert_eq!(err.to_string(), "FatalError: lookup failure in scheduler");
        assert!(err.is_fatal());

        let err = Error::invalid_handle(HandleKind::NativeMethod, 7);
        assert_eq!(err.to_string(), "InvalidHandle: unknown native method 7");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Json { .. }));
    }
}
