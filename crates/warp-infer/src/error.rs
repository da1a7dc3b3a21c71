//! Session cache error types

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineError;

/// Session cache error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Model file does not exist or is not a regular file
    #[error("Model not found: {path}")]
    ModelNotFound {
        /// Path where the model was expected
        path: PathBuf,
    },

    /// Model file exists but holds no bytes
    #[error("Model file is empty: {path}")]
    EmptyModel {
        /// Path of the empty file
        path: PathBuf,
    },

    /// IO error while reading a model
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine reported no execution backend at all
    #[error("No execution backend available")]
    NoBackendAvailable,

    /// The inference engine failed while building or running a session
    #[error("Engine error in session {session}: {source}")]
    Engine {
        /// Key of the session that failed
        session: String,
        /// Underlying engine failure
        #[source]
        source: EngineError,
    },

    /// No session is registered under this key
    #[error("Session not found: {key}")]
    NotFound {
        /// Requested key
        key: String,
    },

    /// Caller supplied a different number of inputs than the model declares
    #[error("Input count mismatch: expected {expected}, got {actual}")]
    InputCountMismatch {
        /// Inputs declared by the model
        expected: usize,
        /// Inputs supplied by the caller
        actual: usize,
    },

    /// The session was evicted or deleted and its engine handle released
    #[error("Session released: {key}")]
    SessionReleased {
        /// Key of the released session
        key: String,
    },

    /// An asynchronous run did not finish before the caller's deadline
    #[error("Run did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    /// A background run task failed to join
    #[error("Background run failed: {0}")]
    Join(String),

    /// Background work was requested outside of a tokio runtime
    #[error("No tokio runtime available for background work")]
    NoRuntime,

    /// Invalid configuration file or environment override
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this is a "not found" outcome rather than a failure
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the error was caused by how the caller used the API
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::InputCountMismatch { .. } | Self::SessionReleased { .. }
        )
    }

    /// Whether the error came from the inference engine
    #[must_use]
    pub fn is_engine(&self) -> bool {
        matches!(self, Self::Engine { .. })
    }

    pub(crate) fn engine(session: &str, source: EngineError) -> Self {
        Self::Engine {
            session: session.to_string(),
            source,
        }
    }
}

/// Result type for session cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = Error::NotFound { key: "m1".into() };
        assert!(not_found.is_not_found());
        assert!(not_found.is_usage());
        assert!(!not_found.is_engine());

        let mismatch = Error::InputCountMismatch {
            expected: 3,
            actual: 2,
        };
        assert!(mismatch.is_usage());
        assert_eq!(mismatch.to_string(), "Input count mismatch: expected 3, got 2");

        let engine = Error::engine("m1", EngineError::Execution("boom".into()));
        assert!(engine.is_engine());
        assert!(!engine.is_usage());
        assert!(engine.to_string().contains("m1"));
    }
}
