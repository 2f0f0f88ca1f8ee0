//! Error types shared across sparsefleet roles.

use thiserror::Error;

/// The common error type used at role boundaries.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or contradictory configuration. Fatal at startup.
    #[error("Configuration error: {message}")]
    Config {
        /// A description of what is wrong with the configuration.
        message: String,
    },

    /// The requested algorithm name is not one of the supported handlers.
    #[error("Unknown algorithm: {name}")]
    UnknownAlgo {
        /// The algorithm name as given.
        name: String,
    },

    /// The requested data format has no reader.
    #[error("Unknown data format: {name}")]
    UnknownFormat {
        /// The format name as given.
        name: String,
    },

    /// A data file could not be read or contained a corrupt row.
    /// Fails the current partition; retried by the pool up to a bound.
    #[error("Reader error in {path}: {message}")]
    Reader {
        /// Path of the offending file.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// A transport-level failure (dead node, RPC error, timeout).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Model persistence failed. Fatal and surfaced non-zero.
    #[error("Save failed: {0}")]
    Save(String),

    /// Mismatched batch shapes on the wire or in a pipeline stage.
    #[error("Length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// The expected element count.
        expected: usize,
        /// The count actually received.
        actual: usize,
    },

    /// I/O error with the path it occurred on.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path of the file being accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Convenience constructor for configuration errors.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}

/// A specialized Result type for sparsefleet operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownAlgo {
            name: "adamw".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown algorithm: adamw");

        let err = Error::LengthMismatch {
            expected: 8,
            actual: 5,
        };
        assert_eq!(err.to_string(), "Length mismatch: expected 8, got 5");

        let err = Error::config("minibatch must be > 0");
        assert_eq!(
            err.to_string(),
            "Configuration error: minibatch must be > 0"
        );
    }
}
