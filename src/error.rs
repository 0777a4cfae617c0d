use thiserror::Error;

use crate::buffer::BufferPhase;

/// Result type for buffer and trainer operations
pub type Result<T> = std::result::Result<T, AccError>;

/// Main error type for the experience buffer and the dual-head trainer
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AccError {
    /// A tensor handed to the buffer or trainer does not have the declared shape
    #[error("Shape mismatch for '{what}': expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// `insert_act` was called more often than the horizon allows
    #[error("Buffer overrun: horizon of {horizon} steps is already full")]
    BufferOverrun { horizon: usize },

    /// The horizon is not full yet
    #[error("Episode incomplete: {step} of {horizon} steps inserted")]
    IncompleteEpisode { step: usize, horizon: usize },

    /// An operation was attempted in the wrong buffer phase
    #[error("Cannot {operation} while buffer is {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: BufferPhase,
    },

    /// Invalid configuration or argument value
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Error reported by a policy or language module
    #[error("Policy error: {0}")]
    Policy(String),

    /// Configuration file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for AccError {
    fn from(err: std::io::Error) -> Self {
        AccError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AccError {
    fn from(err: serde_json::Error) -> Self {
        AccError::Config(err.to_string())
    }
}

impl From<ndarray::ShapeError> for AccError {
    fn from(err: ndarray::ShapeError) -> Self {
        AccError::ShapeMismatch {
            what: "reshape".to_string(),
            expected: "a shape with the same number of elements".to_string(),
            actual: err.to_string(),
        }
    }
}

// Helper functions for common error patterns
impl AccError {
    pub fn shape_mismatch<S: Into<String>>(what: S, expected: &[usize], actual: &[usize]) -> Self {
        AccError::ShapeMismatch {
            what: what.into(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }

    pub fn invalid_parameter<S: Into<String>, R: Into<String>>(name: S, reason: R) -> Self {
        AccError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
