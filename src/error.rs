//! Error types raised while assembling or running the networks.

use thiserror::Error;

/// Result type for network assembly and forward passes.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// Incompatible flag combination or dimensions, raised at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A forward-time input does not match the configured shapes.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// Adaptive parameters do not cover the registered AdaIN layers.
    #[error("AdaIN parameter mismatch: {expected} required, {actual} supplied")]
    AdaInParameterMismatch { expected: usize, actual: usize },
}

impl NetworkError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn shape(
        what: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            what,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}
