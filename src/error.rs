//! Error types for peft-dora.

use thiserror::Error;

/// Result type alias for peft-dora operations.
pub type Result<T> = std::result::Result<T, DoraError>;

/// Errors that can occur while decomposing or applying DoRA weights.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DoraError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch between the reported and materialized base weight.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Dimension mismatch.
    #[error("dimension mismatch: {message}")]
    DimensionMismatch {
        /// Descriptive message
        message: String,
    },

    /// A forward strategy was invoked on a decomposition of another layer kind.
    #[error("layer kind mismatch: decomposition is {actual}, called as {expected}")]
    LayerKindMismatch {
        /// Kind required by the called operation
        expected: &'static str,
        /// Kind the decomposition was built for
        actual: &'static str,
    },

    /// The magnitude has not been computed yet.
    #[error("weight decomposition used before update_layer")]
    Uninitialized,

    /// `update_layer` was called a second time.
    #[error("weight decomposition is already initialized")]
    AlreadyInitialized,

    /// `unmerge` was called without a preceding `merge`.
    #[error("no cached weight norm: adapter was not merged")]
    NotMerged,

    /// Parameter gathering failed.
    #[error("failed to gather parameters: {0}")]
    Gather(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
