//! Error types for dvqa_core.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Contract violations detected by the explanation core.
///
/// Numeric degeneracies (constant heatmaps, fully padded rows) are not errors:
/// they are recovered where they occur.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Invalid tensor shape provided.
    #[error("Invalid shape: expected {expected}, got {got}")]
    InvalidShape {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        got: String,
    },

    /// Shape mismatch between tensors.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Dimension error.
    #[error("Dimension error: expected {expected} dimensions, got {got}")]
    DimensionError {
        /// Expected number of dimensions.
        expected: usize,
        /// Actual number of dimensions.
        got: usize,
    },

    /// Requested index lies outside the addressed collection.
    #[error("Index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Length of the collection.
        len: usize,
    },

    /// A gradient-based rule was asked to run on a capture without gradients.
    #[error("Missing attention gradients: {0}")]
    MissingGradients(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor data could not be read back to the host.
    #[error("Tensor data error: {0}")]
    TensorData(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}
