//! Error types for result export.

use thiserror::Error;

/// Result type alias for export operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Errors that can occur while exporting a prediction result.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Writing an image failed.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Serialising the report failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error.
    #[error("Core error: {0}")]
    Core(#[from] dvqa_core::CoreError),
}
