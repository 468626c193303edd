//! Error types for explanation pipelines.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Boxed error raised by an external collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while explaining a prediction.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The VQA model failed; its error is kept as the source.
    #[error("Model failed: {0}")]
    Model(#[source] BoxError),

    /// The object detector failed; its error is kept as the source.
    #[error("Detector failed: {0}")]
    Detector(#[source] BoxError),

    /// Shape, index or numeric contract violation.
    #[error("Core error: {0}")]
    Core(#[from] dvqa_core::CoreError),

    /// Reading or writing a record failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record or config could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Wrap a model error.
    pub fn model<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Model(Box::new(err))
    }

    /// Wrap a detector error.
    pub fn detector<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Detector(Box::new(err))
    }
}

/// Errors raised when replaying a recorded model.
#[derive(Error, Debug)]
pub enum RecordError {
    /// The record contradicts itself or the request.
    #[error("Inconsistent record: {0}")]
    Inconsistent(String),

    /// Gradients were recorded against a different answer.
    #[error("Record holds gradients for answer {recorded}, requested {requested}")]
    TargetMismatch {
        /// Answer the gradients belong to.
        recorded: usize,
        /// Answer that was requested.
        requested: usize,
    },

    /// Core error.
    #[error("Core error: {0}")]
    Core(#[from] dvqa_core::CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_model_error_keeps_source() {
        let err = PipelineError::model(RecordError::Inconsistent("bad logits".to_string()));
        assert!(err.to_string().contains("bad logits"));
        let source = err.source().unwrap();
        assert!(source.downcast_ref::<RecordError>().is_some());
    }
}
