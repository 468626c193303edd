//! # dvqa_pipeline
//!
//! Explanation pipelines for visual question answering models.
//!
//! This crate provides:
//! - Traits for the external collaborators: [`PatchVqaModel`], [`BoxVqaModel`]
//!   and [`ObjectDetector`]
//! - [`PatchPipeline`]: token-to-patch transport heatmaps for single-stream models
//! - [`BoxPipeline`]: relevance heatmaps over detected regions for dual-stream models
//! - Recorded models that replay saved internals, and synthetic record generators
//!
//! ## Example
//!
//! ```rust,ignore
//! use dvqa_pipeline::{explain_patch_model, ExplainConfig};
//!
//! let config = ExplainConfig::default();
//! let result = explain_patch_model(&model, &image, "How many cars are there?", &config)?;
//! for (name, image) in result.named_visualizations() {
//!     image.save(format!("{name}.png"))?;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod boxes;
mod config;
mod error;
mod model;
mod patch;
mod recorded;

use burn::prelude::Backend;
use image::RgbImage;

use dvqa_analysis::PredictionResult;

pub use boxes::{BoxPipeline, RegionRelevance, DETECTOR_OVERVIEW_NAME};
pub use config::ExplainConfig;
pub use error::{BoxError, PipelineError, RecordError, Result};
pub use model::{
    logits_to_vec, one_hot, BoxForward, BoxVqaModel, ObjectDetector, PatchForward, PatchVqaModel,
};
pub use patch::{PatchPipeline, TokenRelevance, COMBINED_NAME};
pub use recorded::{
    load_record, save_record, synthetic_box_record, synthetic_patch_record, AttentionRecord,
    BoxRecord, CrossRecord, MapRecord, PatchRecord, RecordedBoxModel, RecordedDetector,
    RecordedPatchModel,
};

/// Explain a patch model's answer to `question` about `image`.
///
/// # Errors
///
/// See [`PatchPipeline::run`].
pub fn explain_patch_model<B, M>(
    model: &M,
    image: &RgbImage,
    question: &str,
    config: &ExplainConfig,
) -> Result<PredictionResult>
where
    B: Backend,
    M: PatchVqaModel<B>,
{
    PatchPipeline::new(config.clone()).run(model, image, question, None)
}

/// Like [`explain_patch_model`], reporting answer `target` instead of the top-1.
///
/// # Errors
///
/// Returns [`dvqa_core::CoreError::IndexOutOfRange`] if `target` is not a valid answer.
pub fn explain_patch_model_for_target<B, M>(
    model: &M,
    image: &RgbImage,
    question: &str,
    target: usize,
    config: &ExplainConfig,
) -> Result<PredictionResult>
where
    B: Backend,
    M: PatchVqaModel<B>,
{
    PatchPipeline::new(config.clone()).run(model, image, question, Some(target))
}

/// Explain a region model's answer to `question` about `image`.
///
/// # Errors
///
/// See [`BoxPipeline::run`].
pub fn explain_box_model<B, M, D>(
    model: &M,
    detector: &D,
    image: &RgbImage,
    question: &str,
    config: &ExplainConfig,
) -> Result<PredictionResult>
where
    B: Backend,
    M: BoxVqaModel<B>,
    D: ObjectDetector,
{
    BoxPipeline::new(config.clone()).run(model, detector, image, question, None)
}

/// Like [`explain_box_model`], explaining answer `target` instead of the top-1.
///
/// # Errors
///
/// Returns [`dvqa_core::CoreError::IndexOutOfRange`] if `target` is not a valid answer.
pub fn explain_box_model_for_target<B, M, D>(
    model: &M,
    detector: &D,
    image: &RgbImage,
    question: &str,
    target: usize,
    config: &ExplainConfig,
) -> Result<PredictionResult>
where
    B: Backend,
    M: BoxVqaModel<B>,
    D: ObjectDetector,
{
    BoxPipeline::new(config.clone()).run(model, detector, image, question, Some(target))
}
