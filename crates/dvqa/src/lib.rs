//! # dvqa
//!
//! Attention-based visual explanations for drone visual question answering.
//!
//! dvqa-rs answers "why did the model say that?" for two model families:
//!
//! - **Patch models** (single-stream, ViLT-like): question tokens are aligned
//!   with image patches by optimal transport, giving one heatmap per token
//! - **Region models** (dual-stream, LXMERT-like): relevance is propagated
//!   through every attention layer (rollout, Grad-CAM, gradient-weighted
//!   redistribution), giving one heatmap per rule over the detected regions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dvqa::prelude::*;
//!
//! let record = synthetic_patch_record(Seed::new(42), 3, PatchGrid::new(7, 7));
//! let model = RecordedPatchModel::<NdArray>::new(record, Default::default());
//!
//! let result = explain_patch_model(&model, &image, "How many cars?", &ExplainConfig::default())?;
//! export_result(&result, "./exports/run-1", &ExportConfig::default())?;
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-ndarray` (default): CPU backend using ndarray

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export all crates
pub use dvqa_analysis as analysis;
pub use dvqa_core as core;
pub use dvqa_explain as explain;
pub use dvqa_imaging as imaging;
pub use dvqa_pipeline as pipeline;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use dvqa::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use dvqa_core::{
        BoundingBox, CoreError, DetectedLabel, Detections, EmbeddingSequence, PatchGrid,
        PatchIndex, Region, Seed,
    };

    #[cfg(feature = "backend-ndarray")]
    pub use dvqa_core::backend::NdArray;

    // Explanation numerics
    pub use dvqa_explain::{
        align, AlignmentConfig, AttentionCapture, AttentionMap, CrossModalLayer,
        RedistributionConfig, RelevanceKind, RelevanceMethod, RelevanceRule,
    };

    // Imaging
    pub use dvqa_imaging::{Heatmap, HeatmapConfig};

    // Results
    pub use dvqa_analysis::{export_result, ExportConfig, PredictionResult, TopPrediction};

    // Pipelines
    pub use dvqa_pipeline::{
        explain_box_model, explain_box_model_for_target, explain_patch_model,
        explain_patch_model_for_target, synthetic_box_record, synthetic_patch_record,
        BoxPipeline, BoxVqaModel, ExplainConfig, ObjectDetector, PatchPipeline, PatchVqaModel,
        PipelineError, RecordedBoxModel, RecordedDetector, RecordedPatchModel,
    };
}
