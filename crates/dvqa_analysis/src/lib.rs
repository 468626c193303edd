//! # dvqa_analysis
//!
//! Prediction aggregation and result export for dvqa-rs.
//!
//! This crate provides:
//! - Softmax and stable top-k ranking of answer scores
//! - The [`PredictionResult`] handed to display and export surfaces
//! - File-name sanitising for visualisation names
//! - Export of a result as images plus a JSON report

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod export;
mod prediction;

pub use error::{ExportError, Result};
pub use export::{
    export_result, AltAnswer, ExportConfig, ExportedFiles, ReportSettings, ResultReport,
    WeatherSetting, BASE_IMAGE_FILE, REPORT_FILE,
};
pub use prediction::{
    argmax, sanitize_name, softmax, top_k, PredictionResult, TopPrediction, DEFAULT_TOP_K,
};
