//! # dvqa_imaging
//!
//! Heatmap rendering and compositing for dvqa-rs.
//!
//! This crate provides:
//! - Patch-grid and bounding-box relevance heatmaps
//! - Alpha overlays and their last-write-wins combination (patch models)
//! - Multiplicative blending (region models)
//! - Detector overviews with one labelled outline per region
//!
//! ## Example
//!
//! ```rust,ignore
//! use dvqa_imaging::{alpha_overlay, patch_heatmap, HeatmapConfig};
//!
//! let heat = patch_heatmap(&relevance, &patch_index, &HeatmapConfig::default())?;
//! let overlay = alpha_overlay(&image, &heat.to_gray(image.width(), image.height()))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod composite;
mod heatmap;

pub use composite::{
    alpha_overlay, class_color, combine_overlays, draw_regions, flatten_rgba,
    multiplicative_blend, region_label, WHITE,
};
pub use heatmap::{
    box_heatmap, normalize_min_max, patch_heatmap, zscore_clip_rescale, Heatmap, HeatmapConfig,
};
