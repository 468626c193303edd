//! Relevance heatmaps.
//!
//! A relevance vector has one scalar per image token. Patch models map each
//! token to a grid cell, region models to a pixel rectangle; either way the
//! result is a single-channel [`Heatmap`] with values in `[0, 1]`.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use dvqa_core::{BoundingBox, CoreError, PatchIndex, Result};

/// Configuration for z-score heatmap normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// Lower clip bound, in standard deviations.
    pub clip_min: f32,
    /// Upper clip bound, in standard deviations.
    pub clip_max: f32,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            clip_min: 1.0,
            clip_max: 3.0,
        }
    }
}

impl HeatmapConfig {
    /// Set the clip range.
    #[must_use]
    pub fn with_clip(mut self, min: f32, max: f32) -> Self {
        self.clip_min = min;
        self.clip_max = max;
        self
    }
}

/// Single-channel heatmap, row-major, values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl Heatmap {
    /// Create a heatmap from row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if `values` is not `width * height` long.
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if values.len() != expected {
            return Err(CoreError::ShapeMismatch(format!(
                "heatmap {width}x{height} needs {expected} values, got {}",
                values.len()
            )));
        }
        Ok(Self {
            width,
            height,
            values,
        })
    }

    /// An all-zero heatmap.
    #[must_use]
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            values: vec![0.0; width as usize * height as usize],
        }
    }

    /// Width in cells or pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in cells or pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row-major values.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value at `(x, y)`, if inside.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.values
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Quantise to 8 bits and upscale to `width` x `height` with nearest
    /// neighbour sampling, so every patch stays a hard-edged block.
    ///
    /// Quantisation truncates: `0.999` becomes `254`.
    #[must_use]
    pub fn to_gray(&self, width: u32, height: u32) -> GrayImage {
        if self.width == 0 || self.height == 0 {
            return GrayImage::new(width, height);
        }
        let quantised = GrayImage::from_fn(self.width, self.height, |x, y| {
            let v = self.get(x, y).unwrap_or(0.0);
            Luma([quantise(v)])
        });
        if quantised.dimensions() == (width, height) {
            return quantised;
        }
        imageops::resize(&quantised, width, height, FilterType::Nearest)
    }
}

fn quantise(v: f32) -> u8 {
    if v.is_finite() {
        (v.clamp(0.0, 1.0) * 255.0) as u8
    } else {
        0
    }
}

/// Rescale to `[0, 1]` by min and max.
///
/// Constant input and input with non-finite entries yield all zeros.
pub fn normalize_min_max(values: &[f32]) -> Vec<f32> {
    if values.iter().any(|v| !v.is_finite()) {
        tracing::debug!("non-finite relevance, using zero heatmap");
        return vec![0.0; values.len()];
    }
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if !(range > 0.0) {
        tracing::debug!(len = values.len(), "constant relevance, using zero heatmap");
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - min) / range).collect()
}

/// Z-score with the sample standard deviation, clip, then min-max rescale.
///
/// Fewer than two values, zero variance or non-finite input yield all zeros.
pub fn zscore_clip_rescale(values: &[f32], config: &HeatmapConfig) -> Vec<f32> {
    let n = values.len();
    if n < 2 || values.iter().any(|v| !v.is_finite()) {
        tracing::debug!(len = n, "relevance cannot be standardised, using zero heatmap");
        return vec![0.0; n];
    }
    let mean = values.iter().sum::<f32>() / n as f32;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n - 1) as f32;
    let std = variance.sqrt();
    if !(std > 0.0) || !std.is_finite() {
        tracing::debug!(len = n, "zero variance relevance, using zero heatmap");
        return vec![0.0; n];
    }
    let clipped: Vec<f32> = values
        .iter()
        .map(|v| ((v - mean) / std).clamp(config.clip_min, config.clip_max))
        .collect();
    normalize_min_max(&clipped)
}

/// Scatter per-patch relevance into the model's patch grid and normalise.
///
/// Cells with no patch stay at zero before normalisation.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if `relevance` does not have one
/// entry per indexed patch.
pub fn patch_heatmap(
    relevance: &[f32],
    index: &PatchIndex,
    config: &HeatmapConfig,
) -> Result<Heatmap> {
    if relevance.len() != index.len() {
        return Err(CoreError::ShapeMismatch(format!(
            "{} relevance values for {} patches",
            relevance.len(),
            index.len()
        )));
    }
    let grid = index.grid();
    let mut cells = vec![0.0f32; grid.cells()];
    for (&(row, col), &value) in index.positions().iter().zip(relevance) {
        cells[row * grid.cols() + col] = value;
    }
    Heatmap::new(
        grid.cols() as u32,
        grid.rows() as u32,
        zscore_clip_rescale(&cells, config),
    )
}

/// Paint per-box relevance onto a `width` x `height` canvas and normalise.
///
/// Each box rectangle takes `max(current, score)`, so overlapping boxes keep
/// the larger score. Boxes are clamped to the canvas.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if `relevance` and `boxes` differ in length.
pub fn box_heatmap(
    relevance: &[f32],
    boxes: &[BoundingBox],
    width: u32,
    height: u32,
) -> Result<Heatmap> {
    if relevance.len() != boxes.len() {
        return Err(CoreError::ShapeMismatch(format!(
            "{} relevance values for {} boxes",
            relevance.len(),
            boxes.len()
        )));
    }
    let stride = width as usize;
    let mut canvas = vec![0.0f32; stride * height as usize];
    for (bbox, &score) in boxes.iter().zip(relevance) {
        let (x0, y0, x1, y1) = bbox.clamp_to(width, height);
        for y in y0..y1 {
            let row = &mut canvas[y as usize * stride..(y as usize + 1) * stride];
            for cell in &mut row[x0 as usize..x1 as usize] {
                *cell = cell.max(score);
            }
        }
    }
    Heatmap::new(width, height, normalize_min_max(&canvas))
}
