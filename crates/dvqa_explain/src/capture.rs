//! Attention capture records.
//!
//! A capture is a snapshot of every attention map (and, after a backward pass,
//! its gradient) produced by one forward pass of a dual-stream encoder. It is
//! built once per explanation request and never mutated afterwards, so no
//! gradient from an earlier request can leak into a later one.

use burn::prelude::*;

use dvqa_core::{CoreError, Result};

/// One attention block: weights and optional gradients, both `(heads, queries, keys)`.
#[derive(Debug, Clone)]
pub struct AttentionMap<B: Backend> {
    /// Post-softmax attention probabilities.
    pub weights: Tensor<B, 3>,
    /// Gradient of the target score with respect to `weights`.
    pub gradients: Option<Tensor<B, 3>>,
}

impl<B: Backend> AttentionMap<B> {
    /// Create a map without gradients.
    pub fn new(weights: Tensor<B, 3>) -> Self {
        Self {
            weights,
            gradients: None,
        }
    }

    /// Attach gradients.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if gradients and weights differ in shape.
    pub fn with_gradients(mut self, gradients: Tensor<B, 3>) -> Result<Self> {
        if gradients.dims() != self.weights.dims() {
            return Err(CoreError::ShapeMismatch(format!(
                "attention weights {:?} vs gradients {:?}",
                self.weights.dims(),
                gradients.dims()
            )));
        }
        self.gradients = Some(gradients);
        Ok(self)
    }

    /// `[heads, queries, keys]`.
    #[must_use]
    pub fn dims(&self) -> [usize; 3] {
        self.weights.dims()
    }

    /// Gradients, or [`CoreError::MissingGradients`] naming `what`.
    pub(crate) fn require_gradients(&self, what: &str) -> Result<Tensor<B, 3>> {
        self.gradients
            .clone()
            .ok_or_else(|| CoreError::MissingGradients(what.to_string()))
    }
}

/// Attention maps of one cross-modal encoder layer.
#[derive(Debug, Clone)]
pub struct CrossModalLayer<B: Backend> {
    /// Text queries attending to image keys, `(h, Lt, Li)`.
    pub text_to_image: AttentionMap<B>,
    /// Image queries attending to text keys, `(h, Li, Lt)`.
    pub image_to_text: AttentionMap<B>,
    /// Text self-attention following the cross block, `(h, Lt, Lt)`.
    pub text_self: AttentionMap<B>,
    /// Image self-attention following the cross block, `(h, Li, Li)`.
    pub image_self: AttentionMap<B>,
}

/// Every attention map of a dual-stream encoder for one input pair.
///
/// Layers are ordered from input to output: single-modality text layers,
/// single-modality image layers, then the cross-modal layers.
#[derive(Debug, Clone)]
pub struct AttentionCapture<B: Backend> {
    text_layers: Vec<AttentionMap<B>>,
    image_layers: Vec<AttentionMap<B>>,
    cross_layers: Vec<CrossModalLayer<B>>,
    target: Option<usize>,
    text_tokens: usize,
    image_regions: usize,
}

fn check_dims(what: &str, got: [usize; 3], queries: usize, keys: usize) -> Result<()> {
    if got[1] != queries || got[2] != keys {
        return Err(CoreError::ShapeMismatch(format!(
            "{what}: expected (_, {queries}, {keys}), got {got:?}"
        )));
    }
    Ok(())
}

impl<B: Backend> AttentionCapture<B> {
    /// Assemble and validate a capture.
    ///
    /// Token and region counts are read from the first cross-modal layer; every
    /// other map must agree with them.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidShape`] without cross-modal layers and
    /// [`CoreError::ShapeMismatch`] when any map disagrees with the counts.
    pub fn new(
        text_layers: Vec<AttentionMap<B>>,
        image_layers: Vec<AttentionMap<B>>,
        cross_layers: Vec<CrossModalLayer<B>>,
    ) -> Result<Self> {
        let first = cross_layers.first().ok_or_else(|| CoreError::InvalidShape {
            expected: "at least one cross-modal layer".to_string(),
            got: "0 cross-modal layers".to_string(),
        })?;
        let [_, lt, li] = first.text_to_image.dims();

        for (i, map) in text_layers.iter().enumerate() {
            check_dims(&format!("text layer {i}"), map.dims(), lt, lt)?;
        }
        for (i, map) in image_layers.iter().enumerate() {
            check_dims(&format!("image layer {i}"), map.dims(), li, li)?;
        }
        for (i, layer) in cross_layers.iter().enumerate() {
            check_dims(
                &format!("cross layer {i} text->image"),
                layer.text_to_image.dims(),
                lt,
                li,
            )?;
            check_dims(
                &format!("cross layer {i} image->text"),
                layer.image_to_text.dims(),
                li,
                lt,
            )?;
            check_dims(&format!("cross layer {i} text self"), layer.text_self.dims(), lt, lt)?;
            check_dims(&format!("cross layer {i} image self"), layer.image_self.dims(), li, li)?;
        }

        Ok(Self {
            text_layers,
            image_layers,
            cross_layers,
            target: None,
            text_tokens: lt,
            image_regions: li,
        })
    }

    /// Record the answer index the gradients were taken against.
    #[must_use]
    pub fn with_target(mut self, target: usize) -> Self {
        self.target = Some(target);
        self
    }

    /// Answer index the gradients belong to, if known.
    #[must_use]
    pub const fn target(&self) -> Option<usize> {
        self.target
    }

    /// Single-modality text layers.
    #[must_use]
    pub fn text_layers(&self) -> &[AttentionMap<B>] {
        &self.text_layers
    }

    /// Single-modality image layers.
    #[must_use]
    pub fn image_layers(&self) -> &[AttentionMap<B>] {
        &self.image_layers
    }

    /// Cross-modal layers.
    #[must_use]
    pub fn cross_layers(&self) -> &[CrossModalLayer<B>] {
        &self.cross_layers
    }

    /// The final cross-modal layer.
    #[must_use]
    pub fn last_cross_layer(&self) -> &CrossModalLayer<B> {
        // `new` guarantees at least one cross layer.
        &self.cross_layers[self.cross_layers.len() - 1]
    }

    /// Number of text tokens (`Lt`).
    #[must_use]
    pub const fn text_tokens(&self) -> usize {
        self.text_tokens
    }

    /// Number of image regions (`Li`).
    #[must_use]
    pub const fn image_regions(&self) -> usize {
        self.image_regions
    }

    /// Whether every map carries gradients.
    #[must_use]
    pub fn has_gradients(&self) -> bool {
        let cross_ok = self.cross_layers.iter().all(|l| {
            l.text_to_image.gradients.is_some()
                && l.image_to_text.gradients.is_some()
                && l.text_self.gradients.is_some()
                && l.image_self.gradients.is_some()
        });
        cross_ok
            && self.text_layers.iter().all(|m| m.gradients.is_some())
            && self.image_layers.iter().all(|m| m.gradients.is_some())
    }

    /// The device the maps live on.
    pub fn device(&self) -> B::Device {
        self.last_cross_layer().text_to_image.weights.device()
    }
}
