//! External collaborators: VQA models and object detectors.
//!
//! The pipelines never run a transformer themselves. A model implementation
//! wraps whatever inference engine is available and hands back the internals
//! the explanation needs: logits, token embeddings and, for region models,
//! an [`AttentionCapture`] taken after a backward pass.

use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;

use dvqa_core::{tensor_to_vec, CoreError, Detections, EmbeddingSequence, PatchIndex};
use dvqa_explain::AttentionCapture;

/// Internals of one forward pass of a patch-based (single-stream) model.
#[derive(Debug, Clone)]
pub struct PatchForward<B: Backend> {
    /// Answer scores, `[1, vocab]`.
    pub logits: Tensor<B, 2>,
    /// Question token ids, one per text position.
    pub token_ids: Vec<u32>,
    /// Decoded question tokens, one per text position.
    pub tokens: Vec<String>,
    /// Final-layer text embeddings, batch 1.
    pub text: EmbeddingSequence<B>,
    /// Final-layer image embeddings, batch 1. Position 0 is the image
    /// aggregate token, positions `1..` are the patches of `patches`.
    pub image: EmbeddingSequence<B>,
    /// Grid cell of every image patch.
    pub patches: PatchIndex,
}

impl<B: Backend> PatchForward<B> {
    /// Check that the parts describe the same input.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] on any disagreement.
    pub fn validate(&self) -> dvqa_core::Result<()> {
        check_logits(&self.logits)?;
        if self.text.batch() != 1 || self.image.batch() != 1 {
            return Err(CoreError::ShapeMismatch(format!(
                "expected batch 1, got text {} and image {}",
                self.text.batch(),
                self.image.batch()
            )));
        }
        if self.tokens.len() != self.text.len() || self.token_ids.len() != self.text.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "{} text positions, {} tokens, {} token ids",
                self.text.len(),
                self.tokens.len(),
                self.token_ids.len()
            )));
        }
        if self.image.len() != self.patches.len() + 1 {
            return Err(CoreError::ShapeMismatch(format!(
                "{} image positions for {} patches plus the aggregate token",
                self.image.len(),
                self.patches.len()
            )));
        }
        Ok(())
    }
}

/// Outputs of one forward pass of a region-based (dual-stream) model.
#[derive(Debug, Clone)]
pub struct BoxForward<B: Backend> {
    /// Answer scores, `[1, vocab]`.
    pub logits: Tensor<B, 2>,
    /// Question token ids.
    pub token_ids: Vec<u32>,
    /// Decoded question tokens.
    pub tokens: Vec<String>,
}

/// A patch-based VQA model (single-stream, ViLT-like).
pub trait PatchVqaModel<B: Backend> {
    /// Error raised by the model.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Model name shown in results.
    fn name(&self) -> &str;

    /// Answer vocabulary, indexed like the logits.
    fn labels(&self) -> &[String];

    /// Run inference and return the final-layer internals.
    fn forward(&self, image: &RgbImage, question: &str) -> Result<PatchForward<B>, Self::Error>;
}

/// A region-based VQA model (dual-stream, LXMERT-like).
pub trait BoxVqaModel<B: Backend> {
    /// Error raised by the model.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Model name shown in results.
    fn name(&self) -> &str;

    /// Answer vocabulary, indexed like the logits.
    fn labels(&self) -> &[String];

    /// Run inference on a question and detected regions.
    fn forward(
        &self,
        question: &str,
        detections: &Detections,
    ) -> Result<BoxForward<B>, Self::Error>;

    /// Run forward and backward against `one_hot` (`[1, vocab]`) and return
    /// every attention map with its gradient.
    ///
    /// Each call must return a fresh capture: gradients from an earlier call
    /// may not leak into it.
    fn attention_capture(
        &self,
        question: &str,
        detections: &Detections,
        one_hot: Tensor<B, 2>,
    ) -> Result<AttentionCapture<B>, Self::Error>;
}

/// An object detector producing regions for region-based models.
pub trait ObjectDetector {
    /// Error raised by the detector.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Detect regions in an image.
    fn detect(&self, image: &RgbImage) -> Result<Detections, Self::Error>;
}

fn check_logits<B: Backend>(logits: &Tensor<B, 2>) -> dvqa_core::Result<()> {
    let [batch, _] = logits.dims();
    if batch != 1 {
        return Err(CoreError::ShapeMismatch(format!(
            "expected logits of batch 1, got {batch}"
        )));
    }
    Ok(())
}

/// Host copy of batch-1 logits.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] for a batch other than 1.
pub fn logits_to_vec<B: Backend>(logits: &Tensor<B, 2>) -> dvqa_core::Result<Vec<f32>> {
    check_logits(logits)?;
    tensor_to_vec(logits.clone())
}

/// `[1, vocab]` one-hot row selecting `target`.
///
/// # Errors
///
/// Returns [`CoreError::IndexOutOfRange`] if `target >= vocab`.
pub fn one_hot<B: Backend>(
    target: usize,
    vocab: usize,
    device: &B::Device,
) -> dvqa_core::Result<Tensor<B, 2>> {
    if target >= vocab {
        return Err(CoreError::IndexOutOfRange {
            index: target,
            len: vocab,
        });
    }
    let mut row = vec![0.0f32; vocab];
    row[target] = 1.0;
    Ok(Tensor::from_data(TensorData::new(row, [1, vocab]), device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvqa_core::backend::NdArray;
    use dvqa_core::PatchGrid;

    type TestBackend = NdArray;

    #[test]
    fn test_one_hot() {
        let device = Default::default();
        let row = one_hot::<TestBackend>(2, 4, &device).unwrap();
        assert_eq!(tensor_to_vec(row).unwrap(), vec![0.0, 0.0, 1.0, 0.0]);
        assert!(matches!(
            one_hot::<TestBackend>(4, 4, &device),
            Err(CoreError::IndexOutOfRange { index: 4, len: 4 })
        ));
    }

    #[test]
    fn test_logits_batch_checked() {
        let device = Default::default();
        let ok = Tensor::<TestBackend, 2>::zeros([1, 3], &device);
        assert_eq!(logits_to_vec(&ok).unwrap().len(), 3);
        let batched = Tensor::<TestBackend, 2>::zeros([2, 3], &device);
        assert!(logits_to_vec(&batched).is_err());
    }

    #[test]
    fn test_patch_forward_validation() {
        let device = Default::default();
        let text = EmbeddingSequence::<TestBackend>::unpadded(Tensor::ones([1, 3, 4], &device));
        let image = EmbeddingSequence::<TestBackend>::unpadded(Tensor::ones([1, 5, 4], &device));
        let mut forward = PatchForward {
            logits: Tensor::zeros([1, 2], &device),
            token_ids: vec![1, 2, 3],
            tokens: vec!["[CLS]".into(), "car".into(), "[SEP]".into()],
            text,
            image,
            patches: PatchIndex::dense(PatchGrid::new(2, 2)),
        };
        assert!(forward.validate().is_ok());

        forward.tokens.pop();
        assert!(forward.validate().is_err());
    }
}
