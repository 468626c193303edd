//! Explanations for patch-based models.
//!
//! Final-layer text tokens are aligned with image patches by optimal
//! transport. Every question token gets a heatmap of the patches it sends
//! the most mass to, and one combined overview paints all token heatmaps
//! on top of each other.

use burn::prelude::*;
use burn::tensor::TensorData;
use image::{GrayImage, RgbImage};

use dvqa_analysis::{argmax, top_k, PredictionResult};
use dvqa_core::{CoreError, EmbeddingSequence};
use dvqa_explain::align;
use dvqa_imaging::{alpha_overlay, combine_overlays, flatten_rgba, patch_heatmap, WHITE};

use crate::config::ExplainConfig;
use crate::error::{PipelineError, Result};
use crate::model::{logits_to_vec, PatchForward, PatchVqaModel};

/// Name of the combined overview image.
pub const COMBINED_NAME: &str = "Combined Attention Patches";

/// Transport mass of one question token over the image patches.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRelevance {
    /// Position of the token in the text sequence.
    pub position: usize,
    /// Decoded token.
    pub token: String,
    /// One value per patch, in patch index order.
    pub patches: Vec<f32>,
}

impl TokenRelevance {
    /// Visualisation name of the token.
    #[must_use]
    pub fn name(&self) -> String {
        format!("Token {} - '{}'", self.position, self.token)
    }
}

/// Padding mask with the aggregate token (position 0) and the last valid
/// position also masked.
fn mask_special_tokens(padding: &[bool]) -> Vec<bool> {
    let last_valid = padding.iter().rposition(|&pad| !pad);
    padding
        .iter()
        .enumerate()
        .map(|(i, &pad)| pad || i == 0 || Some(i) == last_valid)
        .collect()
}

/// Padding mask with the image aggregate token (position 0) masked.
fn mask_image_aggregate(padding: &[bool]) -> Vec<bool> {
    padding
        .iter()
        .enumerate()
        .map(|(i, &pad)| pad || i == 0)
        .collect()
}

fn remask<B: Backend>(seq: &EmbeddingSequence<B>, mask: Vec<bool>) -> Result<EmbeddingSequence<B>> {
    let len = mask.len();
    let padding = Tensor::<B, 2, Bool>::from_data(TensorData::new(mask, [1, len]), &seq.device());
    Ok(seq.clone().with_padding(padding)?)
}

fn single_row(rows: Vec<Vec<bool>>) -> Result<Vec<bool>> {
    rows.into_iter().next().ok_or_else(|| {
        PipelineError::Core(CoreError::ShapeMismatch("empty padding mask".to_string()))
    })
}

/// Orchestrates the patch-model explanation.
#[derive(Debug, Clone, Default)]
pub struct PatchPipeline {
    config: ExplainConfig,
}

impl PatchPipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(config: ExplainConfig) -> Self {
        Self { config }
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &ExplainConfig {
        &self.config
    }

    /// Per-token patch relevance from one forward pass.
    ///
    /// Only real question tokens are returned: padding, the aggregate token
    /// and the trailing separator are masked out before alignment. The plan
    /// is rescaled by the number of remaining tokens and the image aggregate
    /// position is dropped from every row.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass is inconsistent.
    pub fn token_relevance<B: Backend>(
        &self,
        forward: &PatchForward<B>,
    ) -> Result<Vec<TokenRelevance>> {
        forward.validate()?;

        let text_mask = mask_special_tokens(&single_row(forward.text.padding_rows()?)?);
        let image_mask = mask_image_aggregate(&single_row(forward.image.padding_rows()?)?);
        let kept: Vec<usize> = text_mask
            .iter()
            .enumerate()
            .filter(|(_, masked)| !**masked)
            .map(|(i, _)| i)
            .collect();

        let text = remask(&forward.text, text_mask)?;
        let image = remask(&forward.image, image_mask)?;
        let plan = align(&text, &image, &self.config.alignment)?.rescaled(kept.len().max(1) as f32);

        kept.into_iter()
            .map(|position| {
                let row = plan.token_relevance(0, position)?;
                Ok(TokenRelevance {
                    position,
                    token: forward.tokens[position].clone(),
                    patches: row.into_iter().skip(1).collect(),
                })
            })
            .collect()
    }

    /// Explain the model's answer to `question` about `image`.
    ///
    /// The first visualisation is the combined overview, followed by one
    /// image per question token.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Model`] if the model fails and a core error
    /// on inconsistent model output or an out-of-range `target`.
    pub fn run<B, M>(
        &self,
        model: &M,
        image: &RgbImage,
        question: &str,
        target: Option<usize>,
    ) -> Result<PredictionResult>
    where
        B: Backend,
        M: PatchVqaModel<B>,
    {
        let forward = model
            .forward(image, question)
            .map_err(PipelineError::model)?;

        let logits = logits_to_vec(&forward.logits)?;
        let labels = model.labels();
        let top = top_k(&logits, labels, self.config.top_k)?;
        let answer = match target {
            Some(t) if t >= labels.len() => {
                return Err(CoreError::IndexOutOfRange {
                    index: t,
                    len: labels.len(),
                }
                .into())
            }
            Some(t) => t,
            None => argmax(&logits).ok_or_else(|| {
                CoreError::InvalidShape {
                    expected: "non-empty answer vocabulary".to_string(),
                    got: "0 logits".to_string(),
                }
            })?,
        };

        let (width, height) = image.dimensions();
        let tokens = self.token_relevance(&forward)?;
        let mut overlays = Vec::with_capacity(tokens.len());
        let mut names = vec![COMBINED_NAME.to_string()];
        for token in &tokens {
            let heat = patch_heatmap(&token.patches, &forward.patches, &self.config.heatmap)?;
            overlays.push(alpha_overlay(image, &heat.to_gray(width, height))?);
            names.push(token.name());
        }

        let combined = if overlays.is_empty() {
            tracing::debug!("question has no content tokens, overview is fully transparent");
            alpha_overlay(image, &GrayImage::new(width, height))?
        } else {
            combine_overlays(&overlays)?
        };
        let visualizations: Vec<RgbImage> = std::iter::once(&combined)
            .chain(&overlays)
            .map(|rgba| flatten_rgba(rgba, WHITE))
            .collect();

        tracing::info!(
            model = model.name(),
            answer = %labels[answer],
            visualizations = visualizations.len(),
            "patch explanation finished"
        );

        Ok(
            PredictionResult::new(model.name(), question, image.clone(), labels[answer].clone())
                .with_top_predictions(top)
                .with_tokens(forward.token_ids.clone(), forward.tokens.clone())
                .with_visualizations(visualizations, names)?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_special_tokens() {
        // [CLS] a b [SEP] [PAD] [PAD]
        let padding = [false, false, false, false, true, true];
        assert_eq!(
            mask_special_tokens(&padding),
            vec![true, false, false, true, true, true]
        );
        assert_eq!(mask_special_tokens(&[false, false]), vec![true, true]);
        assert_eq!(mask_special_tokens(&[true, true]), vec![true, true]);
    }

    #[test]
    fn test_mask_image_aggregate() {
        assert_eq!(mask_image_aggregate(&[false, false, true]), vec![true, false, true]);
    }

    #[test]
    fn test_token_name() {
        let token = TokenRelevance {
            position: 2,
            token: "car".to_string(),
            patches: vec![],
        };
        assert_eq!(token.name(), "Token 2 - 'car'");
    }
}
