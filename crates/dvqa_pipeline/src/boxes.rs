//! Explanations for region-based models.
//!
//! A detector proposes regions, the model answers from them, and a backward
//! pass against the chosen answer yields attention gradients. Each relevance
//! rule turns the capture into one score per region, painted over the image.

use burn::prelude::*;
use image::RgbImage;

use dvqa_analysis::{argmax, top_k, PredictionResult};
use dvqa_core::{CoreError, Detections};
use dvqa_explain::{AttentionCapture, RelevanceKind, RelevanceMethod, RelevanceRule};
use dvqa_imaging::{box_heatmap, draw_regions, multiplicative_blend};

use crate::config::ExplainConfig;
use crate::error::{PipelineError, Result};
use crate::model::{logits_to_vec, one_hot, BoxVqaModel, ObjectDetector};

/// Name of the detector overview image.
pub const DETECTOR_OVERVIEW_NAME: &str = "Faster RCNN Boxes";

/// Per-region relevance of one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionRelevance {
    /// Producing rule.
    pub kind: RelevanceKind,
    /// One score per region, in detection order.
    pub scores: Vec<f32>,
}

/// Orchestrates the region-model explanation.
#[derive(Debug, Clone, Default)]
pub struct BoxPipeline {
    config: ExplainConfig,
}

impl BoxPipeline {
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

    /// Region scores of every rule, in presentation order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MissingGradients`] if the capture has none.
    pub fn region_relevance<B: Backend>(
        &self,
        capture: &AttentionCapture<B>,
    ) -> Result<Vec<RegionRelevance>> {
        RelevanceMethod::presentation_order(self.config.redistribution)
            .iter()
            .map(|method| {
                let maps = method.accumulate(capture)?;
                Ok(RegionRelevance {
                    kind: maps.kind,
                    scores: maps.image_scores()?,
                })
            })
            .collect()
    }

    /// Explain the model's answer to `question` about `image`.
    ///
    /// The first visualisation is the detector overview, followed by one
    /// image per relevance rule. Without detections only the overview is
    /// returned and no backward pass is requested.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Detector`] or [`PipelineError::Model`] when a
    /// collaborator fails and [`CoreError::IndexOutOfRange`] for a `target`
    /// outside the answer vocabulary.
    pub fn run<B, M, D>(
        &self,
        model: &M,
        detector: &D,
        image: &RgbImage,
        question: &str,
        target: Option<usize>,
    ) -> Result<PredictionResult>
    where
        B: Backend,
        M: BoxVqaModel<B>,
        D: ObjectDetector,
    {
        let detections = detector.detect(image).map_err(PipelineError::detector)?;
        let forward = model
            .forward(question, &detections)
            .map_err(PipelineError::model)?;

        let logits = logits_to_vec(&forward.logits)?;
        let labels = model.labels();
        let top = top_k(&logits, labels, self.config.top_k)?;
        let answer = match target {
            Some(t) => t,
            None => argmax(&logits).ok_or_else(|| CoreError::InvalidShape {
                expected: "non-empty answer vocabulary".to_string(),
                got: "0 logits".to_string(),
            })?,
        };
        let selector = one_hot::<B>(answer, labels.len(), &forward.logits.device())?;

        let mut visualizations = vec![draw_regions(image, &detections.regions)?];
        let mut names = vec![DETECTOR_OVERVIEW_NAME.to_string()];

        if detections.is_empty() {
            tracing::warn!(model = model.name(), "no regions detected, returning overview only");
        } else {
            let capture = model
                .attention_capture(question, &detections, selector)
                .map_err(PipelineError::model)?;
            check_regions(&capture, &detections)?;

            let (width, height) = image.dimensions();
            let boxes = detections.boxes();
            for relevance in self.region_relevance(&capture)? {
                let heat = box_heatmap(&relevance.scores, &boxes, width, height)?;
                visualizations.push(multiplicative_blend(image, &heat)?);
                names.push(relevance.kind.display_name().to_string());
            }
        }

        tracing::info!(
            model = model.name(),
            answer = %labels[answer],
            regions = detections.len(),
            visualizations = visualizations.len(),
            "box explanation finished"
        );

        Ok(
            PredictionResult::new(model.name(), question, image.clone(), labels[answer].clone())
                .with_top_predictions(top)
                .with_tokens(forward.token_ids, forward.tokens)
                .with_visualizations(visualizations, names)?,
        )
    }
}

fn check_regions<B: Backend>(capture: &AttentionCapture<B>, detections: &Detections) -> Result<()> {
    if capture.image_regions() != detections.len() {
        return Err(CoreError::ShapeMismatch(format!(
            "attention covers {} regions, detector found {}",
            capture.image_regions(),
            detections.len()
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvqa_core::backend::NdArray;
    use dvqa_explain::{AttentionMap, CrossModalLayer};

    type TestBackend = NdArray;

    fn uniform(h: usize, q: usize, k: usize) -> AttentionMap<TestBackend> {
        let device = Default::default();
        let weights = Tensor::ones([h, q, k], &device).div_scalar(k as f32);
        let grads = Tensor::ones([h, q, k], &device).mul_scalar(0.5);
        AttentionMap::new(weights).with_gradients(grads).unwrap()
    }

    #[test]
    fn test_region_relevance_order() {
        let (lt, li) = (4, 3);
        let cross = CrossModalLayer {
            text_to_image: uniform(2, lt, li),
            image_to_text: uniform(2, li, lt),
            text_self: uniform(2, lt, lt),
            image_self: uniform(2, li, li),
        };
        let capture =
            AttentionCapture::new(vec![uniform(2, lt, lt)], vec![uniform(2, li, li)], vec![cross])
                .unwrap();

        let relevance = BoxPipeline::default().region_relevance(&capture).unwrap();
        let kinds: Vec<RelevanceKind> = relevance.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RelevanceKind::Redistribution,
                RelevanceKind::GradCam,
                RelevanceKind::Rollout
            ]
        );
        assert!(relevance.iter().all(|r| r.scores.len() == li));
    }
}
