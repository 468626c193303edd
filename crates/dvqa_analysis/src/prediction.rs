//! Prediction aggregation.

use image::RgbImage;
use serde::{Deserialize, Serialize};

use dvqa_core::{CoreError, Result};

/// Number of alternative answers reported by default.
pub const DEFAULT_TOP_K: usize = 5;

/// An answer with its softmax probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopPrediction {
    /// Answer label.
    pub answer: String,
    /// Probability in `[0, 1]`.
    pub probability: f32,
}

/// Max-shifted softmax.
///
/// Input with a non-finite maximum yields a uniform distribution.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let uniform = || vec![1.0 / scores.len() as f32; scores.len()];
    if !max.is_finite() {
        tracing::debug!("non-finite logits, using uniform distribution");
        return uniform();
    }
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        tracing::debug!("degenerate softmax sum, using uniform distribution");
        return uniform();
    }
    exps.iter().map(|e| e / sum).collect()
}

/// Index of the largest score; the first one wins ties.
#[must_use]
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, s)| match best {
            Some((_, b)) if s <= b => best,
            _ => Some((i, s)),
        })
        .map(|(i, _)| i)
}

/// The `k` most probable answers, most probable first.
///
/// Equal probabilities keep vocabulary order.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if `labels` and `scores` differ in length.
pub fn top_k(scores: &[f32], labels: &[String], k: usize) -> Result<Vec<TopPrediction>> {
    if scores.len() != labels.len() {
        return Err(CoreError::ShapeMismatch(format!(
            "{} scores for {} labels",
            scores.len(),
            labels.len()
        )));
    }
    let mut ranked: Vec<(usize, f32)> = softmax(scores).into_iter().enumerate().collect();
    // Stable sort: ties stay in index order.
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(k);
    Ok(ranked
        .into_iter()
        .map(|(i, probability)| TopPrediction {
            answer: labels[i].clone(),
            probability,
        })
        .collect())
}

/// Make a name safe to use as a file name.
///
/// Path separators, characters reserved on common filesystems and control
/// characters become `_`; trailing dots and spaces are removed.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Everything one explanation request produced.
///
/// Built once with [`PredictionResult::new`] and the `with_*` methods, then
/// only read. Visualisations come first-overview-first; their names are
/// already file-name safe.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    model: String,
    question: String,
    image: RgbImage,
    prediction: String,
    top_predictions: Vec<TopPrediction>,
    visualizations: Vec<RgbImage>,
    visualization_names: Vec<String>,
    encoded_tokens: Vec<u32>,
    decoded_tokens: Vec<String>,
}

impl PredictionResult {
    /// Create a result with no visualisations.
    pub fn new(
        model: impl Into<String>,
        question: impl Into<String>,
        image: RgbImage,
        prediction: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            question: question.into(),
            image,
            prediction: prediction.into(),
            top_predictions: Vec::new(),
            visualizations: Vec::new(),
            visualization_names: Vec::new(),
            encoded_tokens: Vec::new(),
            decoded_tokens: Vec::new(),
        }
    }

    /// Set the ranked alternatives.
    #[must_use]
    pub fn with_top_predictions(mut self, top: Vec<TopPrediction>) -> Self {
        self.top_predictions = top;
        self
    }

    /// Set the question tokens.
    #[must_use]
    pub fn with_tokens(mut self, encoded: Vec<u32>, decoded: Vec<String>) -> Self {
        self.encoded_tokens = encoded;
        self.decoded_tokens = decoded;
        self
    }

    /// Set the visualisations and their names; names are sanitised.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if the lists differ in length.
    pub fn with_visualizations(
        mut self,
        images: Vec<RgbImage>,
        names: Vec<String>,
    ) -> Result<Self> {
        if images.len() != names.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "{} visualizations, {} names",
                images.len(),
                names.len()
            )));
        }
        self.visualizations = images;
        self.visualization_names = names.iter().map(|n| sanitize_name(n)).collect();
        Ok(self)
    }

    /// Name of the model that answered.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The question asked.
    #[must_use]
    pub fn question(&self) -> &str {
        &self.question
    }

    /// The source image.
    #[must_use]
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// The top-1 answer.
    #[must_use]
    pub fn prediction(&self) -> &str {
        &self.prediction
    }

    /// Ranked alternatives.
    #[must_use]
    pub fn top_predictions(&self) -> &[TopPrediction] {
        &self.top_predictions
    }

    /// Visualisations, overview first.
    #[must_use]
    pub fn visualizations(&self) -> &[RgbImage] {
        &self.visualizations
    }

    /// Visualisation names, parallel to [`Self::visualizations`].
    #[must_use]
    pub fn visualization_names(&self) -> &[String] {
        &self.visualization_names
    }

    /// Named visualisations.
    pub fn named_visualizations(&self) -> impl Iterator<Item = (&str, &RgbImage)> {
        self.visualization_names
            .iter()
            .map(String::as_str)
            .zip(&self.visualizations)
    }

    /// Question token ids.
    #[must_use]
    pub fn encoded_tokens(&self) -> &[u32] {
        &self.encoded_tokens
    }

    /// Decoded question tokens.
    #[must_use]
    pub fn decoded_tokens(&self) -> &[String] {
        &self.decoded_tokens
    }
}
