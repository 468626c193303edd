//! Recorded model internals.
//!
//! A record holds everything one forward (and, for region models, backward)
//! pass produced. Replaying it through the model traits makes the pipelines
//! usable without an inference engine, and makes their output reproducible.
//! Synthetic records with deterministic content are generated from a [`Seed`].

use std::convert::Infallible;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use dvqa_core::{
    BoundingBox, DetectedLabel, Detections, EmbeddingSequence, PatchGrid, PatchIndex, Region, Seed,
};
use dvqa_explain::{AttentionCapture, AttentionMap, CrossModalLayer};

use crate::error::{RecordError, Result};
use crate::model::{BoxForward, BoxVqaModel, ObjectDetector, PatchForward, PatchVqaModel};

/// Attention heads in synthetic records.
const SYNTHETIC_HEADS: usize = 4;
/// Embedding width of synthetic records.
const SYNTHETIC_DIM: usize = 16;
/// Trailing padding positions in synthetic patch records.
const SYNTHETIC_TEXT_PADDING: usize = 2;

const ANSWERS: [&str; 10] = [
    "yes", "no", "1", "2", "3", "car", "person", "tree", "road", "building",
];
const OBJECTS: [&str; 6] = ["car", "person", "tree", "building", "road", "truck"];
const ATTRIBUTES: [&str; 5] = ["red", "white", "parked", "tall", "green"];
const WORDS: [&str; 8] = ["how", "many", "cars", "are", "there", "is", "the", "road"];

/// Read a JSON record.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_record<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Write a JSON record.
///
/// # Errors
///
/// Returns an error if the record cannot be serialised or written.
pub fn save_record<T: Serialize>(record: &T, path: impl AsRef<Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// One patch-model forward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    /// Model name.
    pub model: String,
    /// Answer vocabulary.
    pub labels: Vec<String>,
    /// Answer scores, one per label.
    pub logits: Vec<f32>,
    /// Question token ids.
    pub token_ids: Vec<u32>,
    /// Decoded question tokens.
    pub tokens: Vec<String>,
    /// Final-layer text embeddings, one row per token.
    pub text_embeddings: Vec<Vec<f32>>,
    /// Text padding mask.
    pub text_padding: Vec<bool>,
    /// Final-layer image embeddings; row 0 is the image aggregate token.
    pub image_embeddings: Vec<Vec<f32>>,
    /// Image padding mask.
    pub image_padding: Vec<bool>,
    /// Patch grid of the model.
    pub grid: PatchGrid,
    /// Cell of every patch (image rows `1..`).
    pub patch_positions: Vec<(usize, usize)>,
}

/// A patch model replaying a [`PatchRecord`].
///
/// The image and question passed to `forward` are ignored.
#[derive(Debug, Clone)]
pub struct RecordedPatchModel<B: Backend> {
    record: PatchRecord,
    device: B::Device,
}

impl<B: Backend> RecordedPatchModel<B> {
    /// Wrap a record.
    pub fn new(record: PatchRecord, device: B::Device) -> Self {
        Self { record, device }
    }

    /// The replayed record.
    #[must_use]
    pub fn record(&self) -> &PatchRecord {
        &self.record
    }
}

fn logits_tensor<B: Backend>(
    logits: &[f32],
    labels: usize,
    device: &B::Device,
) -> std::result::Result<Tensor<B, 2>, RecordError> {
    if logits.len() != labels {
        return Err(RecordError::Inconsistent(format!(
            "{} logits for {labels} labels",
            logits.len()
        )));
    }
    Ok(Tensor::from_data(
        TensorData::new(logits.to_vec(), [1, logits.len()]),
        device,
    ))
}

impl<B: Backend> PatchVqaModel<B> for RecordedPatchModel<B> {
    type Error = RecordError;

    fn name(&self) -> &str {
        &self.record.model
    }

    fn labels(&self) -> &[String] {
        &self.record.labels
    }

    fn forward(
        &self,
        _image: &RgbImage,
        _question: &str,
    ) -> std::result::Result<PatchForward<B>, RecordError> {
        let r = &self.record;
        Ok(PatchForward {
            logits: logits_tensor(&r.logits, r.labels.len(), &self.device)?,
            token_ids: r.token_ids.clone(),
            tokens: r.tokens.clone(),
            text: EmbeddingSequence::from_rows(&r.text_embeddings, &r.text_padding, &self.device)?,
            image: EmbeddingSequence::from_rows(
                &r.image_embeddings,
                &r.image_padding,
                &self.device,
            )?,
            patches: PatchIndex::new(r.grid, r.patch_positions.clone())?,
        })
    }
}

/// One attention map with its optional gradient, flattened row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRecord {
    /// `[heads, queries, keys]`.
    pub shape: [usize; 3],
    /// Attention weights.
    pub weights: Vec<f32>,
    /// Gradient of the target score, if recorded.
    pub gradients: Option<Vec<f32>>,
}

impl MapRecord {
    fn to_map<B: Backend>(
        &self,
        device: &B::Device,
    ) -> std::result::Result<AttentionMap<B>, RecordError> {
        let expected = self.shape.iter().product::<usize>();
        let tensor = |values: &[f32]| -> std::result::Result<Tensor<B, 3>, RecordError> {
            if values.len() != expected {
                return Err(RecordError::Inconsistent(format!(
                    "attention map {:?} needs {expected} values, got {}",
                    self.shape,
                    values.len()
                )));
            }
            Ok(Tensor::from_data(TensorData::new(values.to_vec(), self.shape), device))
        };
        let map = AttentionMap::new(tensor(&self.weights)?);
        match &self.gradients {
            Some(g) => Ok(map.with_gradients(tensor(g)?)?),
            None => Ok(map),
        }
    }
}

/// Attention maps of one cross-modal layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossRecord {
    /// Text attending to image.
    pub text_to_image: MapRecord,
    /// Image attending to text.
    pub image_to_text: MapRecord,
    /// Text self-attention.
    pub text_self: MapRecord,
    /// Image self-attention.
    pub image_self: MapRecord,
}

/// Every attention map of a dual-stream encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionRecord {
    /// Text-only layers.
    pub text_layers: Vec<MapRecord>,
    /// Image-only layers.
    pub image_layers: Vec<MapRecord>,
    /// Cross-modal layers.
    pub cross_layers: Vec<CrossRecord>,
}

impl AttentionRecord {
    fn to_capture<B: Backend>(
        &self,
        device: &B::Device,
    ) -> std::result::Result<AttentionCapture<B>, RecordError> {
        let text = self
            .text_layers
            .iter()
            .map(|m| m.to_map(device))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let image = self
            .image_layers
            .iter()
            .map(|m| m.to_map(device))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let cross = self
            .cross_layers
            .iter()
            .map(|c| {
                Ok(CrossModalLayer {
                    text_to_image: c.text_to_image.to_map(device)?,
                    image_to_text: c.image_to_text.to_map(device)?,
                    text_self: c.text_self.to_map(device)?,
                    image_self: c.image_self.to_map(device)?,
                })
            })
            .collect::<std::result::Result<Vec<_>, RecordError>>()?;
        Ok(AttentionCapture::new(text, image, cross)?)
    }
}

/// One region-model forward and backward pass, with its detections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    /// Model name.
    pub model: String,
    /// Answer vocabulary.
    pub labels: Vec<String>,
    /// Answer scores, one per label.
    pub logits: Vec<f32>,
    /// Question token ids.
    pub token_ids: Vec<u32>,
    /// Decoded question tokens.
    pub tokens: Vec<String>,
    /// Detector output the pass was run on.
    pub detections: Detections,
    /// Attention maps and gradients.
    pub attention: AttentionRecord,
    /// Answer the gradients were taken against; `None` if they do not
    /// depend on the answer.
    pub target: Option<usize>,
}

/// A region model replaying a [`BoxRecord`].
#[derive(Debug, Clone)]
pub struct RecordedBoxModel<B: Backend> {
    record: BoxRecord,
    device: B::Device,
}

impl<B: Backend> RecordedBoxModel<B> {
    /// Wrap a record.
    pub fn new(record: BoxRecord, device: B::Device) -> Self {
        Self { record, device }
    }

    /// The replayed record.
    #[must_use]
    pub fn record(&self) -> &BoxRecord {
        &self.record
    }

    /// A detector replaying the record's detections.
    #[must_use]
    pub fn detector(&self) -> RecordedDetector {
        RecordedDetector::new(self.record.detections.clone())
    }

    fn check_detections(&self, detections: &Detections) -> std::result::Result<(), RecordError> {
        if detections.len() != self.record.detections.len() {
            return Err(RecordError::Inconsistent(format!(
                "record has {} regions, request has {}",
                self.record.detections.len(),
                detections.len()
            )));
        }
        Ok(())
    }
}

impl<B: Backend> BoxVqaModel<B> for RecordedBoxModel<B> {
    type Error = RecordError;

    fn name(&self) -> &str {
        &self.record.model
    }

    fn labels(&self) -> &[String] {
        &self.record.labels
    }

    fn forward(
        &self,
        _question: &str,
        detections: &Detections,
    ) -> std::result::Result<BoxForward<B>, RecordError> {
        self.check_detections(detections)?;
        let r = &self.record;
        Ok(BoxForward {
            logits: logits_tensor(&r.logits, r.labels.len(), &self.device)?,
            token_ids: r.token_ids.clone(),
            tokens: r.tokens.clone(),
        })
    }

    fn attention_capture(
        &self,
        _question: &str,
        detections: &Detections,
        one_hot: Tensor<B, 2>,
    ) -> std::result::Result<AttentionCapture<B>, RecordError> {
        self.check_detections(detections)?;
        let selector = dvqa_core::tensor_to_vec(one_hot)?;
        let requested = dvqa_analysis::argmax(&selector).unwrap_or(0);
        if let Some(recorded) = self.record.target {
            if recorded != requested {
                return Err(RecordError::TargetMismatch {
                    recorded,
                    requested,
                });
            }
        }
        Ok(self.record.attention.to_capture(&self.device)?.with_target(requested))
    }
}

/// A detector returning fixed detections.
#[derive(Debug, Clone, Default)]
pub struct RecordedDetector {
    detections: Detections,
}

impl RecordedDetector {
    /// Wrap detections.
    #[must_use]
    pub fn new(detections: Detections) -> Self {
        Self { detections }
    }
}

impl ObjectDetector for RecordedDetector {
    type Error = Infallible;

    fn detect(&self, _image: &RgbImage) -> std::result::Result<Detections, Infallible> {
        Ok(self.detections.clone())
    }
}

fn random_rows(rng: &mut impl Rng, rows: usize, dim: usize) -> Vec<Vec<f32>> {
    (0..rows)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

fn question_tokens(rng: &mut impl Rng, words: usize) -> (Vec<u32>, Vec<String>) {
    let mut ids = vec![101];
    let mut tokens = vec!["[CLS]".to_string()];
    for _ in 0..words {
        let w = rng.gen_range(0..WORDS.len());
        ids.push(2000 + w as u32);
        tokens.push(WORDS[w].to_string());
    }
    ids.push(102);
    tokens.push("[SEP]".to_string());
    (ids, tokens)
}

fn answer_labels() -> Vec<String> {
    ANSWERS.iter().map(ToString::to_string).collect()
}

fn random_logits(rng: &mut impl Rng) -> Vec<f32> {
    (0..ANSWERS.len()).map(|_| rng.gen_range(-4.0..4.0)).collect()
}

/// Deterministic patch record for a question of `words` words on `grid`.
///
/// The text sequence is `[CLS] words.. [SEP]` followed by two padding
/// positions; the image sequence is the aggregate token plus one patch per
/// grid cell, row-major.
///
/// Question, answer scores and embeddings come from separate streams derived
/// from `seed`, so the question does not change with the grid.
#[must_use]
pub fn synthetic_patch_record(seed: Seed, words: usize, grid: PatchGrid) -> PatchRecord {
    let (mut token_ids, mut tokens) =
        question_tokens(&mut seed.derive("question").to_rng(), words);
    let valid = tokens.len();
    for _ in 0..SYNTHETIC_TEXT_PADDING {
        token_ids.push(0);
        tokens.push("[PAD]".to_string());
    }
    let text_padding = (0..tokens.len()).map(|i| i >= valid).collect();
    let image_len = grid.cells() + 1;

    let mut embeddings = seed.derive("embeddings").to_rng();

    PatchRecord {
        model: "ViLT".to_string(),
        labels: answer_labels(),
        logits: random_logits(&mut seed.derive("logits").to_rng()),
        text_embeddings: random_rows(&mut embeddings, tokens.len(), SYNTHETIC_DIM),
        image_embeddings: random_rows(&mut embeddings, image_len, SYNTHETIC_DIM),
        token_ids,
        tokens,
        text_padding,
        image_padding: vec![false; image_len],
        grid,
        patch_positions: PatchIndex::dense(grid).positions().to_vec(),
    }
}

fn random_map(rng: &mut impl Rng, queries: usize, keys: usize) -> MapRecord {
    let mut weights = Vec::with_capacity(SYNTHETIC_HEADS * queries * keys);
    for _ in 0..SYNTHETIC_HEADS * queries {
        let row: Vec<f32> = (0..keys).map(|_| rng.gen_range(0.01f32..1.0)).collect();
        let sum: f32 = row.iter().sum();
        weights.extend(row.into_iter().map(|v| v / sum));
    }
    let gradients = (0..weights.len()).map(|_| rng.gen_range(-0.5..0.5)).collect();
    MapRecord {
        shape: [SYNTHETIC_HEADS, queries, keys],
        weights,
        gradients: Some(gradients),
    }
}

fn random_region(rng: &mut impl Rng, width: u32, height: u32) -> Region {
    let (w, h) = (width.max(8) as f32, height.max(8) as f32);
    let x0 = rng.gen_range(0.0..w * 0.75);
    let y0 = rng.gen_range(0.0..h * 0.75);
    let x1 = rng.gen_range(x0 + 1.0..=w);
    let y1 = rng.gen_range(y0 + 1.0..=h);
    let object = rng.gen_range(0..OBJECTS.len());
    let attribute = rng.gen_range(0..ATTRIBUTES.len());
    Region {
        bbox: BoundingBox::new(x0, y0, x1, y1),
        object: DetectedLabel {
            id: object,
            name: OBJECTS[object].to_string(),
            score: rng.gen_range(0.3..1.0),
        },
        attribute: DetectedLabel {
            id: attribute,
            name: ATTRIBUTES[attribute].to_string(),
            score: rng.gen_range(0.1..1.0),
        },
    }
}

/// Deterministic region record: `boxes` regions on a `width` x `height`
/// image and a question of `words` words.
///
/// Gradients do not depend on the answer (`target` is `None`), so any
/// answer can be explained. Question, answer scores, detections and
/// attention come from separate streams derived from `seed`: changing the
/// number of boxes leaves the question and scores untouched.
#[must_use]
pub fn synthetic_box_record(
    seed: Seed,
    words: usize,
    boxes: usize,
    width: u32,
    height: u32,
) -> BoxRecord {
    let (token_ids, tokens) = question_tokens(&mut seed.derive("question").to_rng(), words);
    let lt = tokens.len();

    let mut detector = seed.derive("detections").to_rng();
    let regions: Vec<Region> = (0..boxes)
        .map(|_| random_region(&mut detector, width, height))
        .collect();
    let normalized_boxes = regions
        .iter()
        .map(|r| r.bbox.normalized(width, height))
        .collect();
    let features = random_rows(&mut detector, boxes, SYNTHETIC_DIM);
    let detections = Detections {
        regions,
        features,
        normalized_boxes,
    };

    let mut rng = seed.derive("attention").to_rng();
    let attention = AttentionRecord {
        text_layers: (0..2).map(|_| random_map(&mut rng, lt, lt)).collect(),
        image_layers: (0..2).map(|_| random_map(&mut rng, boxes, boxes)).collect(),
        cross_layers: (0..3)
            .map(|_| CrossRecord {
                text_to_image: random_map(&mut rng, lt, boxes),
                image_to_text: random_map(&mut rng, boxes, lt),
                text_self: random_map(&mut rng, lt, lt),
                image_self: random_map(&mut rng, boxes, boxes),
            })
            .collect(),
    };

    BoxRecord {
        model: "LXMERT".to_string(),
        labels: answer_labels(),
        logits: random_logits(&mut seed.derive("logits").to_rng()),
        token_ids,
        tokens,
        detections,
        attention,
        target: None,
    }
}
