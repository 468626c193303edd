//! Relevance propagation through dual-stream attention.
//!
//! Three rules turn an [`AttentionCapture`] into a text self-relevance matrix
//! `R_tt` (`Lt x Lt`) and a text-to-image relevance matrix `R_ti` (`Lt x Li`):
//!
//! - [`Rollout`]: gradient-free propagation of head-averaged attention.
//!   Reference: Abnar & Zuidema, "Quantifying Attention Flow in Transformers", ACL 2020.
//! - [`GradCam`]: gradient-weighted heads of the last cross-modal layer only.
//! - [`Redistribution`]: gradient-weighted relevance updates through every
//!   self- and cross-attention block.
//!   Reference: Chefer et al., "Generic Attention-model Explainability for
//!   Interpreting Bi-Modal and Encoder-Decoder Transformers", ICCV 2021.
//!
//! Every rule zeroes `R_tt[0, 0]`: the aggregate token's relevance to itself
//! would otherwise dominate the attribution.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use dvqa_core::{tensor_to_vec, Result};

use crate::capture::{AttentionCapture, AttentionMap};

/// Floor for row sums before division.
const ROW_SUM_FLOOR: f32 = 1e-12;

/// Which rule produced a set of relevance maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelevanceKind {
    /// Attention rollout.
    Rollout,
    /// Gradient-weighted last-layer attention.
    GradCam,
    /// Gradient-weighted relevance redistribution over all layers.
    Redistribution,
}

impl RelevanceKind {
    /// Display name, also used for exported file names.
    #[must_use]
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Rollout => "Attention Rollout",
            Self::GradCam => "Gradcam",
            Self::Redistribution => "Chefer Explainability",
        }
    }

    /// Whether the rule needs attention gradients.
    #[must_use]
    pub const fn needs_gradients(&self) -> bool {
        !matches!(self, Self::Rollout)
    }
}

/// Options for [`Redistribution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedistributionConfig {
    /// Residual-aware renormalisation of self relevance before cross rules.
    ///
    /// Off by default: the renormalisation requires the diagonal of `R - I`
    /// to be non-negative, which does not hold for every attention pattern.
    /// When enabled and violated, the step is skipped for that update.
    pub normalize_self_attention: bool,
    /// Propagate cross attention through both modalities' self relevance.
    /// When false, the cross-attention cam is added as is.
    pub apply_self_in_cross_rule: bool,
}

impl Default for RedistributionConfig {
    fn default() -> Self {
        Self {
            normalize_self_attention: false,
            apply_self_in_cross_rule: true,
        }
    }
}

/// Final relevance matrices of one rule.
#[derive(Debug, Clone)]
pub struct RelevanceMaps<B: Backend> {
    /// `R_tt`, `(Lt, Lt)`.
    pub text_self: Tensor<B, 2>,
    /// `R_ti`, `(Lt, Li)`.
    pub text_to_image: Tensor<B, 2>,
    /// Producing rule.
    pub kind: RelevanceKind,
}

impl<B: Backend> RelevanceMaps<B> {
    /// Relevance of every image region, summed over text tokens.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be read back.
    pub fn image_scores(&self) -> Result<Vec<f32>> {
        tensor_to_vec(self.text_to_image.clone().sum_dim(0))
    }

    /// Relevance of every text token for the aggregate token (row 0 of `R_tt`).
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be read back.
    pub fn text_scores(&self) -> Result<Vec<f32>> {
        let [rows, cols] = self.text_self.dims();
        if rows == 0 {
            return Ok(Vec::new());
        }
        tensor_to_vec(self.text_self.clone().slice([0..1, 0..cols]))
    }
}

/// A relevance propagation strategy.
///
/// All rules share one contract: a capture in, two relevance matrices out.
pub trait RelevanceRule<B: Backend> {
    /// Accumulate relevance over the captured layers.
    ///
    /// # Errors
    ///
    /// Gradient rules return [`dvqa_core::CoreError::MissingGradients`] if
    /// the capture has no gradients.
    fn accumulate(&self, capture: &AttentionCapture<B>) -> Result<RelevanceMaps<B>>;
}

/// Mean over the head axis: `(h, q, k) -> (q, k)`.
pub fn average_heads<B: Backend>(weights: Tensor<B, 3>) -> Tensor<B, 2> {
    let [_, q, k] = weights.dims();
    weights.mean_dim(0).reshape([q, k])
}

/// Gradient-weighted, non-negative head average `mean_h((grad * cam)+)`.
pub fn gradient_weighted_heads<B: Backend>(cam: Tensor<B, 3>, grad: Tensor<B, 3>) -> Tensor<B, 2> {
    average_heads((grad * cam).clamp_min(0.0))
}

/// Grad-CAM head weighting: each head is scaled by its mean gradient, heads
/// are averaged and the result clamped to be non-negative.
pub fn grad_cam_heads<B: Backend>(cam: Tensor<B, 3>, grad: Tensor<B, 3>) -> Tensor<B, 2> {
    let head_weights = grad.mean_dim(2).mean_dim(1);
    average_heads(cam * head_weights).clamp_min(0.0)
}

/// Attention rollout over head-averaged layers, input to output.
///
/// Each layer is augmented with the identity (residual path) and
/// row-normalised; later layers multiply from the left. With no layers the
/// result is the `size x size` identity.
pub fn rollout<B: Backend>(
    layers: &[Tensor<B, 2>],
    size: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let eye = Tensor::<B, 2>::eye(size, device);
    let mut joint: Option<Tensor<B, 2>> = None;
    for layer in layers {
        let augmented = layer.clone() + eye.clone();
        let row_sums = augmented.clone().sum_dim(1).clamp_min(ROW_SUM_FLOOR);
        let normalized = augmented / row_sums;
        joint = Some(match joint {
            None => normalized,
            Some(acc) => normalized.matmul(acc),
        });
    }
    joint.unwrap_or(eye)
}

/// Self-attention update: returns `(cam · R_ss, cam · R_sq)`.
pub fn apply_self_attention_rules<B: Backend>(
    r_ss: &Tensor<B, 2>,
    r_sq: &Tensor<B, 2>,
    cam_ss: &Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let r_ss_addition = cam_ss.clone().matmul(r_ss.clone());
    let r_sq_addition = cam_ss.clone().matmul(r_sq.clone());
    (r_ss_addition, r_sq_addition)
}

/// Cross-attention update for queries `s` attending to keys `q`.
///
/// Returns `(R_sq addition, R_ss addition)` where
/// `R_sq += R_ssᵀ · cam_sq · R_qq` and `R_ss += cam_sq · R_qs`.
///
/// # Errors
///
/// Returns an error only if normalisation is enabled and a matrix cannot be
/// read back to check its diagonal.
pub fn apply_cross_attention_rules<B: Backend>(
    r_ss: &Tensor<B, 2>,
    r_qq: &Tensor<B, 2>,
    r_qs: &Tensor<B, 2>,
    cam_sq: &Tensor<B, 2>,
    config: &RedistributionConfig,
) -> Result<(Tensor<B, 2>, Tensor<B, 2>)> {
    let (r_ss_normalized, r_qq_normalized) = if config.normalize_self_attention {
        (
            handle_residual(r_ss)?.unwrap_or_else(|| r_ss.clone()),
            handle_residual(r_qq)?.unwrap_or_else(|| r_qq.clone()),
        )
    } else {
        (r_ss.clone(), r_qq.clone())
    };

    let r_sq_addition = if config.apply_self_in_cross_rule {
        r_ss_normalized
            .transpose()
            .matmul(cam_sq.clone().matmul(r_qq_normalized))
    } else {
        cam_sq.clone()
    };
    let r_ss_addition = cam_sq.clone().matmul(r_qs.clone());
    Ok((r_sq_addition, r_ss_addition))
}

/// Residual-aware renormalisation of a self-relevance matrix.
///
/// Computes `R̂ = R - I`, normalises its rows to sum to one and adds the
/// identity back. Returns `None` (leave `R` untouched) when the diagonal of
/// `R̂` has a negative entry or a row of `R̂` sums to zero.
///
/// # Errors
///
/// Returns an error if the matrix cannot be read back to the host.
pub fn handle_residual<B: Backend>(self_relevance: &Tensor<B, 2>) -> Result<Option<Tensor<B, 2>>> {
    let [n, _] = self_relevance.dims();
    let eye = Tensor::<B, 2>::eye(n, &self_relevance.device());
    let r_hat = self_relevance.clone() - eye.clone();

    let diagonal = tensor_to_vec((r_hat.clone() * eye.clone()).sum_dim(1))?;
    if diagonal.iter().any(|&d| d < 0.0) {
        tracing::debug!("negative residual diagonal, skipping self-relevance normalization");
        return Ok(None);
    }
    let row_sums = r_hat.clone().sum_dim(1);
    if tensor_to_vec(row_sums.clone())?.iter().any(|&s| s == 0.0 || !s.is_finite()) {
        tracing::debug!("degenerate residual row sum, skipping self-relevance normalization");
        return Ok(None);
    }
    Ok(Some(r_hat / row_sums + eye))
}

/// Zero the aggregate token's self-relevance `R[0, 0]`.
fn zero_aggregate_diagonal<B: Backend>(relevance: Tensor<B, 2>) -> Tensor<B, 2> {
    let [rows, cols] = relevance.dims();
    if rows == 0 || cols == 0 {
        return relevance;
    }
    let device = relevance.device();
    relevance.slice_assign([0..1, 0..1], Tensor::zeros([1, 1], &device))
}

fn weighted<B: Backend>(map: &AttentionMap<B>, what: &str) -> Result<Tensor<B, 2>> {
    let grad = map.require_gradients(what)?;
    Ok(gradient_weighted_heads(map.weights.clone(), grad))
}

/// Gradient-free attention rollout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rollout;

impl Rollout {
    /// The rule kind.
    #[must_use]
    pub const fn kind(&self) -> RelevanceKind {
        RelevanceKind::Rollout
    }
}

impl<B: Backend> RelevanceRule<B> for Rollout {
    fn accumulate(&self, capture: &AttentionCapture<B>) -> Result<RelevanceMaps<B>> {
        let device = capture.device();
        let lt = capture.text_tokens();
        let li = capture.image_regions();
        let cross = capture.cross_layers();
        let (inner_cross, last) = cross.split_at(cross.len() - 1);
        let last = &last[0];

        let mut text_cams: Vec<Tensor<B, 2>> = capture
            .text_layers()
            .iter()
            .map(|m| average_heads(m.weights.clone()))
            .collect();
        let mut image_cams: Vec<Tensor<B, 2>> = capture
            .image_layers()
            .iter()
            .map(|m| average_heads(m.weights.clone()))
            .collect();

        // In the last cross layer only the text stream reaches the aggregate token.
        for layer in inner_cross {
            text_cams.push(average_heads(layer.text_self.weights.clone()));
            image_cams.push(average_heads(layer.image_self.weights.clone()));
        }

        let cam_ti = average_heads(last.text_to_image.weights.clone());
        let r_tt_before_last = rollout(&text_cams, lt, &device);
        let r_ii = rollout(&image_cams, li, &device);
        let text_to_image = r_tt_before_last.transpose().matmul(cam_ti.matmul(r_ii));

        text_cams.push(average_heads(last.text_self.weights.clone()));
        let text_self = rollout(&text_cams, lt, &device);

        Ok(RelevanceMaps {
            text_self: zero_aggregate_diagonal(text_self),
            text_to_image,
            kind: RelevanceKind::Rollout,
        })
    }
}

/// Grad-CAM over the last cross-modal layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradCam;

impl GradCam {
    /// The rule kind.
    #[must_use]
    pub const fn kind(&self) -> RelevanceKind {
        RelevanceKind::GradCam
    }
}

impl<B: Backend> RelevanceRule<B> for GradCam {
    fn accumulate(&self, capture: &AttentionCapture<B>) -> Result<RelevanceMaps<B>> {
        let last = capture.last_cross_layer();

        let grad_ti = last.text_to_image.require_gradients("last cross layer text->image")?;
        let text_to_image = grad_cam_heads(last.text_to_image.weights.clone(), grad_ti);

        let grad_tt = last.text_self.require_gradients("last cross layer text self")?;
        let text_self = grad_cam_heads(last.text_self.weights.clone(), grad_tt);

        Ok(RelevanceMaps {
            text_self: zero_aggregate_diagonal(text_self),
            text_to_image,
            kind: RelevanceKind::GradCam,
        })
    }
}

/// Gradient-weighted relevance redistribution over every layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Redistribution {
    /// Rule options.
    pub config: RedistributionConfig,
}

impl Redistribution {
    /// Create the rule with explicit options.
    #[must_use]
    pub const fn new(config: RedistributionConfig) -> Self {
        Self { config }
    }

    /// The rule kind.
    #[must_use]
    pub const fn kind(&self) -> RelevanceKind {
        RelevanceKind::Redistribution
    }
}

/// The four relevance matrices threaded through [`Redistribution`].
struct RelevanceState<B: Backend> {
    r_tt: Tensor<B, 2>,
    r_ii: Tensor<B, 2>,
    r_ti: Tensor<B, 2>,
    r_it: Tensor<B, 2>,
}

impl<B: Backend> RelevanceState<B> {
    fn new(lt: usize, li: usize, device: &B::Device) -> Self {
        Self {
            r_tt: Tensor::eye(lt, device),
            r_ii: Tensor::eye(li, device),
            r_ti: Tensor::zeros([lt, li], device),
            r_it: Tensor::zeros([li, lt], device),
        }
    }

    fn text_self_step(&mut self, cam: &Tensor<B, 2>) {
        let (tt_add, ti_add) = apply_self_attention_rules(&self.r_tt, &self.r_ti, cam);
        self.r_tt = self.r_tt.clone() + tt_add;
        self.r_ti = self.r_ti.clone() + ti_add;
    }

    fn image_self_step(&mut self, cam: &Tensor<B, 2>) {
        let (ii_add, it_add) = apply_self_attention_rules(&self.r_ii, &self.r_it, cam);
        self.r_ii = self.r_ii.clone() + ii_add;
        self.r_it = self.r_it.clone() + it_add;
    }
}

impl<B: Backend> RelevanceRule<B> for Redistribution {
    fn accumulate(&self, capture: &AttentionCapture<B>) -> Result<RelevanceMaps<B>> {
        let device = capture.device();
        let mut state =
            RelevanceState::new(capture.text_tokens(), capture.image_regions(), &device);

        for (i, map) in capture.text_layers().iter().enumerate() {
            state.text_self_step(&weighted(map, &format!("text layer {i}"))?);
        }
        for (i, map) in capture.image_layers().iter().enumerate() {
            state.image_self_step(&weighted(map, &format!("image layer {i}"))?);
        }

        let cross = capture.cross_layers();
        let (inner_cross, last) = cross.split_at(cross.len() - 1);
        let last = &last[0];

        for (i, layer) in inner_cross.iter().enumerate() {
            let cam_ti = weighted(&layer.text_to_image, &format!("cross layer {i} text->image"))?;
            let cam_it = weighted(&layer.image_to_text, &format!("cross layer {i} image->text"))?;

            // Both directions read the state from before this layer.
            let (ti_add, tt_add) = apply_cross_attention_rules(
                &state.r_tt,
                &state.r_ii,
                &state.r_it,
                &cam_ti,
                &self.config,
            )?;
            let (it_add, ii_add) = apply_cross_attention_rules(
                &state.r_ii,
                &state.r_tt,
                &state.r_ti,
                &cam_it,
                &self.config,
            )?;
            state.r_ti = state.r_ti + ti_add;
            state.r_tt = state.r_tt + tt_add;
            state.r_it = state.r_it + it_add;
            state.r_ii = state.r_ii + ii_add;

            let cam_tt = weighted(&layer.text_self, &format!("cross layer {i} text self"))?;
            let cam_ii = weighted(&layer.image_self, &format!("cross layer {i} image self"))?;
            state.text_self_step(&cam_tt);
            state.image_self_step(&cam_ii);
        }

        // Last cross layer: text side only.
        let cam_ti = weighted(&last.text_to_image, "last cross layer text->image")?;
        let (ti_add, tt_add) = apply_cross_attention_rules(
            &state.r_tt,
            &state.r_ii,
            &state.r_it,
            &cam_ti,
            &self.config,
        )?;
        state.r_ti = state.r_ti + ti_add;
        state.r_tt = state.r_tt + tt_add;
        state.text_self_step(&weighted(&last.text_self, "last cross layer text self")?);

        Ok(RelevanceMaps {
            text_self: zero_aggregate_diagonal(state.r_tt),
            text_to_image: state.r_ti,
            kind: RelevanceKind::Redistribution,
        })
    }
}

/// Tagged choice of relevance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelevanceMethod {
    /// [`Rollout`].
    Rollout,
    /// [`GradCam`].
    GradCam,
    /// [`Redistribution`] with its options.
    Redistribution(RedistributionConfig),
}

impl RelevanceMethod {
    /// The rule kind.
    #[must_use]
    pub const fn kind(&self) -> RelevanceKind {
        match self {
            Self::Rollout => RelevanceKind::Rollout,
            Self::GradCam => RelevanceKind::GradCam,
            Self::Redistribution(_) => RelevanceKind::Redistribution,
        }
    }

    /// The three rules in presentation order: redistribution, Grad-CAM, rollout.
    #[must_use]
    pub const fn presentation_order(config: RedistributionConfig) -> [Self; 3] {
        [Self::Redistribution(config), Self::GradCam, Self::Rollout]
    }
}

impl<B: Backend> RelevanceRule<B> for RelevanceMethod {
    fn accumulate(&self, capture: &AttentionCapture<B>) -> Result<RelevanceMaps<B>> {
        match self {
            Self::Rollout => Rollout.accumulate(capture),
            Self::GradCam => GradCam.accumulate(capture),
            Self::Redistribution(config) => Redistribution::new(*config).accumulate(capture),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CrossModalLayer;
    use burn::tensor::TensorData;
    use dvqa_core::backend::NdArray;
    use dvqa_core::{CoreError, Seed};
    use rand::Rng;

    type TestBackend = NdArray;

    fn random_map(
        rng: &mut impl Rng,
        h: usize,
        q: usize,
        k: usize,
        with_grad: bool,
    ) -> AttentionMap<TestBackend> {
        let device = Default::default();
        // Row-stochastic weights, like softmax output.
        let mut weights = Vec::with_capacity(h * q * k);
        for _ in 0..h * q {
            let row: Vec<f32> = (0..k).map(|_| rng.gen::<f32>() + 0.01).collect();
            let sum: f32 = row.iter().sum();
            weights.extend(row.iter().map(|v| v / sum));
        }
        let map = AttentionMap::new(Tensor::from_data(
            TensorData::new(weights, [h, q, k]),
            &device,
        ));
        if !with_grad {
            return map;
        }
        let grads: Vec<f32> = (0..h * q * k).map(|_| rng.gen::<f32>() - 0.4).collect();
        map.with_gradients(Tensor::from_data(TensorData::new(grads, [h, q, k]), &device))
            .unwrap()
    }

    fn random_capture(
        seed: u64,
        lt: usize,
        li: usize,
        with_grad: bool,
    ) -> AttentionCapture<TestBackend> {
        let mut rng = Seed::new(seed).to_rng();
        let h = 2;
        let text = (0..2).map(|_| random_map(&mut rng, h, lt, lt, with_grad)).collect();
        let image = (0..2).map(|_| random_map(&mut rng, h, li, li, with_grad)).collect();
        let cross = (0..3)
            .map(|_| CrossModalLayer {
                text_to_image: random_map(&mut rng, h, lt, li, with_grad),
                image_to_text: random_map(&mut rng, h, li, lt, with_grad),
                text_self: random_map(&mut rng, h, lt, lt, with_grad),
                image_self: random_map(&mut rng, h, li, li, with_grad),
            })
            .collect();
        AttentionCapture::new(text, image, cross).unwrap()
    }

    fn identity_map(h: usize, n: usize) -> AttentionMap<TestBackend> {
        let device = Default::default();
        let eye = Tensor::<TestBackend, 2>::eye(n, &device);
        AttentionMap::new(eye.unsqueeze::<3>().repeat_dim(0, h))
    }

    fn identity_capture(n: usize) -> AttentionCapture<TestBackend> {
        let cross = CrossModalLayer {
            text_to_image: identity_map(2, n),
            image_to_text: identity_map(2, n),
            text_self: identity_map(2, n),
            image_self: identity_map(2, n),
        };
        AttentionCapture::new(
            vec![identity_map(2, n), identity_map(2, n)],
            vec![identity_map(2, n)],
            vec![cross.clone(), cross],
        )
        .unwrap()
    }

    fn identity_values(n: usize) -> Vec<f32> {
        (0..n * n).map(|i| if i % (n + 1) == 0 { 1.0 } else { 0.0 }).collect()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(RelevanceKind::Rollout.display_name(), "Attention Rollout");
        assert_eq!(RelevanceKind::GradCam.display_name(), "Gradcam");
        assert_eq!(RelevanceKind::Redistribution.display_name(), "Chefer Explainability");
        assert!(!RelevanceKind::Rollout.needs_gradients());
        assert!(RelevanceKind::GradCam.needs_gradients());
    }

    #[test]
    fn test_rollout_of_identity_layers_is_identity() {
        let device = Default::default();
        let layers = vec![Tensor::<TestBackend, 2>::eye(4, &device); 3];
        let joint = rollout(&layers, 4, &device);
        assert_close(&tensor_to_vec(joint).unwrap(), &identity_values(4));

        let empty = rollout::<TestBackend>(&[], 3, &device);
        assert_close(&tensor_to_vec(empty).unwrap(), &identity_values(3));
    }

    #[test]
    fn test_rollout_rows_stay_stochastic() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 2>::from_floats(
            [[0.5, 0.5, 0.0], [0.2, 0.3, 0.5], [0.0, 0.0, 1.0]],
            &device,
        );
        let b = Tensor::<TestBackend, 2>::from_floats(
            [[1.0, 0.0, 0.0], [0.1, 0.1, 0.8], [0.3, 0.3, 0.4]],
            &device,
        );
        let joint = rollout(&[a, b], 3, &device);
        let sums = tensor_to_vec(joint.sum_dim(1)).unwrap();
        assert_close(&sums, &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_rollout_identity_attention() {
        let maps = Rollout.accumulate(&identity_capture(3)).unwrap();

        let mut expected = identity_values(3);
        expected[0] = 0.0;
        assert_close(&tensor_to_vec(maps.text_self).unwrap(), &expected);
        assert_close(&tensor_to_vec(maps.text_to_image).unwrap(), &identity_values(3));
    }

    #[test]
    fn test_aggregate_diagonal_zero_for_every_rule() {
        let capture = random_capture(11, 5, 4, true);
        for method in RelevanceMethod::presentation_order(RedistributionConfig::default()) {
            let maps = method.accumulate(&capture).unwrap();
            assert_eq!(maps.kind, method.kind());
            assert_eq!(maps.text_self.dims(), [5, 5]);
            assert_eq!(maps.text_to_image.dims(), [5, 4]);

            let values = tensor_to_vec(maps.text_self).unwrap();
            assert_eq!(values[0], 0.0);
            assert!(values.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_gradient_rules_need_gradients() {
        let capture = random_capture(5, 4, 3, false);
        assert!(Rollout.accumulate(&capture).is_ok());
        assert!(matches!(
            GradCam.accumulate(&capture),
            Err(CoreError::MissingGradients(_))
        ));
        assert!(matches!(
            Redistribution::default().accumulate(&capture),
            Err(CoreError::MissingGradients(_))
        ));
    }

    #[test]
    fn test_grad_cam_is_non_negative() {
        let maps = GradCam.accumulate(&random_capture(3, 4, 6, true)).unwrap();
        let values = tensor_to_vec(maps.text_to_image).unwrap();
        assert!(values.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_redistribution_with_zero_gradients() {
        let device = Default::default();
        let zero_grads = |m: AttentionMap<TestBackend>| {
            let dims = m.dims();
            m.with_gradients(Tensor::zeros(dims, &device)).unwrap()
        };
        let base = random_capture(9, 4, 3, false);
        let cross = base
            .cross_layers()
            .iter()
            .map(|l| CrossModalLayer {
                text_to_image: zero_grads(l.text_to_image.clone()),
                image_to_text: zero_grads(l.image_to_text.clone()),
                text_self: zero_grads(l.text_self.clone()),
                image_self: zero_grads(l.image_self.clone()),
            })
            .collect();
        let capture = AttentionCapture::new(
            base.text_layers().iter().cloned().map(zero_grads).collect(),
            base.image_layers().iter().cloned().map(zero_grads).collect(),
            cross,
        )
        .unwrap();

        let maps = Redistribution::default().accumulate(&capture).unwrap();
        let mut expected = identity_values(4);
        expected[0] = 0.0;
        assert_close(&tensor_to_vec(maps.text_self).unwrap(), &expected);
        assert_close(&tensor_to_vec(maps.text_to_image).unwrap(), &[0.0; 12]);
    }

    #[test]
    fn test_normalization_flag_tolerates_bad_diagonals() {
        let config = RedistributionConfig {
            normalize_self_attention: true,
            apply_self_in_cross_rule: true,
        };
        let maps = Redistribution::new(config)
            .accumulate(&random_capture(21, 5, 3, true))
            .unwrap();
        let values = tensor_to_vec(maps.text_to_image).unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_handle_residual() {
        let device = Default::default();
        let ok = Tensor::<TestBackend, 2>::from_floats([[2.0, 1.0], [0.5, 1.5]], &device);
        let normalized = handle_residual(&ok).unwrap().unwrap();
        // R - I = [[1, 1], [0.5, 0.5]] -> rows / sums + I
        assert_close(&tensor_to_vec(normalized).unwrap(), &[1.5, 0.5, 0.5, 1.5]);

        let negative = Tensor::<TestBackend, 2>::from_floats([[0.5, 0.2], [0.1, 1.0]], &device);
        assert!(handle_residual(&negative).unwrap().is_none());
    }

    #[test]
    fn test_accumulation_is_repeatable() {
        let capture = random_capture(42, 4, 5, true);
        for method in RelevanceMethod::presentation_order(RedistributionConfig::default()) {
            let first = method.accumulate(&capture).unwrap().image_scores().unwrap();
            let second = method.accumulate(&capture).unwrap().image_scores().unwrap();
            assert_eq!(first, second);
            assert_eq!(first.len(), 5);
        }
    }

    #[test]
    fn test_text_scores_row() {
        let maps = Rollout.accumulate(&identity_capture(3)).unwrap();
        assert_close(&maps.text_scores().unwrap(), &[0.0, 0.0, 0.0]);
    }

    fn fixed_map(shape: [usize; 3], weights: &[f32], grads: &[f32]) -> AttentionMap<TestBackend> {
        let device = Default::default();
        let weights = Tensor::from_data(TensorData::new(weights.to_vec(), shape), &device);
        let grads = Tensor::from_data(TensorData::new(grads.to_vec(), shape), &device);
        AttentionMap::new(weights).with_gradients(grads).unwrap()
    }

    /// Two text tokens, three regions, one layer of each kind.
    ///
    /// Single-head cams after `(grad * cam)+`:
    /// text `[[1, 0], [1, 0]]`, image `diag(1, 0, 1)`,
    /// last cross text->image `[[1, 1, 0], [0, 0, 0]]`,
    /// last cross text self `[[0, 0], [1, 0]]`.
    fn small_capture() -> AttentionCapture<TestBackend> {
        let third = 1.0 / 3.0;
        let text = fixed_map([1, 2, 2], &[0.5, 0.5, 0.25, 0.75], &[2.0, 0.0, 4.0, -1.0]);
        let image = fixed_map(
            [1, 3, 3],
            &[third; 9],
            &[3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 3.0],
        );
        let cross = CrossModalLayer {
            text_to_image: fixed_map(
                [1, 2, 3],
                &[0.5, 0.25, 0.25, 0.2, 0.3, 0.5],
                &[2.0, 4.0, 0.0, 0.0, 0.0, -2.0],
            ),
            image_to_text: fixed_map([1, 3, 2], &[0.5; 6], &[0.0; 6]),
            text_self: fixed_map([1, 2, 2], &[0.5; 4], &[0.0, 0.0, 2.0, 0.0]),
            image_self: fixed_map([1, 3, 3], &[third; 9], &[0.0; 9]),
        };
        AttentionCapture::new(vec![text], vec![image], vec![cross]).unwrap()
    }

    #[test]
    fn test_redistribution_small_case() {
        // R_tt = I + C_t = [[2, 0], [1, 1]], R_ii = I + C_i = diag(2, 1, 2).
        // Cross: R_ti += R_ttᵀ · C_ti · R_ii = [[4, 2, 0], [0, 0, 0]].
        // Last text self C_s: R_tt += C_s · R_tt, R_ti += C_s · R_ti.
        let maps = Redistribution::default().accumulate(&small_capture()).unwrap();
        assert_close(
            &tensor_to_vec(maps.text_to_image.clone()).unwrap(),
            &[4.0, 2.0, 0.0, 4.0, 2.0, 0.0],
        );
        assert_close(&tensor_to_vec(maps.text_self.clone()).unwrap(), &[0.0, 0.0, 3.0, 1.0]);
        assert_close(&maps.image_scores().unwrap(), &[8.0, 4.0, 0.0]);
    }

    #[test]
    fn test_redistribution_without_self_in_cross_rule() {
        let config = RedistributionConfig {
            normalize_self_attention: false,
            apply_self_in_cross_rule: false,
        };
        let maps = Redistribution::new(config).accumulate(&small_capture()).unwrap();
        assert_close(
            &tensor_to_vec(maps.text_to_image).unwrap(),
            &[1.0, 1.0, 0.0, 1.0, 1.0, 0.0],
        );
        assert_close(&tensor_to_vec(maps.text_self).unwrap(), &[0.0, 0.0, 3.0, 1.0]);
    }

    #[test]
    fn test_cross_attention_rules_values() {
        let device = Default::default();
        let r_ss = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0], [1.0, 1.0]], &device);
        let r_qq = Tensor::<TestBackend, 2>::from_floats(
            [[2.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 2.0]],
            &device,
        );
        let r_qs =
            Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]], &device);
        let cam =
            Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0, 0.0], [0.0, 0.0, 1.0]], &device);

        let config = RedistributionConfig::default();
        let (sq_add, ss_add) =
            apply_cross_attention_rules(&r_ss, &r_qq, &r_qs, &cam, &config).unwrap();
        // R_ssᵀ · cam · R_qq
        assert_close(&tensor_to_vec(sq_add).unwrap(), &[4.0, 2.0, 2.0, 0.0, 0.0, 2.0]);
        // cam · R_qs
        assert_close(&tensor_to_vec(ss_add).unwrap(), &[1.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_grad_cam_heads_weights_whole_heads() {
        let device = Default::default();
        let cam = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 2.0], [3.0, 4.0]], [[4.0, 0.0], [0.0, 4.0]]],
            &device,
        );
        // Head 0 mean gradient 1, head 1 mean gradient -1.
        let grad = Tensor::<TestBackend, 3>::from_floats(
            [[[2.0, 0.0], [0.0, 2.0]], [[0.0, -2.0], [-2.0, 0.0]]],
            &device,
        );
        // mean([[1, 2], [3, 4]], [[-4, 0], [0, -4]]) = [[-1.5, 1], [1.5, 0]], then clamp.
        let weighted = grad_cam_heads(cam.clone(), grad.clone());
        assert_close(&tensor_to_vec(weighted).unwrap(), &[0.0, 1.0, 1.5, 0.0]);

        let capture = AttentionCapture::new(
            vec![],
            vec![],
            vec![CrossModalLayer {
                text_to_image: AttentionMap::new(cam.clone())
                    .with_gradients(grad.clone())
                    .unwrap(),
                image_to_text: AttentionMap::new(cam.clone())
                    .with_gradients(grad.clone())
                    .unwrap(),
                text_self: AttentionMap::new(cam.clone())
                    .with_gradients(grad.clone())
                    .unwrap(),
                image_self: AttentionMap::new(cam).with_gradients(grad).unwrap(),
            }],
        )
        .unwrap();
        let maps = GradCam.accumulate(&capture).unwrap();
        assert_close(&tensor_to_vec(maps.text_to_image).unwrap(), &[0.0, 1.0, 1.5, 0.0]);
        assert_close(&tensor_to_vec(maps.text_self).unwrap(), &[0.0, 1.0, 1.5, 0.0]);
    }

    #[test]
    fn test_rollout_text_and_image_lengths_differ() {
        let sixth = 1.0 / 6.0;
        let third = 1.0 / 3.0;
        let capture = AttentionCapture::new(
            vec![AttentionMap::new(Tensor::from_floats(
                [[[0.5, 0.5], [0.0, 1.0]]],
                &Default::default(),
            ))],
            vec![AttentionMap::new(Tensor::from_floats(
                [[[third; 3]; 3]],
                &Default::default(),
            ))],
            vec![CrossModalLayer {
                text_to_image: AttentionMap::new(Tensor::from_floats(
                    [[[1.0, 0.0, 0.0], [0.0, 0.5, 0.5]]],
                    &Default::default(),
                )),
                image_to_text: fixed_map([1, 3, 2], &[0.5; 6], &[0.0; 6]),
                text_self: AttentionMap::new(Tensor::from_floats(
                    [[[0.0, 1.0], [1.0, 0.0]]],
                    &Default::default(),
                )),
                image_self: fixed_map([1, 3, 3], &[third; 9], &[0.0; 9]),
            }],
        )
        .unwrap();

        let maps = Rollout.accumulate(&capture).unwrap();
        assert_eq!(maps.text_to_image.dims(), [2, 3]);
        // R_tt before last = [[0.75, 0.25], [0, 1]], R_ii has 2/3 on the
        // diagonal and 1/6 elsewhere; R_ti = R_ttᵀ · cam_ti · R_ii.
        assert_close(
            &tensor_to_vec(maps.text_to_image.clone()).unwrap(),
            &[0.5, 0.125, 0.125, 2.0 * sixth, 11.0 / 24.0, 11.0 / 24.0],
        );
        // Last text self rolls in as all 0.5, on top of the text layer.
        assert_close(
            &tensor_to_vec(maps.text_self.clone()).unwrap(),
            &[0.0, 0.625, 0.375, 0.625],
        );
        assert_close(&maps.image_scores().unwrap(), &[5.0 / 6.0, 7.0 / 12.0, 7.0 / 12.0]);
    }
}
