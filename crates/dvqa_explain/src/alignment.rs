//! Token-to-patch alignment by entropic optimal transport.
//!
//! Text tokens and image patches of a single-stream model are compared with a
//! cosine cost, and an approximate optimal transport plan between the two
//! sequences is found with IPOT (Inexact Proximal point method for Optimal
//! Transport): a fixed number of proximal steps, each solved with a few
//! Sinkhorn-style marginal rescalings.
//!
//! Reference: Xie et al., "A Fast Proximal Point Method for Computing Exact
//! Wasserstein Distance", UAI 2019.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use dvqa_core::{tensor_to_vec, CoreError, EmbeddingSequence, Result};

/// Additive guard on padded rows/columns in the marginal updates.
const PAD_GUARD: f32 = 1e4;

/// Smallest denominator accepted by a reciprocal, so that a row or column
/// without any transportable mass yields a finite (and later masked) value.
const DENOM_FLOOR: f32 = 1e-12;

/// Configuration for [`ipot`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Entropic regularisation temperature; must be finite and positive.
    pub beta: f32,
    /// Number of proximal (outer) iterations.
    pub outer_iterations: usize,
    /// Marginal rescalings per proximal step.
    pub inner_iterations: usize,
    /// Norm floor used when L2-normalising embeddings.
    pub eps: f32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            beta: 0.1,
            outer_iterations: 1000,
            inner_iterations: 1,
            eps: 1e-5,
        }
    }
}

impl AlignmentConfig {
    /// Set the number of outer iterations.
    ///
    /// Interactive callers trade precision for latency with a smaller count.
    #[must_use]
    pub fn with_outer_iterations(mut self, n: usize) -> Self {
        self.outer_iterations = n;
        self
    }

    /// Set the regularisation temperature.
    #[must_use]
    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }
}

/// Scale every vector along the last axis to unit L2 norm.
///
/// Norms below `eps` are replaced by `eps`, so near-zero vectors shrink to
/// (near) zero instead of dividing by zero.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 3>, eps: f32) -> Tensor<B, 3> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(2).sqrt().clamp_min(eps);
    x / norm
}

/// Pairwise cosine distance between two batched sequences.
///
/// `(B, Lx, D) x (B, Ly, D) -> (B, Lx, Ly)` with `cost = 1 - cos(x_i, y_j)`.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if batch sizes or widths differ.
pub fn cost_matrix_cosine<B: Backend>(
    x: Tensor<B, 3>,
    y: Tensor<B, 3>,
    eps: f32,
) -> Result<Tensor<B, 3>> {
    let [bx, _, dx] = x.dims();
    let [by, _, dy] = y.dims();
    if bx != by {
        return Err(CoreError::ShapeMismatch(format!(
            "text batch {bx} != image batch {by}"
        )));
    }
    if dx != dy {
        return Err(CoreError::ShapeMismatch(format!(
            "text width {dx} != image width {dy}"
        )));
    }

    let x_norm = l2_normalize(x, eps);
    let y_norm = l2_normalize(y, eps);
    let cosine_sim = x_norm.matmul(y_norm.swap_dims(1, 2));
    Ok(cosine_sim.neg().add_scalar(1.0))
}

/// Pairwise padding mask: `(B, M) x (B, N) -> (B, M, N)`, true where either side is padding.
pub fn joint_padding<B: Backend>(
    x_pad: Tensor<B, 2, Bool>,
    y_pad: Tensor<B, 2, Bool>,
) -> Tensor<B, 3, Bool> {
    let m = x_pad.dims()[1];
    let n = y_pad.dims()[1];
    let x = x_pad.float().unsqueeze_dim::<3>(2).repeat_dim(2, n);
    let y = y_pad.float().unsqueeze_dim::<3>(1).repeat_dim(1, m);
    (x + y).greater_elem(0.5)
}

/// A transport plan of shape `(B, Ly, Lx)`: mass moved from each text token
/// (last axis) to each image position (middle axis).
#[derive(Debug, Clone)]
pub struct TransportPlan<B: Backend> {
    plan: Tensor<B, 3>,
}

impl<B: Backend> TransportPlan<B> {
    /// Wrap a `(B, Ly, Lx)` tensor.
    pub fn new(plan: Tensor<B, 3>) -> Self {
        Self { plan }
    }

    /// The raw `(B, Ly, Lx)` plan.
    #[must_use]
    pub fn plan(&self) -> &Tensor<B, 3> {
        &self.plan
    }

    /// Consume the plan.
    #[must_use]
    pub fn into_inner(self) -> Tensor<B, 3> {
        self.plan
    }

    /// `[batch, image_len, text_len]`.
    #[must_use]
    pub fn dims(&self) -> [usize; 3] {
        self.plan.dims()
    }

    /// Multiply every entry by `factor`.
    #[must_use]
    pub fn rescaled(self, factor: f32) -> Self {
        Self {
            plan: self.plan.mul_scalar(factor),
        }
    }

    /// Text-major view `(Lx, Ly)` of one batch row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] for a batch index past the end.
    pub fn text_to_image(&self, batch: usize) -> Result<Tensor<B, 2>> {
        let [b, ly, lx] = self.plan.dims();
        if batch >= b {
            return Err(CoreError::IndexOutOfRange {
                index: batch,
                len: b,
            });
        }
        Ok(self
            .plan
            .clone()
            .slice([batch..batch + 1, 0..ly, 0..lx])
            .reshape([ly, lx])
            .transpose())
    }

    /// Mass sent from text token `token` to every image position, as host data.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexOutOfRange`] for an invalid batch or token index.
    pub fn token_relevance(&self, batch: usize, token: usize) -> Result<Vec<f32>> {
        let rows = self.text_to_image(batch)?;
        let [lx, ly] = rows.dims();
        if token >= lx {
            return Err(CoreError::IndexOutOfRange {
                index: token,
                len: lx,
            });
        }
        tensor_to_vec(rows.slice([token..token + 1, 0..ly]))
    }
}

/// Solve the entropic transport problem for a masked cost matrix.
///
/// * `cost` - `(B, M, N)` cost, zero at padded pairs
/// * `x_pad` - `(B, M)` padding of the source (text) side
/// * `y_pad` - `(B, N)` padding of the target (image) side
///
/// The iteration count is fixed; no convergence test is made, so the run time
/// is a deterministic function of the configuration. Lengths are clamped to at
/// least one and every reciprocal has a positive floor: a fully padded row or
/// column produces zeros, never NaN.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if the masks disagree with `cost` and
/// [`CoreError::InvalidConfig`] if `config.beta` is not finite and positive.
pub fn ipot<B: Backend>(
    cost: Tensor<B, 3>,
    x_pad: Tensor<B, 2, Bool>,
    y_pad: Tensor<B, 2, Bool>,
    config: &AlignmentConfig,
) -> Result<TransportPlan<B>> {
    let [b, m, n] = cost.dims();
    if x_pad.dims() != [b, m] || y_pad.dims() != [b, n] {
        return Err(CoreError::ShapeMismatch(format!(
            "cost ({b}, {m}, {n}) vs masks {:?} and {:?}",
            x_pad.dims(),
            y_pad.dims()
        )));
    }
    let beta = config.beta;
    if !(beta.is_finite() && beta > 0.0) {
        return Err(CoreError::InvalidConfig(format!(
            "transport temperature beta must be finite and positive, got {beta}"
        )));
    }
    let device = cost.device();
    if b == 0 || m == 0 || n == 0 {
        return Ok(TransportPlan::new(Tensor::zeros([b, n, m], &device)));
    }

    let inner = config.inner_iterations.max(1);

    let x_pad_f = x_pad.clone().float();
    let y_pad_f = y_pad.clone().float();
    let x_len = x_pad_f.clone().neg().add_scalar(1.0).sum_dim(1).clamp_min(1.0);
    let y_len = y_pad_f.clone().neg().add_scalar(1.0).sum_dim(1).clamp_min(1.0);

    // (B, N, M)
    let joint = joint_padding(x_pad.clone(), y_pad).swap_dims(1, 2);

    let sigma0 = (Tensor::<B, 2>::ones([b, m], &device) / x_len.clone()).mask_fill(x_pad, 0.0);
    let mut sigma = sigma0.reshape([b, 1, m]);
    let mut plan = Tensor::<B, 3>::ones([b, n, m], &device).mask_fill(joint.clone(), 0.0);
    let kernel = cost
        .swap_dims(1, 2)
        .div_scalar(beta)
        .neg()
        .exp()
        .mask_fill(joint.clone(), 0.0);

    let x_len = x_len.reshape([b, 1, 1]);
    let y_len = y_len.reshape([b, 1, 1]);
    let x_guard = x_pad_f.mul_scalar(PAD_GUARD).reshape([b, 1, m]);
    let y_guard = y_pad_f.mul_scalar(PAD_GUARD).reshape([b, 1, n]);

    let mut delta = Tensor::<B, 3>::zeros([b, 1, n], &device);
    for _ in 0..config.outer_iterations {
        let q = kernel.clone() * plan;
        let mut s = sigma.reshape([b, m, 1]);
        for _ in 0..inner {
            let qs = q.clone().matmul(s).reshape([b, 1, n]);
            delta = (y_len.clone() * qs + y_guard.clone())
                .clamp_min(DENOM_FLOOR)
                .recip();
            let dq = delta.clone().matmul(q.clone());
            s = (x_len.clone() * dq + x_guard.clone())
                .clamp_min(DENOM_FLOOR)
                .recip()
                .reshape([b, m, 1]);
        }
        sigma = s.reshape([b, 1, m]);
        plan = delta.clone().reshape([b, n, 1]) * q * sigma.clone();
    }

    Ok(TransportPlan::new(plan.mask_fill(joint, 0.0)))
}

/// Align a text sequence with an image sequence.
///
/// Computes the cosine cost between the two sequences, zeroes it on padded
/// pairs and runs [`ipot`] with the padding masks of both sides.
///
/// # Errors
///
/// Returns [`CoreError::ShapeMismatch`] if the sequences disagree in batch
/// size or embedding width and [`CoreError::InvalidConfig`] for a
/// non-positive `beta`.
pub fn align<B: Backend>(
    text: &EmbeddingSequence<B>,
    image: &EmbeddingSequence<B>,
    config: &AlignmentConfig,
) -> Result<TransportPlan<B>> {
    if text.batch() != image.batch() {
        return Err(CoreError::ShapeMismatch(format!(
            "text batch {} != image batch {}",
            text.batch(),
            image.batch()
        )));
    }
    let cost = cost_matrix_cosine(
        text.embeddings().clone(),
        image.embeddings().clone(),
        config.eps,
    )?;
    let joint = joint_padding(text.padding().clone(), image.padding().clone());
    let cost = cost.mask_fill(joint, 0.0);
    ipot(cost, text.padding().clone(), image.padding().clone(), config)
}
