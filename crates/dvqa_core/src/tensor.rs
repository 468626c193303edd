//! Padded embedding sequences.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{CoreError, Result};

/// Copy a float tensor back to the host as a flat row-major vector.
///
/// # Errors
///
/// Returns [`CoreError::TensorData`] if the backend data cannot be read as `f32`.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| CoreError::TensorData(format!("{e:?}")))
}

/// A batch of token embeddings with its padding mask.
///
/// The embeddings have shape `(B, L, D)` and the mask `(B, L)`, with `true`
/// marking padded (ignored) positions. One sequence is produced per modality
/// by a forward pass and is treated as read-only afterwards.
///
/// # Example
///
/// ```rust,ignore
/// use dvqa_core::EmbeddingSequence;
///
/// let rows = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
/// let seq = EmbeddingSequence::<NdArray>::from_rows(&rows, &[false, true], &device)?;
/// assert_eq!(seq.valid_lengths()?, vec![1]);
/// ```
#[derive(Debug, Clone)]
pub struct EmbeddingSequence<B: Backend> {
    embeddings: Tensor<B, 3>,
    padding: Tensor<B, 2, Bool>,
}

impl<B: Backend> EmbeddingSequence<B> {
    /// Create a sequence from embeddings and a padding mask.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if the mask is not `(B, L)` for
    /// embeddings of shape `(B, L, D)`.
    pub fn new(embeddings: Tensor<B, 3>, padding: Tensor<B, 2, Bool>) -> Result<Self> {
        let [batch, len, _] = embeddings.dims();
        let [mask_batch, mask_len] = padding.dims();
        if batch != mask_batch || len != mask_len {
            return Err(CoreError::ShapeMismatch(format!(
                "embeddings ({batch}, {len}, _) vs padding mask ({mask_batch}, {mask_len})"
            )));
        }
        Ok(Self {
            embeddings,
            padding,
        })
    }

    /// Create a sequence in which no position is padded.
    pub fn unpadded(embeddings: Tensor<B, 3>) -> Self {
        let [batch, len, _] = embeddings.dims();
        let padding = Tensor::<B, 2, Bool>::from_data(
            TensorData::new(vec![false; batch * len], [batch, len]),
            &embeddings.device(),
        );
        Self {
            embeddings,
            padding,
        }
    }

    /// Build a single-instance sequence from host rows.
    ///
    /// # Errors
    ///
    /// Returns an error if rows have differing widths or the mask length
    /// differs from the number of rows.
    pub fn from_rows(rows: &[Vec<f32>], padding: &[bool], device: &B::Device) -> Result<Self> {
        let len = rows.len();
        let dim = rows.first().map_or(0, Vec::len);
        if let Some(row) = rows.iter().find(|r| r.len() != dim) {
            return Err(CoreError::InvalidShape {
                expected: format!("rows of width {dim}"),
                got: format!("row of width {}", row.len()),
            });
        }
        if padding.len() != len {
            return Err(CoreError::ShapeMismatch(format!(
                "{len} embedding rows vs {} mask entries",
                padding.len()
            )));
        }

        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let embeddings = Tensor::<B, 3>::from_data(TensorData::new(flat, [1, len, dim]), device);
        let padding =
            Tensor::<B, 2, Bool>::from_data(TensorData::new(padding.to_vec(), [1, len]), device);
        Self::new(embeddings, padding)
    }

    /// Replace the padding mask.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if the new mask has the wrong shape.
    pub fn with_padding(self, padding: Tensor<B, 2, Bool>) -> Result<Self> {
        Self::new(self.embeddings, padding)
    }

    /// Batch size.
    #[must_use]
    pub fn batch(&self) -> usize {
        self.embeddings.dims()[0]
    }

    /// Sequence length, padding included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.embeddings.dims()[1]
    }

    /// Whether the sequence has no positions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding width.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.embeddings.dims()[2]
    }

    /// The `(B, L, D)` embeddings.
    #[must_use]
    pub fn embeddings(&self) -> &Tensor<B, 3> {
        &self.embeddings
    }

    /// The `(B, L)` padding mask.
    #[must_use]
    pub fn padding(&self) -> &Tensor<B, 2, Bool> {
        &self.padding
    }

    /// The device the sequence lives on.
    pub fn device(&self) -> B::Device {
        self.embeddings.device()
    }

    /// Host copy of the padding mask, one vector per batch row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TensorData`] if the mask cannot be read back.
    pub fn padding_rows(&self) -> Result<Vec<Vec<bool>>> {
        let len = self.len();
        let flat = self
            .padding
            .clone()
            .into_data()
            .to_vec::<bool>()
            .map_err(|e| CoreError::TensorData(format!("{e:?}")))?;
        if len == 0 {
            return Ok(vec![Vec::new(); self.batch()]);
        }
        Ok(flat.chunks(len).map(<[bool]>::to_vec).collect())
    }

    /// Number of non-padded positions in every batch row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TensorData`] if the mask cannot be read back.
    pub fn valid_lengths(&self) -> Result<Vec<usize>> {
        Ok(self
            .padding_rows()?
            .iter()
            .map(|row| row.iter().filter(|&&pad| !pad).count())
            .collect())
    }
}
