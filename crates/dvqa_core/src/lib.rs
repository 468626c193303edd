//! # dvqa_core
//!
//! Core types shared by the dvqa-rs explanation crates.
//!
//! This crate provides:
//! - [`CoreError`] and the crate-wide [`Result`] alias
//! - [`Seed`] for reproducible synthetic inputs
//! - Image geometry: [`PatchGrid`], [`PatchIndex`], [`BoundingBox`], [`Region`]
//! - [`EmbeddingSequence`], a padded `[batch, len, dim]` tensor with its mask
//!
//! ## Sequence Convention
//!
//! Token embeddings follow `(B, L, D)`:
//! - `B`: Batch size (one question/image pair per row)
//! - `L`: Sequence length (text tokens, image patches or detected regions)
//! - `D`: Hidden width
//!
//! Padding masks are `(B, L)` booleans where `true` marks a position to ignore.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod seed;
mod shape;
mod tensor;

pub use error::{CoreError, Result};
pub use seed::Seed;
pub use shape::{BoundingBox, DetectedLabel, Detections, PatchGrid, PatchIndex, Region};
pub use tensor::{tensor_to_vec, EmbeddingSequence};

/// Backend type aliases for convenience
pub mod backend {
    #[cfg(feature = "backend-ndarray")]
    pub use burn_ndarray::NdArray;
}
