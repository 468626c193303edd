//! # dvqa_explain
//!
//! Attention explanations for dvqa-rs.
//!
//! This crate provides:
//! - Token-to-patch alignment by inexact proximal optimal transport (IPOT)
//! - Attention capture records for dual-stream encoders
//! - Relevance propagation: rollout, Grad-CAM and gradient-weighted redistribution

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod alignment;
mod capture;
mod relevance;

pub use alignment::{
    align, cost_matrix_cosine, ipot, joint_padding, l2_normalize, AlignmentConfig, TransportPlan,
};
pub use capture::{AttentionCapture, AttentionMap, CrossModalLayer};
pub use relevance::{
    apply_cross_attention_rules, apply_self_attention_rules, average_heads, grad_cam_heads,
    gradient_weighted_heads, handle_residual, rollout, GradCam, Redistribution,
    RedistributionConfig, RelevanceKind, RelevanceMaps, RelevanceMethod, RelevanceRule, Rollout,
};
