//! Pipeline configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use dvqa_analysis::DEFAULT_TOP_K;
use dvqa_explain::{AlignmentConfig, RedistributionConfig};
use dvqa_imaging::HeatmapConfig;

use crate::error::Result;

/// Configuration shared by both pipelines.
///
/// Missing fields fall back to their defaults when deserialised, so a
/// partial JSON file such as `{"top_k": 3}` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainConfig {
    /// Transport solver options (patch models).
    pub alignment: AlignmentConfig,
    /// Heatmap normalisation (patch models).
    pub heatmap: HeatmapConfig,
    /// Relevance redistribution options (region models).
    pub redistribution: RedistributionConfig,
    /// Number of ranked answers to report.
    pub top_k: usize,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            alignment: AlignmentConfig::default(),
            heatmap: HeatmapConfig::default(),
            redistribution: RedistributionConfig::default(),
            top_k: DEFAULT_TOP_K,
        }
    }
}

impl ExplainConfig {
    /// Set the transport solver options.
    #[must_use]
    pub fn with_alignment(mut self, alignment: AlignmentConfig) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the heatmap options.
    #[must_use]
    pub fn with_heatmap(mut self, heatmap: HeatmapConfig) -> Self {
        self.heatmap = heatmap;
        self
    }

    /// Set the redistribution options.
    #[must_use]
    pub fn with_redistribution(mut self, redistribution: RedistributionConfig) -> Self {
        self.redistribution = redistribution;
        self
    }

    /// Set the number of ranked answers.
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Load a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExplainConfig::default();
        assert_eq!(config.top_k, 5);
        assert_eq!(config.alignment.outer_iterations, 1000);
        assert_eq!(config.heatmap.clip_max, 3.0);
        assert!(!config.redistribution.normalize_self_attention);
    }

    #[test]
    fn test_partial_json() {
        let config: ExplainConfig =
            serde_json::from_str(r#"{"top_k": 3, "alignment": {"outer_iterations": 50}}"#).unwrap();
        assert_eq!(config.top_k, 3);
        assert_eq!(config.alignment.outer_iterations, 50);
        assert_eq!(config.alignment.beta, AlignmentConfig::default().beta);
        assert_eq!(config.heatmap, HeatmapConfig::default());
    }
}
