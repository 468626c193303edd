//! Result export.
//!
//! An exported result is a directory holding:
//! - `base_image.png` - the image the question was asked about
//! - `<name>.png` - one file per visualisation, named after it
//! - `results.json` - the [`ResultReport`] sidecar
//!
//! # Example
//!
//! ```rust,ignore
//! use dvqa_analysis::{export_result, ExportConfig};
//!
//! let files = export_result(&result, "./exports/run-1", &ExportConfig::default())?;
//! println!("report written to {}", files.report.display());
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::prediction::PredictionResult;

/// Base image file name.
pub const BASE_IMAGE_FILE: &str = "base_image.png";
/// Report file name.
pub const REPORT_FILE: &str = "results.json";

/// One weather condition applied to the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSetting {
    /// Condition name, e.g. "Rain".
    pub name: String,
    /// Intensity in percent.
    pub intensity: f32,
}

/// Export options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Size visualisations are resized to; `None` keeps their size.
    pub export_size: Option<(u32, u32)>,
    /// Camera effect the image was captured with.
    pub camera_effect: String,
    /// Weather conditions; only positive intensities are reported.
    pub weather: Vec<WeatherSetting>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            export_size: Some((1280, 720)),
            camera_effect: "Normal".to_string(),
            weather: Vec::new(),
        }
    }
}

impl ExportConfig {
    /// Set the camera effect.
    #[must_use]
    pub fn with_camera_effect(mut self, effect: impl Into<String>) -> Self {
        self.camera_effect = effect.into();
        self
    }

    /// Add a weather condition.
    #[must_use]
    pub fn with_weather(mut self, name: impl Into<String>, intensity: f32) -> Self {
        self.weather.push(WeatherSetting {
            name: name.into(),
            intensity,
        });
        self
    }

    /// Set or clear the export size.
    #[must_use]
    pub fn with_export_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.export_size = size;
        self
    }
}

/// An alternative answer in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AltAnswer {
    /// Answer label.
    pub answer: String,
    /// Softmax probability.
    pub probability: f32,
}

/// Capture settings in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSettings {
    /// Camera effect.
    pub effect: String,
    /// Active weather conditions and their intensity.
    pub weather: BTreeMap<String, f32>,
}

/// JSON sidecar describing an exported result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    /// Model name.
    pub model: String,
    /// Question asked.
    pub question: String,
    /// Top-1 answer.
    pub answer: String,
    /// Ranked answers keyed `alt_answer_1`, `alt_answer_2`, ...
    pub details: BTreeMap<String, AltAnswer>,
    /// Capture settings.
    pub settings: ReportSettings,
}

impl ResultReport {
    /// Build the report of a result.
    #[must_use]
    pub fn new(result: &PredictionResult, config: &ExportConfig) -> Self {
        let details = result
            .top_predictions()
            .iter()
            .enumerate()
            .map(|(i, top)| {
                (
                    format!("alt_answer_{}", i + 1),
                    AltAnswer {
                        answer: top.answer.clone(),
                        probability: top.probability,
                    },
                )
            })
            .collect();
        let weather = config
            .weather
            .iter()
            .filter(|w| w.intensity > 0.0)
            .map(|w| (w.name.clone(), w.intensity))
            .collect();

        Self {
            model: result.model().to_string(),
            question: result.question().to_string(),
            answer: result.prediction().to_string(),
            details,
            settings: ReportSettings {
                effect: config.camera_effect.clone(),
                weather,
            },
        }
    }
}

/// Paths written by [`export_result`].
#[derive(Debug, Clone)]
pub struct ExportedFiles {
    /// The base image.
    pub base_image: PathBuf,
    /// One file per visualisation, in result order.
    pub visualizations: Vec<PathBuf>,
    /// The JSON report.
    pub report: PathBuf,
}

fn resized(image: &RgbImage, size: Option<(u32, u32)>) -> RgbImage {
    match size {
        Some((w, h)) if image.dimensions() != (w, h) && w > 0 && h > 0 => {
            imageops::resize(image, w, h, FilterType::Triangle)
        }
        _ => image.clone(),
    }
}

/// Write a result into `dir`, creating it if needed.
///
/// # Errors
///
/// Returns an error if the directory or any file cannot be written.
pub fn export_result(
    result: &PredictionResult,
    dir: impl AsRef<Path>,
    config: &ExportConfig,
) -> Result<ExportedFiles> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let base_image = dir.join(BASE_IMAGE_FILE);
    result.image().save(&base_image)?;

    let mut visualizations = Vec::with_capacity(result.visualizations().len());
    for (name, image) in result.named_visualizations() {
        let path = dir.join(format!("{name}.png"));
        resized(image, config.export_size).save(&path)?;
        visualizations.push(path);
    }

    let report = dir.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(&ResultReport::new(result, config))?;
    std::fs::write(&report, json)?;

    tracing::info!(
        dir = %dir.display(),
        visualizations = visualizations.len(),
        "exported result"
    );
    Ok(ExportedFiles {
        base_image,
        visualizations,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::TopPrediction;
    use tempfile::tempdir;

    fn sample_result() -> PredictionResult {
        let image = RgbImage::new(32, 24);
        PredictionResult::new("ViLT", "Is there a car?", image.clone(), "yes")
            .with_top_predictions(vec![
                TopPrediction {
                    answer: "yes".to_string(),
                    probability: 0.8,
                },
                TopPrediction {
                    answer: "no".to_string(),
                    probability: 0.15,
                },
            ])
            .with_visualizations(
                vec![image.clone(), image],
                vec!["Combined Attention Patches".into(), "Token 1 - 'car'".into()],
            )
            .unwrap()
    }

    #[test]
    fn test_report_fields() {
        let config = ExportConfig::default()
            .with_camera_effect("Depth")
            .with_weather("Rain", 30.0)
            .with_weather("Snow", 0.0);
        let report = ResultReport::new(&sample_result(), &config);

        assert_eq!(report.answer, "yes");
        assert_eq!(report.details.len(), 2);
        assert_eq!(report.details["alt_answer_1"].answer, "yes");
        assert_eq!(report.details["alt_answer_2"].answer, "no");
        assert_eq!(report.settings.effect, "Depth");
        assert_eq!(report.settings.weather.len(), 1);
        assert_eq!(report.settings.weather["Rain"], 30.0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["details"]["alt_answer_2"]["answer"], "no");
        assert_eq!(json["model"], "ViLT");
        assert_eq!(json["settings"]["effect"], "Depth");
    }

    #[test]
    fn test_export_writes_files() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("run");
        let config = ExportConfig::default().with_export_size(Some((64, 36)));
        let files = export_result(&sample_result(), &out, &config).unwrap();

        assert!(files.base_image.exists());
        assert!(files.report.exists());
        assert_eq!(files.visualizations.len(), 2);
        assert!(out.join("Combined Attention Patches.png").exists());

        let first = image::open(&files.visualizations[0]).unwrap();
        assert_eq!((first.width(), first.height()), (64, 36));
        let base = image::open(&files.base_image).unwrap();
        assert_eq!((base.width(), base.height()), (32, 24));

        let json = std::fs::read_to_string(&files.report).unwrap();
        let report: ResultReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report.question, "Is there a car?");
    }

    #[test]
    fn test_export_keeps_size_without_target() {
        let dir = tempdir().unwrap();
        let config = ExportConfig::default().with_export_size(None);
        let files = export_result(&sample_result(), dir.path(), &config).unwrap();
        let first = image::open(&files.visualizations[1]).unwrap();
        assert_eq!((first.width(), first.height()), (32, 24));
    }
}
