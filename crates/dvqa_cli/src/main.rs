//! dvqa CLI for replaying recorded models and exporting explanations.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burn_ndarray::NdArray;
use image::{Rgb, RgbImage};

use dvqa_analysis::{export_result, ExportConfig, PredictionResult};
use dvqa_core::{PatchGrid, Seed};
use dvqa_pipeline::{
    explain_box_model, explain_box_model_for_target, explain_patch_model,
    explain_patch_model_for_target, load_record, save_record, synthetic_box_record,
    synthetic_patch_record, BoxRecord, ExplainConfig, PatchRecord, RecordedBoxModel,
    RecordedPatchModel,
};

/// Backend type for replay.
type ReplayBackend = NdArray;

/// Size of the blank frame used when no image is given.
const DEFAULT_FRAME: (u32, u32) = (640, 480);

#[derive(Parser)]
#[command(name = "dvqa")]
#[command(author, version)]
#[command(about = "Visual explanations for drone VQA - replay recorded models and export heatmaps")]
#[command(long_about = "dvqa-rs: attention-based visual explanations for visual question answering.

EXAMPLES:
  # Generate a synthetic patch-model record
  dvqa synth --kind patch --out vilt.json --tokens 4

  # Explain it over a camera frame and export the result
  dvqa explain-patch --record vilt.json --image frame.png --out ./exports/run-1

  # Explain a region model for the third answer
  dvqa explain-box --record lxmert.json --image frame.png --out ./exports/run-2 --target 2

  # Record the environment settings the frame was captured under
  dvqa explain-patch --record vilt.json --out ./exports/run-3 --effect Fisheye --weather rain=0.4")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by both explain commands.
#[derive(clap::Args)]
struct ExplainArgs {
    /// Recorded model (JSON)
    #[arg(long, value_name = "FILE")]
    record: PathBuf,

    /// Camera frame to explain; a blank frame is used when omitted
    #[arg(long, value_name = "FILE")]
    image: Option<PathBuf>,

    /// Output directory for the exported images and report
    #[arg(long, value_name = "DIR")]
    out: PathBuf,

    /// Explanation configuration (JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Question asked about the frame
    #[arg(long, default_value = "How many cars are there?")]
    question: String,

    /// Answer index to explain instead of the top-1
    #[arg(long, value_name = "INDEX")]
    target: Option<usize>,

    /// Camera effect active when the frame was captured
    #[arg(long, default_value = "Normal")]
    effect: String,

    /// Weather setting as NAME=INTENSITY, repeatable
    #[arg(long, value_name = "NAME=INTENSITY", value_parser = parse_weather)]
    weather: Vec<(String, f32)>,

    /// Export resolution as WIDTHxHEIGHT, or "source" to keep the frame size
    #[arg(long, default_value = "1280x720", value_parser = parse_size)]
    size: ExportSize,
}

#[derive(Clone, Copy)]
enum ExportSize {
    Source,
    Fixed(u32, u32),
}

#[derive(Clone, Copy, ValueEnum)]
enum RecordKind {
    /// Single-stream patch model
    Patch,
    /// Dual-stream region model
    Box,
}

#[derive(Subcommand)]
enum Commands {
    /// Explain a recorded patch model (token-to-patch alignment)
    ExplainPatch(ExplainArgs),
    /// Explain a recorded region model (relevance over detected boxes)
    ExplainBox(ExplainArgs),
    /// Write a deterministic synthetic record
    Synth {
        /// Kind of model to synthesize
        #[arg(long, value_enum)]
        kind: RecordKind,

        /// Output path for the record
        #[arg(long, value_name = "FILE")]
        out: PathBuf,

        /// Random seed for reproducibility
        #[arg(long, default_value = "42", value_name = "SEED")]
        seed: u64,

        /// Number of question words
        #[arg(long, default_value = "3", value_name = "N")]
        tokens: usize,

        /// Number of detected regions (box records)
        #[arg(long, default_value = "6", value_name = "N")]
        boxes: usize,

        /// Patch grid as ROWSxCOLS (patch records)
        #[arg(long, default_value = "7x7", value_parser = parse_grid)]
        grid: PatchGrid,
    },
}

fn parse_weather(s: &str) -> std::result::Result<(String, f32), String> {
    let (name, intensity) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=INTENSITY, got '{s}'"))?;
    let intensity: f32 = intensity
        .parse()
        .map_err(|e| format!("invalid intensity '{intensity}': {e}"))?;
    Ok((name.to_string(), intensity))
}

fn parse_pair(s: &str) -> std::result::Result<(u32, u32), String> {
    let (a, b) = s
        .split_once('x')
        .ok_or_else(|| format!("expected AxB, got '{s}'"))?;
    let a = a.parse().map_err(|e| format!("invalid '{a}': {e}"))?;
    let b = b.parse().map_err(|e| format!("invalid '{b}': {e}"))?;
    Ok((a, b))
}

fn parse_size(s: &str) -> std::result::Result<ExportSize, String> {
    if s.eq_ignore_ascii_case("source") {
        return Ok(ExportSize::Source);
    }
    let (w, h) = parse_pair(s)?;
    Ok(ExportSize::Fixed(w, h))
}

fn parse_grid(s: &str) -> std::result::Result<PatchGrid, String> {
    let (rows, cols) = parse_pair(s)?;
    if rows == 0 || cols == 0 {
        return Err("grid must have at least one row and column".to_string());
    }
    Ok(PatchGrid::new(rows as usize, cols as usize))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::ExplainPatch(args) => handle_explain_patch(&args),
        Commands::ExplainBox(args) => handle_explain_box(&args),
        Commands::Synth {
            kind,
            out,
            seed,
            tokens,
            boxes,
            grid,
        } => handle_synth(kind, &out, seed, tokens, boxes, grid),
    }
}

fn load_config(path: Option<&Path>) -> Result<ExplainConfig> {
    match path {
        Some(path) => ExplainConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ExplainConfig::default()),
    }
}

fn load_frame(path: Option<&Path>) -> Result<RgbImage> {
    match path {
        Some(path) => Ok(image::open(path)
            .with_context(|| format!("Failed to open image {}", path.display()))?
            .to_rgb8()),
        None => {
            tracing::info!(
                "No image given, using a blank {}x{} frame",
                DEFAULT_FRAME.0,
                DEFAULT_FRAME.1
            );
            Ok(RgbImage::from_pixel(DEFAULT_FRAME.0, DEFAULT_FRAME.1, Rgb([128, 128, 128])))
        }
    }
}

fn export_config(args: &ExplainArgs) -> ExportConfig {
    let size = match args.size {
        ExportSize::Source => None,
        ExportSize::Fixed(w, h) => Some((w, h)),
    };
    args.weather.iter().fold(
        ExportConfig::default()
            .with_camera_effect(args.effect.clone())
            .with_export_size(size),
        |config, (name, intensity)| config.with_weather(name.clone(), *intensity),
    )
}

fn handle_explain_patch(args: &ExplainArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let record: PatchRecord = load_record(&args.record)
        .with_context(|| format!("Failed to load patch record {}", args.record.display()))?;
    let frame = load_frame(args.image.as_deref())?;
    let model = RecordedPatchModel::<ReplayBackend>::new(record, Default::default());

    let result = match args.target {
        Some(target) => {
            explain_patch_model_for_target(&model, &frame, &args.question, target, &config)
        }
        None => explain_patch_model(&model, &frame, &args.question, &config),
    }
    .context("Patch explanation failed")?;

    finish(&result, args)
}

fn handle_explain_box(args: &ExplainArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let record: BoxRecord = load_record(&args.record)
        .with_context(|| format!("Failed to load box record {}", args.record.display()))?;
    let frame = load_frame(args.image.as_deref())?;
    let model = RecordedBoxModel::<ReplayBackend>::new(record, Default::default());
    let detector = model.detector();

    let result = match args.target {
        Some(target) => {
            explain_box_model_for_target(&model, &detector, &frame, &args.question, target, &config)
        }
        None => explain_box_model(&model, &detector, &frame, &args.question, &config),
    }
    .context("Box explanation failed")?;

    finish(&result, args)
}

fn finish(result: &PredictionResult, args: &ExplainArgs) -> Result<()> {
    print_summary(result);

    let files = export_result(result, &args.out, &export_config(args))
        .with_context(|| format!("Failed to export to {}", args.out.display()))?;

    println!("\nExported to {}:", args.out.display());
    println!("  {}", files.base_image.display());
    for path in &files.visualizations {
        println!("  {}", path.display());
    }
    println!("  {}", files.report.display());
    Ok(())
}

fn print_summary(result: &PredictionResult) {
    println!("Model:    {}", result.model());
    println!("Question: {}", result.question());
    println!("Answer:   {}", result.prediction());
    println!("\nTop answers:");
    println!("─────────────────────────────────");
    for (i, top) in result.top_predictions().iter().enumerate() {
        println!("{:>2}. {:<20} {:>6.2}%", i + 1, top.answer, top.probability * 100.0);
    }
    println!("\nVisualizations: {}", result.visualization_names().join(", "));
}

fn handle_synth(
    kind: RecordKind,
    out: &Path,
    seed: u64,
    tokens: usize,
    boxes: usize,
    grid: PatchGrid,
) -> Result<()> {
    if tokens == 0 {
        bail!("A question needs at least one word");
    }
    let seed = Seed::new(seed);

    match kind {
        RecordKind::Patch => {
            let record = synthetic_patch_record(seed, tokens, grid);
            save_record(&record, out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!(
                "Wrote patch record ({} tokens, {} patches) to {}",
                record.tokens.len(),
                grid.cells(),
                out.display()
            );
        }
        RecordKind::Box => {
            let record =
                synthetic_box_record(seed, tokens, boxes, DEFAULT_FRAME.0, DEFAULT_FRAME.1);
            save_record(&record, out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!(
                "Wrote box record ({} tokens, {} regions) to {}",
                record.tokens.len(),
                record.detections.len(),
                out.display()
            );
        }
    }
    Ok(())
}
