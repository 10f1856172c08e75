use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use facelive_core::backend::domain::control_sheet::{CellKind, CellValue};
use facelive_core::backend::infrastructure::backend_db::BackendDb;
use facelive_core::pipeline::{FaceSwapPipeline, PipelineConfig, PipelineMode, StageStatus};
use facelive_core::shared::constants::MIB;
use facelive_core::stages::domain::frame_sink::FrameSink;
use facelive_core::stages::domain::frame_source::FrameSource;
use facelive_core::stages::file_source::{self, SourceOpener};
use facelive_core::stages::infrastructure::image_file_source::ImageFileSource;
use facelive_core::stages::infrastructure::image_sequence_sink::ImageSequenceSink;
use facelive_core::stages::stream_output::SinkOpener;

/// Output silence after the last source frame that ends a finite run.
const QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Real-time face swap pipeline over image files and directories.
#[derive(Parser)]
#[command(name = "facelive")]
struct Cli {
    /// Input image files or directories of images. Each one becomes a source stage.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory to write merged frames into.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// JSON pipeline config. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pipeline mode: face_swap or face_animator.
    #[arg(long)]
    mode: Option<PipelineMode>,

    /// Source frame rate.
    #[arg(long)]
    fps: Option<f64>,

    /// Weak heap capacity in MiB.
    #[arg(long)]
    heap_mb: Option<usize>,

    /// Per-stage compute cache budget in MiB.
    #[arg(long)]
    cache_mb: Option<usize>,

    /// Backend DB file holding per-stage settings.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory for downloaded models.
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// URL of the reference face image, downloaded into the model directory
    /// when the swapper selects `reference-face`.
    #[arg(long)]
    reference_face_url: Option<String>,

    /// Restart crashed stages automatically.
    #[arg(long)]
    auto_restart: bool,

    /// Log per-stage timing summaries.
    #[arg(long)]
    timing_logs: bool,

    /// Wipe all persisted stage settings before running.
    #[arg(long)]
    reset_settings: bool,

    /// Loop the sources. Needs --duration to end.
    #[arg(long = "loop")]
    looping: bool,

    /// Stop after this many seconds.
    #[arg(long)]
    duration: Option<f64>,

    /// Set a stage cell before running, e.g. `face_merger.opacity=0.8` (repeatable).
    #[arg(long = "set", value_name = "STAGE.CELL=VALUE")]
    cells: Vec<String>,

    /// Seconds between status reports.
    #[arg(long, default_value = "2.0")]
    status_interval: f64,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    validate(&cli)?;
    let config = build_config(&cli)?;

    if cli.reset_settings {
        let path = config
            .backend_db_path
            .clone()
            .or_else(BackendDb::default_path)
            .ok_or("No config directory for the backend DB; pass --db")?;
        BackendDb::open(&path).clear()?;
        log::info!("Cleared stage settings in {}", path.display());
    }

    let total_frames = if cli.looping {
        None
    } else {
        count_frames(&cli.inputs)?
    };
    let sources: Vec<SourceOpener> = cli.inputs.iter().map(|p| source_opener(p)).collect();
    let sink = cli.output.as_deref().map(sink_opener);

    let mut pipeline = FaceSwapPipeline::new(&config, sources, sink);
    for assignment in &cli.cells {
        let (stage, cell, value) = parse_assignment(assignment)?;
        pipeline.set_cell(&stage, &cell, value)?;
    }
    // Loop is persisted per stage, so every run sets it.
    let source_stages: Vec<String> = pipeline
        .stage_names()
        .into_iter()
        .filter(|name| name.starts_with(file_source::NAME))
        .map(str::to_string)
        .collect();
    for stage in &source_stages {
        pipeline.set_cell(stage, "loop", CellValue::Flag(cli.looping))?;
    }

    pipeline.start()?;
    let delivered = drive(&mut pipeline, &cli, total_frames);
    pipeline.stop();

    print_statuses(&pipeline.stage_statuses());
    let heap = pipeline.heap_stats();
    log::info!(
        "Heap: {:.1}/{:.1} MiB, {} evictions, {} dropped allocations",
        heap.used as f64 / MIB as f64,
        heap.capacity as f64 / MIB as f64,
        heap.evictions,
        heap.soft_failures
    );
    eprintln!("Processed {delivered} frame(s)");
    if let Some(output) = &cli.output {
        log::info!("Output written to {}", output.display());
    }
    Ok(())
}

/// Runs until every source frame has been emitted and the output went quiet,
/// or the duration passes.
fn drive(pipeline: &mut FaceSwapPipeline, cli: &Cli, total_frames: Option<usize>) -> usize {
    let started = Instant::now();
    let deadline = cli.duration.map(|s| started + Duration::from_secs_f64(s));
    let interval = Duration::from_secs_f64(cli.status_interval.max(0.1));
    let mut next_status = started + interval;
    let mut last_output = started;
    let mut delivered = 0;

    loop {
        pipeline.poll();
        if let Some(output) = pipeline.output() {
            while output.read(Duration::from_millis(5)).is_some() {
                delivered += 1;
                last_output = Instant::now();
            }
        }

        let now = Instant::now();
        let drained = total_frames.is_some_and(|total| frames_emitted(pipeline) >= total)
            && now.duration_since(last_output) >= QUIET_PERIOD;
        if drained || deadline.is_some_and(|d| now >= d) {
            break;
        }
        if now >= next_status {
            next_status = now + interval;
            eprintln!("Frames out: {delivered}");
            print_statuses(&pipeline.stage_statuses());
        }
    }
    delivered
}

fn frames_emitted(pipeline: &FaceSwapPipeline) -> usize {
    pipeline
        .stage_names()
        .into_iter()
        .filter(|name| name.starts_with(file_source::NAME))
        .filter_map(|name| match &pipeline.host(name)?.cell("frames_emitted")?.kind {
            CellKind::InfoLabel { text } => text.as_deref()?.parse::<usize>().ok(),
            _ => None,
        })
        .sum()
}

fn build_config(cli: &Cli) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(fps) = cli.fps {
        config.source_fps = fps;
    }
    if let Some(mb) = cli.heap_mb {
        config.heap_capacity = mb * MIB;
    }
    if let Some(mb) = cli.cache_mb {
        config.cache_budget = mb * MIB;
    }
    if cli.db.is_some() {
        config.backend_db_path = cli.db.clone();
    }
    if cli.model_dir.is_some() {
        config.model_dir = cli.model_dir.clone();
    }
    if cli.reference_face_url.is_some() {
        config.reference_face_url = cli.reference_face_url.clone();
    }
    config.auto_restart |= cli.auto_restart;
    config.timing_logs |= cli.timing_logs;
    // The run loop counts finished frames off the output connection.
    config.forward_output = true;
    Ok(config.normalized())
}

fn validate(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    for input in &cli.inputs {
        if !input.exists() {
            return Err(format!("Input not found: {}", input.display()).into());
        }
    }
    if cli.looping && cli.duration.is_none() {
        return Err("--loop needs --duration".into());
    }
    if let Some(fps) = cli.fps {
        if !(1.0..=240.0).contains(&fps) {
            return Err(format!("FPS must be between 1 and 240, got {fps}").into());
        }
    }
    if cli.heap_mb == Some(0) {
        return Err("Heap size must be positive".into());
    }
    if let Some(d) = cli.duration {
        if d <= 0.0 {
            return Err(format!("Duration must be positive, got {d}").into());
        }
    }
    Ok(())
}

fn count_frames(inputs: &[PathBuf]) -> Result<Option<usize>, Box<dyn std::error::Error>> {
    let mut total = 0;
    for input in inputs {
        let source = ImageFileSource::open(input).map_err(|e| e.to_string())?;
        match source.frame_count() {
            Some(n) => total += n,
            None => return Ok(None),
        }
    }
    Ok(Some(total))
}

fn source_opener(path: &Path) -> SourceOpener {
    let path = path.to_path_buf();
    Arc::new(
        move || -> Result<Box<dyn FrameSource>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Box::new(ImageFileSource::open(&path)?))
        },
    )
}

fn sink_opener(dir: &Path) -> SinkOpener {
    let dir = dir.to_path_buf();
    Arc::new(
        move || -> Result<Box<dyn FrameSink>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Box::new(ImageSequenceSink::create(&dir)?))
        },
    )
}

/// `stage.cell=value`; the value is a JSON number, bool or a bare choice name.
fn parse_assignment(text: &str) -> Result<(String, String, CellValue), String> {
    let (target, raw) = text
        .split_once('=')
        .ok_or_else(|| format!("expected STAGE.CELL=VALUE, got '{text}'"))?;
    let (stage, cell) = target
        .split_once('.')
        .ok_or_else(|| format!("expected STAGE.CELL, got '{target}'"))?;
    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Bool(b)) => CellValue::Flag(b),
        Ok(serde_json::Value::Number(n)) => {
            CellValue::Number(n.as_f64().ok_or_else(|| format!("bad number {raw}"))?)
        }
        Ok(serde_json::Value::String(s)) => CellValue::Choice(Some(s)),
        Ok(serde_json::Value::Null) => CellValue::Choice(None),
        _ => CellValue::Choice(Some(raw.to_string())),
    };
    Ok((stage.to_string(), cell.to_string(), value))
}

fn print_statuses(statuses: &[StageStatus]) {
    for status in statuses.iter().filter(|s| s.active) {
        let mut line = format!("  {:<16} {}", status.name, status.state);
        if let Some((percent, caption)) = &status.model_progress {
            if *percent < 100 {
                line.push_str(&format!(
                    "  model {percent}% {}",
                    caption.as_deref().unwrap_or("")
                ));
            }
        }
        if let Some(stats) = &status.cache_stats {
            line.push_str(&format!("  cache: {stats}"));
        }
        if status.crash_count > 0 {
            line.push_str(&format!("  crashes: {}", status.crash_count));
        }
        if let Some(error) = &status.error {
            line.push_str(&format!("  error: {error}"));
        }
        eprintln!("{line}");
    }
}
