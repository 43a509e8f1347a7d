use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use patchscale_core::codec::{ImageFileDecoder, ImageSource};
use patchscale_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use patchscale_core::conversion::{ConversionFlow, ConversionList, StageId};
use patchscale_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use patchscale_core::onnx::{InferenceBackend, OnnxUpscaler, SessionConfig};
use patchscale_core::snapshot::FlowSnapshot;
use patchscale_core::tiling::{TilingConfig, TilingPlan};
use patchscale_core::upscaler::{IdentityUpscaler, SharedUpscaler};

#[derive(Parser, Debug)]
#[command(name = "patchscale", about = "Tiled 2x image upscaling", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale one or more images 2x.
    Upscale(UpscaleArgs),
    /// Print the tiling geometry for a source size.
    Plan(PlanArgs),
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(required = true, help = "Input images")]
    inputs: Vec<PathBuf>,
    #[arg(short = 'o', long = "output-dir", help = "Directory for results")]
    output_dir: Option<PathBuf>,
    #[arg(long, help = "ONNX model (overrides [model].path)")]
    model: Option<PathBuf>,
    #[arg(long, value_name = "cuda|tensorrt")]
    backend: Option<String>,
    #[arg(long, conflicts_with = "model", help = "Skip the model; nearest-neighbor only")]
    identity: bool,
    #[arg(long, help = "Emit JSON progress snapshots on stdout")]
    json: bool,
}

#[derive(Args, Debug)]
struct PlanArgs {
    width: usize,
    height: usize,
    #[arg(long)]
    json: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config, &resolved_data_dir).await,
        Commands::Plan(args) => run_plan(args, &config.tiling),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn build_upscaler(
    args: &UpscaleArgs,
    config: &AppConfig,
    data_dir: &Path,
) -> Result<SharedUpscaler> {
    if args.identity {
        return Ok(Arc::new(IdentityUpscaler));
    }
    let Some(model) = args.model.clone().or_else(|| config.model.path.clone()) else {
        info!("No model configured; using nearest-neighbor identity upscaler");
        return Ok(Arc::new(IdentityUpscaler));
    };

    let model_path = resolve_relative_to(data_dir, &model);
    if !model_path.exists() {
        bail!("Model file does not exist: {}", model_path.display());
    }
    let backend = args
        .backend
        .as_deref()
        .map(InferenceBackend::from_str_lossy)
        .unwrap_or(config.model.backend);
    let trt_cache_dir = resolve_relative_to(data_dir, &config.model.trt_cache_dir);

    let upscaler = tokio::task::spawn_blocking(move || {
        OnnxUpscaler::load(&SessionConfig {
            model_path: &model_path,
            backend,
            trt_cache_dir: Some(&trt_cache_dir),
        })
    })
    .await
    .context("model loading worker failed")??;
    Ok(Arc::new(upscaler))
}

async fn run_upscale(args: UpscaleArgs, config: AppConfig, data_dir: &Path) -> Result<()> {
    for input in &args.inputs {
        if !input.exists() {
            bail!("Input file does not exist: {}", input.display());
        }
    }
    let upscaler = build_upscaler(&args, &config, data_dir).await?;

    let list = ConversionList::new();
    let decoder = Arc::new(ImageFileDecoder);
    let mut submitted: Vec<(Arc<ConversionFlow>, PathBuf)> = Vec::new();
    for input in &args.inputs {
        let flow = list.start_conversion_with(
            ImageSource::Path(input.clone()),
            decoder.clone(),
            Arc::clone(&upscaler),
            config.tiling,
        );
        info!(flow = %flow.id(), input = %input.display(), "Submitted conversion");
        submitted.push((flow, input.clone()));
    }

    watch_progress(&list, args.json).await?;

    let mut failed = 0usize;
    for (flow, input) in &submitted {
        match flow.output() {
            Some(image) => {
                let path = config
                    .output
                    .output_path(input, args.output_dir.as_deref());
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create output directory: {}", parent.display())
                    })?;
                }
                let target = path.clone();
                tokio::task::spawn_blocking(move || image.save_png(&target))
                    .await
                    .context("image encoding worker failed")??;
                info!(input = %input.display(), output = %path.display(), "Saved result");
                if args.json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "event": "saved",
                            "id": flow.id(),
                            "input": input.display().to_string(),
                            "output": path.display().to_string(),
                        })
                    );
                }
            }
            None => {
                failed += 1;
                match flow.failure() {
                    Some((stage, failure)) => error!(
                        input = %input.display(),
                        %stage,
                        "Conversion failed: {failure}"
                    ),
                    None => error!(input = %input.display(), "Conversion produced no output"),
                }
            }
        }
        flow.close();
    }

    if failed > 0 {
        bail!("{failed} of {} conversions failed", submitted.len());
    }
    Ok(())
}

const PROGRESS_TICK: Duration = Duration::from_millis(200);
const PROGRESS_BAR_WIDTH: usize = 30;

/// Render progress until every submitted flow has run to completion.
async fn watch_progress(list: &ConversionList, json: bool) -> Result<()> {
    let start = Instant::now();
    let mut last_json: HashMap<Uuid, FlowSnapshot> = HashMap::new();
    let mut ticker = tokio::time::interval(PROGRESS_TICK);

    loop {
        ticker.tick().await;
        let flows = list.conversions();
        let snapshots: Vec<FlowSnapshot> = flows.iter().map(|flow| flow.snapshot()).collect();

        if json {
            for snapshot in &snapshots {
                if last_json.get(&snapshot.id) != Some(snapshot) {
                    println!("{}", serde_json::to_string(snapshot)?);
                    last_json.insert(snapshot.id, snapshot.clone());
                }
            }
        } else {
            let done = snapshots.iter().filter(|s| is_settled(s)).count();
            let percent = overall_percent(&snapshots);
            eprint!(
                "\r{}    ",
                render_progress_line(percent, done, snapshots.len(), start.elapsed().as_secs_f64())
            );
        }

        if snapshots.iter().all(is_settled) {
            break;
        }
    }

    if !json {
        eprintln!();
    }
    Ok(())
}

/// Flows from a [`ConversionList`] are running from the moment they are
/// added, so a flow that is not running has finished or failed.
fn is_settled(snapshot: &FlowSnapshot) -> bool {
    !snapshot.running
}

/// Share of one flow that is done, in percent. Finished and failed flows
/// count as complete; until tiling starts only stage boundaries count.
fn flow_percent(snapshot: &FlowSnapshot) -> f64 {
    if is_settled(snapshot) {
        return 100.0;
    }
    if let Some(progress) = snapshot
        .stages
        .iter()
        .find(|stage| stage.stage == StageId::Upscale)
        .and_then(|stage| stage.progress)
    {
        return progress;
    }
    0.0
}

fn overall_percent(snapshots: &[FlowSnapshot]) -> f64 {
    if snapshots.is_empty() {
        return 100.0;
    }
    snapshots.iter().map(flow_percent).sum::<f64>() / snapshots.len() as f64
}

fn render_progress_line(percent: f64, done: usize, total: usize, elapsed: f64) -> String {
    let fraction = (percent / 100.0).clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);
    format!(
        "[{}] {:5.1}% | Images {}/{} | Elapsed: {}",
        bar,
        fraction * 100.0,
        done,
        total,
        format_duration(elapsed)
    )
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

fn run_plan(args: PlanArgs, tiling: &TilingConfig) -> Result<()> {
    let plan = tiling.plan(args.width, args.height)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", format_plan(&plan));
    }
    Ok(())
}

fn format_plan(plan: &TilingPlan) -> String {
    [
        format!("source      {}x{}", plan.source_width, plan.source_height),
        format!(
            "padded      {}x{} (x: {}+{}, y: {}+{})",
            plan.padded_width,
            plan.padded_height,
            plan.pad_x.before,
            plan.pad_x.after,
            plan.pad_y.before,
            plan.pad_y.after
        ),
        format!(
            "grid        {} rows x {} cols = {} tiles of {}px",
            plan.rows,
            plan.cols,
            plan.tile_count(),
            plan.patch_size * 2
        ),
        format!("output      {}x{}", plan.output_width, plan.output_height),
    ]
    .join("\n")
}


#[cfg(test)]
mod progress_tests {
    use patchscale_core::snapshot::StageSnapshot;
    use patchscale_core::task::TaskStatus;

    use super::*;

    fn snapshot(running: bool, load: Option<TaskStatus>, progress: Option<f64>) -> FlowSnapshot {
        let stage = |stage, status| StageSnapshot {
            stage,
            status,
            error: None,
            output_size: None,
            progress: None,
            tiles: None,
        };
        let mut upscale = stage(StageId::Upscale, None);
        upscale.progress = progress;

        FlowSnapshot {
            id: Uuid::new_v4(),
            source: "a.png".to_string(),
            running,
            can_close: !running,
            all_finished: false,
            current_stage: None,
            selected_stage: None,
            stages: vec![
                stage(StageId::Load, load),
                stage(StageId::Scale2x, None),
                upscale,
            ],
        }
    }

    #[test]
    fn just_added_flow_is_not_settled() {
        let flow = snapshot(true, None, None);
        assert!(!is_settled(&flow));
        assert_eq!(flow_percent(&flow), 0.0);
    }

    #[test]
    fn running_flow_reports_tile_progress() {
        let flow = snapshot(true, Some(TaskStatus::Success), Some(25.0));
        assert!(!is_settled(&flow));
        assert_eq!(flow_percent(&flow), 25.0);
    }

    #[test]
    fn failed_flow_counts_as_complete() {
        let flow = snapshot(false, Some(TaskStatus::Failure), None);
        assert!(is_settled(&flow));
        assert_eq!(flow_percent(&flow), 100.0);
    }

    #[test]
    fn overall_percent_averages_flows() {
        let flows = vec![
            snapshot(true, Some(TaskStatus::Success), Some(50.0)),
            snapshot(false, Some(TaskStatus::Success), Some(100.0)),
        ];
        assert_eq!(overall_percent(&flows), 75.0);
        assert_eq!(overall_percent(&[]), 100.0);
    }

    #[test]
    fn progress_line_fills_bar() {
        let line = render_progress_line(50.0, 1, 2, 5.0);
        assert!(line.starts_with(&format!("[{}{}]", "█".repeat(15), "░".repeat(15))));
        assert!(line.contains(" 50.0%"));
        assert!(line.contains("Images 1/2"));
        assert!(line.ends_with("00:00:05"));
    }

    #[test]
    fn format_duration_pads_fields() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.0), "00:00:45");
        assert_eq!(format_duration(0.0), "00:00:00");
    }

    #[test]
    fn format_plan_lists_geometry() {
        let plan = TilingConfig::default().plan(96, 96).unwrap();
        let text = format_plan(&plan);
        assert!(text.contains("padded      224x224 (x: 16+16, y: 16+16)"));
        assert!(text.contains("6 rows x 6 cols = 36 tiles of 64px"));
        assert!(text.contains("output      192x192"));
    }
}
