//! SpeedView Simulator CLI
//!
//! Run deterministic traffic scenarios, or replay recorded detector output.

use clap::Parser;
use speedview_core::{CalibrationSnapshot, EngineConfig, Session};
use speedview_sim::scenarios::ScenarioId;
use speedview_sim::{open_replay, run_replay, write_heatmap_png, write_recording};
use speedview_sim::{ScenarioResult, ScenarioRunner, SimError};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SpeedView deterministic scenario CLI
#[derive(Parser, Debug)]
#[command(name = "speedview-sim")]
#[command(about = "Run deterministic traffic scenarios for SpeedView", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (steady_traffic, occlusion, label_gate, noisy_detector, recalibration, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Duration of open-ended scenarios in seconds
    #[arg(short, long, default_value = "20")]
    duration: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export per-frame data to a JSON file (single scenario or replay)
    #[arg(long)]
    export: Option<PathBuf>,

    /// Write the final heatmap as PNG (single scenario or replay)
    #[arg(long)]
    heatmap_png: Option<PathBuf>,

    /// Heatmap overlay opacity in [0, 1]
    #[arg(long, default_value = "0.6")]
    opacity: f32,

    /// Record the generated detector output as JSON lines (single scenario)
    #[arg(long)]
    record: Option<PathBuf>,

    /// Replay a JSON-lines recording instead of running scenarios
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Calibration snapshot (JSON) to restore before replaying
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Engine configuration (JSON); defaults apply to missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frame width of the replayed camera
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Frame height of the replayed camera
    #[arg(long, default_value = "720")]
    height: u32,

    /// Run the session on a background engine worker
    #[arg(long)]
    offload: bool,
}

fn load_config(args: &Args) -> Result<EngineConfig, SimError> {
    match &args.config {
        Some(path) => Ok(EngineConfig::from_json_str(&std::fs::read_to_string(path)?)?),
        None => Ok(EngineConfig::default()),
    }
}

async fn replay(args: &Args, path: &PathBuf) -> Result<bool, SimError> {
    let mut session = Session::new(load_config(args)?, args.width, args.height)?;
    if let Some(calibration) = &args.calibration {
        let snapshot: CalibrationSnapshot = serde_json::from_str(&std::fs::read_to_string(calibration)?)?;
        let status = session.restore_calibration(&snapshot)?;
        info!("Restored calibration: {}", status.name());
    }

    info!("Replaying {}", path.display());
    let output = run_replay(session, open_replay(path)?, args.opacity).await?;

    if let Some(export_path) = &args.export {
        output.export.write_to_file(export_path)?;
        info!("Exported {} frames to {}", output.export.frames.len(), export_path.display());
    }
    if let Some(png) = &args.heatmap_png {
        write_heatmap_png(&output.heatmap, png)?;
        info!("Heatmap written to {}", png.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output.summary)?);
    } else {
        let s = &output.summary;
        info!(
            "Processed {} frames ({} rejected), {} confirmed tracks, {} malformed detections",
            s.frames_processed, s.frames_rejected, s.confirmed_tracks, s.malformed_detections
        );
        if let Some(max) = s.max_speed_mps {
            info!("Max speed: {:.1} m/s ({:.1} km/h)", max, max * speedview_core::MPS_TO_KMH);
        }
    }
    Ok(output.summary.frames_rejected == 0)
}

async fn run_scenarios(args: &Args, scenarios: &[ScenarioId]) -> Result<bool, SimError> {
    let single_run = scenarios.len() == 1 && args.seeds == 1;
    if !single_run && (args.export.is_some() || args.record.is_some() || args.heatmap_png.is_some()) {
        return Err(SimError::Setup(
            "--export, --record and --heatmap-png need a single scenario and seed".to_string(),
        ));
    }

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };
    let config = load_config(args)?;

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let mut runner = ScenarioRunner::new(seed)
            .with_duration(args.duration)
            .with_config(config.clone())
            .with_offload(args.offload)
            .with_export(args.export.is_some())
            .with_recording(args.record.is_some());
        if args.heatmap_png.is_some() {
            runner = runner.with_heatmap(args.opacity);
        }

        for scenario in scenarios {
            let run = runner.run(*scenario).await?;
            let result = run.result;

            if let (Some(path), Some(export)) = (&args.export, &run.export) {
                export.write_to_file(path)?;
                info!("Exported {} frames to {}", export.frames.len(), path.display());
            }
            if let (Some(path), Some(batches)) = (&args.record, &run.recording) {
                write_recording(path, batches)?;
                info!("Recorded {} frames to {}", batches.len(), path.display());
            }
            if let (Some(path), Some(image)) = (&args.heatmap_png, &run.heatmap) {
                write_heatmap_png(image, path)?;
                info!("Heatmap written to {}", path.display());
            }

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "frames": r.total_frames,
                    "time_secs": r.final_time_secs,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    Ok(failed_count == 0)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    if !args.json {
        info!("SpeedView Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let outcome = if let Some(path) = &args.replay {
        replay(&args, path).await
    } else {
        let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
            ScenarioId::all()
        } else {
            match args.scenario.parse() {
                Ok(id) => vec![id],
                Err(e) => {
                    eprintln!("Error: {}", e);
                    eprintln!(
                        "Available scenarios: steady_traffic, occlusion, label_gate, noisy_detector, recalibration, all"
                    );
                    std::process::exit(1);
                }
            }
        };
        run_scenarios(&args, &scenarios).await
    };

    // Exit with proper code for CI
    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
