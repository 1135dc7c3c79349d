//! CLI entry point for the pump-probe daemon.
//!
//! # Usage
//!
//! Refresh the cameras for a while and log what they see:
//! ```bash
//! pp-daemon --config config/site.example.toml watch --ticks 200
//! ```
//!
//! Run a pump-probe measurement (delays in fs):
//! ```bash
//! pp-daemon pump-probe --delays -500,0,250,1000 --scans 5 --shots 1000
//! ```
//!
//! Without `--config` a simulated site (one camera, one delay line) is used.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pp_core::logging::{self, LogFormat, LoggingConfig};
use pp_experiment::plans::PumpProbePlan;
use pp_experiment::{Controller, JsonLinesStore, Plan, PlanEvent, PlanMeta, ScanRunner, TickOutcome};
use pp_hardware::config::SiteConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pp-daemon")]
#[command(about = "Pump-probe acquisition daemon", long_about = None)]
struct Cli {
    /// Site configuration file (TOML). Simulated devices when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the idle loop and log the last read of every camera
    Watch {
        /// Number of loop iterations
        #[arg(long, default_value_t = 100)]
        ticks: usize,
    },

    /// Run a pump-probe plan to completion
    PumpProbe {
        /// Comma separated delays in fs
        #[arg(long, value_delimiter = ',', required = true, allow_hyphen_values = true)]
        delays: Vec<f64>,

        /// Number of scans over the delay list
        #[arg(long, default_value_t = 1)]
        scans: usize,

        /// Shots per point
        #[arg(long, default_value_t = 1000)]
        shots: usize,

        /// Plan name, used in output file names
        #[arg(long, default_value = "pump-probe")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init(LoggingConfig::from_level_str(&config.application.log_level)?.with_format(format))?;
    info!(site = %config.application.name, "pp-daemon starting");

    let controller = Arc::new(Controller::from_config(&config).await?);

    let result = match cli.command {
        Commands::Watch { ticks } => watch(&controller, ticks).await,
        Commands::PumpProbe {
            delays,
            scans,
            shots,
            name,
        } => {
            run_pump_probe(
                controller.clone(),
                &config.application.data_directory,
                PumpProbeArgs {
                    name,
                    delays,
                    scans,
                    shots,
                },
            )
            .await
        }
    };

    if let Err(err) = controller.shutdown().await {
        warn!(error = %err, "Device shutdown encountered errors");
    }
    result
}

fn load_config(path: Option<&Path>) -> Result<SiteConfig> {
    match path {
        Some(path) => Ok(SiteConfig::load_from(path)?),
        None => Ok(SiteConfig::mock()),
    }
}

async fn watch(controller: &Controller, ticks: usize) -> Result<()> {
    for tick in 0..ticks {
        tokio::select! {
            outcome = controller.tick() => {
                if let TickOutcome::Refreshed { failed, .. } = outcome {
                    if failed > 0 {
                        warn!(tick, failed, "Some cameras did not refresh");
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }

        for cam in controller.cams() {
            let read = cam.last_read();
            info!(
                tick,
                cam = cam.name(),
                shots = read.shots,
                probe = read.probe_mean.mean().unwrap_or(0.0),
                reference = read.reference_mean.mean().unwrap_or(0.0),
                signal_mod = read.differential_signal.mean().unwrap_or(0.0),
                "Last read"
            );
        }
        tokio::time::sleep(controller.interval()).await;
    }
    Ok(())
}

struct PumpProbeArgs {
    name: String,
    delays: Vec<f64>,
    scans: usize,
    shots: usize,
}

async fn run_pump_probe(
    controller: Arc<Controller>,
    data_dir: &Path,
    args: PumpProbeArgs,
) -> Result<()> {
    let meta = PlanMeta::new(args.name.as_str(), "pp");
    let store = JsonLinesStore::open(data_dir, &meta.file_stem())?;
    println!("Writing results to {}", store.path().display());

    let plan = PumpProbePlan::new(
        args.name,
        controller.cam().clone(),
        controller.delay_line().clone(),
        args.delays.clone(),
        args.shots,
        Box::new(store),
    )?;
    let results = plan.results();
    let runner = ScanRunner::new(plan)
        .with_plan_meta(meta)
        .with_max_scan(args.scans);
    runner.meta().save_meta(data_dir)?;
    let mut events = runner.subscribe();

    controller.start_plan(Box::new(runner)).await?;
    let handle = controller.clone().spawn();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(PlanEvent::StepDone { scan, point }) => {
                    info!(scan, point, delay_fs = args.delays[point], "Point recorded");
                }
                Ok(PlanEvent::PlanFinished { status }) => {
                    info!(%status, "Plan finished");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Plan events dropped"),
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                info!("Interrupted, stopping plan");
                controller.stop_plan().await?;
            }
        }
    }

    controller.request_shutdown();
    handle.await?;

    if let Some(summary) = controller.with_plan(|p| p.time_tracker().summary()).await {
        println!("{}", summary);
    }
    let results = results.read();
    println!("Scans completed: {}", results.scans_done);
    for (delay, mean) in args.delays.iter().zip(&results.mean_signals) {
        match mean {
            Some(signal) => println!(
                "  {:>10.1} fs  mean signal {:>9.3} mOD",
                delay,
                signal.mean().unwrap_or(0.0)
            ),
            None => println!("  {:>10.1} fs  no data", delay),
        }
    }

    if let Some(err) = controller.last_error() {
        anyhow::bail!("Plan failed: {}", err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pump_probe_arguments() {
        let cli = Cli::try_parse_from([
            "pp-daemon",
            "pump-probe",
            "--delays",
            "-100,0,250.5",
            "--scans",
            "3",
        ])
        .unwrap();
        match cli.command {
            Commands::PumpProbe {
                delays,
                scans,
                shots,
                name,
            } => {
                assert_eq!(delays, vec![-100.0, 0.0, 250.5]);
                assert_eq!(scans, 3);
                assert_eq!(shots, 1000);
                assert_eq!(name, "pump-probe");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_delays_are_required() {
        assert!(Cli::try_parse_from(["pp-daemon", "pump-probe"]).is_err());
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from([
            "pp-daemon",
            "watch",
            "--ticks",
            "5",
            "--config",
            "site.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("site.toml")));
        assert!(matches!(cli.command, Commands::Watch { ticks: 5 }));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/site.toml"))).is_err());
        assert_eq!(load_config(None).unwrap().cameras.len(), 1);
    }
}
