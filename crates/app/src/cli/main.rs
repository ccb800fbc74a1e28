//! decibender CLI Application

mod script;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use decibender_core::domain::{
    AnalysisService, ClassificationState, Classifier, ConfigManager, DecibenderConfig,
    LogReactions, Surface, SyncChannel, ThresholdSet,
};
use decibender_infra::{LocalBus, ManualFeed, ManualSource};
use script::Step;
use serde::Serialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Time given to the analysis loop to react before the bus is flushed
const SETTLE: Duration = Duration::from_millis(25);

#[derive(Parser)]
#[command(name = "decibender")]
#[command(about = "Loudness comfort monitor with synchronized operator surfaces", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run analysis, a viewer and an admin surface over the in-process bus
    Simulate {
        /// Session script; a built-in demo runs when omitted
        #[arg(long)]
        script: Option<PathBuf>,
    },
    /// Classify loudness readings (arguments, or one per line on stdin)
    Classify {
        #[arg(long, allow_hyphen_values = true)]
        too_loud: Option<f32>,
        #[arg(long, allow_hyphen_values = true)]
        too_quiet: Option<f32>,
        #[arg(long)]
        grace: Option<f32>,
        /// Emit one JSON object per reading
        #[arg(long)]
        json: bool,
        #[arg(allow_negative_numbers = true)]
        readings: Vec<f32>,
    },
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let manager = match cli.config {
        Some(path) => ConfigManager::for_file(path),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    };

    match cli.command {
        Command::Simulate { script } => {
            let config = manager.load().await;
            run_simulate(config, script).await
        }
        Command::Classify {
            too_loud,
            too_quiet,
            grace,
            json,
            readings,
        } => {
            let config = manager.load().await;
            let base = config.analysis.initial_thresholds;
            let thresholds = ThresholdSet::new(
                too_loud.unwrap_or(base.too_loud()),
                too_quiet.unwrap_or(base.too_quiet()),
                grace.unwrap_or(base.grace()),
            )?;
            run_classify(thresholds, readings, json)
        }
        Command::Config { action } => run_config(&manager, action).await,
    }
}

async fn run_simulate(config: DecibenderConfig, script: Option<PathBuf>) -> anyhow::Result<()> {
    let steps = match script {
        Some(path) => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading script {}", path.display()))?;
            script::parse_script(&text)?
        }
        None => script::demo(),
    };

    let bus = Arc::new(LocalBus::new().context("starting local bus")?);
    let channel: Arc<dyn SyncChannel> = bus.clone();
    let (source, feed) = ManualSource::new();

    let service = AnalysisService::new(
        Arc::clone(&channel),
        Arc::new(source),
        Arc::new(LogReactions),
        config.analysis.clone(),
    );
    let mut viewer = Surface::new(config.viewer.clone(), Arc::clone(&channel));
    let mut admin = Surface::new(config.admin.clone(), Arc::clone(&channel));

    info!(steps = steps.len(), "Starting simulated session");
    viewer.mount()?;
    service.init(admin.init_request())?;
    admin.mount()?;
    settle(&bus).await?;
    println!("{:>24}  {}", "start", viewer.snapshot(Instant::now()).status_line());

    for step in steps {
        debug!(%step, "Applying step");
        apply_step(step, &viewer, &admin, &feed).await?;
        settle(&bus).await?;
        println!(
            "{:>24}  {}",
            step.to_string(),
            viewer.snapshot(Instant::now()).status_line()
        );
    }

    if let Some(window) = feed.window() {
        println!("{:>24}  rms window {:.1} s", "analysis", window.seconds());
    }

    viewer.unmount();
    admin.unmount();
    service.shutdown();
    bus.shutdown();
    info!("Simulated session finished");
    Ok(())
}

async fn apply_step(
    step: Step,
    viewer: &Surface,
    admin: &Surface,
    feed: &ManualFeed,
) -> anyhow::Result<()> {
    match step {
        Step::Sample(db) => {
            if !feed.push(db) {
                bail!("analysis is no longer accepting readings");
            }
        }
        Step::Adjust(adjustment) => {
            viewer.adjust(adjustment)?;
        }
        Step::Set(field, value) => {
            admin.set_field(field, value)?;
        }
        Step::Window(seconds) => {
            admin.set_rms_seconds(seconds)?;
        }
        Step::Wait(duration) => tokio::time::sleep(duration).await,
    }
    Ok(())
}

async fn settle(bus: &Arc<LocalBus>) -> anyhow::Result<()> {
    tokio::time::sleep(SETTLE).await;
    let bus = Arc::clone(bus);
    tokio::task::spawn_blocking(move || bus.flush()).await?;
    Ok(())
}

#[derive(Serialize)]
struct Classified {
    loudness: f32,
    state: ClassificationState,
}

fn run_classify(thresholds: ThresholdSet, readings: Vec<f32>, json: bool) -> anyhow::Result<()> {
    let readings = if readings.is_empty() {
        read_stdin_readings()?
    } else {
        readings
    };

    let mut classifier = Classifier::new();
    for loudness in readings {
        classifier.observe(loudness, &thresholds);
        let state = classifier.state();
        if json {
            println!("{}", serde_json::to_string(&Classified { loudness, state })?);
        } else {
            println!("{loudness:>8.1}  {state}");
        }
    }
    Ok(())
}

fn read_stdin_readings() -> anyhow::Result<Vec<f32>> {
    let mut readings = Vec::new();
    for (index, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = trimmed
            .parse::<f32>()
            .with_context(|| format!("line {}: '{trimmed}' is not a loudness reading", index + 1))?;
        readings.push(value);
    }
    Ok(readings)
}

async fn run_config(manager: &ConfigManager, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { force } => {
            if manager.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    manager.config_path().display()
                );
            }
            manager.save(&DecibenderConfig::default()).await?;
            println!("Wrote {}", manager.config_path().display());
        }
        ConfigAction::Show => {
            let config = manager.load().await;
            println!("# {}", manager.config_path().display());
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
