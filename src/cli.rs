//! Command-line interface components.

use crate::config::{Config, DeploymentTable, PeriodPolicy, QualityConfig};
use crate::error::Result;
use crate::processor::{Pipeline, ProcessingStats};
use crate::reader::NoDecoder;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "adcp")]
#[command(about = "Convert raw ADCP deployments into quality-controlled NetCDF time series")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Run configuration file (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Deployment parameter table (JSON)
    #[arg(short, long, global = true)]
    pub parameters: Option<PathBuf>,

    /// Quality-check configuration (JSON)
    #[arg(short, long, global = true)]
    pub quality: Option<PathBuf>,

    /// Override the configured output period (daily, weekly, monthly,
    /// yearly, <days>, file)
    #[arg(long, global = true)]
    pub period: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reprocess the complete Level 0 archive into Levels 1 and 2
    Process,
    /// Process only the most recent raw files per band
    Live,
    /// Re-run the advanced quality checks over persisted Level 1 files and
    /// rebuild Level 2
    Qa,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(period) = &self.period {
            config.output_period = period.parse::<PeriodPolicy>()?;
        }
        Ok(config)
    }
}

/// Set up structured logging based on CLI arguments
pub fn setup_logging(verbose: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("adcp_processor={log_level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .init();

    debug!("logging initialized at level {log_level}");
}

/// Dispatch the parsed arguments
pub fn run(args: &Args) -> Result<ProcessingStats> {
    let config = args.load_config()?;
    let deployments = match &args.parameters {
        Some(path) => DeploymentTable::from_file(path)?,
        None => DeploymentTable {
            deployments: vec![Default::default()],
        },
    };
    let quality = match &args.quality {
        Some(path) => QualityConfig::from_file(path)?,
        None => QualityConfig::default(),
    };

    let bands = config.bands.clone();
    let pipeline = Pipeline::new(config, deployments, quality, Box::new(NoDecoder))?;

    match args.command.as_ref() {
        Some(Command::Live) => pipeline.process(true),
        Some(Command::Qa) => {
            let mut stats = ProcessingStats::default();
            for band in &bands {
                let band_stats = pipeline.advanced_pass(band)?;
                stats.files_processed += band_stats.files_processed;
                stats.buckets_written += band_stats.buckets_written;
            }
            Ok(stats)
        }
        Some(Command::Process) | None => pipeline.process(false),
    }
}
