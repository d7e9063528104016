//! Epilog: inspect and summarize episode logs.
//!
//! Subcommands:
//!
//! - `inspect`    -- Episode counts, completion and the most recent records
//! - `columns`    -- The columns a log loads into, with their types and shapes
//! - `summarize`  -- Benchmark statistics and the combined score

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use epilog::config::{EpisodeType, LoggerConfig, SinkConfig};
use epilog::episode::{EpisodeLog, EpisodeLogger, EpisodeRecord};
use epilog::stats::LogRegistry;
use epilog::storage::{BenchmarkSummary, LogFileLoader};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Epilog: durable episode logs for reinforcement-learning runs
#[derive(Parser)]
#[command(name = "epilog", version, about)]
struct Cli {
    /// Path to a JSON logger configuration (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Which episode log to read when no path is given.
    #[arg(long, global = true)]
    episode_type: Option<EpisodeChoice>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum EpisodeChoice {
    Training,
    Testing,
    Benchmark,
}

impl From<EpisodeChoice> for EpisodeType {
    fn from(choice: EpisodeChoice) -> Self {
        match choice {
            EpisodeChoice::Training => EpisodeType::Training,
            EpisodeChoice::Testing => EpisodeType::Testing,
            EpisodeChoice::Benchmark => EpisodeType::Benchmark,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show episode counts and the most recent records of a log.
    Inspect {
        /// Episode log file (defaults to the configured log).
        path: Option<PathBuf>,

        /// Number of recent records to print.
        #[arg(long, default_value_t = 5)]
        last: usize,
    },

    /// List the columns a log loads into.
    Columns {
        /// Episode log file (defaults to the configured log).
        path: Option<PathBuf>,
    },

    /// Compute benchmark statistics.
    Summarize {
        /// Episode log file (defaults to the configured log).
        path: Option<PathBuf>,

        /// Also push the summary to the configured metrics backends.
        #[arg(long)]
        push: bool,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<LoggerConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        // No directory to write into, so no file-based sinks either.
        None => LoggerConfig::default().with_sinks(SinkConfig::none()),
    };
    if let Some(choice) = cli.episode_type {
        let episode_type = EpisodeType::from(choice);
        if episode_type != config.episode_type {
            let defaults = LoggerConfig::for_episode_type(episode_type);
            config.episode_type = episode_type;
            config.episode_logname = defaults.episode_logname;
        }
    }
    config.validate().context("Invalid logger configuration")?;

    match cli.command {
        Commands::Inspect { path, last } => cmd_inspect(&resolve_log(path, &config)?, last),
        Commands::Columns { path } => cmd_columns(&resolve_log(path, &config)?),
        Commands::Summarize { path, push } => {
            cmd_summarize(&resolve_log(path, &config)?, push.then_some(&config))
        }
    }
}

/// The explicit path, or the configured log inside the configured directory.
fn resolve_log(path: Option<PathBuf>, config: &LoggerConfig) -> Result<PathBuf> {
    if let Some(path) = path {
        return Ok(path);
    }
    match (&config.logdir, &config.episode_logname) {
        (Some(dir), Some(name)) => Ok(dir.join(name)),
        _ => bail!("No log path given and no log directory configured"),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_inspect(path: &Path, last: usize) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let entries: Vec<serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array", path.display()))?;

    let mut records = Vec::with_capacity(entries.len());
    let mut unreadable = 0usize;
    for entry in entries {
        match serde_json::from_value::<EpisodeRecord>(entry) {
            Ok(record) => records.push(record),
            Err(e) => {
                unreadable += 1;
                tracing::debug!(error = %e, "Skipping unreadable record");
            }
        }
    }

    let mut per_level: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for record in &records {
        let slot = per_level.entry(record.level_name.as_str()).or_default();
        slot.0 += 1;
        if record.completed.to_vec().iter().all(|c| *c) {
            slot.1 += 1;
        }
    }
    let multi = records.iter().filter(|r| r.is_multi_agent()).count();

    println!("Episode log: {}", path.display());
    println!("  Records: {}", records.len());
    println!("  Multi-agent records: {multi}");
    if unreadable > 0 {
        println!("  Unreadable records: {unreadable}");
    }
    if let (Some(first), Some(newest)) = (records.first(), records.last()) {
        println!("  Time span: {} .. {}", first.time, newest.time);
    }
    println!();

    println!("Levels (episodes / completed):");
    for (level, (count, done)) in &per_level {
        println!("  {level}: {count} / {done}");
    }
    println!();

    println!("Most recent records:");
    for record in records.iter().rev().take(last) {
        println!(
            "  [{time}] {level}: length {length}, reward {reward} / {possible}",
            time = record.time.format("%Y-%m-%d %H:%M:%S"),
            level = record.level_name,
            length = serde_json::to_string(&record.length)?,
            reward = serde_json::to_string(&record.reward)?,
            possible = serde_json::to_string(&record.reward_possible)?,
        );
    }
    Ok(())
}

fn cmd_columns(path: &Path) -> Result<()> {
    let log = LogFileLoader::new().load(path)?;

    println!("Episode log: {} ({} records)", path.display(), log.rows());
    for (name, column) in log.columns() {
        println!("  {name}: {:?} {:?}", column.kind(), column.shape());
    }
    if !log.skipped().is_empty() {
        println!();
        println!("Skipped keys:");
        for key in log.skipped() {
            println!("  {key}");
        }
    }
    Ok(())
}

fn cmd_summarize(path: &Path, push_to: Option<&LoggerConfig>) -> Result<()> {
    let log = LogFileLoader::new().load(path)?;
    let summary = BenchmarkSummary::from_log(&log)
        .with_context(|| format!("Cannot summarize {}", path.display()))?;
    println!("{summary}");

    if let Some(config) = push_to {
        let registry = LogRegistry::new();
        let mut logger = EpisodeLogger::new(config.clone(), &registry, None)?;
        logger.log_scalars(summary.to_metrics(), None, Some("benchmark"))?;
        tracing::info!(logdir = ?config.logdir, "Pushed benchmark summary");
    }
    Ok(())
}
