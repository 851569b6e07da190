//! ferrite-migrate - copy every key from one Redis-compatible store to another
//!
//! Works against standalone servers and sharded clusters on either side,
//! and can resume an interrupted run from a checkpoint file.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use ferrite_migrate::cluster::{ClusterSlotsResolver, TopologyResolver};
use ferrite_migrate::config::{EndpointConfig, LogFormat, LoggingConfig, MigrationConfig};
use ferrite_migrate::connection::{RespConnection, RespConnector};
use ferrite_migrate::migration::{MigrationController, MigrationCursor, MigrationSummary};

/// ferrite-migrate - key-by-key migration between Redis-compatible stores
#[derive(Parser, Debug)]
#[command(name = "ferrite-migrate")]
#[command(author, version, about = "Copy every key between Redis-compatible stores")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "FERRITE_MIGRATE_LOG_LEVEL",
        global = true
    )]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Migrate every key from the source to the target
    Run(RunArgs),

    /// Show the shards of the source store
    Shards {
        /// Source URL (e.g., redis://localhost:6379)
        #[arg(long, env = "FERRITE_MIGRATE_SOURCE")]
        source: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Source URL (e.g., redis://localhost:6379)
    #[arg(long, env = "FERRITE_MIGRATE_SOURCE")]
    source: Option<String>,

    /// Target URL (e.g., redis://:secret@localhost:6380/0)
    #[arg(long, env = "FERRITE_MIGRATE_TARGET")]
    target: Option<String>,

    /// Keys fetched per batch
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Shards migrated concurrently
    #[arg(long, value_name = "N")]
    parallelism: Option<usize>,

    /// Write attempts per key after the first
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Read and rebuild values per type instead of DUMP/RESTORE
    #[arg(long)]
    typed: bool,

    /// Only migrate keys matching this glob (e.g., "user:*")
    #[arg(long, value_name = "GLOB")]
    pattern: Option<String>,

    /// Resume from, and save progress to, this file
    #[arg(long, value_name = "FILE")]
    checkpoint: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    /// Apply CLI overrides to the configuration
    fn apply_to_config(&self, config: &mut MigrationConfig) {
        if let Some(source) = &self.source {
            config.source.url = source.clone();
        }
        if let Some(target) = &self.target {
            config.target.url = target.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(parallelism) = self.parallelism {
            config.shard_parallelism = parallelism;
        }
        if let Some(retries) = self.retries {
            config.write_retries = retries;
        }
        if self.typed {
            config.prefer_opaque_transfer = false;
        }
        if let Some(pattern) = &self.pattern {
            config.key_pattern = Some(pattern.clone());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => MigrationConfig::from_file(path)?,
        None => MigrationConfig::default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging);

    match cli.command {
        Commands::Run(args) => {
            args.apply_to_config(&mut config);
            cmd_run(config, &args).await
        }
        Commands::Shards { source } => {
            if let Some(source) = source {
                config.source.url = source;
            }
            cmd_shards(&config.source).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Run ──────────────────────────────────────────────────────────────

async fn cmd_run(config: MigrationConfig, args: &RunArgs) -> anyhow::Result<ExitCode> {
    config.validate()?;

    if !args.json {
        println!(
            "{} Migrating {} → {}",
            "→".cyan().bold(),
            config.source.url.yellow(),
            config.target.url.yellow(),
        );
        println!(
            "  Batch: {}  Shards in parallel: {}  Retries: {}  Pattern: {}",
            config.batch_size,
            config.shard_parallelism,
            config.write_retries,
            config.key_pattern.as_deref().unwrap_or("*"),
        );
        println!();
    }

    let connector = Arc::new(RespConnector::new(&config.source, &config.target)?);
    let mut controller =
        MigrationController::new(config, connector, Arc::new(ClusterSlotsResolver));

    if let Some(path) = args.checkpoint.as_deref().filter(|p| p.exists()) {
        let cursor = MigrationCursor::load(path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        info!(
            path = %path.display(),
            keys_fetched = cursor.keys_fetched(),
            "resuming from checkpoint"
        );
        controller = controller.resume_from(cursor);
    }

    let token = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current batches");
            token.cancel();
        }
    });

    let summary = controller.run().await?;

    if let Some(path) = &args.checkpoint {
        save_checkpoint(path, &summary.checkpoint)?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(if summary.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn save_checkpoint(path: &Path, checkpoint: &MigrationCursor) -> anyhow::Result<()> {
    let written = checkpoint
        .persist(path)
        .with_context(|| format!("updating checkpoint {}", path.display()))?;
    if written {
        info!(path = %path.display(), "checkpoint saved");
    } else {
        info!(path = %path.display(), "every shard done, checkpoint removed");
    }
    Ok(())
}

fn print_summary(summary: &MigrationSummary) {
    println!();
    if !summary.is_complete() {
        println!("{} {}", "✗ Migration stopped:".red().bold(), summary.state);
    } else if !summary.all_shards_done() {
        println!(
            "{}",
            "⚠ Migration completed with incomplete shards; rerun with --checkpoint to resume them."
                .yellow()
                .bold()
        );
    } else if summary.counters.failed > 0 {
        println!("{}", "✗ Migration completed with failed keys.".yellow().bold());
    } else {
        println!("{}", "✓ Migration completed successfully!".green().bold());
    }
    println!();

    let counters = &summary.counters;
    println!("{}", "Result Summary".bold().underline());
    println!("  Run ID:        {}", summary.run_id);
    println!("  Strategy:      {}", summary.strategy);
    println!("  Keys fetched:  {}", counters.fetched);
    println!("  Keys migrated: {}", counters.migrated.to_string().green());
    println!("  Keys skipped:  {}", counters.skipped);
    for (reason, count) in &counters.skipped_by_reason {
        println!("    {:<16} {}", reason.dimmed(), count);
    }
    println!("  Keys failed:   {}", colour_failures(counters.failed));
    println!(
        "  Duration:      {}",
        format_duration(summary.duration.as_secs())
    );
    println!("  Throughput:    {:.0} keys/s", summary.throughput());
    println!();

    if !summary.failed_keys.is_empty() {
        println!("{}", "Failed Keys".bold().underline());
        for failed in summary.failed_keys.iter().take(20) {
            println!("  {} {}: {}", "✗".red(), failed.key, failed.reason);
        }
        let hidden = summary.failed_keys.len().saturating_sub(20) as u64
            + summary.failed_keys_omitted;
        if hidden > 0 {
            println!("  {}", format!("... and {} more", hidden).dimmed());
        }
        println!();
    }

    if !summary.incomplete_shards.is_empty() {
        println!("{}", "Incomplete Shards".bold().underline());
        for shard in &summary.incomplete_shards {
            println!("  {} {}: {}", "⚠".yellow(), shard.id, shard.reason);
        }
        println!();
    }
}

fn colour_failures(failed: u64) -> colored::ColoredString {
    if failed == 0 {
        "0".normal()
    } else {
        failed.to_string().red()
    }
}

// ── Shards ───────────────────────────────────────────────────────────

async fn cmd_shards(source: &EndpointConfig) -> anyhow::Result<()> {
    let endpoint = source.endpoint()?;
    println!(
        "{} Resolving shards of {}...",
        "→".cyan().bold(),
        endpoint.addr().yellow()
    );
    println!();

    let mut conn =
        RespConnection::connect(endpoint, source.connect_timeout(), source.io_timeout()).await?;
    let shards = ClusterSlotsResolver.shards(&mut conn).await?;

    println!("{}", "Shards".bold().underline());
    for shard in &shards {
        let ranges: Vec<String> = shard.slots.iter().map(ToString::to_string).collect();
        println!(
            "  {} {}  {} slots  [{}]",
            shard.id.bold(),
            shard.addr.yellow(),
            shard.slot_count(),
            ranges.join(", ").dimmed()
        );
    }
    println!();
    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
