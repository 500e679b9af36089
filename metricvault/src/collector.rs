//! metricvault-collector - local-first metrics collection with remote sync
//!
//! This tool provides commands for:
//! - Collecting events (JSON lines on stdin) into the local logs
//! - Draining the retry queue once
//! - Showing collector configuration and the last status snapshot
//! - Running the background retry, health probe and recovery loop
//!
//! Uses XDG Base Directory specification for file locations:
//! - Local logs, queue, status: $XDG_DATA_HOME/metricvault/collector/
//! - Config: $XDG_CONFIG_HOME/metricvault/config.toml (~/.config/metricvault/config.toml)

use std::io::BufRead;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use metricvault_core::collector::HybridCollector;
use metricvault_core::{Config, MetricsEvent};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "metricvault-collector")]
#[command(about = "Collect metrics events locally and replicate them to the remote store")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Collect events read as JSON lines from stdin
    Collect,

    /// Run one retry cycle over the queued events
    Drain,

    /// Show collector configuration and status
    Status,

    /// Run background retry, health probe and recovery until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();
    let config = Config::load().context("failed to load configuration")?;
    let _log_guard = metricvault_core::logging::init(&config.logging, "metricvault-collector")
        .context("failed to initialize logging")?;

    let collector = HybridCollector::open(config.collector.clone())
        .await
        .context("failed to open collector")?;

    match args.command {
        Command::Collect => cmd_collect(&collector).await,
        Command::Drain => cmd_drain(&collector).await,
        Command::Status => cmd_status(&config, &collector).await,
        Command::Run => cmd_run(&collector).await,
    }
}

async fn cmd_collect(collector: &HybridCollector) -> Result<()> {
    let mut collected = 0usize;
    let mut synced = 0usize;
    let mut queued = 0usize;
    let mut fallbacks = 0usize;
    let mut failed = 0usize;
    let mut malformed = 0usize;

    let stdin = std::io::stdin();
    for (index, line) in stdin.lock().lines().enumerate() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let event: MetricsEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                eprintln!("line {}: invalid event: {}", index + 1, e);
                malformed += 1;
                continue;
            }
        };

        let result = collector.collect(event).await;
        collected += 1;
        if !result.success {
            failed += 1;
        }
        if result.remote_synced {
            synced += 1;
        }
        if result.queued {
            queued += 1;
        }
        if result.fallback_activated {
            fallbacks += 1;
        }
    }

    println!("Collected:         {}", collected);
    println!("Remote synced:     {}", synced);
    println!("Queued for retry:  {}", queued);
    println!("Fallbacks:         {}", fallbacks);
    println!("Malformed lines:   {}", malformed);
    println!("Mode:              {}", collector.failover().mode());

    if failed > 0 {
        bail!("{} event(s) could not be written locally", failed);
    }
    Ok(())
}

async fn cmd_drain(collector: &HybridCollector) -> Result<()> {
    let report = collector
        .process_retry_queue()
        .await
        .context("retry cycle failed")?;

    if report.skipped {
        println!("Retry cycle skipped (remote unavailable or not configured)");
    } else {
        println!("Attempted:         {}", report.attempted);
        println!("Synced:            {}", report.synced);
        println!("Requeued:          {}", report.requeued);
        println!("Dropped:           {}", report.dropped);
        if report.queue_errors > 0 {
            println!("Queue errors:      {}", report.queue_errors);
        }
    }
    println!("Remaining:         {}", report.remaining);
    Ok(())
}

async fn cmd_status(config: &Config, collector: &HybridCollector) -> Result<()> {
    let settings = &config.collector;

    println!("Collector Configuration");
    println!("=======================");
    println!();
    println!("Enabled:           {}", settings.enabled);
    println!("Mode:              {:?}", settings.mode);
    println!(
        "Endpoint:          {}",
        settings.endpoint.as_deref().unwrap_or("<not set>")
    );
    println!(
        "Tenant:            {}",
        settings.tenant_id.as_deref().unwrap_or("<not set>")
    );
    println!(
        "API Key:           {}",
        if settings.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Data dir:          {}", collector.local().dir().display());
    println!("Sync timeout:      {}ms", settings.sync_timeout_ms);
    println!("Fallback at:       {}ms", settings.fallback_threshold_ms);

    println!();
    let status = collector.status().await;
    println!("Current mode:      {}", status.mode);
    println!("Queue depth:       {}", status.queue_depth);

    let path = collector.status_path();
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let snapshot: serde_json::Value =
            serde_json::from_str(&content).context("status snapshot is not valid JSON")?;
        println!();
        println!("Last snapshot ({}):", path.display());
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

async fn cmd_run(collector: &HybridCollector) -> Result<()> {
    let (tx, rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = tx.send(true);
    })
    .context("failed to install Ctrl-C handler")?;

    println!(
        "Collector running in {} mode. Press Ctrl-C to stop.",
        collector.failover().mode()
    );
    collector.run_background(rx).await;
    println!("Collector stopped.");
    Ok(())
}
