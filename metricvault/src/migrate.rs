//! metricvault-migrate - import legacy telemetry into the metrics store
//!
//! Reads `sessions.jsonl` and `tool_metrics.jsonl` from a legacy export
//! directory, validates them, bulk-imports them in checkpointed batches and
//! verifies a sample of the written rows.
//!
//! An interrupted run resumes automatically when started again on the same
//! input: the checkpoint is matched by the input's checksum.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use metricvault_core::import::{ImportOptions, WriteMode};
use metricvault_core::legacy;
use metricvault_core::migrate::{MigrationReport, MigrationRunner};
use metricvault_core::{Config, Database, EntityKind};

#[derive(Parser)]
#[command(name = "metricvault-migrate")]
#[command(about = "Import legacy telemetry files into the metrics store")]
#[command(version)]
struct Args {
    /// Directory containing sessions.jsonl and tool_metrics.jsonl
    source: PathBuf,

    /// Simulate the import without writing
    #[arg(long)]
    dry_run: bool,

    /// Skip records whose id already exists instead of updating them
    #[arg(long)]
    insert_only: bool,

    /// Records per batch (default: import.batch_size)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Keep going after a batch with failed records
    #[arg(long)]
    continue_on_error: bool,

    /// Skip validation before writing
    #[arg(long)]
    no_validate: bool,

    /// Target tenant schema (default: store.schema)
    #[arg(long)]
    schema: Option<String>,

    /// Name the run, or resume the checkpoint with this id
    #[arg(long)]
    run_id: Option<String>,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();
    let config = Config::load().context("failed to load configuration")?;
    let _log_guard = metricvault_core::logging::init(&config.logging, "metricvault-migrate")
        .context("failed to initialize logging")?;

    tracing::info!(source = %args.source.display(), "metricvault-migrate starting");

    let data = legacy::load_dir(&args.source)
        .with_context(|| format!("failed to read legacy data from {}", args.source.display()))?;
    if !args.json {
        println!(
            "Source: {} ({} sessions, {} tool metrics)",
            args.source.display(),
            data.sessions.len(),
            data.tool_metrics.len()
        );
        for warning in &data.warnings {
            println!("  warning: {}", warning);
        }
    }

    let schema = args.schema.clone().unwrap_or_else(|| config.store.schema.clone());
    let mut options = ImportOptions::from_config(&config.import, &schema);
    options.dry_run = args.dry_run;
    options.continue_on_error |= args.continue_on_error;
    options.validate_before_insert &= !args.no_validate;
    options.run_id = args.run_id.clone();
    if args.insert_only {
        options.mode = WriteMode::Insert;
    }
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }

    let db_path = config.database_path();
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    db.set_chunk_interval_hours(config.partitions.chunk_interval_hours);
    if schema != "main" {
        db.attach_schema(&schema, Some(&Config::tenant_database_path(&schema)))
            .with_context(|| format!("failed to attach schema {}", schema))?;
    }

    let sessions_total = data.sessions.len() as u64;
    let pb = if args.json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(sessions_total + data.tool_metrics.len() as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let runner = MigrationRunner::new(&db, options)
        .with_post_import_sample(config.import.post_import_sample);
    let report = runner
        .run_with_progress(&data, |p| {
            let offset = match p.entity {
                EntityKind::Session => 0,
                EntityKind::ToolMetric => sessions_total,
            };
            pb.set_position(offset + p.processed as u64);
            pb.set_message(format!(
                "{} batch {}/{} ({:.0}/s)",
                p.entity,
                p.batch_index + 1,
                p.total_batches,
                p.throughput
            ));
        })
        .context("migration failed")?;
    pb.finish_and_clear();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.status.succeeded() {
        bail!("migration did not complete ({:?})", report.status);
    }
    Ok(())
}

fn print_report(report: &MigrationReport) {
    if let Some(validation) = &report.validation {
        println!();
        println!(
            "Validation: {} error(s), {} warning(s)",
            validation.errors.len(),
            validation.warnings.len()
        );
        for issue in validation.errors.iter().take(20) {
            println!(
                "  [{}] {} {}",
                issue.rule,
                issue.record_id.as_deref().unwrap_or("-"),
                issue.message
            );
        }
    }

    if let Some(import) = &report.import {
        println!();
        println!("{}", if import.dry_run { "Dry run complete:" } else { "Import complete:" });
        println!("  Run id:            {}", import.run_id);
        println!("  Resumed:           {}", import.resumed);
        println!("  Processed:         {}", import.total_processed);
        println!("  Inserted:          {}", import.inserted);
        println!("  Updated:           {}", import.updated);
        println!("  Skipped:           {}", import.skipped);
        println!("  Errors:            {}", import.errors.len());
        for err in import.errors.iter().take(20) {
            println!(
                "    {:?} {}: {}",
                err.origin,
                err.record_id.as_deref().unwrap_or("-"),
                err.message
            );
        }
        if let Some(checksum) = &import.checksum_validation {
            println!(
                "  Checksum:          {}",
                if checksum.matches { "match" } else { "MISMATCH" }
            );
        }
    }

    if let Some(post) = &report.post_import {
        println!();
        println!(
            "Verification: {} ({} sampled, {} missing, {} mismatched)",
            if post.is_valid { "ok" } else { "FAILED" },
            post.sampled,
            post.missing.len(),
            post.mismatches.len()
        );
        for err in &post.errors {
            println!("  {}", err);
        }
    }

    println!();
    println!("Status: {:?} in {}ms", report.status, report.duration_ms);
}
