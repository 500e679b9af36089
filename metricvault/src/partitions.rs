//! metricvault-partitions - partition maintenance for the metrics store
//!
//! Lists, compresses, drops and pre-creates time chunks of the partitioned
//! tables, runs the full maintenance cycle and reports partition health.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/metricvault/metrics.db (~/.local/share/metricvault/metrics.db)
//! - Tenant schemas: $XDG_DATA_HOME/metricvault/tenants/<schema>.db
//! - Config: $XDG_CONFIG_HOME/metricvault/config.toml (~/.config/metricvault/config.toml)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use metricvault_core::partition::PartitionManager;
use metricvault_core::{Config, Database};

#[derive(Parser)]
#[command(name = "metricvault-partitions")]
#[command(about = "Manage time partitions of the metrics store")]
#[command(version)]
struct Args {
    /// Tenant schema (default: from config)
    #[arg(long, global = true)]
    schema: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List chunks
    Chunks {
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Per-table chunk statistics
    Stats {
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Compress chunks older than the given age
    Compress {
        #[arg(short, long)]
        table: Option<String>,

        /// Age in days (default: partitions.compress_after_days)
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Drop chunks older than the given age, with their rows
    Drop {
        #[arg(short, long)]
        table: Option<String>,

        /// Age in days (default: partitions.retention_days)
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Create chunks for the next N days
    Precreate {
        #[arg(long)]
        days: Option<u32>,
    },

    /// Create chunks covering an explicit window
    Window {
        table: String,

        /// RFC 3339 start of the window
        #[arg(long)]
        start: DateTime<Utc>,

        /// RFC 3339 end of the window
        #[arg(long)]
        end: DateTime<Utc>,

        /// Chunk width (default: partitions.chunk_interval_hours)
        #[arg(long)]
        interval_hours: Option<u32>,
    },

    /// Compress, drop and pre-create in one pass
    Maintain,

    /// Report partition health; exits with status 2 when unhealthy
    Health,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();
    let config = Config::load().context("failed to load configuration")?;
    let _log_guard = metricvault_core::logging::init(&config.logging, "metricvault-partitions")
        .context("failed to initialize logging")?;

    let schema = args.schema.clone().unwrap_or_else(|| config.store.schema.clone());
    let db = open_database(&config, &schema)?;

    let mut partitions = config.partitions.clone();
    partitions.tables = partitions.tables.iter().map(|t| qualify(&schema, t)).collect();
    let manager = PartitionManager::new(&db, partitions);
    let table = |t: &Option<String>| t.as_deref().map(|t| qualify(&schema, t));

    match &args.command {
        Command::Chunks { table: t } => {
            let chunks = manager.list_chunks(table(t).as_deref())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&chunks)?);
            } else {
                println!(
                    "{:<24} {:>6}  {:<20} {:<20} {:>12}  {}",
                    "TABLE", "ID", "START", "END", "BYTES", "COMPRESSED"
                );
                for c in &chunks {
                    println!(
                        "{:<24} {:>6}  {:<20} {:<20} {:>12}  {}",
                        c.table_name,
                        c.chunk_id,
                        c.range_start.format("%Y-%m-%d %H:%M"),
                        c.range_end.format("%Y-%m-%d %H:%M"),
                        c.size_bytes,
                        if c.compressed { "yes" } else { "no" }
                    );
                }
                println!("{} chunk(s)", chunks.len());
            }
        }
        Command::Stats { table: t } => {
            let stats = manager.chunk_stats(table(t).as_deref())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                for s in &stats {
                    println!("{}", s.table_name);
                    println!(
                        "  chunks:      {} ({} compressed, {} uncompressed)",
                        s.total_chunks, s.compressed_chunks, s.uncompressed_chunks
                    );
                    println!("  size:        {} bytes", s.total_size_bytes);
                    println!("  oldest:      {}", fmt_time(s.oldest_chunk));
                    println!("  newest:      {}", fmt_time(s.newest_chunk));
                }
            }
        }
        Command::Compress {
            table: t,
            older_than_days,
        } => {
            let n = manager.compress_chunks_older_than(table(t).as_deref(), *older_than_days)?;
            print_count(args.json, "compressed", n);
        }
        Command::Drop {
            table: t,
            older_than_days,
        } => {
            let n = manager.drop_chunks_older_than(table(t).as_deref(), *older_than_days)?;
            print_count(args.json, "dropped", n);
        }
        Command::Precreate { days } => {
            let days = days.unwrap_or(config.partitions.precreate_days);
            let n = manager.pre_create_upcoming(days)?;
            print_count(args.json, "created", n);
        }
        Command::Window {
            table: t,
            start,
            end,
            interval_hours,
        } => {
            let interval = interval_hours.unwrap_or(config.partitions.chunk_interval_hours);
            let n = manager.create_chunks_for_window(&qualify(&schema, t), *start, *end, interval)?;
            print_count(args.json, "created", n);
        }
        Command::Maintain => {
            let summary = manager
                .run_maintenance_cycle()
                .context("maintenance cycle failed")?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Maintenance complete:");
                println!("  Compressed:      {}", summary.compressed);
                println!("  Dropped:         {}", summary.dropped);
                println!("  Pre-created:     {} day(s)", summary.pre_created_days);
            }
        }
        Command::Health => {
            let report = manager.health_check()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_healthy {
                println!("Partitions healthy");
            } else {
                println!("Partitions unhealthy:");
                for issue in &report.issues {
                    println!("  - {}", issue);
                }
            }
            if !report.is_healthy {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

/// Open the store and attach the tenant schema if it is not `main`
fn open_database(config: &Config, schema: &str) -> Result<Database> {
    let db_path = config.database_path();
    tracing::info!(path = %db_path.display(), schema, "Opening database");

    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    db.set_chunk_interval_hours(config.partitions.chunk_interval_hours);
    if schema != "main" {
        db.attach_schema(schema, Some(&Config::tenant_database_path(schema)))
            .with_context(|| format!("failed to attach schema {}", schema))?;
    }
    Ok(db)
}

fn qualify(schema: &str, table: &str) -> String {
    if schema == "main" || table.contains('.') {
        table.to_string()
    } else {
        format!("{}.{}", schema, table)
    }
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_count(json: bool, label: &str, n: usize) {
    if json {
        let mut body = serde_json::Map::new();
        body.insert(label.to_string(), n.into());
        println!("{}", serde_json::Value::Object(body));
    } else {
        println!("{} {} chunk(s)", capitalize(label), n);
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
