// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pgswap::config::{self, Endpoint};
use pgswap::dump;
use pgswap::engine::MigrationEngine;
use pgswap::pool;
use pgswap::rollback;
use tracing::info;

#[derive(Parser)]
#[command(name = "pgswap")]
#[command(author, version, about = "Zero-downtime replacement of a destination PostgreSQL database from a source database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full migration: stage, sync, swap, validate, restore sequences and indexes.
    Start {
        #[arg(long)]
        source_url: Option<String>,
        #[arg(long)]
        dest_url: Option<String>,
        /// Comma-separated list of tables whose live contents survive the migration.
        #[arg(long)]
        preserved_tables: Option<String>,
        /// Report what would happen without mutating either database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Stage inbound data and preserved-table sync without swapping; emits a migration-id for `swap`.
    Prepare {
        #[arg(long)]
        source_url: Option<String>,
        #[arg(long)]
        dest_url: Option<String>,
        #[arg(long)]
        preserved_tables: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Commit a previously prepared migration: atomic swap, validate, reset sequences, rebuild indexes.
    Swap {
        #[arg(long)]
        dest_url: Option<String>,
        #[arg(long)]
        preserved_tables: Option<String>,
        /// The migration-id `prepare` reported. Omit to swap against a fresh timestamp.
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Report shadow presence, shadow table count, active sync triggers, and backup count.
    Status {
        #[arg(long)]
        dest_url: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Enumerate backup namespaces, newest first.
    List {
        #[arg(long)]
        dest_url: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Restore a backup namespace as `public`.
    Rollback {
        #[arg(long)]
        dest_url: Option<String>,
        /// Roll back to the most recent backup.
        #[arg(long)]
        latest: bool,
        /// Roll back to a specific backup's millisecond timestamp.
        #[arg(long)]
        timestamp: Option<i64>,
        /// Comma-separated tables whose post-migration contents are kept rather than restored from backup.
        #[arg(long)]
        keep_tables: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete backup namespaces strictly older than a cutoff.
    Cleanup {
        /// `YYYY-MM-DD`, `YYYY-MM-DD HH:MM`, or a millisecond timestamp.
        #[arg(long)]
        before: String,
        #[arg(long)]
        dest_url: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate one backup namespace's integrity.
    Verify {
        timestamp: i64,
        #[arg(long)]
        dest_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Start {
            source_url,
            dest_url,
            preserved_tables,
            dry_run,
        } => run_start(source_url, dest_url, preserved_tables, dry_run).await,
        Commands::Prepare {
            source_url,
            dest_url,
            preserved_tables,
            dry_run,
        } => run_prepare(source_url, dest_url, preserved_tables, dry_run).await,
        Commands::Swap {
            dest_url,
            preserved_tables,
            timestamp,
        } => run_swap(dest_url, preserved_tables, timestamp).await,
        Commands::Status { dest_url, json } => run_status(dest_url, json).await,
        Commands::List { dest_url, json } => run_list(dest_url, json).await,
        Commands::Rollback {
            dest_url,
            latest,
            timestamp,
            keep_tables,
            dry_run,
        } => run_rollback(dest_url, latest, timestamp, keep_tables, dry_run).await,
        Commands::Cleanup {
            before,
            dest_url,
            dry_run,
        } => run_cleanup(before, dest_url, dry_run).await,
        Commands::Verify { timestamp, dest_url } => run_verify(timestamp, dest_url).await,
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn resolve_endpoints(source_url: Option<String>, dest_url: Option<String>) -> Result<(Endpoint, Endpoint)> {
    let source = config::resolve_source(source_url.as_deref()).context("resolving source endpoint")?;
    let dest = config::resolve_dest(dest_url.as_deref()).context("resolving destination endpoint")?;
    Ok((source, dest))
}

async fn run_start(
    source_url: Option<String>,
    dest_url: Option<String>,
    preserved_tables: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let (source, dest) = resolve_endpoints(source_url, dest_url)?;
    let preserved = config::resolve_preserved_tables(preserved_tables.as_deref());
    let parallel_jobs = dump::parallel_job_bound();
    let engine = MigrationEngine::new(source, dest, parallel_jobs)?;

    if dry_run {
        let report = engine.dry_run(&preserved).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let outcome = engine.migrate(preserved).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.stats)?);
    if !outcome.success {
        bail!("migration completed but post-swap validation failed; run `rollback --latest`");
    }
    info!(
        "migration complete; backup namespace is {}",
        outcome.backup_namespace.unwrap_or_default()
    );
    Ok(())
}

async fn run_prepare(
    source_url: Option<String>,
    dest_url: Option<String>,
    preserved_tables: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let (source, dest) = resolve_endpoints(source_url, dest_url)?;
    let preserved = config::resolve_preserved_tables(preserved_tables.as_deref());
    let parallel_jobs = dump::parallel_job_bound();
    let engine = MigrationEngine::new(source, dest, parallel_jobs)?;

    if dry_run {
        let report = engine.dry_run(&preserved).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let prepared = engine.prepare(preserved).await?;
    println!(
        "{{\"migration_id\":{},\"timestamp\":\"{}\"}}",
        prepared.backup_ts,
        chrono::DateTime::from_timestamp_millis(prepared.backup_ts)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default()
    );
    Ok(())
}

async fn run_swap(dest_url: Option<String>, preserved_tables: Option<String>, timestamp: Option<i64>) -> Result<()> {
    let dest = config::resolve_dest(dest_url.as_deref()).context("resolving destination endpoint")?;
    let preserved = config::resolve_preserved_tables(preserved_tables.as_deref());
    let parallel_jobs = dump::parallel_job_bound();
    // `swap` only needs the destination; the source endpoint slot is
    // populated with a clone purely to satisfy the engine's
    // constructor, and is never dialed by commit_swap.
    let engine = MigrationEngine::new(dest.clone(), dest, parallel_jobs)?;

    let backup_ts = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let prepared = engine.resume_prepared(backup_ts, preserved);
    let outcome = engine.commit_swap(prepared).await?;
    println!("{}", serde_json::to_string_pretty(&outcome.stats)?);
    if !outcome.success {
        bail!("swap committed but post-swap validation failed; run `rollback --latest`");
    }
    Ok(())
}

async fn run_status(dest_url: Option<String>, json: bool) -> Result<()> {
    let dest = config::resolve_dest(dest_url.as_deref()).context("resolving destination endpoint")?;
    let engine = MigrationEngine::new(dest.clone(), dest, 4)?;
    let status = engine.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("shadow present: {}", status.shadow_present);
        println!("shadow table count: {}", status.shadow_table_count);
        println!("active sync triggers: {}", status.active_sync_triggers.len());
        for t in &status.active_sync_triggers {
            println!("  - {t}");
        }
        println!("backup count: {}", status.backup_count);
    }
    Ok(())
}

async fn run_list(dest_url: Option<String>, json: bool) -> Result<()> {
    let dest = config::resolve_dest(dest_url.as_deref()).context("resolving destination endpoint")?;
    let dest_pool = pool::build_pool(&dest, 4)?;
    let client = dest_pool.get().await?;
    let backups = rollback::list(&client).await?;

    if json {
        #[derive(serde::Serialize)]
        struct Entry {
            namespace: String,
            timestamp_ms: i64,
            created_at: String,
            table_count: usize,
            cumulative_size: String,
        }
        let entries: Vec<Entry> = backups
            .iter()
            .map(|b| Entry {
                namespace: b.namespace.clone(),
                timestamp_ms: b.timestamp_ms,
                created_at: b.created_at.to_rfc3339(),
                table_count: b.tables.len(),
                cumulative_size: b.cumulative_size_pretty.clone(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if backups.is_empty() {
        println!("no backups");
    } else {
        for b in &backups {
            println!(
                "{}  {} tables  {}  ({})",
                b.namespace,
                b.tables.len(),
                b.cumulative_size_pretty,
                b.created_at.to_rfc3339()
            );
        }
    }
    Ok(())
}

async fn run_rollback(
    dest_url: Option<String>,
    latest: bool,
    timestamp: Option<i64>,
    keep_tables: Option<String>,
    dry_run: bool,
) -> Result<()> {
    if !latest && timestamp.is_none() {
        bail!("rollback requires either --latest or --timestamp");
    }
    let dest = config::resolve_dest(dest_url.as_deref()).context("resolving destination endpoint")?;
    let dest_pool = pool::build_pool(&dest, 4)?;
    let client = dest_pool.get().await?;

    let ts = if let Some(ts) = timestamp {
        ts
    } else {
        let backups = rollback::list(&client).await?;
        backups
            .first()
            .map(|b| b.timestamp_ms)
            .context("rollback --latest requested but no backups exist")?
    };

    let keep: Vec<String> = keep_tables
        .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();

    if dry_run {
        let validation = rollback::validate(&client, ts).await?;
        println!("would roll back to backup_{ts}");
        println!("valid: {}", validation.valid);
        for e in &validation.errors {
            println!("  error: {e}");
        }
        for w in &validation.warnings {
            println!("  warning: {w}");
        }
        return Ok(());
    }

    rollback::rollback(&dest_pool, ts, &keep).await?;
    println!("rolled back to backup_{ts}");
    Ok(())
}

async fn run_cleanup(before: String, dest_url: Option<String>, dry_run: bool) -> Result<()> {
    let before_ms = config::parse_before(&before)?;
    let dest = config::resolve_dest(dest_url.as_deref()).context("resolving destination endpoint")?;
    let dest_pool = pool::build_pool(&dest, 4)?;
    let client = dest_pool.get().await?;

    if dry_run {
        let backups = rollback::list(&client).await?;
        let stale: Vec<_> = backups.into_iter().filter(|b| b.timestamp_ms < before_ms).collect();
        println!("would delete {} backup(s):", stale.len());
        for b in &stale {
            println!("  {}", b.namespace);
        }
        return Ok(());
    }

    let dropped = rollback::cleanup_before(&client, before_ms).await?;
    println!("deleted {} backup(s)", dropped.len());
    for namespace in dropped {
        println!("  {namespace}");
    }
    Ok(())
}

async fn run_verify(timestamp: i64, dest_url: Option<String>) -> Result<()> {
    let dest = config::resolve_dest(dest_url.as_deref()).context("resolving destination endpoint")?;
    let dest_pool = pool::build_pool(&dest, 4)?;
    let client = dest_pool.get().await?;

    let validation = rollback::validate(&client, timestamp).await?;
    println!("valid: {}", validation.valid);
    for e in &validation.errors {
        println!("error: {e}");
    }
    for w in &validation.warnings {
        println!("warning: {w}");
    }
    if !validation.valid {
        bail!("backup_{timestamp} failed validation");
    }
    Ok(())
}
