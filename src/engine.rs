// src/engine.rs

//! Migration Engine: the six-phase recoverable state machine.
//!
//! ```text
//! IDLE -> P0 pre-checks -> P1 stage inbound -> P2a set up sync
//!      -> P2b backup preserved -> P3 atomic swap -> P4 validate & cleanup
//!      -> P5 reset sequences -> P6 rebuild indexes -> DONE
//! ```
//!
//! The engine exclusively owns the destination connection pool for the
//! duration of a run. Introspection and the dump transport may open
//! short-lived sub-sessions but always hand control back before the
//! next phase begins; no phase starts until the previous one has
//! quiesced (every session returned, every subprocess reaped).
//!
//! [`MigrationEngine::prepare`] and [`MigrationEngine::commit_swap`]
//! split the state machine at the P2b/P3 boundary so a CLI front-end can
//! run them as two separate process invocations (`prepare` then
//! `swap`), since P1's staged `shadow` namespace and P2a's sync triggers
//! both persist in the destination database across a process exit.
//! [`MigrationEngine::migrate`] runs both halves back to back for a
//! single-invocation `start`.
//!
//! Portability note: preserved-table sync assumes every preserved table
//! has a primary key column literally named `id`. Composite or
//! differently named primary keys are not supported;
//! [`crate::sync::setup`] fails fast with
//! [`crate::error::Error::PreservedTable`] when the column is absent.

use crate::config::Endpoint;
use crate::dump::{self, ArchiveFile};
use crate::error::{Error, Result};
use crate::introspect;
use crate::namespace;
use crate::pool;
use crate::restorer;
use crate::stats::MigrationStats;
use crate::sync::{self, SyncTriggerRecord};
use chrono::Utc;
use deadpool_postgres::Pool;
use futures_util::future::join_all;

/// Outcome of a completed (or failed-but-recovered) run.
#[derive(Debug)]
pub struct MigrationOutcome {
    pub success: bool,
    /// Set once P3 commits; `None` if the run failed before the swap.
    pub backup_namespace: Option<String>,
    /// Set if phase 4's post-swap validation found a mismatch. The swap
    /// itself is not undone by this; operators should `rollback --latest`.
    pub post_swap_validation_failed: bool,
    pub stats: MigrationStats,
}

/// Result of [`MigrationEngine::prepare`]: P0 through P2b have run, the
/// destination has a populated `shadow` and (if any preserved tables
/// were given) live sync triggers. `backup_ts` is the millisecond
/// timestamp [`MigrationEngine::commit_swap`] will use to name the
/// backup namespace — doubling as the "migration-id" a `prepare`
/// invocation reports to the caller.
#[derive(Debug)]
pub struct PreparedMigration {
    pub backup_ts: i64,
    preserved_tables: Vec<String>,
    sync_triggers: Vec<SyncTriggerRecord>,
    stats: MigrationStats,
}

/// Report produced by [`MigrationEngine::dry_run`]. No mutation occurs;
/// this only reflects what a real run would do.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DryRunReport {
    pub source_tables: Vec<DryRunTable>,
    pub destination_tables_to_backup: Vec<DryRunTable>,
    pub preserved_table_presence: Vec<PreservedPresence>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DryRunTable {
    pub name: String,
    pub row_count: i64,
    pub planned_target: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PreservedPresence {
    pub table: String,
    pub present_in_source: bool,
    pub present_in_destination: bool,
}

/// Snapshot reported by `status`. Pure: reads the destination's current
/// state without mutating anything.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub shadow_present: bool,
    pub shadow_table_count: usize,
    pub active_sync_triggers: Vec<String>,
    pub backup_count: usize,
}

pub struct MigrationEngine {
    source_endpoint: Endpoint,
    dest_endpoint: Endpoint,
    source_pool: Pool,
    dest_pool: Pool,
}

impl MigrationEngine {
    pub fn new(source_endpoint: Endpoint, dest_endpoint: Endpoint, parallel_jobs: usize) -> Result<Self> {
        let source_pool = pool::build_pool(&source_endpoint, 4)?;
        let dest_pool = pool::build_pool(&dest_endpoint, parallel_jobs + 4)?;
        Ok(MigrationEngine {
            source_endpoint,
            dest_endpoint,
            source_pool,
            dest_pool,
        })
    }

    /// P0 plus an analysis pass; mutates nothing.
    pub async fn dry_run(&self, preserved_tables: &[String]) -> Result<DryRunReport> {
        let source_client = self.source_pool.get().await?;
        let dest_client = self.dest_pool.get().await?;

        self.pre_checks(&source_client, &dest_client).await?;

        let mut warnings = Vec::new();
        let source_tables = introspect::introspect_schema(&source_client, "public", &mut warnings).await?;
        let dest_tables = introspect::introspect_schema(&dest_client, "public", &mut warnings).await?;

        let mut source_report = Vec::with_capacity(source_tables.len());
        for table in &source_tables {
            let count = row_count(&source_client, "public", &table.name).await?;
            source_report.push(DryRunTable {
                name: table.name.clone(),
                row_count: count,
                planned_target: "public (via shadow)".to_string(),
            });
        }

        let mut dest_report = Vec::with_capacity(dest_tables.len());
        for table in &dest_tables {
            let count = row_count(&dest_client, "public", &table.name).await?;
            dest_report.push(DryRunTable {
                name: table.name.clone(),
                row_count: count,
                planned_target: "backup_<ts>".to_string(),
            });
        }

        let source_names: std::collections::HashSet<_> =
            source_tables.iter().map(|t| t.name.clone()).collect();
        let dest_names: std::collections::HashSet<_> =
            dest_tables.iter().map(|t| t.name.clone()).collect();
        let presence = preserved_tables
            .iter()
            .map(|t| PreservedPresence {
                table: t.clone(),
                present_in_source: source_names.contains(t),
                present_in_destination: dest_names.contains(t),
            })
            .collect();

        Ok(DryRunReport {
            source_tables: source_report,
            destination_tables_to_backup: dest_report,
            preserved_table_presence: presence,
        })
    }

    /// Report shadow presence, shadow table count, active sync
    /// triggers, and backup count. Pure; never mutates.
    pub async fn status(&self) -> Result<EngineStatus> {
        let dest_client = self.dest_pool.get().await?;

        let shadow_present = namespace::shadow_exists(&dest_client).await?;
        let shadow_table_count = if shadow_present {
            let mut warnings = Vec::new();
            introspect::introspect_schema(&dest_client, "shadow", &mut warnings).await?.len()
        } else {
            0
        };

        let trigger_rows = dest_client
            .query(
                "SELECT p.proname FROM pg_catalog.pg_proc p
                   JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
                  WHERE n.nspname = 'public' AND p.proname LIKE 'sync\\_%\\_to\\_shadow' ESCAPE '\\'",
                &[],
            )
            .await
            .map_err(|e| Error::Introspection(format!("listing sync trigger functions: {e}")))?;
        let active_sync_triggers: Vec<String> = trigger_rows.into_iter().map(|r| r.get(0)).collect();

        let backup_rows = dest_client
            .query(
                "SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname LIKE 'backup\\_%' ESCAPE '\\'",
                &[],
            )
            .await
            .map_err(|e| Error::Introspection(format!("counting backup namespaces: {e}")))?;

        Ok(EngineStatus {
            shadow_present,
            shadow_table_count,
            active_sync_triggers,
            backup_count: backup_rows.len(),
        })
    }

    /// Drive the full six-phase migration in one call: `prepare` then
    /// `commit_swap`. Used by the single-invocation `start` command.
    pub async fn migrate(&self, preserved_tables: Vec<String>) -> Result<MigrationOutcome> {
        let prepared = self.prepare(preserved_tables).await?;
        self.commit_swap(prepared).await
    }

    /// P0 pre-checks, P1 stage inbound, P2a set up sync, P2b backup
    /// preserved tables. Leaves the destination with a populated
    /// `shadow` and (if any) live sync triggers — both of which persist
    /// in the destination database, so a caller may exit the process
    /// here and resume with [`Self::commit_swap`] in a later invocation,
    /// as the `prepare`/`swap` CLI command pair does.
    pub async fn prepare(&self, preserved_tables: Vec<String>) -> Result<PreparedMigration> {
        let mut stats = MigrationStats::new(Utc::now());
        let parallel_jobs = dump::parallel_job_bound();

        let source_client = self.source_pool.get().await?;
        let dest_client = self.dest_pool.get().await?;
        if let Err(e) = self.pre_checks(&source_client, &dest_client).await {
            stats.log_error(format!("P0 pre-checks failed: {e}"));
            stats.finish(Utc::now());
            return Err(e);
        }
        stats.log_info("P0 pre-checks passed");

        if let Err(e) = self.stage_inbound(&dest_client, parallel_jobs, &mut stats).await {
            stats.log_error(format!("P1 stage inbound failed: {e}"));
            stats.finish(Utc::now());
            return Err(e);
        }

        let sync_triggers = if preserved_tables.is_empty() {
            stats.log_info("no preserved tables; skipping P2a/P2b");
            Vec::new()
        } else {
            match sync::setup(&dest_client, &preserved_tables).await {
                Ok(triggers) => {
                    stats.log_info(format!("installed {} sync trigger(s)", triggers.len()));
                    triggers
                }
                Err(e) => {
                    let mut warnings = Vec::new();
                    sync::cleanup(&dest_client, &[], &mut warnings).await;
                    for w in warnings {
                        stats.log_warning(w);
                    }
                    stats.log_error(format!("P2a set up sync failed: {e}"));
                    stats.finish(Utc::now());
                    return Err(e);
                }
            }
        };

        let backup_ts = Utc::now().timestamp_millis();
        if !preserved_tables.is_empty() {
            self.backup_preserved_tables(&dest_client, &preserved_tables, backup_ts, &mut stats)
                .await;
        }

        Ok(PreparedMigration {
            backup_ts,
            preserved_tables,
            sync_triggers,
            stats,
        })
    }

    /// Reconstruct a [`PreparedMigration`] for a `swap` invocation that
    /// runs in a separate process from the `prepare` that actually
    /// staged `shadow` and installed sync triggers: `backup_ts` is the
    /// migration-id `prepare` reported (or, if the caller never ran
    /// `prepare` separately, a timestamp chosen fresh), and the trigger
    /// records are rebuilt from `preserved_tables` by naming convention
    /// rather than read back from the database.
    pub fn resume_prepared(&self, backup_ts: i64, preserved_tables: Vec<String>) -> PreparedMigration {
        let sync_triggers = sync::existing_trigger_records(&preserved_tables);
        PreparedMigration {
            backup_ts,
            preserved_tables,
            sync_triggers,
            stats: MigrationStats::new(Utc::now()),
        }
    }

    /// P3 atomic swap, P4 validate & cleanup, P5 reset sequences, P6
    /// rebuild indexes. On P3 failure, runs global recovery and returns
    /// the original error; otherwise always returns `Ok` with the
    /// outcome reflecting whether P4's post-swap validation passed.
    pub async fn commit_swap(&self, prepared: PreparedMigration) -> Result<MigrationOutcome> {
        let PreparedMigration {
            backup_ts,
            preserved_tables,
            sync_triggers,
            mut stats,
        } = prepared;

        let dest_client = self.dest_pool.get().await?;
        let backup_namespace = format!("backup_{backup_ts}");
        if let Err(e) = self.atomic_swap(&dest_client, &backup_namespace, &mut stats).await {
            stats.log_error(format!("P3 atomic swap failed: {e}"));
            let mut warnings = Vec::new();
            sync::cleanup(&dest_client, &sync_triggers, &mut warnings).await;
            for w in warnings {
                stats.log_warning(w);
            }
            if let Err(recovery_err) = self.global_recovery(&dest_client, None).await {
                stats.log_error(format!("global recovery failed: {recovery_err}"));
                stats.finish(Utc::now());
                return Err(recovery_err);
            }
            stats.finish(Utc::now());
            return Err(e);
        }
        stats.log_info(format!("atomic swap committed; backup is {backup_namespace}"));

        // Compare the newly promoted `public` against the just-demoted
        // backup, not against `shadow` — `shadow` has already been
        // recreated empty by `atomic_swap`. A mismatch here means a
        // write landed directly on `public` between the swap commit
        // and this check. Each table validates on its own leased
        // session so the checks actually run concurrently — the
        // destination pool is sized `parallel_jobs + 4` precisely so
        // this can overlap with engine bookkeeping.
        let validations = join_all(preserved_tables.iter().map(|table| {
            let pool = &self.dest_pool;
            let backup_namespace = backup_namespace.clone();
            async move {
                let client = pool.get().await?;
                let result = sync::validate_against(&client, table, "public", &backup_namespace).await;
                Ok::<_, Error>((table.clone(), result))
            }
        }))
        .await;

        let mut post_swap_validation_failed = false;
        for outcome in validations {
            match outcome {
                Ok((table, Ok(v))) if v.is_valid() => {
                    stats.log_info(format!("mirror validated for {table}"));
                }
                Ok((table, Ok(v))) => {
                    post_swap_validation_failed = true;
                    stats.log_error(format!(
                        "post-swap validation failed for {table}: {:?}",
                        v.errors
                    ));
                }
                Ok((table, Err(e))) => {
                    post_swap_validation_failed = true;
                    stats.log_error(format!("post-swap validation error for {table}: {e}"));
                }
                Err(e) => {
                    post_swap_validation_failed = true;
                    stats.log_error(format!("acquiring validation session: {e}"));
                }
            }
        }
        let mut cleanup_warnings = Vec::new();
        sync::cleanup(&dest_client, &sync_triggers, &mut cleanup_warnings).await;
        for w in cleanup_warnings {
            stats.log_warning(w);
        }

        let mut introspect_warnings = Vec::new();
        let live_tables =
            introspect::introspect_schema(&dest_client, "public", &mut introspect_warnings).await?;
        for w in introspect_warnings {
            stats.log_warning(w);
        }

        let mut records_migrated = 0i64;
        for table in &live_tables {
            match row_count(&dest_client, "public", &table.name).await {
                Ok(n) => records_migrated += n,
                Err(e) => stats.log_warning(format!("counting rows in public.{}: {e}", table.name)),
            }
        }
        stats.records_migrated = records_migrated;

        let mut seq_warnings = Vec::new();
        restorer::reset_sequences(&dest_client, &live_tables, &mut seq_warnings).await;
        for w in seq_warnings {
            stats.log_warning(w);
        }

        let mut index_warnings = Vec::new();
        let mut index_info = Vec::new();
        restorer::rebuild_indexes(&dest_client, &live_tables, "shadow", &mut index_warnings, &mut index_info)
            .await;
        for i in index_info {
            stats.log_info(i);
        }
        for w in index_warnings {
            stats.log_warning(w);
        }

        stats.tables_processed = live_tables.len();
        stats.finish(Utc::now());

        Ok(MigrationOutcome {
            success: !post_swap_validation_failed,
            backup_namespace: Some(backup_namespace),
            post_swap_validation_failed,
            stats,
        })
    }

    /// Confirms both connections actually serve queries (not just that
    /// `pool.get()` handed back a leased session), lists the extensions
    /// installed on the destination, and probes both databases' total
    /// size. All three are real round-trips: a failure here is P0's
    /// "fatal; return without side effects" case, since nothing has
    /// mutated anything yet.
    async fn pre_checks(
        &self,
        source_client: &deadpool_postgres::Client,
        dest_client: &deadpool_postgres::Client,
    ) -> Result<()> {
        source_client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| Error::Connection(format!("probing source connection: {e}")))?;
        dest_client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| Error::Connection(format!("probing destination connection: {e}")))?;

        let extension_rows = dest_client
            .query(
                "SELECT extname FROM pg_catalog.pg_extension ORDER BY extname",
                &[],
            )
            .await
            .map_err(|e| Error::Connection(format!("listing destination extensions: {e}")))?;
        let extensions: Vec<String> = extension_rows.into_iter().map(|r| r.get(0)).collect();
        tracing::info!(?extensions, "destination extensions probed");

        let source_size: i64 = source_client
            .query_one("SELECT pg_database_size(current_database())", &[])
            .await
            .map_err(|e| Error::Connection(format!("probing source database size: {e}")))?
            .get(0);
        let dest_size: i64 = dest_client
            .query_one("SELECT pg_database_size(current_database())", &[])
            .await
            .map_err(|e| Error::Connection(format!("probing destination database size: {e}")))?
            .get(0);
        tracing::info!(source_size, dest_size, "size probe complete");

        Ok(())
    }

    /// P1: rename source `public -> shadow`, dump that namespace, restore
    /// it into the destination's `shadow`, then rename source `shadow`
    /// back to `public`. The source rename is always reversed, on both
    /// the success and failure paths.
    async fn stage_inbound(
        &self,
        dest_client: &deadpool_postgres::Client,
        parallel_jobs: usize,
        stats: &mut MigrationStats,
    ) -> Result<()> {
        if namespace::shadow_exists(dest_client).await? {
            stats.log_warning("destination shadow already exists; dropping it before staging");
            namespace::drop_namespace(dest_client, "shadow", true).await?;
        }

        let source_client = self.source_pool.get().await?;
        namespace::rename_namespace(&source_client, "public", "shadow").await?;

        let archive = ArchiveFile::new("shadow")?;
        let dump_result = dump::dump(&self.source_endpoint, "shadow", archive.path()).await;

        // The source rename is reversed unconditionally: whether the
        // dump succeeded or not, `source.public` must exist again
        // before this function returns.
        let rename_back = namespace::rename_namespace(&source_client, "shadow", "public").await;

        dump_result?;
        rename_back?;

        let restore_result = dump::restore(&self.dest_endpoint, parallel_jobs, archive.path()).await;
        if let Err(e) = restore_result {
            namespace::drop_namespace(dest_client, "shadow", true).await?;
            return Err(e);
        }

        stats.log_info("inbound data staged into destination shadow");
        Ok(())
    }

    async fn backup_preserved_tables(
        &self,
        dest_client: &deadpool_postgres::Client,
        preserved_tables: &[String],
        ts: i64,
        stats: &mut MigrationStats,
    ) {
        for table in preserved_tables {
            let quoted = crate::identifier::quote_ident(table);
            let backup_name = crate::identifier::quote_ident(&format!("{table}_backup_{ts}"));
            let stmt = format!("CREATE TABLE public.{backup_name} AS SELECT * FROM public.{quoted}");
            if let Err(e) = dest_client.batch_execute(&stmt).await {
                stats.log_warning(format!("backing up preserved table {table}: {e}"));
            }
        }
    }

    /// P3: rename `public -> backup_<ts>`, `shadow -> public`, inside
    /// one transaction; on commit, create a fresh empty `shadow`.
    ///
    /// Once the transaction commits, the swap is durable — a failure to
    /// create the fresh `shadow` afterward is logged as a warning, not
    /// surfaced as a swap failure, since `stage_inbound` already drops
    /// a leftover `shadow` at the start of the next run.
    async fn atomic_swap(
        &self,
        dest_client: &deadpool_postgres::Client,
        backup_namespace: &str,
        stats: &mut MigrationStats,
    ) -> Result<()> {
        let mut client = self.dest_pool.get().await?;
        let txn = client.transaction().await?;
        namespace::swap_triple(&txn, "public", "shadow", backup_namespace).await?;
        txn.commit().await?;

        if let Err(e) = namespace::create_namespace(dest_client, "shadow").await {
            stats.log_warning(format!("creating fresh shadow after swap: {e}"));
        }
        Ok(())
    }

    /// On any failure with an existing `backup_<ts>` namespace: rename
    /// `public -> failed_migration_<ts>`, `backup_<ts> -> public`,
    /// inside one transaction. If no backup exists yet (failure before
    /// P3), nothing in the destination was promoted and no recovery is
    /// needed.
    async fn global_recovery(
        &self,
        dest_client: &deadpool_postgres::Client,
        backup_namespace: Option<&str>,
    ) -> Result<()> {
        let Some(backup_namespace) = backup_namespace else {
            return Ok(());
        };
        if !namespace::namespace_exists(dest_client, backup_namespace).await? {
            return Ok(());
        }

        let mut client = self.dest_pool.get().await?;
        let txn = client
            .transaction()
            .await
            .map_err(|e| Error::Recovery(format!("starting recovery transaction: {e}")))?;

        let ts = Utc::now().timestamp_millis();
        let failed_name = format!("failed_migration_{ts}");
        namespace::rename_namespace_in_recovery(&txn, "public", &failed_name)
            .await
            .map_err(|e| Error::Recovery(e.to_string()))?;
        namespace::rename_namespace_in_recovery(&txn, backup_namespace, "public")
            .await
            .map_err(|e| Error::Recovery(e.to_string()))?;
        txn.commit()
            .await
            .map_err(|e| Error::Recovery(format!("committing recovery: {e}")))?;
        Ok(())
    }
}

pub(crate) async fn row_count(
    client: &deadpool_postgres::Client,
    namespace: &str,
    table: &str,
) -> Result<i64> {
    let quoted = crate::identifier::quote_qualified(namespace, table);
    let row = client
        .query_one(&format!("SELECT count(*) FROM {quoted}"), &[])
        .await
        .map_err(|e| Error::Introspection(format!("counting rows in {namespace}.{table}: {e}")))?;
    Ok(row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_table_carries_planned_target() {
        let t = DryRunTable {
            name: "users".into(),
            row_count: 2,
            planned_target: "public (via shadow)".into(),
        };
        assert_eq!(t.row_count, 2);
    }

    #[test]
    fn preserved_presence_flags_both_sides_independently() {
        let p = PreservedPresence {
            table: "users".into(),
            present_in_source: true,
            present_in_destination: false,
        };
        assert!(p.present_in_source);
        assert!(!p.present_in_destination);
    }
}
