// src/rollback.rs

//! Rollback Engine.
//!
//! Enumerates `backup_<unix-ms>` namespaces, validates their integrity,
//! and restores one by the symmetric swap: rename the current `public`
//! aside, promote the backup, and — for any caller-nominated
//! `keep-tables` — splice the pre-rollback live contents back in for
//! just those tables.
//!
//! Namespace-swap is the only rollback model implemented here; a
//! table-rename variant is deliberately not built.

use crate::error::{Error, Result};
use crate::identifier::{quote_ident, quote_qualified, validate_ident};
use crate::namespace;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_postgres::{Client, Pool};

#[derive(Debug, Clone)]
pub struct BackupTable {
    pub name: String,
    pub row_count: i64,
    pub size_pretty: String,
}

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub namespace: String,
    pub timestamp_ms: i64,
    pub created_at: DateTime<Utc>,
    pub tables: Vec<BackupTable>,
    pub cumulative_size_pretty: String,
}

#[derive(Debug, Clone, Default)]
pub struct TableValidation {
    pub table: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BackupValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub tables: Vec<TableValidation>,
}

/// Parse `backup_<unix-ms>` into its millisecond timestamp.
fn parse_backup_timestamp(namespace: &str) -> Option<i64> {
    namespace.strip_prefix("backup_")?.parse().ok()
}

pub fn backup_namespace_name(timestamp_ms: i64) -> String {
    format!("backup_{timestamp_ms}")
}

/// Enumerate every `backup_<*>` namespace, newest first.
pub async fn list(client: &Client) -> Result<Vec<BackupRecord>> {
    let rows = client
        .query(
            "SELECT nspname FROM pg_catalog.pg_namespace WHERE nspname LIKE 'backup\\_%' ESCAPE '\\'",
            &[],
        )
        .await
        .map_err(|e| Error::Introspection(format!("listing backup namespaces: {e}")))?;

    let mut records = Vec::new();
    for row in rows {
        let namespace: String = row.get(0);
        let Some(ts) = parse_backup_timestamp(&namespace) else {
            continue;
        };
        let created_at = Utc
            .timestamp_millis_opt(ts)
            .single()
            .unwrap_or_else(Utc::now);
        let tables = enumerate_tables(client, &namespace).await?;
        let cumulative_bytes = namespace_size_bytes(client, &namespace).await?;
        records.push(BackupRecord {
            namespace: namespace.clone(),
            timestamp_ms: ts,
            created_at,
            cumulative_size_pretty: pretty_size(cumulative_bytes),
            tables,
        });
    }
    records.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
    Ok(records)
}

async fn enumerate_tables(client: &Client, namespace: &str) -> Result<Vec<BackupTable>> {
    let rows = client
        .query(
            "SELECT c.relname, pg_total_relation_size(c.oid)
               FROM pg_catalog.pg_class c
               JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
              WHERE n.nspname = $1 AND c.relkind = 'r'
              ORDER BY c.relname",
            &[&namespace],
        )
        .await
        .map_err(|e| Error::Introspection(format!("enumerating tables in {namespace}: {e}")))?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get(0);
        let size_bytes: i64 = row.get(1);
        let qualified = quote_qualified(namespace, &name);
        let count_row = client
            .query_one(&format!("SELECT count(*) FROM {qualified}"), &[])
            .await
            .map_err(|e| Error::Introspection(format!("counting {namespace}.{name}: {e}")))?;
        tables.push(BackupTable {
            name,
            row_count: count_row.get(0),
            size_pretty: pretty_size(size_bytes),
        });
    }
    Ok(tables)
}

async fn namespace_size_bytes(client: &Client, namespace: &str) -> Result<i64> {
    let row = client
        .query_one(
            "SELECT COALESCE(SUM(pg_total_relation_size(c.oid)), 0)
               FROM pg_catalog.pg_class c
               JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
              WHERE n.nspname = $1 AND c.relkind = 'r'",
            &[&namespace],
        )
        .await
        .map_err(|e| Error::Introspection(format!("sizing namespace {namespace}: {e}")))?;
    Ok(row.get(0))
}

fn pretty_size(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Validate a backup namespace's integrity: existence, every table has
/// at least one column, `id` (when present) has no nulls in the first
/// 100 rows, and every foreign key's referenced rows actually exist
/// (a `LIMIT 1` orphan probe per constraint, not a full scan).
pub async fn validate(client: &Client, timestamp_ms: i64) -> Result<BackupValidationResult> {
    let namespace = backup_namespace_name(timestamp_ms);
    validate_ident(&namespace)?;

    let mut result = BackupValidationResult {
        valid: true,
        ..Default::default()
    };

    if !namespace::namespace_exists(client, &namespace).await? {
        result.valid = false;
        result.errors.push(format!("namespace {namespace} does not exist"));
        return Ok(result);
    }

    let tables = enumerate_tables(client, &namespace).await?;
    if tables.is_empty() {
        result.warnings.push(format!("{namespace} contains no tables"));
    }

    for table in &tables {
        let mut table_validation = TableValidation {
            table: table.name.clone(),
            errors: Vec::new(),
        };

        let column_count: i64 = client
            .query_one(
                "SELECT count(*) FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2",
                &[&namespace, &table.name],
            )
            .await
            .map_err(|e| Error::Introspection(format!("columns of {namespace}.{}: {e}", table.name)))?
            .get(0);
        if column_count == 0 {
            table_validation
                .errors
                .push("table has no columns".to_string());
        }

        if has_id_column(client, &namespace, &table.name).await? {
            let qualified = quote_qualified(&namespace, &table.name);
            let null_count: i64 = client
                .query_one(
                    &format!(
                        "SELECT count(*) FROM (SELECT id FROM {qualified} LIMIT 100) t WHERE id IS NULL"
                    ),
                    &[],
                )
                .await
                .map_err(|e| Error::Introspection(format!("sampling {namespace}.{}: {e}", table.name)))?
                .get(0);
            if null_count > 0 {
                table_validation
                    .errors
                    .push(format!("{null_count} null id value(s) in the first 100 rows"));
            }
        }

        for error in orphan_probe(client, &namespace, &table.name).await? {
            table_validation.errors.push(error);
        }

        if !table_validation.errors.is_empty() {
            result.valid = false;
            result.errors.extend(
                table_validation
                    .errors
                    .iter()
                    .map(|e| format!("{}: {e}", table.name)),
            );
        }
        result.tables.push(table_validation);
    }

    Ok(result)
}

async fn has_id_column(client: &Client, namespace: &str, table: &str) -> Result<bool> {
    let row = client
        .query_opt(
            "SELECT 1 FROM information_schema.columns
              WHERE table_schema = $1 AND table_name = $2 AND column_name = 'id'",
            &[&namespace, &table],
        )
        .await
        .map_err(|e| Error::Introspection(format!("checking id column of {namespace}.{table}: {e}")))?;
    Ok(row.is_some())
}

/// For every foreign key defined on `table` within `namespace`, probe
/// for at least one orphaned row (`LIMIT 1`) rather than a full-table
/// join, so validation stays cheap on large backups.
async fn orphan_probe(client: &Client, namespace: &str, table: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT con.conname, pg_get_constraintdef(con.oid)
               FROM pg_catalog.pg_constraint con
               JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
               JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
              WHERE n.nspname = $1 AND c.relname = $2 AND con.contype = 'f'",
            &[&namespace, &table],
        )
        .await
        .map_err(|e| Error::Introspection(format!("foreign keys of {namespace}.{table}: {e}")))?;

    let mut errors = Vec::new();
    for row in rows {
        let conname: String = row.get(0);
        let condef: String = row.get(1);
        let Some((local_col, ref_table, ref_col)) = parse_simple_fk(&condef) else {
            continue;
        };
        let qualified = quote_qualified(namespace, table);
        let ref_qualified = quote_qualified(namespace, &ref_table);
        let probe = format!(
            "SELECT 1 FROM {qualified} t
              WHERE t.{local} IS NOT NULL
                AND NOT EXISTS (SELECT 1 FROM {ref_qualified} r WHERE r.{ref_col} = t.{local})
              LIMIT 1",
            local = quote_ident(&local_col),
            ref_col = quote_ident(&ref_col),
        );
        let orphan = client
            .query_opt(&probe, &[])
            .await
            .map_err(|e| Error::Introspection(format!("orphan probe for {conname}: {e}")))?;
        if orphan.is_some() {
            errors.push(format!(
                "foreign key {conname} has at least one orphaned row referencing {namespace}.{ref_table}"
            ));
        }
    }
    Ok(errors)
}

/// Extract `(local_column, referenced_table, referenced_column)` from a
/// single-column `FOREIGN KEY (col) REFERENCES table(col)` definition.
/// Composite foreign keys are skipped — the short-circuit probe only
/// covers the common single-column case.
fn parse_simple_fk(condef: &str) -> Option<(String, String, String)> {
    let fk_start = condef.find("FOREIGN KEY (")? + "FOREIGN KEY (".len();
    let fk_rest = &condef[fk_start..];
    let local_col_end = fk_rest.find(')')?;
    let local_col = fk_rest[..local_col_end].trim().to_string();
    if local_col.contains(',') {
        return None;
    }

    let refs_start = condef.find("REFERENCES ")? + "REFERENCES ".len();
    let refs_rest = &condef[refs_start..];
    let paren = refs_rest.find('(')?;
    let ref_table = refs_rest[..paren].trim().trim_matches('"').to_string();
    let ref_table = ref_table.rsplit('.').next().unwrap_or(&ref_table).to_string();
    let after_paren = &refs_rest[paren + 1..];
    let close = after_paren.find(')')?;
    let ref_col = after_paren[..close].trim().to_string();
    if ref_col.contains(',') {
        return None;
    }

    Some((local_col, ref_table, ref_col))
}

/// Restore `backup_<ts>` as `public`. Fails outright if `validate`
/// reports the backup invalid. `keep_tables` splices the pre-rollback
/// live contents back in for just those tables, evaluated against
/// `shadow` (the demoted former `public`) once it has been renamed
/// aside, not before the demotion has happened.
pub async fn rollback(pool: &Pool, timestamp_ms: i64, keep_tables: &[String]) -> Result<()> {
    let client = pool.get().await?;
    recover_from_failed_rollback(&client).await?;

    let validation = validate(&client, timestamp_ms).await?;
    if !validation.valid {
        return Err(Error::BackupValidation {
            timestamp: timestamp_ms,
            detail: validation.errors.join("; "),
        });
    }

    let backup_namespace = backup_namespace_name(timestamp_ms);
    let mut client = pool.get().await?;
    let txn = client.transaction().await?;
    txn.batch_execute("SET LOCAL session_replication_role = 'replica'")
        .await?;

    namespace::rename_namespace_in_recovery(&txn, "public", "shadow").await?;
    namespace::rename_namespace_in_recovery(&txn, &backup_namespace, "public").await?;

    for table in keep_tables {
        validate_ident(table)?;
        let both_present = table_exists(&txn, "shadow", table).await?
            && table_exists(&txn, "public", table).await?;
        if !both_present {
            continue;
        }
        let quoted = quote_ident(table);
        txn.batch_execute(&format!("DELETE FROM public.{quoted}"))
            .await?;
        txn.execute(
            &format!("INSERT INTO public.{quoted} SELECT * FROM shadow.{quoted}"),
            &[],
        )
        .await?;
    }

    txn.batch_execute("SET LOCAL session_replication_role = 'origin'")
        .await?;
    txn.commit().await?;

    namespace::drop_namespace(&client, "shadow", true).await?;
    Ok(())
}

async fn table_exists(txn: &deadpool_postgres::Transaction<'_>, namespace: &str, table: &str) -> Result<bool> {
    let row = txn
        .query_opt(
            "SELECT 1 FROM pg_catalog.pg_class c
               JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
              WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind = 'r'",
            &[&namespace, &table],
        )
        .await
        .map_err(Error::from)?;
    Ok(row.is_some())
}

/// If a prior `rollback` was interrupted after renaming `public ->
/// shadow` but before `backup_<ts> -> public` committed, `public` is
/// absent and `shadow` holds what used to be `public`. Self-heal by
/// dropping any partial `public` and renaming `shadow` back.
pub async fn recover_from_failed_rollback(client: &Client) -> Result<bool> {
    let public_exists = namespace::namespace_exists(client, "public").await?;
    let shadow_exists = namespace::shadow_exists(client).await?;
    if public_exists || !shadow_exists {
        return Ok(false);
    }
    namespace::rename_namespace(client, "shadow", "public").await?;
    Ok(true)
}

/// Validate first; on success, drop the backup namespace. The consumed
/// backup is absent afterward.
pub async fn cleanup_one(client: &Client, timestamp_ms: i64) -> Result<()> {
    let validation = validate(client, timestamp_ms).await?;
    if !validation.valid {
        return Err(Error::BackupValidation {
            timestamp: timestamp_ms,
            detail: validation.errors.join("; "),
        });
    }
    namespace::drop_namespace(client, &backup_namespace_name(timestamp_ms), true).await
}

/// Drop every `backup_<ts>` namespace strictly older than `before_ms`.
/// Applying this twice for the same cutoff is equivalent to applying it
/// once — the second call simply finds nothing left to drop.
pub async fn cleanup_before(client: &Client, before_ms: i64) -> Result<Vec<String>> {
    let backups = list(client).await?;
    let mut dropped = Vec::new();
    for backup in backups {
        if backup.timestamp_ms < before_ms {
            namespace::drop_namespace(client, &backup.namespace, true).await?;
            dropped.push(backup.namespace);
        }
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backup_namespace_timestamp() {
        assert_eq!(parse_backup_timestamp("backup_1700000000000"), Some(1700000000000));
    }

    #[test]
    fn rejects_non_backup_namespace() {
        assert_eq!(parse_backup_timestamp("public"), None);
    }

    #[test]
    fn builds_conventional_backup_name() {
        assert_eq!(backup_namespace_name(42), "backup_42");
    }

    #[test]
    fn pretty_size_scales_units() {
        assert_eq!(pretty_size(512), "512.0 B");
        assert_eq!(pretty_size(2048), "2.0 KB");
    }

    #[test]
    fn parses_simple_foreign_key_definition() {
        let def = "FOREIGN KEY (user_id) REFERENCES public.users(id)";
        assert_eq!(
            parse_simple_fk(def),
            Some(("user_id".to_string(), "users".to_string(), "id".to_string()))
        );
    }

    #[test]
    fn skips_composite_foreign_keys() {
        let def = "FOREIGN KEY (a, b) REFERENCES public.t(a, b)";
        assert_eq!(parse_simple_fk(def), None);
    }
}
