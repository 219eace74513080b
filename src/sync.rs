// src/sync.rs

//! Preserved-Table Sync.
//!
//! For each preserved table, installs a row-level trigger that mirrors
//! every live-namespace write into the staged namespace, keyed by the
//! assumed `id` primary key. A table without an `id` column cannot be
//! preserved — see the portability note in the module docs of
//! [`crate::engine`].

use crate::error::{Error, Result};
use crate::identifier::quote_ident;
use crate::pool::ReplicationRoleGuard;
use deadpool_postgres::Client;
use sha2::{Digest, Sha256};

/// One installed (or torn down) mirror. Carries the generated function
/// and trigger names so [`cleanup`] can drop both without recomputing
/// them, and an optional snapshot of the initial validation so the
/// engine can report it without re-querying.
#[derive(Debug, Clone)]
pub struct SyncTriggerRecord {
    pub table: String,
    pub function_name: String,
    pub trigger_name: String,
    pub active: bool,
    pub initial_checksum: Option<String>,
    pub initial_row_count: Option<i64>,
}

impl SyncTriggerRecord {
    fn names_for(table: &str) -> (String, String) {
        let function_name = format!("sync_{table}_to_shadow");
        let trigger_name = format!("{function_name}_trigger");
        (function_name, trigger_name)
    }
}

/// Reconstruct the trigger/function names [`setup`] would have
/// installed for `preserved_tables`, without touching the database.
/// Used by a `swap` invocation that runs in a separate process from the
/// `prepare` that actually installed them, so it can hand
/// [`cleanup`] the same names by naming convention alone.
pub fn existing_trigger_records(preserved_tables: &[String]) -> Vec<SyncTriggerRecord> {
    preserved_tables
        .iter()
        .map(|table| {
            let (function_name, trigger_name) = SyncTriggerRecord::names_for(table);
            SyncTriggerRecord {
                table: table.clone(),
                function_name,
                trigger_name,
                active: true,
                initial_checksum: None,
                initial_row_count: None,
            }
        })
        .collect()
}

/// Result of validating one mirror's consistency.
#[derive(Debug, Clone)]
pub struct MirrorValidation {
    pub table: String,
    pub source_row_count: i64,
    pub target_row_count: i64,
    pub source_checksum: String,
    pub target_checksum: String,
    pub errors: Vec<String>,
}

impl MirrorValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
            && self.source_row_count == self.target_row_count
            && self.source_checksum == self.target_checksum
    }
}

/// Install mirrors for every preserved table: assert existence in both
/// namespaces, truncate+copy the shadow side, install the trigger, and
/// validate before moving on to the next table. Trigger DDL and the
/// initial copy happen in one session without interleaving another
/// table's setup.
pub async fn setup(client: &Client, preserved_tables: &[String]) -> Result<Vec<SyncTriggerRecord>> {
    let mut installed = Vec::with_capacity(preserved_tables.len());
    for table in preserved_tables {
        let columns = assert_preserved_table(client, table).await?;
        copy_live_into_shadow(client, table).await?;
        let record = install_trigger(client, table, &columns).await?;
        let validation = validate(client, table).await?;
        if !validation.is_valid() {
            return Err(Error::SyncValidation {
                table: table.clone(),
                detail: format!(
                    "initial mirror mismatch: source_count={} target_count={} errors={:?}",
                    validation.source_row_count, validation.target_row_count, validation.errors
                ),
            });
        }
        installed.push(SyncTriggerRecord {
            initial_checksum: Some(validation.target_checksum),
            initial_row_count: Some(validation.target_row_count),
            ..record
        });
    }
    Ok(installed)
}

/// Confirm the table exists in both `public` and `shadow`, has an `id`
/// column, and return its ordered non-generated column names.
async fn assert_preserved_table(client: &Client, table: &str) -> Result<Vec<String>> {
    for namespace in ["public", "shadow"] {
        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_catalog.pg_class c
                   JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                  WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind = 'r'",
                &[&namespace, &table],
            )
            .await
            .map_err(|e| Error::PreservedTable(format!("checking {namespace}.{table}: {e}")))?;
        if exists.is_none() {
            return Err(Error::PreservedTable(format!(
                "preserved table '{table}' is missing from namespace '{namespace}'"
            )));
        }
    }

    let rows = client
        .query(
            "SELECT column_name FROM information_schema.columns
              WHERE table_schema = 'public' AND table_name = $1
              ORDER BY ordinal_position",
            &[&table],
        )
        .await
        .map_err(|e| Error::PreservedTable(format!("columns of {table}: {e}")))?;
    let columns: Vec<String> = rows.into_iter().map(|r| r.get(0)).collect();

    if !columns.iter().any(|c| c == "id") {
        return Err(Error::PreservedTable(format!(
            "preserved table '{table}' has no 'id' column; composite or \
             differently named primary keys are not supported"
        )));
    }

    Ok(columns)
}

/// Truncates and repopulates `shadow.<table>` from `public.<table>`.
/// Runs with the session's replication role disabled, since `shadow`
/// already carries the full staged dataset and this bulk rewrite must
/// not fire FK checks or triggers against it mid-copy.
async fn copy_live_into_shadow(client: &Client, table: &str) -> Result<()> {
    let guard = ReplicationRoleGuard::disable_on(client).await?;
    let quoted = quote_ident(table);
    client
        .batch_execute(&format!("TRUNCATE TABLE shadow.{quoted}"))
        .await
        .map_err(|e| Error::PreservedTable(format!("truncating shadow.{table}: {e}")))?;
    client
        .execute(
            &format!("INSERT INTO shadow.{quoted} SELECT * FROM public.{quoted}"),
            &[],
        )
        .await
        .map_err(|e| Error::PreservedTable(format!("copying public.{table} into shadow: {e}")))?;
    guard.restore().await?;
    Ok(())
}

/// Regenerate the trigger function for the table's exact column list at
/// setup time. Schema drift mid-migration is not supported: a column
/// added to `public.<table>` after setup will not be mirrored until the
/// next run regenerates the function.
async fn install_trigger(client: &Client, table: &str, columns: &[String]) -> Result<SyncTriggerRecord> {
    let (function_name, trigger_name) = SyncTriggerRecord::names_for(table);
    let quoted_table = quote_ident(table);
    let quoted_fn = quote_ident(&function_name);
    let quoted_trigger = quote_ident(&trigger_name);

    let set_clause = columns
        .iter()
        .map(|c| format!("{} = NEW.{}", quote_ident(c), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let value_list = columns
        .iter()
        .map(|c| format!("NEW.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    let body = format!(
        "CREATE OR REPLACE FUNCTION public.{quoted_fn}() RETURNS trigger AS $sync$
         BEGIN
           IF TG_OP = 'DELETE' THEN
             DELETE FROM shadow.{quoted_table} WHERE id = OLD.id;
             RETURN OLD;
           ELSIF TG_OP = 'UPDATE' THEN
             UPDATE shadow.{quoted_table} SET {set_clause} WHERE id = NEW.id;
             RETURN NEW;
           ELSE
             INSERT INTO shadow.{quoted_table} ({column_list}) VALUES ({value_list});
             RETURN NEW;
           END IF;
         END;
         $sync$ LANGUAGE plpgsql;

         DROP TRIGGER IF EXISTS {quoted_trigger} ON public.{quoted_table};
         CREATE TRIGGER {quoted_trigger}
           AFTER INSERT OR UPDATE OR DELETE ON public.{quoted_table}
           FOR EACH ROW EXECUTE FUNCTION public.{quoted_fn}();"
    );

    client
        .batch_execute(&body)
        .await
        .map_err(|e| Error::PreservedTable(format!("installing trigger for {table}: {e}")))?;

    Ok(SyncTriggerRecord {
        table: table.to_string(),
        function_name,
        trigger_name,
        active: true,
        initial_checksum: None,
        initial_row_count: None,
    })
}

/// Drop every trigger and function named in `triggers`, in any order,
/// best-effort: a single failure is logged as a warning, not a hard
/// error, so the rest of the cleanup still runs.
pub async fn cleanup(client: &Client, triggers: &[SyncTriggerRecord], warnings: &mut Vec<String>) {
    for record in triggers {
        let quoted_table = quote_ident(&record.table);
        let quoted_trigger = quote_ident(&record.trigger_name);
        let quoted_fn = quote_ident(&record.function_name);
        if let Err(e) = client
            .batch_execute(&format!(
                "DROP TRIGGER IF EXISTS {quoted_trigger} ON public.{quoted_table}"
            ))
            .await
        {
            warnings.push(format!("dropping trigger {}: {e}", record.trigger_name));
        }
        if let Err(e) = client
            .batch_execute(&format!("DROP FUNCTION IF EXISTS public.{quoted_fn}()"))
            .await
        {
            warnings.push(format!("dropping function {}: {e}", record.function_name));
        }
    }
}

/// Compare `public.<table>` and `shadow.<table>`: row counts and a
/// primary-key-ordered row-hash checksum. Used by [`setup`]'s
/// immediately-after-install check, while both namespaces carry their
/// conventional meaning.
pub async fn validate(client: &Client, table: &str) -> Result<MirrorValidation> {
    validate_against(client, table, "public", "shadow").await
}

/// Compare `table` across two arbitrary namespaces: row counts and a
/// primary-key-ordered row-hash checksum. The post-swap check in P4
/// uses this directly, comparing the newly promoted `public` against
/// the just-demoted backup namespace, since by that point `shadow` has
/// already been recreated empty.
pub async fn validate_against(
    client: &Client,
    table: &str,
    source_namespace: &str,
    target_namespace: &str,
) -> Result<MirrorValidation> {
    let mut errors = Vec::new();
    let source_row_count = count_rows(client, source_namespace, table).await?;
    let target_row_count = count_rows(client, target_namespace, table).await?;
    if source_row_count != target_row_count {
        errors.push(format!(
            "row count mismatch: {source_namespace}={source_row_count} {target_namespace}={target_row_count}"
        ));
    }

    let source_checksum = table_checksum(client, source_namespace, table).await?;
    let target_checksum = table_checksum(client, target_namespace, table).await?;
    if source_checksum != target_checksum {
        errors.push("row-hash checksum mismatch".to_string());
    }

    Ok(MirrorValidation {
        table: table.to_string(),
        source_row_count,
        target_row_count,
        source_checksum,
        target_checksum,
        errors,
    })
}

async fn count_rows(client: &Client, namespace: &str, table: &str) -> Result<i64> {
    let quoted = crate::identifier::quote_qualified(namespace, table);
    let row = client
        .query_one(&format!("SELECT count(*) FROM {quoted}"), &[])
        .await
        .map_err(|e| Error::SyncValidation {
            table: table.to_string(),
            detail: format!("counting rows in {namespace}.{table}: {e}"),
        })?;
    Ok(row.get(0))
}

/// The message digest of the concatenation of per-row message digests,
/// in primary-key order. Each row's digest is computed over its full
/// text image (`row_to_json`), so any column difference changes the
/// table checksum.
pub async fn table_checksum(client: &Client, namespace: &str, table: &str) -> Result<String> {
    let quoted = crate::identifier::quote_qualified(namespace, table);
    let rows = client
        .query(
            &format!("SELECT row_to_json(t)::text FROM {quoted} t ORDER BY t.id"),
            &[],
        )
        .await
        .map_err(|e| Error::SyncValidation {
            table: table.to_string(),
            detail: format!("hashing rows of {namespace}.{table}: {e}"),
        })?;

    let mut combined = Sha256::new();
    for row in rows {
        let text: String = row.get(0);
        let mut row_hasher = Sha256::new();
        row_hasher.update(text.as_bytes());
        combined.update(row_hasher.finalize());
    }
    Ok(format!("{:x}", combined.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_for_derive_conventional_names() {
        let (function_name, trigger_name) = SyncTriggerRecord::names_for("orders");
        assert_eq!(function_name, "sync_orders_to_shadow");
        assert_eq!(trigger_name, "sync_orders_to_shadow_trigger");
    }

    #[test]
    fn reconstructed_records_match_setup_naming() {
        let records = existing_trigger_records(&["orders".to_string()]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].function_name, "sync_orders_to_shadow");
        assert_eq!(records[0].trigger_name, "sync_orders_to_shadow_trigger");
        assert!(records[0].active);
    }

    #[test]
    fn validation_requires_both_counts_and_checksums() {
        let v = MirrorValidation {
            table: "orders".into(),
            source_row_count: 3,
            target_row_count: 3,
            source_checksum: "abc".into(),
            target_checksum: "abc".into(),
            errors: vec![],
        };
        assert!(v.is_valid());

        let mismatched = MirrorValidation {
            target_row_count: 2,
            ..v
        };
        assert!(!mismatched.is_valid());
    }
}
