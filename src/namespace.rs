// src/namespace.rs

//! Namespace Manager.
//!
//! Creates, renames, and drops namespaces atomically, and performs the
//! triple rename used by the atomic swap. Renames are metadata-only and
//! atomic with respect to concurrent readers: a reader session that
//! began before a rename keeps seeing the old name until it ends.

use crate::error::{Error, Result};
use crate::identifier::{quote_ident, validate_ident};
use deadpool_postgres::{Client, Transaction};

/// Idempotent: dropping a namespace that does not exist succeeds.
pub async fn drop_namespace(client: &Client, name: &str, cascade: bool) -> Result<()> {
    validate_ident(name)?;
    let mode = if cascade { "CASCADE" } else { "RESTRICT" };
    client
        .batch_execute(&format!(
            "DROP SCHEMA IF EXISTS {} {mode}",
            quote_ident(name)
        ))
        .await
        .map_err(|e| Error::NamespaceConflict(format!("dropping namespace {name}: {e}")))?;
    Ok(())
}

/// Fails if the namespace already exists.
pub async fn create_namespace(client: &Client, name: &str) -> Result<()> {
    validate_ident(name)?;
    client
        .batch_execute(&format!("CREATE SCHEMA {}", quote_ident(name)))
        .await
        .map_err(|e| Error::NamespaceConflict(format!("creating namespace {name}: {e}")))?;
    Ok(())
}

/// Fails if `from` is absent or `to` already exists.
pub async fn rename_namespace(client: &Client, from: &str, to: &str) -> Result<()> {
    validate_ident(from)?;
    validate_ident(to)?;
    if !namespace_exists(client, from).await? {
        return Err(Error::NamespaceConflict(format!(
            "rename source namespace '{from}' does not exist"
        )));
    }
    if namespace_exists(client, to).await? {
        return Err(Error::NamespaceConflict(format!(
            "rename target namespace '{to}' already exists"
        )));
    }
    client
        .batch_execute(&format!(
            "ALTER SCHEMA {} RENAME TO {}",
            quote_ident(from),
            quote_ident(to)
        ))
        .await
        .map_err(|e| Error::NamespaceConflict(format!("renaming {from} to {to}: {e}")))?;
    Ok(())
}

pub async fn namespace_exists(client: &Client, name: &str) -> Result<bool> {
    let row = client
        .query_opt(
            "SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1",
            &[&name],
        )
        .await
        .map_err(|e| Error::Introspection(format!("checking namespace {name}: {e}")))?;
    Ok(row.is_some())
}

/// The atomic swap primitive: inside a single serializable transaction,
/// rename `a -> c`, then `b -> a`. The destination promotion and the
/// outgoing demotion both land, or neither does. Caller is responsible
/// for committing the transaction and creating the fresh empty `b`
/// afterward.
pub async fn swap_triple(txn: &Transaction<'_>, a: &str, b: &str, c: &str) -> Result<()> {
    validate_ident(a)?;
    validate_ident(b)?;
    validate_ident(c)?;

    txn.batch_execute("SET LOCAL lock_timeout = '10s'")
        .await
        .map_err(Error::from)?;

    rename_schema_in_txn(txn, a, c).await?;
    rename_schema_in_txn(txn, b, a).await?;
    Ok(())
}

/// Rename a namespace inside an already-open transaction, used by
/// global recovery where the rename must share the recovery
/// transaction's atomicity rather than run as its own statement.
pub async fn rename_namespace_in_recovery(txn: &Transaction<'_>, from: &str, to: &str) -> Result<()> {
    validate_ident(from)?;
    validate_ident(to)?;
    rename_schema_in_txn(txn, from, to).await
}

async fn rename_schema_in_txn(txn: &Transaction<'_>, from: &str, to: &str) -> Result<()> {
    txn.batch_execute(&format!(
        "ALTER SCHEMA {} RENAME TO {}",
        quote_ident(from),
        quote_ident(to)
    ))
    .await
    .map_err(|e| Error::NamespaceConflict(format!("renaming {from} to {to}: {e}")))?;
    Ok(())
}

/// `true` if `shadow` already exists; the swap primitive must drop it
/// before P1 starts a fresh staging run.
pub async fn shadow_exists(client: &Client) -> Result<bool> {
    namespace_exists(client, "shadow").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_identifiers_before_any_query() {
        // These must fail validation synchronously, without needing a
        // live connection, since the identifier is checked first.
        assert!(validate_ident("").is_err());
        assert!(validate_ident(&"x".repeat(64)).is_err());
    }

    #[test]
    fn quoting_is_applied_to_schema_names() {
        assert_eq!(quote_ident("backup_1700000000000"), "\"backup_1700000000000\"");
    }
}
