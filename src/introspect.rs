// src/introspect.rs

//! Schema Introspector.
//!
//! Reads catalog metadata — tables, columns, constraints, indexes,
//! sequences — for one namespace. Descriptors are captured once and are
//! immutable afterward; textual constraint and index definitions are
//! taken verbatim from the engine's own catalog functions
//! (`pg_get_constraintdef`, `pg_get_indexdef`) so they are byte-identical
//! on recreation.

use crate::error::{Error, Result};
use deadpool_postgres::Client;

/// Tables belonging to the target engine's spatial extension or to this
/// tool's own point-in-time bookkeeping are never introspected as
/// ordinary base tables.
const EXCLUDED_TABLE_NAMES: &[&str] = &[
    "spatial_ref_sys",
    "geometry_columns",
    "geography_columns",
    "raster_columns",
    "raster_overviews",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub max_length: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
    Check,
    NotNull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintDescriptor {
    pub name: String,
    pub kind: ConstraintKind,
    /// Textual definition sufficient to recreate the constraint, as
    /// returned by `pg_get_constraintdef`.
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    /// Full `CREATE INDEX ...` statement as returned by `pg_get_indexdef`.
    pub definition: String,
    pub unique: bool,
    pub access_method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceDescriptor {
    pub sequence_name: String,
    pub owning_column: String,
    pub last_value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub constraints: Vec<ConstraintDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    pub sequences: Vec<SequenceDescriptor>,
}

impl TableDescriptor {
    pub fn qualified_name(&self) -> String {
        crate::identifier::quote_qualified(&self.namespace, &self.name)
    }
}

/// Read every base table in `namespace`, excluding system and spatial
/// tables. Connection errors are fatal; a malformed sequence default on
/// one column degrades to a warning pushed onto `warnings` rather than
/// failing the whole namespace.
pub async fn introspect_schema(
    client: &Client,
    namespace: &str,
    warnings: &mut Vec<String>,
) -> Result<Vec<TableDescriptor>> {
    let table_names = list_base_tables(client, namespace).await?;
    let mut tables = Vec::with_capacity(table_names.len());
    for name in table_names {
        let columns = fetch_columns(client, namespace, &name).await?;
        let mut constraints = fetch_constraints(client, namespace, &name).await?;
        for col in &columns {
            if !col.nullable {
                constraints.push(ConstraintDescriptor {
                    name: format!("{name}_{}_not_null", col.name),
                    kind: ConstraintKind::NotNull,
                    definition: format!("{} SET NOT NULL", crate::identifier::quote_ident(&col.name)),
                });
            }
        }
        let indexes = fetch_indexes(client, namespace, &name).await?;
        let sequences = fetch_sequences(client, namespace, &name, &columns, warnings).await?;
        tables.push(TableDescriptor {
            namespace: namespace.to_string(),
            name,
            columns,
            constraints,
            indexes,
            sequences,
        });
    }
    Ok(tables)
}

async fn list_base_tables(client: &Client, namespace: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT c.relname
               FROM pg_catalog.pg_class c
               JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
              WHERE n.nspname = $1
                AND c.relkind = 'r'
              ORDER BY c.relname",
            &[&namespace],
        )
        .await
        .map_err(|e| Error::Introspection(format!("listing tables in {namespace}: {e}")))?;

    Ok(rows
        .into_iter()
        .map(|r| r.get::<_, String>(0))
        .filter(|name| !EXCLUDED_TABLE_NAMES.contains(&name.as_str()))
        .filter(|name| !name.contains("_backup_"))
        .collect())
}

async fn fetch_columns(client: &Client, namespace: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
    let rows = client
        .query(
            "SELECT column_name, data_type, is_nullable, column_default, character_maximum_length
               FROM information_schema.columns
              WHERE table_schema = $1 AND table_name = $2
              ORDER BY ordinal_position",
            &[&namespace, &table],
        )
        .await
        .map_err(|e| Error::Introspection(format!("columns of {namespace}.{table}: {e}")))?;

    Ok(rows
        .into_iter()
        .map(|r| ColumnDescriptor {
            name: r.get(0),
            data_type: r.get(1),
            nullable: r.get::<_, String>(2) == "YES",
            default: r.get(3),
            max_length: r.get(4),
        })
        .collect())
}

async fn fetch_constraints(
    client: &Client,
    namespace: &str,
    table: &str,
) -> Result<Vec<ConstraintDescriptor>> {
    let rows = client
        .query(
            "SELECT con.conname, con.contype, pg_get_constraintdef(con.oid)
               FROM pg_catalog.pg_constraint con
               JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
               JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
              WHERE n.nspname = $1 AND c.relname = $2
              ORDER BY con.conname",
            &[&namespace, &table],
        )
        .await
        .map_err(|e| Error::Introspection(format!("constraints of {namespace}.{table}: {e}")))?;

    Ok(rows
        .into_iter()
        .filter_map(|r| {
            let kind = match r.get::<_, i8>(1) as u8 as char {
                'p' => ConstraintKind::PrimaryKey,
                'u' => ConstraintKind::Unique,
                'f' => ConstraintKind::ForeignKey,
                'c' => ConstraintKind::Check,
                _ => return None,
            };
            Some(ConstraintDescriptor {
                name: r.get(0),
                kind,
                definition: r.get(2),
            })
        })
        .collect())
}

async fn fetch_indexes(client: &Client, namespace: &str, table: &str) -> Result<Vec<IndexDescriptor>> {
    let rows = client
        .query(
            "SELECT ic.relname, pg_get_indexdef(i.indexrelid), i.indisunique, am.amname
               FROM pg_catalog.pg_index i
               JOIN pg_catalog.pg_class ic ON ic.oid = i.indexrelid
               JOIN pg_catalog.pg_class tc ON tc.oid = i.indrelid
               JOIN pg_catalog.pg_namespace n ON n.oid = tc.relnamespace
               JOIN pg_catalog.pg_am am ON am.oid = ic.relam
              WHERE n.nspname = $1 AND tc.relname = $2
                AND NOT i.indisprimary
              ORDER BY ic.relname",
            &[&namespace, &table],
        )
        .await
        .map_err(|e| Error::Introspection(format!("indexes of {namespace}.{table}: {e}")))?;

    Ok(rows
        .into_iter()
        .map(|r| IndexDescriptor {
            name: r.get(0),
            definition: r.get(1),
            unique: r.get(2),
            access_method: r.get(3),
        })
        .collect())
}

async fn fetch_sequences(
    client: &Client,
    namespace: &str,
    table: &str,
    columns: &[ColumnDescriptor],
    warnings: &mut Vec<String>,
) -> Result<Vec<SequenceDescriptor>> {
    let mut sequences = Vec::new();
    for col in columns {
        let Some(default) = &col.default else { continue };
        if !default.contains("nextval(") {
            continue;
        }
        let Some(seq_name) = parse_nextval_target(default) else {
            warnings.push(format!(
                "{namespace}.{table}.{}: malformed sequence default expression '{default}'",
                col.name
            ));
            continue;
        };
        match fetch_sequence_last_value(client, namespace, &seq_name).await {
            Ok(last_value) => sequences.push(SequenceDescriptor {
                sequence_name: seq_name,
                owning_column: col.name.clone(),
                last_value,
            }),
            Err(e) => warnings.push(format!(
                "{namespace}.{table}.{}: sequence '{seq_name}' unreadable: {e}",
                col.name
            )),
        }
    }
    Ok(sequences)
}

/// Extract the sequence name from a `nextval('schema.seq_name'::regclass)`
/// (or unqualified `nextval('seq_name'::regclass)`) default expression.
fn parse_nextval_target(default: &str) -> Option<String> {
    let start = default.find("nextval('")? + "nextval('".len();
    let rest = &default[start..];
    let end = rest.find('\'')?;
    let full = &rest[..end];
    Some(full.rsplit('.').next().unwrap_or(full).to_string())
}

async fn fetch_sequence_last_value(client: &Client, namespace: &str, seq_name: &str) -> Result<i64> {
    let row = client
        .query_opt(
            "SELECT last_value FROM pg_sequences WHERE schemaname = $1 AND sequencename = $2",
            &[&namespace, &seq_name],
        )
        .await
        .map_err(|e| Error::Introspection(format!("reading sequence {seq_name}: {e}")))?;

    match row {
        Some(r) => Ok(r.get::<_, Option<i64>>(0).unwrap_or(0)),
        None => Err(Error::Introspection(format!(
            "sequence {namespace}.{seq_name} not found"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_nextval_target() {
        let d = "nextval('public.users_id_seq'::regclass)";
        assert_eq!(parse_nextval_target(d).as_deref(), Some("users_id_seq"));
    }

    #[test]
    fn parses_unqualified_nextval_target() {
        let d = "nextval('users_id_seq'::regclass)";
        assert_eq!(parse_nextval_target(d).as_deref(), Some("users_id_seq"));
    }

    #[test]
    fn rejects_non_nextval_default() {
        assert_eq!(parse_nextval_target("'active'::text"), None);
    }

    #[test]
    fn excludes_spatial_tables() {
        assert!(EXCLUDED_TABLE_NAMES.contains(&"spatial_ref_sys"));
    }
}
