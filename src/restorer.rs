// src/restorer.rs

//! Sequence & Index Restorer.
//!
//! Runs after the atomic swap: resets every auto-incrementing column's
//! sequence to `max(column) + 1`, and rebuilds the non-unique indexes
//! captured by the Introspector (unique and primary-key indexes already
//! exist from the dump). Per-object failures are warnings, never fatal
//! — the migration is considered successful once the swap has
//! committed.

use crate::identifier::{quote_ident, quote_qualified};
use crate::introspect::TableDescriptor;
use deadpool_postgres::Client;

/// For each auto-incrementing column in `tables`, set its sequence's
/// current value to `max(column) + 1` on the now-live `public` table.
/// A missing or unreadable sequence is recorded as a warning, not an
/// error — the swap has already committed and the run is not rolled
/// back over this.
pub async fn reset_sequences(client: &Client, tables: &[TableDescriptor], warnings: &mut Vec<String>) {
    for table in tables {
        for seq in &table.sequences {
            let qualified_table = quote_qualified("public", &table.name);
            let column = quote_ident(&seq.owning_column);
            let max_query = format!("SELECT COALESCE(MAX({column}), 0) FROM {qualified_table}");
            let max_value: i64 = match client.query_one(&max_query, &[]).await {
                Ok(row) => row.get(0),
                Err(e) => {
                    warnings.push(format!(
                        "reading max({}) on public.{}: {e}",
                        seq.owning_column, table.name
                    ));
                    continue;
                }
            };

            let seq_ident = quote_qualified("public", &seq.sequence_name);
            let setval = format!("SELECT setval('{}', {})", seq_ident.replace('\'', "''"), max_value + 1);
            if let Err(e) = client.execute(&setval, &[]).await {
                warnings.push(format!(
                    "setting sequence public.{} to {}: {e}",
                    seq.sequence_name,
                    max_value + 1
                ));
            }
        }
    }
}

/// Recreate every non-unique, non-primary-key index on `tables`, using
/// the textual definition captured at introspection time with the
/// source namespace prefix rewritten to `public`. Spatial indexes
/// (access method `gist`) are logged explicitly so operators can spot
/// them in the run's output.
pub async fn rebuild_indexes(
    client: &Client,
    tables: &[TableDescriptor],
    source_namespace: &str,
    warnings: &mut Vec<String>,
    info: &mut Vec<String>,
) {
    for table in tables {
        for index in &table.indexes {
            if index.unique {
                continue;
            }
            let rewritten = rewrite_namespace_prefix(&index.definition, source_namespace, "public");
            if index.access_method.eq_ignore_ascii_case("gist") {
                info.push(format!(
                    "rebuilding spatial index {} on public.{} (access method gist)",
                    index.name, table.name
                ));
            }
            if let Err(e) = client.batch_execute(&rewritten).await {
                warnings.push(format!("rebuilding index {}: {e}", index.name));
            }
        }
    }
}

/// Rewrite a captured `CREATE INDEX ... ON <namespace>.<table> ...`
/// statement's namespace qualifier. Definitions are captured verbatim
/// from `pg_get_indexdef`, which always qualifies the target table, so
/// a plain token replace on the `ON "<from>".` / `ON <from>.` prefix is
/// sufficient and does not touch column or expression text elsewhere in
/// the statement.
fn rewrite_namespace_prefix(definition: &str, from: &str, to: &str) -> String {
    let quoted_from_prefixes = [
        format!("ON {}.", quote_ident(from)),
        format!("ON {from}."),
    ];
    for prefix in quoted_from_prefixes {
        if let Some(pos) = definition.find(&prefix) {
            let mut rewritten = definition.to_string();
            rewritten.replace_range(pos..pos + prefix.len(), &format!("ON {}.", quote_ident(to)));
            return rewritten;
        }
    }
    definition.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_quoted_namespace_prefix() {
        let def = "CREATE INDEX idx_users_email ON \"shadow\".users USING btree (email)";
        let rewritten = rewrite_namespace_prefix(def, "shadow", "public");
        assert_eq!(
            rewritten,
            "CREATE INDEX idx_users_email ON \"public\".users USING btree (email)"
        );
    }

    #[test]
    fn rewrites_unquoted_namespace_prefix() {
        let def = "CREATE INDEX idx_users_email ON shadow.users USING btree (email)";
        let rewritten = rewrite_namespace_prefix(def, "shadow", "public");
        assert!(rewritten.starts_with("CREATE INDEX idx_users_email ON \"public\"."));
    }

    #[test]
    fn leaves_unmatched_definitions_untouched() {
        let def = "CREATE INDEX idx ON other.t USING btree (x)";
        let rewritten = rewrite_namespace_prefix(def, "shadow", "public");
        assert_eq!(rewritten, def);
    }
}
