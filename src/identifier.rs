// src/identifier.rs

//! Identifier validation and quoting.
//!
//! Table, column, and namespace names come from introspection or from
//! caller-supplied lists (`--preserved-tables`); they are never safe to
//! interpolate into SQL as-is. Every identifier that reaches a dynamically
//! built statement passes through [`quote_ident`], and anything that did
//! not come from introspection is checked with [`validate_ident`] first.

use crate::error::{Error, Result};

/// Quote a single identifier per Postgres quoting rules: wrap in double
/// quotes, doubling any embedded double quote. This makes mixed-case and
/// reserved-word identifiers safe to use in dynamic DDL/DML, closing the
/// unquoted-identifier gap called out for the generated trigger function.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a namespace-qualified identifier: `"schema"."table"`.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Reject identifiers that cannot be catalog names: empty, containing a
/// NUL byte, or longer than Postgres's 63-byte `NAMEDATALEN` limit. This
/// is a whitelist-adjacent sanity check, not a substitute for quoting —
/// callers must still quote the identifier before using it in SQL.
pub fn validate_ident(ident: &str) -> Result<()> {
    if ident.is_empty() {
        return Err(Error::Config("identifier must not be empty".into()));
    }
    if ident.len() > 63 {
        return Err(Error::Config(format!(
            "identifier '{ident}' exceeds 63 bytes"
        )));
    }
    if ident.contains('\0') {
        return Err(Error::Config(format!(
            "identifier '{ident}' contains a NUL byte"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_identifier() {
        assert_eq!(quote_ident("users"), "\"users\"");
    }

    #[test]
    fn doubles_embedded_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn quotes_qualified_name() {
        assert_eq!(quote_qualified("shadow", "Users"), "\"shadow\".\"Users\"");
    }

    #[test]
    fn rejects_empty_identifier() {
        assert!(validate_ident("").is_err());
    }

    #[test]
    fn rejects_overlong_identifier() {
        let long = "a".repeat(64);
        assert!(validate_ident(&long).is_err());
    }

    #[test]
    fn accepts_normal_identifier() {
        assert!(validate_ident("backup_1700000000000").is_ok());
    }
}
