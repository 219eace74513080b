// src/dump.rs

//! Dump Transport.
//!
//! Drives the native `pg_dump`/`pg_restore` utilities between two
//! endpoints, restricted to a single namespace. This is the engine's
//! only dependency on out-of-process tools; a rewrite may substitute a
//! direct wire-protocol implementation as long as it preserves the
//! archive's semantics: all rows, all indexes, all constraints,
//! triggers disabled during load.

use crate::config::Endpoint;
use crate::error::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// `min(8, available-cpu-count)`, the bound on `pg_restore --jobs`.
pub fn parallel_job_bound() -> usize {
    std::cmp::min(8, num_cpus::get())
}

/// Produce a binary archive (`pg_dump -Fc`) of one namespace's data and
/// schema from `endpoint`, writing it to `output_path`.
pub async fn dump(endpoint: &Endpoint, namespace: &str, output_path: &Path) -> Result<()> {
    crate::identifier::validate_ident(namespace)?;

    let mut cmd = Command::new("pg_dump");
    cmd.arg("--format=custom")
        .arg("--no-owner")
        .arg("--no-privileges")
        .arg(format!("--schema={namespace}"))
        .arg(format!("--host={}", endpoint.host))
        .arg(format!("--port={}", endpoint.port))
        .arg(format!("--username={}", endpoint.user))
        .arg(format!("--dbname={}", endpoint.database))
        .arg(format!("--file={}", output_path.display()))
        .env("PGPASSWORD", &endpoint.secret);

    let output = cmd
        .output()
        .await
        .map_err(|e| Error::Archive {
            message: format!("failed to spawn pg_dump: {e}"),
        })?;

    if !output.status.success() {
        return Err(Error::Archive {
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Restore `input_path` into the matching namespace inside `endpoint`,
/// using up to [`parallel_job_bound`] parallel worker processes.
/// Triggers are disabled during the load (`--disable-triggers`) so the
/// restore never interacts with a concurrently-installed sync trigger.
///
/// Standalone `INDEX` entries (every non-unique index, including
/// spatial/GIST ones, plus any unique index not backed by a constraint)
/// are excluded from this pass via a filtered `--use-list`: the
/// Sequence & Index Restorer creates those after the swap, against the
/// promoted `public` namespace, and would otherwise collide with the
/// copies this restore already built. Primary-key and constraint-backed
/// unique indexes are unaffected — Postgres dumps those as a single
/// `CONSTRAINT` entry, never a separate `INDEX` entry.
pub async fn restore(endpoint: &Endpoint, parallel_jobs: usize, input_path: &Path) -> Result<()> {
    let jobs = std::cmp::min(parallel_jobs, parallel_job_bound()).max(1);
    let use_list = toc_list_excluding_indexes(input_path).await?;

    let mut cmd = Command::new("pg_restore");
    cmd.arg(format!("--jobs={jobs}"))
        .arg("--no-owner")
        .arg("--no-privileges")
        .arg("--disable-triggers")
        .arg(format!("--use-list={}", use_list.path().display()))
        .arg(format!("--host={}", endpoint.host))
        .arg(format!("--port={}", endpoint.port))
        .arg(format!("--username={}", endpoint.user))
        .arg(format!("--dbname={}", endpoint.database))
        .arg(input_path)
        .env("PGPASSWORD", &endpoint.secret);

    let output = cmd
        .output()
        .await
        .map_err(|e| Error::Archive {
            message: format!("failed to spawn pg_restore: {e}"),
        })?;

    if !output.status.success() {
        return Err(Error::Archive {
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// List `input_path`'s table of contents and write a copy with every
/// standalone `INDEX` entry removed, suitable for `pg_restore
/// --use-list`. `--use-list` restores only the entries present in the
/// file, in order, so dropping a line defers just that one object;
/// everything else (tables, data, constraints, sequences, triggers)
/// restores exactly as it would without this filter.
async fn toc_list_excluding_indexes(archive_path: &Path) -> Result<tempfile::NamedTempFile> {
    let mut cmd = Command::new("pg_restore");
    cmd.arg("--list").arg(archive_path);
    let output = cmd.output().await.map_err(|e| Error::Archive {
        message: format!("failed to spawn pg_restore --list: {e}"),
    })?;
    if !output.status.success() {
        return Err(Error::Archive {
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let toc = String::from_utf8_lossy(&output.stdout);
    let filtered: String = toc
        .lines()
        .filter(|line| !is_standalone_index_entry(line))
        .collect::<Vec<_>>()
        .join("\n");

    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(filtered.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// A `pg_restore -l` line looks like `3375; 1259 16420 INDEX public
/// idx_users_email postgres` — object OID, catalog OID, type, then the
/// rest. Header/comment lines (blank, or starting with a bare `;`) are
/// never entries and are always kept.
fn is_standalone_index_entry(line: &str) -> bool {
    let Some((_, rest)) = line.split_once("; ") else {
        return false;
    };
    let mut fields = rest.split_whitespace();
    fields.next(); // dump ID
    fields.next(); // table OID
    fields.next() == Some("INDEX")
}

/// A scoped archive file: removed on drop so a failed or completed
/// dump never leaves a stray file behind.
pub struct ArchiveFile {
    path: PathBuf,
    _dir: tempfile::TempDir,
}

impl ArchiveFile {
    pub fn new(namespace: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(format!("{namespace}.dump"));
        Ok(ArchiveFile { path, _dir: dir })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_job_bound_is_never_above_eight() {
        assert!(parallel_job_bound() <= 8);
        assert!(parallel_job_bound() >= 1);
    }

    #[test]
    fn archive_file_lives_under_a_scoped_tempdir() {
        let archive = ArchiveFile::new("shadow").unwrap();
        assert!(archive.path().to_string_lossy().ends_with("shadow.dump"));
    }

    #[test]
    fn excludes_standalone_index_entries() {
        let line = "3375; 1259 16420 INDEX public idx_users_email postgres";
        assert!(is_standalone_index_entry(line));
    }

    #[test]
    fn keeps_constraint_entries() {
        let line = "3370; 2606 16410 CONSTRAINT public users_pkey postgres";
        assert!(!is_standalone_index_entry(line));
    }

    #[test]
    fn keeps_header_and_comment_lines() {
        assert!(!is_standalone_index_entry(";"));
        assert!(!is_standalone_index_entry("; Archive created at 2024-01-01 00:00:00"));
        assert!(!is_standalone_index_entry(""));
    }
}
