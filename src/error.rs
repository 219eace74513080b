// src/error.rs

use thiserror::Error;

/// The engine's error taxonomy.
///
/// Every failure the migration and rollback engines can produce is a
/// distinct variant rather than an opaque string, so callers (the CLI,
/// tests, the statistics buffer) can match on what actually went wrong.
#[derive(Error, Debug)]
pub enum Error {
    /// A connection pool could not reach an endpoint.
    #[error("connection error: {0}")]
    Connection(String),

    /// A catalog query failed or returned an unexpected shape.
    #[error("introspection error: {0}")]
    Introspection(String),

    /// The dump or restore subprocess exited non-zero.
    #[error("archive error: {message}")]
    Archive { message: String },

    /// A namespace rename target already exists, or its source is absent.
    #[error("namespace conflict: {0}")]
    NamespaceConflict(String),

    /// A preserved table is missing in one of the namespaces, or lacks
    /// the assumed `id` primary key.
    #[error("preserved table error: {0}")]
    PreservedTable(String),

    /// A mirror's row count or row-hash checksum did not match.
    #[error("sync validation error: table {table}: {detail}")]
    SyncValidation { table: String, detail: String },

    /// A rollback target failed one of its precondition checks.
    #[error("backup validation error: backup_{timestamp}: {detail}")]
    BackupValidation { timestamp: i64, detail: String },

    /// Global recovery itself failed; operator intervention is required,
    /// the run cannot be retried safely.
    #[error("recovery error: {0}")]
    Recovery(String),

    /// Malformed CLI invocation, database URL, or `--before` timestamp.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        Error::Connection(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Error::Connection(e.to_string())
    }
}

impl From<deadpool_postgres::BuildError> for Error {
    fn from(e: deadpool_postgres::BuildError) -> Self {
        Error::Connection(e.to_string())
    }
}

/// Result type alias using the engine's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
