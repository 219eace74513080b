// src/stats.rs

//! Statistics & Log Buffer.
//!
//! Accumulates phase timings, counts, warnings, and errors over the
//! course of a run, and provides the complete log buffer that the
//! external log writer (out of scope here) renders into the log file's
//! body. `status` reads the equivalent live state directly from the
//! database and never mutates it; `MigrationStats` itself is likewise
//! inert except for its own accumulation methods.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Wall-clock timings, counts, and the full log buffer for one engine
/// run. `end` is set only on completion (success or failure); a run
/// that panics before reaching that point leaves it `None`.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStats {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub tables_processed: usize,
    pub records_migrated: i64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub log: Vec<LogEntry>,
}

impl MigrationStats {
    pub fn new(start: DateTime<Utc>) -> Self {
        MigrationStats {
            start,
            end: None,
            tables_processed: 0,
            records_migrated: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message,
        });
    }

    pub fn log_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.warnings.push(message.clone());
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Warn,
            message,
        });
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.errors.push(message.clone());
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Error,
            message,
        });
    }

    pub fn finish(&mut self, end: DateTime<Utc>) {
        self.end = Some(end);
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_and_errors_accumulate_independently() {
        let mut stats = MigrationStats::new(Utc::now());
        stats.log_warning("sequence missing");
        stats.log_error("checksum mismatch");
        assert_eq!(stats.warnings.len(), 1);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.log.len(), 2);
        assert!(!stats.succeeded());
    }

    #[test]
    fn fresh_stats_have_succeeded_true() {
        let stats = MigrationStats::new(Utc::now());
        assert!(stats.succeeded());
    }
}
