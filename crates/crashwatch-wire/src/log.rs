//! Structured interaction log.
//!
//! One JSON object per line. The log handle is cheap to clone; every clone
//! appends to the same file under a mutex, one whole line per write.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classify::ResponseStatus;

/// One statement round trip as recorded in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub timestamp: DateTime<Utc>,
    /// Who sent the statement (session label, probe, verifier).
    pub context: String,
    pub statement: String,
    pub success: bool,
    /// Present when a response arrived.
    pub status: Option<ResponseStatus>,
    /// Response text, or the error message when no response arrived.
    pub response: String,
    pub elapsed_ms: f64,
}

#[derive(Debug)]
struct LogSink {
    path: PathBuf,
    file: File,
}

/// Append-only JSON lines log shared by every client of a scenario.
#[derive(Debug, Clone, Default)]
pub struct InteractionLog {
    sink: Option<Arc<Mutex<LogSink>>>,
}

impl InteractionLog {
    /// Opens (or creates) the log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            sink: Some(Arc::new(Mutex::new(LogSink { path, file }))),
        })
    }

    /// A log that drops every record.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        let sink = self.sink.as_ref()?;
        let guard = sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Some(guard.path.clone())
    }

    /// Appends a record. Failures are reported through tracing and
    /// otherwise ignored.
    pub fn record(&self, record: &InteractionRecord) {
        let Some(sink) = &self.sink else {
            return;
        };

        let mut line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize interaction record");
                return;
            }
        };
        line.push('\n');

        let mut guard = sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = guard.file.write_all(line.as_bytes()) {
            warn!(path = %guard.path.display(), error = %e, "failed to append interaction record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(statement: &str, success: bool) -> InteractionRecord {
        InteractionRecord {
            timestamp: Utc::now(),
            context: "session-0".to_string(),
            statement: statement.to_string(),
            success,
            status: success.then_some(ResponseStatus::Ok),
            response: if success { "1".to_string() } else { "connection reset".to_string() },
            elapsed_ms: 1.5,
        }
    }

    #[test]
    fn test_records_are_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("interactions.jsonl");
        let log = InteractionLog::open(&path).unwrap();

        log.record(&record("SELECT 1;", true));
        log.clone().record(&record("SELECT 2;", false));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<InteractionRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].statement, "SELECT 1;");
        assert_eq!(lines[0].status, Some(ResponseStatus::Ok));
        assert!(!lines[1].success);
        assert_eq!(lines[1].status, None);
    }

    #[test]
    fn test_disabled_log_is_noop() {
        let log = InteractionLog::disabled();
        assert!(!log.is_enabled());
        assert!(log.path().is_none());
        log.record(&record("SELECT 1;", true));
    }

    #[test]
    fn test_open_appends_to_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("interactions.jsonl");

        InteractionLog::open(&path).unwrap().record(&record("a;", true));
        InteractionLog::open(&path).unwrap().record(&record("b;", true));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
