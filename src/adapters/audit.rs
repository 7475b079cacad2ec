//! Append-only audit records.
//!
//! Audit writes are best effort: a sink must never fail the operation that
//! produced the record. When the JSONL file cannot be written the record is
//! printed to stderr instead.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audit line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub status: String,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            status: status.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Destination for audit records. Implementations must not panic or block on failure.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// JSONL file sink with stderr fallback
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                eprintln!("audit: failed to serialize record for {}: {}", record.action, e);
                return;
            }
        };

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.try_append(&line) {
            eprintln!("audit: {} unavailable ({}); record: {}", self.path.display(), e, line);
        }
    }
}

/// Keeps records in memory; handy for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_sink_appends() {
        let temp = TempDir::new().unwrap();
        let sink = JsonlAuditSink::new(temp.path().join("audit").join("audit.jsonl"));

        sink.record(AuditRecord::new("op1", "approve", "task/1", "ok"));
        sink.record(AuditRecord::new("op2", "deny", "task/2", "ok"));

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<AuditRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].actor, "op2");
    }

    #[test]
    fn test_unwritable_sink_does_not_panic() {
        let temp = TempDir::new().unwrap();
        // A directory where the file should be makes every append fail
        let path = temp.path().join("audit.jsonl");
        std::fs::create_dir_all(&path).unwrap();

        let sink = JsonlAuditSink::new(&path);
        sink.record(AuditRecord::new("op1", "approve", "task/1", "ok"));
    }
}
