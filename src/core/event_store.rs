//! Append-only event store with file-based persistence.
//!
//! Each workflow gets a directory holding its event log (`events.jsonl`) and
//! its latest snapshot (`snapshot.json`). Events are newline-delimited JSON
//! for simplicity and easy debugging/inspection. Once a snapshot is written
//! the events it covers are compacted out of the log.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{WorkflowEvent, WorkflowState};

use super::saga::SagaError;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted checkpoint of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub workflow_id: Uuid,

    /// Sequence of the last event folded into `state`
    pub last_sequence: u64,
    pub created_at: DateTime<Utc>,

    /// SHA-256 over the serialized state
    pub checksum: String,
    pub state: WorkflowState,
}

/// On-disk form of a [`Snapshot`]. The state stays as the exact bytes the
/// checksum was taken over, so verifying never depends on re-serializing.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    workflow_id: Uuid,
    last_sequence: u64,
    created_at: DateTime<Utc>,
    checksum: String,
    state: Box<RawValue>,
}

/// File-based event store for one workflow
pub struct EventStore {
    workflow_id: Uuid,

    /// Directory containing the workflow
    workflow_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    snapshot_path: PathBuf,
}

impl EventStore {
    /// Create or open the event store for a workflow under `base_dir`
    pub async fn open(base_dir: &Path, workflow_id: Uuid) -> Result<Self> {
        let workflow_dir = base_dir.join(workflow_id.to_string());

        fs::create_dir_all(&workflow_dir)
            .await
            .with_context(|| format!("Failed to create workflow directory: {}", workflow_dir.display()))?;

        Ok(Self {
            workflow_id,
            events_path: workflow_dir.join("events.jsonl"),
            snapshot_path: workflow_dir.join("snapshot.json"),
            workflow_dir,
        })
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the workflow directory
    pub fn workflow_dir(&self) -> &Path {
        &self.workflow_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &WorkflowEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<WorkflowEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: WorkflowEvent =
                serde_json::from_str(&line).with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Events with a sequence number greater than `sequence`
    pub async fn replay_after(&self, sequence: u64) -> Result<Vec<WorkflowEvent>> {
        let events = self.replay().await?;
        Ok(events.into_iter().filter(|e| e.sequence > sequence).collect())
    }

    /// Highest sequence number recorded for the workflow (0 when empty).
    ///
    /// Compaction can leave the log empty; the snapshot still counts.
    pub async fn last_sequence(&self) -> Result<u64> {
        let events = self.replay().await?;
        let logged = events.iter().map(|e| e.sequence).max().unwrap_or(0);
        let snapshotted = self.load_snapshot().await?.map_or(0, |s| s.last_sequence);
        Ok(logged.max(snapshotted))
    }

    /// Write a snapshot atomically (temp file, then rename), then drop the
    /// events it covers from the log
    pub async fn save_snapshot(&self, state: &WorkflowState, last_sequence: u64) -> Result<()> {
        let state_json = serde_json::to_string(state).context("Failed to serialize workflow state")?;
        let snapshot = SnapshotFile {
            version: SNAPSHOT_VERSION,
            workflow_id: self.workflow_id,
            last_sequence,
            created_at: Utc::now(),
            checksum: checksum(state_json.as_bytes()),
            state: RawValue::from_string(state_json).context("Failed to embed workflow state")?,
        };

        let json = serde_json::to_vec_pretty(&snapshot).context("Failed to serialize snapshot")?;
        let tmp_path = self.snapshot_path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write snapshot: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.snapshot_path)
            .await
            .with_context(|| format!("Failed to move snapshot into place: {}", self.snapshot_path.display()))?;

        self.compact(last_sequence).await
    }

    /// Rewrite the log without events at or below `sequence`.
    ///
    /// Runs after the snapshot is in place; a crash in between only leaves
    /// events that [`replay_after`](Self::replay_after) skips anyway.
    pub async fn compact(&self, sequence: u64) -> Result<()> {
        let events = self.replay().await?;
        let total = events.len();
        let kept: Vec<&WorkflowEvent> = events.iter().filter(|e| e.sequence > sequence).collect();
        if kept.len() == total {
            return Ok(());
        }

        let mut content = String::new();
        for event in &kept {
            content.push_str(&serde_json::to_string(event).context("Failed to serialize event")?);
            content.push('\n');
        }

        let tmp_path = self.events_path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, content)
            .await
            .with_context(|| format!("Failed to write compacted log: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.events_path)
            .await
            .with_context(|| format!("Failed to move compacted log into place: {}", self.events_path.display()))?;

        debug!(dropped = total - kept.len(), kept = kept.len(), "Event log compacted");
        Ok(())
    }

    /// Load the latest snapshot, verifying its checksum.
    ///
    /// A snapshot that fails to parse or verify is reported as
    /// [`SagaError::SnapshotCorruption`].
    pub async fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }

        let content = fs::read(&self.snapshot_path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", self.snapshot_path.display()))?;

        let corrupt = |reason: String| SagaError::SnapshotCorruption {
            workflow_id: self.workflow_id,
            reason,
        };

        let file: SnapshotFile = serde_json::from_slice(&content).map_err(|e| corrupt(e.to_string()))?;
        if file.version != SNAPSHOT_VERSION {
            return Err(corrupt(format!("unsupported snapshot version {}", file.version)).into());
        }
        if checksum(file.state.get().as_bytes()) != file.checksum {
            return Err(corrupt("checksum mismatch".to_string()).into());
        }

        let state: WorkflowState = serde_json::from_str(file.state.get()).map_err(|e| corrupt(e.to_string()))?;
        if file.workflow_id != self.workflow_id || state.workflow_id != self.workflow_id {
            return Err(corrupt("snapshot belongs to another workflow".to_string()).into());
        }

        Ok(Some(Snapshot {
            version: file.version,
            workflow_id: file.workflow_id,
            last_sequence: file.last_sequence,
            created_at: file.created_at,
            checksum: file.checksum,
            state,
        }))
    }

    /// List all workflow IDs in the base directory
    pub async fn list_workflows(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut workflows = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        workflows.push(uuid);
                    }
                }
            }
        }

        workflows.sort();
        Ok(workflows)
    }
}

/// Hex SHA-256 of a byte string
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
