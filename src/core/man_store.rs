//! SQLite-backed store for MAN (manual approval needed) tasks.
//!
//! Tasks are never deleted. Every status change is applied in a transaction
//! that also appends a row to `man_task_transitions`, so the table doubles as
//! the approval audit trail.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::domain::{ActionIntent, ManDecision, ManTask, ManTaskStatus, RiskTriageResult};

use super::clock::{Clock, SystemClock};

#[derive(Debug, Error)]
pub enum ManStoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite statement failed: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("MAN task not found: {0}")]
    NotFound(Uuid),

    #[error("invalid MAN task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: ManTaskStatus,
        to: ManTaskStatus,
    },

    #[error("corrupt MAN task row {task_id}: {reason}")]
    Corrupt { task_id: String, reason: String },
}

/// One row of the transition history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManTransition {
    pub from: Option<ManTaskStatus>,
    pub to: ManTaskStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct ManTaskStore {
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
}

const TASK_COLUMNS: &str =
    "task_id, workflow_id, step_id, intent, triage, status, created_at, expires_at, decision";

impl ManTaskStore {
    /// Open (creating if needed) the store and its schema
    pub fn open(db_path: &Path) -> Result<Self, ManStoreError> {
        Self::open_with_clock(db_path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(db_path: &Path, clock: Arc<dyn Clock>) -> Result<Self, ManStoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ManStoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
            clock,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, ManStoreError> {
        let connection = Connection::open(&self.db_path).map_err(|source| ManStoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Ok(connection)
    }

    fn ensure_schema(&self) -> Result<(), ManStoreError> {
        self.connect()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS man_tasks (
                task_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                intent TEXT NOT NULL,
                triage TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                decision TEXT,
                updated_at INTEGER NOT NULL,
                UNIQUE (workflow_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS man_task_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                from_status TEXT,
                to_status TEXT NOT NULL,
                actor TEXT NOT NULL,
                reason TEXT,
                at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_man_tasks_status_expiry
                ON man_tasks(status, expires_at);
            CREATE INDEX IF NOT EXISTS idx_man_task_transitions_task
                ON man_task_transitions(task_id, id);
            ",
        )?;
        Ok(())
    }

    /// Create a PENDING task for a step.
    ///
    /// Idempotent per (workflow_id, step_id): a retried call returns the task
    /// created by the first one.
    pub fn create(
        &self,
        intent: &ActionIntent,
        triage: &RiskTriageResult,
        expires_at: DateTime<Utc>,
    ) -> Result<ManTask, ManStoreError> {
        let now = self.clock.now();
        let task_id = Uuid::new_v4();
        let mut connection = self.connect()?;
        let tx = connection.transaction()?;

        let inserted = tx.execute(
            "
            INSERT INTO man_tasks (
                task_id, workflow_id, step_id, intent, triage, status,
                created_at, expires_at, decision, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?7)
            ON CONFLICT(workflow_id, step_id) DO NOTHING
            ",
            params![
                task_id.to_string(),
                intent.workflow_id.to_string(),
                intent.step_id,
                serde_json::to_string(intent)?,
                serde_json::to_string(triage)?,
                ManTaskStatus::Pending.as_str(),
                now.timestamp_millis(),
                expires_at.timestamp_millis(),
            ],
        )?;

        if inserted == 1 {
            tx.execute(
                "INSERT INTO man_task_transitions (task_id, from_status, to_status, actor, reason, at)
                 VALUES (?1, NULL, ?2, 'system', ?3, ?4)",
                params![
                    task_id.to_string(),
                    ManTaskStatus::Pending.as_str(),
                    triage.reason,
                    now.timestamp_millis()
                ],
            )?;
        }

        let task = tx
            .query_row(
                &format!("SELECT {} FROM man_tasks WHERE workflow_id = ?1 AND step_id = ?2", TASK_COLUMNS),
                params![intent.workflow_id.to_string(), intent.step_id],
                RawTask::from_row,
            )?
            .into_task()?;
        tx.commit()?;

        if inserted == 1 {
            info!(task_id = %task.task_id, step = %task.step_id, lane = %triage.lane, "MAN task created");
        }
        Ok(task)
    }

    pub fn get(&self, task_id: Uuid) -> Result<ManTask, ManStoreError> {
        self.find(task_id)?.ok_or(ManStoreError::NotFound(task_id))
    }

    pub fn find(&self, task_id: Uuid) -> Result<Option<ManTask>, ManStoreError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!("SELECT {} FROM man_tasks WHERE task_id = ?1", TASK_COLUMNS),
                params![task_id.to_string()],
                RawTask::from_row,
            )
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    /// Task for a workflow step, if one was ever created
    pub fn find_for_step(&self, workflow_id: Uuid, step_id: &str) -> Result<Option<ManTask>, ManStoreError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!("SELECT {} FROM man_tasks WHERE workflow_id = ?1 AND step_id = ?2", TASK_COLUMNS),
                params![workflow_id.to_string(), step_id],
                RawTask::from_row,
            )
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    /// Open tasks (PENDING or ESCALATED), oldest first
    pub fn list_pending(&self) -> Result<Vec<ManTask>, ManStoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {} FROM man_tasks WHERE status IN ('PENDING', 'ESCALATED') ORDER BY created_at, task_id",
            TASK_COLUMNS
        ))?;
        let rows = statement.query_map([], RawTask::from_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn approve(&self, task_id: Uuid, approver: &str) -> Result<ManTask, ManStoreError> {
        self.transition(task_id, ManTaskStatus::Approved, approver, None)
    }

    pub fn deny(&self, task_id: Uuid, denier: &str, reason: &str) -> Result<ManTask, ManStoreError> {
        self.transition(task_id, ManTaskStatus::Denied, denier, Some(reason))
    }

    pub fn escalate(&self, task_id: Uuid, actor: &str) -> Result<ManTask, ManStoreError> {
        self.transition(task_id, ManTaskStatus::Escalated, actor, None)
    }

    pub fn expire(&self, task_id: Uuid) -> Result<ManTask, ManStoreError> {
        self.transition(task_id, ManTaskStatus::Expired, "system", Some("approval window elapsed"))
    }

    /// Close an open task whose step no longer needs a decision
    pub fn withdraw(&self, task_id: Uuid, reason: &str) -> Result<ManTask, ManStoreError> {
        self.transition(task_id, ManTaskStatus::Expired, "system", Some(reason))
    }

    /// Expire every open task whose window has elapsed
    pub fn expire_overdue(&self) -> Result<Vec<ManTask>, ManStoreError> {
        self.expire_overdue_at(self.clock.now())
    }

    /// Expire every open task with `expires_at <= now`
    pub fn expire_overdue_at(&self, now: DateTime<Utc>) -> Result<Vec<ManTask>, ManStoreError> {
        let overdue: Vec<Uuid> = {
            let connection = self.connect()?;
            let mut statement = connection.prepare(
                "SELECT task_id FROM man_tasks
                 WHERE status IN ('PENDING', 'ESCALATED') AND expires_at <= ?1
                 ORDER BY expires_at, task_id",
            )?;
            let rows = statement.query_map(params![now.timestamp_millis()], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                let raw = row?;
                ids.push(Uuid::parse_str(&raw).map_err(|e| ManStoreError::Corrupt {
                    task_id: raw.clone(),
                    reason: e.to_string(),
                })?);
            }
            ids
        };

        let mut expired = Vec::new();
        for task_id in overdue {
            match self.expire(task_id) {
                Ok(task) => expired.push(task),
                // Decided concurrently; nothing to expire
                Err(ManStoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Full transition history of a task, oldest first
    pub fn history(&self, task_id: Uuid) -> Result<Vec<ManTransition>, ManStoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT from_status, to_status, actor, reason, at
             FROM man_task_transitions WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = statement.query_map(params![task_id.to_string()], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (from, to, actor, reason, at) = row?;
            history.push(ManTransition {
                from: from.map(|f| parse_status(&task_id.to_string(), &f)).transpose()?,
                to: parse_status(&task_id.to_string(), &to)?,
                actor,
                reason,
                at: from_millis(&task_id.to_string(), at)?,
            });
        }
        Ok(history)
    }

    fn transition(
        &self,
        task_id: Uuid,
        to: ManTaskStatus,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ManTask, ManStoreError> {
        let now = self.clock.now();
        let mut connection = self.connect()?;
        let tx = connection.transaction()?;

        let mut task = tx
            .query_row(
                &format!("SELECT {} FROM man_tasks WHERE task_id = ?1", TASK_COLUMNS),
                params![task_id.to_string()],
                RawTask::from_row,
            )
            .optional()?
            .ok_or(ManStoreError::NotFound(task_id))?
            .into_task()?;

        if !task.status.can_transition_to(to) {
            return Err(ManStoreError::InvalidTransition {
                task_id,
                from: task.status,
                to,
            });
        }

        let from = task.status;
        task.status = to;
        if to != ManTaskStatus::Escalated {
            task.decision = Some(ManDecision {
                actor: actor.to_string(),
                reason: reason.map(str::to_string),
                decided_at: now,
            });
        }

        let decision = task.decision.as_ref().map(serde_json::to_string).transpose()?;
        tx.execute(
            "UPDATE man_tasks SET status = ?2, decision = ?3, updated_at = ?4 WHERE task_id = ?1",
            params![task_id.to_string(), to.as_str(), decision, now.timestamp_millis()],
        )?;
        tx.execute(
            "INSERT INTO man_task_transitions (task_id, from_status, to_status, actor, reason, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id.to_string(),
                from.as_str(),
                to.as_str(),
                actor,
                reason,
                now.timestamp_millis()
            ],
        )?;
        tx.commit()?;

        info!(%task_id, %from, %to, actor, "MAN task transitioned");
        Ok(task)
    }
}

/// Row as stored, before JSON and enum decoding
struct RawTask {
    task_id: String,
    workflow_id: String,
    step_id: String,
    intent: String,
    triage: String,
    status: String,
    created_at: i64,
    expires_at: i64,
    decision: Option<String>,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            workflow_id: row.get(1)?,
            step_id: row.get(2)?,
            intent: row.get(3)?,
            triage: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            expires_at: row.get(7)?,
            decision: row.get(8)?,
        })
    }

    fn into_task(self) -> Result<ManTask, ManStoreError> {
        let corrupt = |reason: String| ManStoreError::Corrupt {
            task_id: self.task_id.clone(),
            reason,
        };

        let intent: ActionIntent = serde_json::from_str(&self.intent)?;
        let triage: RiskTriageResult = serde_json::from_str(&self.triage)?;
        let decision: Option<ManDecision> = self.decision.as_deref().map(serde_json::from_str).transpose()?;

        Ok(ManTask {
            task_id: Uuid::parse_str(&self.task_id).map_err(|e| corrupt(e.to_string()))?,
            workflow_id: Uuid::parse_str(&self.workflow_id).map_err(|e| corrupt(e.to_string()))?,
            step_id: self.step_id.clone(),
            intent,
            triage,
            status: parse_status(&self.task_id, &self.status)?,
            created_at: from_millis(&self.task_id, self.created_at)?,
            expires_at: from_millis(&self.task_id, self.expires_at)?,
            decision,
        })
    }
}

fn parse_status(task_id: &str, value: &str) -> Result<ManTaskStatus, ManStoreError> {
    value.parse().map_err(|reason| ManStoreError::Corrupt {
        task_id: task_id.to_string(),
        reason,
    })
}

fn from_millis(task_id: &str, millis: i64) -> Result<DateTime<Utc>, ManStoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ManStoreError::Corrupt {
            task_id: task_id.to_string(),
            reason: format!("invalid timestamp {}", millis),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::domain::RiskLane;
    use chrono::Duration;
    use tempfile::TempDir;

    fn triage() -> RiskTriageResult {
        RiskTriageResult {
            lane: RiskLane::Red,
            reason: "sensitive_tool".to_string(),
            risk_factors: vec!["tool:delete_record".to_string()],
            requires_approval: true,
            suggested_timeout_hours: 4,
        }
    }

    fn store() -> (ManTaskStore, Arc<ManualClock>, TempDir) {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = ManTaskStore::open_with_clock(&temp.path().join("db").join("man.db"), clock.clone()).unwrap();
        (store, clock, temp)
    }

    fn intent(workflow_id: Uuid, step: &str) -> ActionIntent {
        ActionIntent::new("delete_record", Default::default(), workflow_id, step)
    }

    #[test]
    fn test_create_is_idempotent_per_step() {
        let (store, clock, _temp) = store();
        let workflow_id = Uuid::new_v4();
        let expires = clock.now() + Duration::hours(4);

        let first = store.create(&intent(workflow_id, "s1"), &triage(), expires).unwrap();
        let again = store.create(&intent(workflow_id, "s1"), &triage(), expires).unwrap();
        let other = store.create(&intent(workflow_id, "s2"), &triage(), expires).unwrap();

        assert_eq!(first.task_id, again.task_id);
        assert_ne!(first.task_id, other.task_id);
        assert_eq!(first.status, ManTaskStatus::Pending);
        assert_eq!(store.list_pending().unwrap().len(), 2);
        assert_eq!(store.history(first.task_id).unwrap().len(), 1);
    }

    #[test]
    fn test_deny_records_decision_and_history() {
        let (store, clock, _temp) = store();
        let task = store
            .create(&intent(Uuid::new_v4(), "s1"), &triage(), clock.now() + Duration::hours(1))
            .unwrap();

        let denied = store.deny(task.task_id, "op1", "too risky").unwrap();
        assert_eq!(denied.status, ManTaskStatus::Denied);
        let decision = denied.decision.unwrap();
        assert_eq!(decision.actor, "op1");
        assert_eq!(decision.reason.as_deref(), Some("too risky"));

        let history = store.history(task.task_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from, Some(ManTaskStatus::Pending));
        assert_eq!(history[1].to, ManTaskStatus::Denied);

        assert_eq!(store.get(task.task_id).unwrap().status, ManTaskStatus::Denied);
    }

    #[test]
    fn test_decided_task_rejects_second_decision() {
        let (store, clock, _temp) = store();
        let task = store
            .create(&intent(Uuid::new_v4(), "s1"), &triage(), clock.now() + Duration::hours(1))
            .unwrap();
        store.approve(task.task_id, "op1").unwrap();

        let result = store.deny(task.task_id, "op2", "late");
        assert!(matches!(result, Err(ManStoreError::InvalidTransition { .. })));
    }

    #[test]
    fn test_escalated_task_can_still_be_approved() {
        let (store, clock, _temp) = store();
        let task = store
            .create(&intent(Uuid::new_v4(), "s1"), &triage(), clock.now() + Duration::hours(1))
            .unwrap();

        let escalated = store.escalate(task.task_id, "oncall").unwrap();
        assert_eq!(escalated.status, ManTaskStatus::Escalated);
        assert!(escalated.decision.is_none());

        let approved = store.approve(task.task_id, "manager").unwrap();
        assert_eq!(approved.status, ManTaskStatus::Approved);
    }

    #[test]
    fn test_expire_overdue() {
        let (store, clock, _temp) = store();
        let workflow_id = Uuid::new_v4();
        let short = store
            .create(&intent(workflow_id, "short"), &triage(), clock.now() + Duration::hours(1))
            .unwrap();
        let long = store
            .create(&intent(workflow_id, "long"), &triage(), clock.now() + Duration::hours(24))
            .unwrap();

        clock.advance(Duration::hours(2));
        let expired = store.expire_overdue().unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id, short.task_id);
        assert_eq!(expired[0].status, ManTaskStatus::Expired);
        assert_eq!(store.get(long.task_id).unwrap().status, ManTaskStatus::Pending);
    }

    #[test]
    fn test_withdrawn_task_is_closed_with_reason() {
        let (store, clock, _temp) = store();
        let task = store
            .create(&intent(Uuid::new_v4(), "s1"), &triage(), clock.now() + Duration::hours(1))
            .unwrap();

        let withdrawn = store.withdraw(task.task_id, "step cancelled").unwrap();
        assert_eq!(withdrawn.status, ManTaskStatus::Expired);
        let decision = withdrawn.decision.unwrap();
        assert_eq!(decision.actor, "system");
        assert_eq!(decision.reason.as_deref(), Some("step cancelled"));
        assert!(store.list_pending().unwrap().is_empty());

        assert!(matches!(
            store.approve(task.task_id, "op1"),
            Err(ManStoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.withdraw(task.task_id, "again"),
            Err(ManStoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unknown_task() {
        let (store, _, _temp) = store();
        assert!(matches!(store.approve(Uuid::new_v4(), "op"), Err(ManStoreError::NotFound(_))));
    }
}
