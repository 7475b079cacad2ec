//! Manual-approval-needed (MAN) tickets.
//!
//! A MAN task is created when a step needs a human decision. It is never
//! deleted, only moved between states; the store keeps every transition.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::intent::{ActionIntent, RiskTriageResult};

/// A pending or decided approval ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManTask {
    /// Unique ticket id
    pub task_id: Uuid,

    /// Workflow waiting on this ticket
    pub workflow_id: Uuid,

    /// Step waiting on this ticket
    pub step_id: String,

    /// What the step wants to do
    pub intent: ActionIntent,

    /// Why it needs approval
    pub triage: RiskTriageResult,

    /// Current lifecycle state
    pub status: ManTaskStatus,

    pub created_at: DateTime<Utc>,

    /// After this instant the ticket may be expired
    pub expires_at: DateTime<Utc>,

    /// Human decision, once one was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ManDecision>,
}

impl ManTask {
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// A recorded human (or timer) decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManDecision {
    /// Who decided ("system" for expiry)
    pub actor: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub decided_at: DateTime<Utc>,
}

/// Lifecycle of a MAN task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManTaskStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Escalated,
}

impl ManTaskStatus {
    /// Still waiting for a decision
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Escalated)
    }

    /// Whether moving from `self` to `to` is a legal transition
    pub fn can_transition_to(&self, to: ManTaskStatus) -> bool {
        match self {
            Self::Pending => to != Self::Pending,
            Self::Escalated => matches!(to, Self::Approved | Self::Denied | Self::Expired),
            Self::Approved | Self::Denied | Self::Expired => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
            Self::Expired => "EXPIRED",
            Self::Escalated => "ESCALATED",
        }
    }
}

impl fmt::Display for ManTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManTaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "DENIED" => Ok(Self::Denied),
            "EXPIRED" => Ok(Self::Expired),
            "ESCALATED" => Ok(Self::Escalated),
            other => Err(format!("unknown MAN task status `{}`", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_from_pending() {
        let pending = ManTaskStatus::Pending;
        assert!(pending.can_transition_to(ManTaskStatus::Approved));
        assert!(pending.can_transition_to(ManTaskStatus::Escalated));
        assert!(!pending.can_transition_to(ManTaskStatus::Pending));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for status in [ManTaskStatus::Approved, ManTaskStatus::Denied, ManTaskStatus::Expired] {
            assert!(!status.is_open());
            assert!(!status.can_transition_to(ManTaskStatus::Approved));
            assert!(!status.can_transition_to(ManTaskStatus::Pending));
        }
    }

    #[test]
    fn test_escalated_cannot_go_back_to_pending() {
        assert!(ManTaskStatus::Escalated.is_open());
        assert!(!ManTaskStatus::Escalated.can_transition_to(ManTaskStatus::Pending));
        assert!(ManTaskStatus::Escalated.can_transition_to(ManTaskStatus::Denied));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        let parsed: ManTaskStatus = ManTaskStatus::Escalated.as_str().parse().unwrap();
        assert_eq!(parsed, ManTaskStatus::Escalated);
        assert!("BOGUS".parse::<ManTaskStatus>().is_err());
    }
}
