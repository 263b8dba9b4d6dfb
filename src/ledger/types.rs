use std::path::PathBuf;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::enum_display_fromstr;
use crate::error::DropmarkError;

/// Processing state of one logical item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

enum_display_fromstr!(
    LedgerStatus,
    DropmarkError::invalid_status,
    {
        Pending => "pending",
        InProgress => "in_progress",
        Done => "done",
        Failed => "failed",
    }
);

impl LedgerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LedgerStatus::Done | LedgerStatus::Failed)
    }

    pub const ALL: [LedgerStatus; 4] = [
        LedgerStatus::Pending,
        LedgerStatus::InProgress,
        LedgerStatus::Done,
        LedgerStatus::Failed,
    ];
}

/// The process holding a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub pid: u32,
    pub instance_id: String,
}

impl Owner {
    pub fn new(pid: u32, instance_id: impl Into<String>) -> Self {
        Self {
            pid,
            instance_id: instance_id.into(),
        }
    }

    /// Identity of this process with a fresh instance id.
    pub fn current() -> Self {
        Self::new(std::process::id(), uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} ({})", self.pid, self.instance_id)
    }
}

/// One durable record per logical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub logical_key: String,
    pub status: LedgerStatus,
    pub source_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl LedgerEntry {
    pub(crate) fn reserved(key: &str, source: PathBuf, owner: Owner, now: Timestamp) -> Self {
        Self {
            logical_key: key.to_string(),
            status: LedgerStatus::InProgress,
            source_path: source,
            output_path: None,
            attempts: 1,
            last_error: None,
            owner: Some(owner),
            heartbeat_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Owner pid, when one is recorded.
    pub fn owner_pid(&self) -> Option<u32> {
        self.owner.as_ref().map(|owner| owner.pid)
    }
}

/// Result of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The caller now holds the key. `reclaimed` is set when a dead owner's
    /// reservation was taken over.
    Admitted { entry: LedgerEntry, reclaimed: bool },
    AlreadyDone(LedgerEntry),
    AlreadyInProgress(LedgerEntry),
    PreviouslyFailed(LedgerEntry),
}

impl Admission {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Admission::Admitted { entry, .. }
            | Admission::AlreadyDone(entry)
            | Admission::AlreadyInProgress(entry)
            | Admission::PreviouslyFailed(entry) => entry,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}
