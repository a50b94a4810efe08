//! Local change log entry model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::worksite::{WorkType, Worksite, WorksiteId};

/// Version of the serialized `changeData` payload written by this build
pub const CHANGE_MODEL_VERSION: i32 = 1;

/// Archive marker of a change log entry.
///
/// Anything other than `Pending` means the entry is archived and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeArchiveAction {
    #[default]
    Pending,
    Synced,
    PartiallySynced,
}

impl ChangeArchiveAction {
    /// Literal stored in the `archive_action` column
    #[must_use]
    pub const fn literal(self) -> &'static str {
        match self {
            Self::Pending => "",
            Self::Synced => "synced",
            Self::PartiallySynced => "partially_synced",
        }
    }
}

impl fmt::Display for ChangeArchiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            other => write!(f, "{}", other.literal()),
        }
    }
}

impl FromStr for ChangeArchiveAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "partially_synced" => Ok(Self::PartiallySynced),
            other => Err(Error::InvalidInput(format!(
                "Unknown change archive action '{other}'"
            ))),
        }
    }
}

/// The serialized payload of a change: worksite state before and after an edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedWorksiteChange {
    /// State the edit started from; `None` for worksites created offline
    pub start: Option<Worksite>,
    pub change: Worksite,
    #[serde(default)]
    pub primary_work_type: Option<WorkType>,
}

impl SavedWorksiteChange {
    /// Whether the edit created the worksite
    #[must_use]
    pub const fn is_create(&self) -> bool {
        self.start.is_none()
    }
}

/// One entry of a worksite's local change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalChange {
    pub id: i64,
    pub app_version: i64,
    pub organization_id: i64,
    pub worksite_id: WorksiteId,
    /// Idempotency key for the upload
    pub sync_uuid: String,
    pub change_model_version: i32,
    pub change_data: String,
    pub created_at: i64,
    pub save_attempt: i32,
    pub save_attempt_at: i64,
    pub archive_action: ChangeArchiveAction,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl LocalChange {
    /// Fresh idempotency key for a new change
    #[must_use]
    pub fn new_sync_uuid() -> String {
        Uuid::now_v7().to_string()
    }

    /// Synced, partially synced, or otherwise superseded
    #[must_use]
    pub const fn is_archived(&self) -> bool {
        !matches!(self.archive_action, ChangeArchiveAction::Pending)
    }

    /// Fully accepted by the server
    #[must_use]
    pub const fn is_synced(&self) -> bool {
        matches!(self.archive_action, ChangeArchiveAction::Synced)
    }

    /// Failed more than `max_sync_tries` times and needs manual intervention
    #[must_use]
    pub const fn is_stalled(&self, max_sync_tries: i32) -> bool {
        !self.is_archived() && self.save_attempt > max_sync_tries
    }

    /// Decode the serialized worksite snapshots
    pub fn decode(&self) -> Result<SavedWorksiteChange> {
        if self.change_model_version > CHANGE_MODEL_VERSION {
            return Err(Error::InvalidInput(format!(
                "Change {} uses model version {} (supported up to {CHANGE_MODEL_VERSION})",
                self.id, self.change_model_version
            )));
        }
        Ok(serde_json::from_str(&self.change_data)?)
    }
}

/// Ids written by an append to the change log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedLocalChange {
    pub worksite_id: WorksiteId,
    pub change_id: i64,
}

/// A worksite holding changes that still have to reach the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWorksite {
    pub worksite_id: WorksiteId,
    pub network_id: i64,
    pub case_number: String,
    pub pending_changes: i64,
    pub oldest_change_at: i64,
    /// Unix ms of the most recent upload attempt, 0 when never attempted
    pub last_attempt_at: i64,
    /// Failed worksite sync passes since the last success
    pub sync_attempt: i32,
}
