//! Incident submission model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::GeoPoint;

/// A unique identifier for a local submission, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    /// Create a new unique submission ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubmissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim_start_matches("uuid:"))?))
    }
}

/// Where a submission stands relative to the remote form service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local changes not yet delivered
    #[default]
    Unsynced,
    /// Matches the remote copy
    Synced,
    /// A local edit beat a concurrent remote edit and still needs delivery
    Conflict,
    /// Last push attempt failed
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsynced => "unsynced",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// Whether the local copy carries changes the remote has not seen.
    pub const fn has_local_changes(self) -> bool {
        !matches!(self, Self::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unsynced" | "pending" => Ok(Self::Unsynced),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync status `{other}`")),
        }
    }
}

/// A wildlife incident report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Local identifier
    pub id: SubmissionId,
    /// Remote form uid
    pub form_id: String,
    /// Remote submission id (`_id`), immutable once assigned
    pub remote_id: Option<i64>,
    /// Remote instance uuid (`_uuid`)
    pub remote_uuid: Option<String>,
    /// Person or account that reported the incident
    pub submitted_by: Option<String>,
    /// Incident location
    pub location: Option<GeoPoint>,
    /// Form answers
    pub answers: Map<String, Value>,
    /// Sync state
    pub sync_status: SyncStatus,
    /// Number of failed push attempts
    pub sync_attempts: u32,
    /// Last push error, if any
    pub sync_error: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last local modification (Unix ms)
    pub updated_at: i64,
    /// Remote modification marker of the last applied remote version (Unix ms)
    pub remote_updated_at: Option<i64>,
    /// Last successful sync (Unix ms)
    pub last_synced_at: Option<i64>,
}

impl Submission {
    /// Create a new, unsynced local submission
    #[must_use]
    pub fn new(
        form_id: impl Into<String>,
        answers: Map<String, Value>,
        submitted_by: Option<String>,
        location: Option<GeoPoint>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: SubmissionId::new(),
            form_id: form_id.into(),
            remote_id: None,
            remote_uuid: None,
            submitted_by,
            location,
            answers,
            sync_status: SyncStatus::Unsynced,
            sync_attempts: 0,
            sync_error: None,
            created_at: now,
            updated_at: now,
            remote_updated_at: None,
            last_synced_at: None,
        }
    }

    /// Instance id sent to the remote service so a pulled copy can be linked back.
    #[must_use]
    pub fn instance_id(&self) -> String {
        format!("uuid:{}", self.id)
    }

    /// Whether this record has been edited locally since it last matched the remote copy.
    #[must_use]
    pub const fn has_local_edits(&self) -> bool {
        self.sync_status.has_local_changes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_id_parse_accepts_instance_prefix() {
        let id = SubmissionId::new();
        let parsed: SubmissionId = format!("uuid:{id}").parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn new_submission_starts_unsynced() {
        let submission = Submission::new("aXf3", Map::new(), None, None);
        assert_eq!(submission.sync_status, SyncStatus::Unsynced);
        assert!(submission.remote_id.is_none());
        assert_eq!(submission.created_at, submission.updated_at);
        assert!(submission.instance_id().starts_with("uuid:"));
    }

    #[test]
    fn sync_status_round_trips_through_text() {
        for status in [
            SyncStatus::Unsynced,
            SyncStatus::Synced,
            SyncStatus::Conflict,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert_eq!(
            "pending".parse::<SyncStatus>().unwrap(),
            SyncStatus::Unsynced
        );
        assert!("bogus".parse::<SyncStatus>().is_err());
    }
}
