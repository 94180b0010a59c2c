//! Sync conflict model

use serde::{Deserialize, Serialize};

/// Which side of a conflict was kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Remote,
    Local,
}

impl ConflictWinner {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("local") {
            Self::Local
        } else {
            Self::Remote
        }
    }
}

/// Recorded sync conflict resolved by strategy (e.g., LWW)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Local submission involved in the conflict
    pub submission_id: String,
    /// Form the submission belongs to
    pub form_id: String,
    /// Remote submission id
    pub remote_id: i64,
    /// Local edit timestamp when the conflict occurred
    pub local_updated_at: i64,
    /// Incoming remote timestamp
    pub remote_updated_at: i64,
    /// Side that was kept
    pub winner: ConflictWinner,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
}
