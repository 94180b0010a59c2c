//! Per-form sync watermark and run log models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Remote timestamp a pull is filtered and ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPhase {
    /// New submissions, by `_submission_time`
    Submitted,
    /// Submissions edited on the remote, by `_last_edited`
    Edited,
}

impl PullPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Edited => "edited",
        }
    }
}

/// Per-form watermarks of the remote records already applied.
///
/// Each [`PullPhase`] keeps its own `(timestamp, remote_id)` position; a
/// record at or before the position for its phase has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub form_id: String,
    /// Remote submission time of the last applied new record (Unix ms)
    pub last_submission_time: i64,
    /// Remote id of the last applied new record
    pub last_remote_id: i64,
    /// Remote edit time of the last applied edit (Unix ms)
    pub last_edited_at: i64,
    /// Remote id of the last applied edit
    pub last_edited_remote_id: i64,
    /// When the cursor last advanced (Unix ms)
    pub updated_at: i64,
}

impl SyncCursor {
    /// Cursor that has seen nothing yet
    pub fn start(form_id: impl Into<String>) -> Self {
        Self {
            form_id: form_id.into(),
            last_submission_time: 0,
            last_remote_id: 0,
            last_edited_at: 0,
            last_edited_remote_id: 0,
            updated_at: 0,
        }
    }

    /// `(timestamp, remote_id)` watermark for a phase
    pub const fn position(&self, phase: PullPhase) -> (i64, i64) {
        match phase {
            PullPhase::Submitted => (self.last_submission_time, self.last_remote_id),
            PullPhase::Edited => (self.last_edited_at, self.last_edited_remote_id),
        }
    }

    /// Whether a remote record sorts strictly after the phase's watermark,
    /// i.e. it has not been applied yet.
    pub const fn is_behind(&self, phase: PullPhase, timestamp: i64, remote_id: i64) -> bool {
        let (last_time, last_id) = self.position(phase);
        timestamp > last_time || (timestamp == last_time && remote_id > last_id)
    }
}

/// Final state of a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some pushes failed but the pull completed
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "success" => Self::Success,
            "partial" => Self::Partial,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Counters for one reconciliation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub fetched: u32,
    pub inserted: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub conflicts: u32,
    pub pushed: u32,
    pub push_failed: u32,
    /// Remote records dropped because they could not be read
    pub skipped: u32,
}

/// Logged reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub form_id: String,
    pub status: RunStatus,
    pub counts: SyncCounts,
    pub error: Option<String>,
    pub started_at: i64,
    pub completed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_orders_by_time_then_id() {
        let cursor = SyncCursor {
            last_submission_time: 1_000,
            last_remote_id: 7,
            ..SyncCursor::start("f")
        };
        assert!(!cursor.is_behind(PullPhase::Submitted, 999, 100));
        assert!(!cursor.is_behind(PullPhase::Submitted, 1_000, 7));
        assert!(cursor.is_behind(PullPhase::Submitted, 1_000, 8));
        assert!(cursor.is_behind(PullPhase::Submitted, 1_001, 1));
    }

    #[test]
    fn phases_keep_separate_watermarks() {
        let cursor = SyncCursor {
            last_submission_time: 5_000,
            last_remote_id: 3,
            last_edited_at: 2_000,
            last_edited_remote_id: 1,
            ..SyncCursor::start("f")
        };
        // An old record edited after the edit watermark is still pending
        assert!(!cursor.is_behind(PullPhase::Submitted, 1_000, 1));
        assert!(cursor.is_behind(PullPhase::Edited, 3_000, 1));
        assert!(!cursor.is_behind(PullPhase::Edited, 2_000, 1));
        assert_eq!(cursor.position(PullPhase::Edited), (2_000, 1));
    }

    #[test]
    fn fresh_cursor_accepts_everything() {
        let cursor = SyncCursor::start("f");
        assert!(cursor.is_behind(PullPhase::Submitted, 1, 1));
        assert!(cursor.is_behind(PullPhase::Edited, 1, 1));
    }
}
