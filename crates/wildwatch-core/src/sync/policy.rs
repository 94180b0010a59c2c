//! Last-write-wins resolution between a stored submission and its remote copy.

use crate::models::{ConflictWinner, Submission};

/// Strategy name recorded in the conflict log
pub const LWW_STRATEGY: &str = "lww";

/// What to do with an incoming remote version of a known submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Replace the local copy with the remote one
    ApplyRemote,
    /// Nothing new on the remote side
    Unchanged,
    /// Both sides changed; the side named here is kept
    Conflict(ConflictWinner),
}

/// Decide how a remote version stamped `remote_updated_at` meets `local`.
///
/// The remote copy counts as changed when it is newer than the last remote
/// version applied locally. A conflict needs a change on both sides; the
/// remote wins only when strictly newer than the local edit.
pub fn resolve(local: &Submission, remote_updated_at: i64) -> Resolution {
    let remote_changed = local
        .remote_updated_at
        .is_none_or(|seen| remote_updated_at > seen);

    if !remote_changed {
        return Resolution::Unchanged;
    }
    if !local.has_local_edits() {
        return Resolution::ApplyRemote;
    }
    if remote_updated_at > local.updated_at {
        Resolution::Conflict(ConflictWinner::Remote)
    } else {
        Resolution::Conflict(ConflictWinner::Local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncStatus;
    use serde_json::Map;

    fn stored(status: SyncStatus, updated_at: i64, remote_updated_at: Option<i64>) -> Submission {
        let mut submission = Submission::new("form", Map::new(), None, None);
        submission.remote_id = Some(1);
        submission.sync_status = status;
        submission.updated_at = updated_at;
        submission.remote_updated_at = remote_updated_at;
        submission
    }

    #[test]
    fn clean_record_takes_newer_remote() {
        let local = stored(SyncStatus::Synced, 100, Some(100));
        assert_eq!(resolve(&local, 200), Resolution::ApplyRemote);
        assert_eq!(resolve(&local, 100), Resolution::Unchanged);
        assert_eq!(resolve(&local, 50), Resolution::Unchanged);
    }

    #[test]
    fn newer_remote_beats_older_local_edit() {
        let local = stored(SyncStatus::Unsynced, 150, Some(100));
        assert_eq!(
            resolve(&local, 200),
            Resolution::Conflict(ConflictWinner::Remote)
        );
    }

    #[test]
    fn local_edit_wins_ties_and_newer() {
        let local = stored(SyncStatus::Unsynced, 200, Some(100));
        assert_eq!(
            resolve(&local, 200),
            Resolution::Conflict(ConflictWinner::Local)
        );
        assert_eq!(
            resolve(&local, 150),
            Resolution::Conflict(ConflictWinner::Local)
        );
    }

    #[test]
    fn local_edit_alone_is_not_a_conflict() {
        let local = stored(SyncStatus::Unsynced, 300, Some(100));
        assert_eq!(resolve(&local, 100), Resolution::Unchanged);
    }
}
