//! Data models for Wildwatch

mod form;
mod location;
mod submission;
mod sync_conflict;
mod sync_cursor;

pub use form::{Choice, FormDefinition, FormSummary, Question, QuestionType};
pub use location::{BoundingBox, GeoPoint};
pub use submission::{Submission, SubmissionId, SyncStatus};
pub use sync_conflict::{ConflictWinner, SyncConflict};
pub use sync_cursor::{PullPhase, RunStatus, SyncCounts, SyncCursor, SyncRun};
