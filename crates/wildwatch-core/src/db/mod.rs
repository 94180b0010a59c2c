//! Database layer for Wildwatch

mod connection;
mod form_repository;
mod migrations;
mod submission_repository;
mod sync_repository;

pub use connection::Database;
pub use form_repository::{FormRepository, LibSqlFormRepository};
pub use submission_repository::{
    IncomingSubmission, LibSqlSubmissionRepository, SubmissionPatch, SubmissionQuery,
    SubmissionRepository, UpsertOutcome, DEFAULT_QUERY_LIMIT,
};
pub use sync_repository::{LibSqlSyncRepository, SyncRepository};
