//! Shared database service wrapper used by the API and CLI.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::DatabaseConfig;
use crate::db::{
    Database, FormRepository, IncomingSubmission, LibSqlFormRepository,
    LibSqlSubmissionRepository, LibSqlSyncRepository, SubmissionPatch, SubmissionQuery,
    SubmissionRepository, SyncRepository, UpsertOutcome,
};
use crate::models::{
    FormDefinition, PullPhase, Submission, SubmissionId, SyncConflict, SyncCursor, SyncRun,
};
use crate::sync::SubmissionStore;
use crate::Result;

/// Thread-safe service for DB and repository operations.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
}

impl DatabaseService {
    /// Open the configured database.
    pub async fn open(config: &DatabaseConfig) -> Result<Self> {
        if let DatabaseConfig::Local { path } = config {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            tracing::info!(path, "Using local database");
        }
        let db = Database::open_config(config).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<()> {
        let db = self.db.lock().await;
        let mut rows = db.connection().query("SELECT 1", ()).await?;
        rows.next().await?;
        Ok(())
    }

    pub async fn is_remote(&self) -> bool {
        self.db.lock().await.is_remote()
    }

    /// Create a local submission.
    pub async fn create_submission(&self, submission: &Submission) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.create(submission).await
    }

    /// Fetch a submission by id.
    pub async fn get_submission(&self, id: &SubmissionId) -> Result<Option<Submission>> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.get(id).await
    }

    /// List submissions matching a query.
    pub async fn query_submissions(&self, query: &SubmissionQuery) -> Result<Vec<Submission>> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.query(query).await
    }

    /// Apply a local edit.
    pub async fn update_submission(
        &self,
        id: &SubmissionId,
        patch: &SubmissionPatch,
    ) -> Result<Submission> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.update_local(id, patch).await
    }

    pub async fn count_submissions(&self) -> Result<i64> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.count().await
    }

    /// List recently resolved sync conflicts.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.list_conflicts(limit).await
    }

    /// Cache a parsed form definition.
    pub async fn save_form(&self, form: &FormDefinition) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlFormRepository::new(db.connection());
        repo.save(form).await
    }

    /// Cached form definition, if any.
    pub async fn cached_form(&self, form_id: &str) -> Result<Option<FormDefinition>> {
        let db = self.db.lock().await;
        let repo = LibSqlFormRepository::new(db.connection());
        repo.get(form_id).await
    }

    /// All cached form definitions.
    pub async fn list_forms(&self) -> Result<Vec<FormDefinition>> {
        let db = self.db.lock().await;
        let repo = LibSqlFormRepository::new(db.connection());
        repo.list().await
    }

    pub async fn count_forms(&self) -> Result<i64> {
        let db = self.db.lock().await;
        let repo = LibSqlFormRepository::new(db.connection());
        repo.count().await
    }

    /// Sync cursor for a form.
    pub async fn cursor(&self, form_id: &str) -> Result<SyncCursor> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncRepository::new(db.connection());
        repo.cursor(form_id).await
    }

    /// All stored sync cursors.
    pub async fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncRepository::new(db.connection());
        repo.list_cursors().await
    }

    /// Most recent sync runs for a form.
    pub async fn recent_runs(&self, form_id: &str, limit: usize) -> Result<Vec<SyncRun>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncRepository::new(db.connection());
        repo.recent_runs(form_id, limit).await
    }
}

#[async_trait]
impl SubmissionStore for DatabaseService {
    async fn cursor(&self, form_id: &str) -> Result<SyncCursor> {
        Self::cursor(self, form_id).await
    }

    async fn advance_cursor(
        &self,
        form_id: &str,
        phase: PullPhase,
        timestamp: i64,
        remote_id: i64,
    ) -> Result<SyncCursor> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncRepository::new(db.connection());
        repo.advance_cursor(form_id, phase, timestamp, remote_id)
            .await
    }

    async fn reset_cursor(&self, form_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncRepository::new(db.connection());
        repo.reset_cursor(form_id).await
    }

    async fn cached_form(&self, form_id: &str) -> Result<Option<FormDefinition>> {
        Self::cached_form(self, form_id).await
    }

    async fn upsert_remote(&self, incoming: &IncomingSubmission) -> Result<UpsertOutcome> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.upsert_remote(incoming).await
    }

    async fn pending_push(
        &self,
        form_id: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.pending_push(form_id, max_attempts, limit).await
    }

    async fn mark_synced(&self, id: &SubmissionId, remote_id: i64) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.mark_synced(id, remote_id).await
    }

    async fn mark_failed(&self, id: &SubmissionId, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlSubmissionRepository::new(db.connection());
        repo.mark_failed(id, error).await
    }

    async fn record_run(&self, run: &SyncRun) -> Result<SyncRun> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncRepository::new(db.connection());
        repo.record_run(run).await
    }
}
