//! Bi-directional reconciliation between local submissions and Kobo.
//!
//! A run pushes pending local submissions, then pulls remote submissions past
//! the form's cursor page by page: first new submissions by submission time,
//! then remote edits by edit time. Each remote record is committed on its
//! own; a phase's watermark only advances once a whole page has been written,
//! so a failed run leaves committed records in place and re-fetches the page
//! next time. Upserts are idempotent per remote id, which makes the re-fetch
//! safe.

pub mod policy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::db::{IncomingSubmission, UpsertOutcome};
use crate::error::{Error, Result};
use crate::forms::{extract_location, normalize_answers};
use crate::kobo::{FormGateway, GatewayError, RemoteSubmission};
use crate::models::{
    FormDefinition, PullPhase, RunStatus, Submission, SubmissionId, SyncConflict, SyncCounts,
    SyncCursor, SyncRun,
};
use crate::util::{now_millis, sanitize};

/// Pending submissions pushed per run
const PUSH_BATCH_LIMIT: usize = 500;

/// Storage the reconciler reads and writes.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn cursor(&self, form_id: &str) -> Result<SyncCursor>;

    async fn advance_cursor(
        &self,
        form_id: &str,
        phase: PullPhase,
        timestamp: i64,
        remote_id: i64,
    ) -> Result<SyncCursor>;

    async fn reset_cursor(&self, form_id: &str) -> Result<()>;

    async fn cached_form(&self, form_id: &str) -> Result<Option<FormDefinition>>;

    async fn upsert_remote(&self, incoming: &IncomingSubmission) -> Result<UpsertOutcome>;

    async fn pending_push(
        &self,
        form_id: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Submission>>;

    async fn mark_synced(&self, id: &SubmissionId, remote_id: i64) -> Result<()>;

    async fn mark_failed(&self, id: &SubmissionId, error: &str) -> Result<()>;

    async fn record_run(&self, run: &SyncRun) -> Result<SyncRun>;
}

/// Reconciler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub page_size: u32,
    pub max_push_attempts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_push_attempts: 3,
        }
    }
}

/// Where a pull starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Continue from the stored cursor
    #[default]
    Incremental,
    /// Reset the cursor and re-read every remote submission
    Full,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub run: SyncRun,
    pub cursor: SyncCursor,
    pub conflicts: Vec<SyncConflict>,
}

/// Outcome of delivering one submission outside a full run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed(i64),
    Failed(GatewayError),
    /// A run for the form holds the lock; the run's push phase delivers it
    Deferred,
}

/// Exclusive right to reconcile one form
#[derive(Debug)]
pub struct SyncLease {
    form_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SyncLease {
    pub fn form_id(&self) -> &str {
        &self.form_id
    }
}

/// Runs reconciliation with at most one run per form at a time.
pub struct SyncCoordinator {
    gateway: Arc<dyn FormGateway>,
    store: Arc<dyn SubmissionStore>,
    options: SyncOptions,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncCoordinator {
    pub fn new(
        gateway: Arc<dyn FormGateway>,
        store: Arc<dyn SubmissionStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            gateway,
            store,
            options,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn FormGateway> {
        &self.gateway
    }

    fn form_lock(&self, form_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(form_id.to_string()).or_default())
    }

    /// Take the form's lock, failing fast with `SyncInProgress` when busy.
    pub fn acquire(&self, form_id: &str) -> Result<SyncLease> {
        let guard = self
            .form_lock(form_id)
            .try_lock_owned()
            .map_err(|_| Error::SyncInProgress(form_id.to_string()))?;
        Ok(SyncLease {
            form_id: form_id.to_string(),
            _guard: guard,
        })
    }

    /// Whether a run currently holds the form's lock.
    pub fn is_running(&self, form_id: &str) -> bool {
        self.form_lock(form_id).try_lock().is_err()
    }

    /// Acquire the form and run reconciliation.
    pub async fn run(
        &self,
        form_id: &str,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let lease = self.acquire(form_id)?;
        self.run_leased(lease, mode, cancel).await
    }

    /// Run reconciliation under a lease taken earlier with [`Self::acquire`].
    ///
    /// A cancelled run returns a report with [`RunStatus::Cancelled`]; any
    /// other failure is returned as an error after the run is logged.
    pub async fn run_leased(
        &self,
        lease: SyncLease,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let form_id = lease.form_id().to_string();
        let started_at = now_millis();
        tracing::info!(form_id, ?mode, "Sync run started");

        let mut progress = RunProgress::default();
        let result = self.reconcile(&form_id, mode, cancel, &mut progress).await;

        let (status, error) = match &result {
            Ok(()) if progress.counts.push_failed > 0 => (RunStatus::Partial, None),
            Ok(()) => (RunStatus::Success, None),
            Err(Error::Cancelled(_)) => (RunStatus::Cancelled, None),
            Err(error) => (RunStatus::Failed, Some(sanitize(error))),
        };
        let run = SyncRun {
            id: 0,
            form_id: form_id.clone(),
            status,
            counts: progress.counts,
            error,
            started_at,
            completed_at: now_millis(),
        };
        let run = match self.store.record_run(&run).await {
            Ok(recorded) => recorded,
            Err(log_error) => {
                tracing::warn!(form_id, "Failed to record sync run: {log_error}");
                run
            }
        };
        drop(lease);

        let counts = run.counts;
        match result {
            Ok(()) | Err(Error::Cancelled(_)) => {
                tracing::info!(
                    form_id,
                    status = %run.status,
                    fetched = counts.fetched,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    conflicts = counts.conflicts,
                    pushed = counts.pushed,
                    push_failed = counts.push_failed,
                    skipped = counts.skipped,
                    "Sync run finished"
                );
                let cursor = self.store.cursor(&form_id).await?;
                Ok(SyncReport {
                    run,
                    cursor,
                    conflicts: progress.conflicts,
                })
            }
            Err(error) => {
                tracing::error!(form_id, "Sync run failed: {error}");
                Err(error)
            }
        }
    }

    /// Deliver a single submission unless a run for its form is in progress.
    ///
    /// Makes one attempt only, so the form's lock is held for at most one
    /// request; a failure is left for the next run's push phase.
    pub async fn push_submission(&self, submission: &Submission) -> Result<PushOutcome> {
        let Ok(_lease) = self.acquire(&submission.form_id) else {
            return Ok(PushOutcome::Deferred);
        };
        let result = self.gateway.push_submission_once(submission).await;
        self.record_push(submission, result).await
    }

    async fn deliver(&self, submission: &Submission) -> Result<PushOutcome> {
        let result = self.gateway.push_submission(submission).await;
        self.record_push(submission, result).await
    }

    async fn record_push(
        &self,
        submission: &Submission,
        result: std::result::Result<i64, GatewayError>,
    ) -> Result<PushOutcome> {
        match result {
            Ok(remote_id) => {
                self.store.mark_synced(&submission.id, remote_id).await?;
                Ok(PushOutcome::Pushed(remote_id))
            }
            Err(error) => {
                tracing::warn!(
                    form_id = submission.form_id.as_str(),
                    submission_id = %submission.id,
                    "Push failed: {error}"
                );
                self.store
                    .mark_failed(&submission.id, &error.to_string())
                    .await?;
                Ok(PushOutcome::Failed(error))
            }
        }
    }

    async fn reconcile(
        &self,
        form_id: &str,
        mode: SyncMode,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
    ) -> Result<()> {
        if mode == SyncMode::Full {
            self.store.reset_cursor(form_id).await?;
        }
        self.push_pending(form_id, cancel, progress).await?;
        self.pull(form_id, cancel, progress).await
    }

    async fn push_pending(
        &self,
        form_id: &str,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
    ) -> Result<()> {
        let pending = self
            .store
            .pending_push(form_id, self.options.max_push_attempts, PUSH_BATCH_LIMIT)
            .await?;

        for submission in pending {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(form_id.to_string()));
            }
            match self.deliver(&submission).await? {
                PushOutcome::Pushed(_) => progress.counts.pushed += 1,
                PushOutcome::Failed(error) => {
                    progress.counts.push_failed += 1;
                    // Upstream is down; leave the rest for the next run
                    if error.is_retryable() {
                        break;
                    }
                }
                PushOutcome::Deferred => {}
            }
        }
        Ok(())
    }

    async fn pull(
        &self,
        form_id: &str,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
    ) -> Result<()> {
        let form = self.store.cached_form(form_id).await?;
        for phase in [PullPhase::Submitted, PullPhase::Edited] {
            self.pull_phase(form_id, phase, form.as_ref(), cancel, progress)
                .await?;
        }
        Ok(())
    }

    async fn pull_phase(
        &self,
        form_id: &str,
        phase: PullPhase,
        form: Option<&FormDefinition>,
        cancel: &CancellationToken,
        progress: &mut RunProgress,
    ) -> Result<()> {
        let mut cursor = self.store.cursor(form_id).await?;
        let (since, _) = cursor.position(phase);
        let mut start: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(form_id.to_string()));
            }

            let page = self
                .gateway
                .fetch_submissions(form_id, phase, since, start, self.options.page_size)
                .await?;
            let fetched = u32::try_from(page.results.len()).unwrap_or(u32::MAX);
            let received = fetched.saturating_add(page.skipped);
            progress.counts.fetched += fetched;
            progress.counts.skipped += page.skipped;

            let mut high_water: Option<(i64, i64)> = None;
            for remote in page.results {
                let position = match phase {
                    PullPhase::Submitted => (remote.submission_time, remote.remote_id),
                    PullPhase::Edited => (remote.updated_at, remote.remote_id),
                };
                if !cursor.is_behind(phase, position.0, position.1) {
                    continue;
                }
                let incoming = to_incoming(form_id, remote, form);
                self.apply(&incoming, progress).await?;
                high_water = high_water.max(Some(position));
            }

            if let Some((timestamp, remote_id)) = high_water {
                cursor = self
                    .store
                    .advance_cursor(form_id, phase, timestamp, remote_id)
                    .await?;
                let (last_time, last_remote_id) = cursor.position(phase);
                tracing::debug!(
                    form_id,
                    phase = phase.as_str(),
                    last_time,
                    last_remote_id,
                    "Sync cursor advanced"
                );
            }

            if !page.has_more || received == 0 {
                return Ok(());
            }
            start = start.saturating_add(received);
        }
    }

    async fn apply(&self, incoming: &IncomingSubmission, progress: &mut RunProgress) -> Result<()> {
        match self.store.upsert_remote(incoming).await? {
            UpsertOutcome::Inserted(_) => progress.counts.inserted += 1,
            UpsertOutcome::Updated(_) | UpsertOutcome::Linked(_) => progress.counts.updated += 1,
            UpsertOutcome::Unchanged(_) => progress.counts.unchanged += 1,
            UpsertOutcome::Conflict(conflict) => {
                tracing::warn!(
                    form_id = conflict.form_id.as_str(),
                    submission_id = conflict.submission_id.as_str(),
                    remote_id = conflict.remote_id,
                    local_updated_at = conflict.local_updated_at,
                    remote_updated_at = conflict.remote_updated_at,
                    winner = conflict.winner.as_str(),
                    "Sync conflict resolved by last-write-wins"
                );
                progress.counts.conflicts += 1;
                progress.conflicts.push(conflict);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    counts: SyncCounts,
    conflicts: Vec<SyncConflict>,
}

fn to_incoming(
    form_id: &str,
    remote: RemoteSubmission,
    form: Option<&FormDefinition>,
) -> IncomingSubmission {
    let location = extract_location(&remote.answers, form).or(remote.location);
    IncomingSubmission {
        form_id: form_id.to_string(),
        remote_id: remote.remote_id,
        remote_uuid: remote.instance_uuid,
        submitted_by: remote.submitted_by,
        location,
        answers: normalize_answers(&remote.answers, form),
        submitted_at: remote.submission_time,
        remote_updated_at: remote.updated_at,
    }
}
