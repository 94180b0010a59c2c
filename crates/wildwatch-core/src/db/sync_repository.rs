//! Sync cursor and run log storage

use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::{PullPhase, RunStatus, SyncCounts, SyncCursor, SyncRun};
use crate::util::now_millis;

/// Trait for reconciliation bookkeeping (async)
#[allow(async_fn_in_trait)]
pub trait SyncRepository {
    /// Cursor for a form; a fresh cursor when none is stored
    async fn cursor(&self, form_id: &str) -> Result<SyncCursor>;

    /// Move one phase of a form's cursor forward. A watermark never moves
    /// backwards here.
    async fn advance_cursor(
        &self,
        form_id: &str,
        phase: PullPhase,
        timestamp: i64,
        remote_id: i64,
    ) -> Result<SyncCursor>;

    /// Forget a form's cursor so the next run starts from the beginning
    async fn reset_cursor(&self, form_id: &str) -> Result<()>;

    /// All stored cursors
    async fn list_cursors(&self) -> Result<Vec<SyncCursor>>;

    /// Append a finished run to the log
    async fn record_run(&self, run: &SyncRun) -> Result<SyncRun>;

    /// Most recent runs for a form
    async fn recent_runs(&self, form_id: &str, limit: usize) -> Result<Vec<SyncRun>>;
}

/// libSQL implementation of `SyncRepository`
pub struct LibSqlSyncRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SyncRepository for LibSqlSyncRepository<'_> {
    async fn cursor(&self, form_id: &str) -> Result<SyncCursor> {
        let mut rows = self
            .conn
            .query(
                "SELECT form_id, last_submission_time, last_remote_id, last_edited_at,
                        last_edited_remote_id, updated_at
                 FROM sync_cursors WHERE form_id = ?1",
                [form_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => parse_cursor(&row),
            None => Ok(SyncCursor::start(form_id)),
        }
    }

    async fn advance_cursor(
        &self,
        form_id: &str,
        phase: PullPhase,
        timestamp: i64,
        remote_id: i64,
    ) -> Result<SyncCursor> {
        let (time_column, id_column) = match phase {
            PullPhase::Submitted => ("last_submission_time", "last_remote_id"),
            PullPhase::Edited => ("last_edited_at", "last_edited_remote_id"),
        };
        let sql = format!(
            "INSERT INTO sync_cursors (form_id, {time_column}, {id_column}, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(form_id) DO UPDATE SET
                {time_column} = excluded.{time_column},
                {id_column} = excluded.{id_column},
                updated_at = excluded.updated_at
             WHERE excluded.{time_column} > sync_cursors.{time_column}
                OR (excluded.{time_column} = sync_cursors.{time_column}
                    AND excluded.{id_column} > sync_cursors.{id_column})"
        );
        self.conn
            .execute(&sql, params![form_id, timestamp, remote_id, now_millis()])
            .await?;
        self.cursor(form_id).await
    }

    async fn reset_cursor(&self, form_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_cursors WHERE form_id = ?1", [form_id])
            .await?;
        tracing::info!(form_id, "Sync cursor reset");
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT form_id, last_submission_time, last_remote_id, last_edited_at,
                        last_edited_remote_id, updated_at
                 FROM sync_cursors ORDER BY form_id",
                (),
            )
            .await?;
        let mut cursors = Vec::new();
        while let Some(row) = rows.next().await? {
            cursors.push(parse_cursor(&row)?);
        }
        Ok(cursors)
    }

    async fn record_run(&self, run: &SyncRun) -> Result<SyncRun> {
        let counts = run.counts;
        self.conn
            .execute(
                "INSERT INTO sync_runs (
                    form_id, status, fetched, inserted, updated, unchanged, conflicts,
                    pushed, push_failed, skipped, error, started_at, completed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    run.form_id.clone(),
                    run.status.as_str(),
                    i64::from(counts.fetched),
                    i64::from(counts.inserted),
                    i64::from(counts.updated),
                    i64::from(counts.unchanged),
                    i64::from(counts.conflicts),
                    i64::from(counts.pushed),
                    i64::from(counts.push_failed),
                    i64::from(counts.skipped),
                    run.error.clone(),
                    run.started_at,
                    run.completed_at
                ],
            )
            .await?;

        Ok(SyncRun {
            id: self.conn.last_insert_rowid(),
            ..run.clone()
        })
    }

    #[allow(clippy::cast_possible_wrap)]
    async fn recent_runs(&self, form_id: &str, limit: usize) -> Result<Vec<SyncRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, form_id, status, fetched, inserted, updated, unchanged, conflicts,
                        pushed, push_failed, skipped, error, started_at, completed_at
                 FROM sync_runs WHERE form_id = ?1
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?2",
                params![form_id, limit as i64],
            )
            .await?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next().await? {
            let count = |index: i32| -> Result<u32> {
                Ok(u32::try_from(row.get::<i64>(index)?).unwrap_or(0))
            };
            runs.push(SyncRun {
                id: row.get(0)?,
                form_id: row.get(1)?,
                status: RunStatus::parse(&row.get::<String>(2)?),
                counts: SyncCounts {
                    fetched: count(3)?,
                    inserted: count(4)?,
                    updated: count(5)?,
                    unchanged: count(6)?,
                    conflicts: count(7)?,
                    pushed: count(8)?,
                    push_failed: count(9)?,
                    skipped: count(10)?,
                },
                error: row.get(11)?,
                started_at: row.get(12)?,
                completed_at: row.get(13)?,
            });
        }
        Ok(runs)
    }
}

fn parse_cursor(row: &Row) -> Result<SyncCursor> {
    Ok(SyncCursor {
        form_id: row.get(0)?,
        last_submission_time: row.get(1)?,
        last_remote_id: row.get(2)?,
        last_edited_at: row.get(3)?,
        last_edited_remote_id: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
