//! Submission repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use libsql::{params, Connection, Row, Value as SqlValue};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{
    BoundingBox, ConflictWinner, GeoPoint, Submission, SubmissionId, SyncConflict, SyncStatus,
};
use crate::sync::policy::{self, Resolution, LWW_STRATEGY};
use crate::util::now_millis;

const SUBMISSION_COLUMNS: &str = "id, form_id, remote_id, remote_uuid, submitted_by, latitude, \
     longitude, altitude, accuracy, answers, sync_status, sync_attempts, sync_error, created_at, \
     updated_at, remote_updated_at, last_synced_at";

const CONFLICT_COLUMNS: &str = "id, submission_id, form_id, remote_id, local_updated_at, \
     remote_updated_at, winner, resolved_at, strategy";

/// Default page size for submission queries
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// A remote submission normalized for storage
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingSubmission {
    pub form_id: String,
    pub remote_id: i64,
    /// Remote instance uuid; links the record to a local submission pushed earlier
    pub remote_uuid: Option<String>,
    pub submitted_by: Option<String>,
    pub location: Option<GeoPoint>,
    pub answers: Map<String, Value>,
    /// Remote submission time (Unix ms)
    pub submitted_at: i64,
    /// Remote modification marker (Unix ms)
    pub remote_updated_at: i64,
}

/// Result of applying one remote submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(SubmissionId),
    Updated(SubmissionId),
    /// An unsynced local record was matched by instance uuid and given its remote id
    Linked(SubmissionId),
    Unchanged(SubmissionId),
    Conflict(SyncConflict),
}

/// Filters for listing submissions
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionQuery {
    pub form_id: Option<String>,
    pub status: Option<SyncStatus>,
    /// Inclusive lower bound on `created_at` (Unix ms)
    pub created_after: Option<i64>,
    /// Inclusive upper bound on `created_at` (Unix ms)
    pub created_before: Option<i64>,
    pub bbox: Option<BoundingBox>,
    /// Center and radius in kilometres
    pub near: Option<(GeoPoint, f64)>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SubmissionQuery {
    fn default() -> Self {
        Self {
            form_id: None,
            status: None,
            created_after: None,
            created_before: None,
            bbox: None,
            near: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

/// Local edit to a submission; absent fields are left alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionPatch {
    /// Keys merged into the stored answers
    pub answers: Option<Map<String, Value>>,
    pub location: Option<GeoPoint>,
    pub submitted_by: Option<String>,
}

/// Trait for submission storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SubmissionRepository {
    /// Insert a new local submission
    async fn create(&self, submission: &Submission) -> Result<()>;

    /// Get a submission by local ID
    async fn get(&self, id: &SubmissionId) -> Result<Option<Submission>>;

    /// Get a submission by its remote ID within a form
    async fn get_by_remote_id(&self, form_id: &str, remote_id: i64) -> Result<Option<Submission>>;

    /// Filtered listing, newest first
    async fn query(&self, query: &SubmissionQuery) -> Result<Vec<Submission>>;

    /// Number of stored submissions
    async fn count(&self) -> Result<i64>;

    /// Apply a local edit and mark the record unsynced
    async fn update_local(&self, id: &SubmissionId, patch: &SubmissionPatch) -> Result<Submission>;

    /// Insert or reconcile a remote submission; idempotent per remote ID
    async fn upsert_remote(&self, incoming: &IncomingSubmission) -> Result<UpsertOutcome>;

    /// Record a successful push
    async fn mark_synced(&self, id: &SubmissionId, remote_id: i64) -> Result<()>;

    /// Record a failed push
    async fn mark_failed(&self, id: &SubmissionId, error: &str) -> Result<()>;

    /// Local submissions that still need to be delivered, oldest first
    async fn pending_push(
        &self,
        form_id: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Submission>>;

    /// Most recent conflicts across all forms
    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// libSQL implementation of `SubmissionRepository`
pub struct LibSqlSubmissionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSubmissionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn fetch_one(&self, filter: &str, params: Vec<SqlValue>) -> Result<Option<Submission>> {
        let sql = format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE {filter} LIMIT 1");
        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(params))
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_submission(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, submission: &Submission) -> Result<()> {
        let (latitude, longitude, altitude, accuracy) = location_columns(submission.location);
        self.conn
            .execute(
                &format!(
                    "INSERT INTO submissions ({SUBMISSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    submission.id.as_str(),
                    submission.form_id.clone(),
                    submission.remote_id,
                    submission.remote_uuid.clone(),
                    submission.submitted_by.clone(),
                    latitude,
                    longitude,
                    altitude,
                    accuracy,
                    serde_json::to_string(&submission.answers)?,
                    submission.sync_status.as_str(),
                    i64::from(submission.sync_attempts),
                    submission.sync_error.clone(),
                    submission.created_at,
                    submission.updated_at,
                    submission.remote_updated_at,
                    submission.last_synced_at
                ],
            )
            .await?;
        Ok(())
    }

    /// Overwrite the local copy with the remote version and mark it synced.
    async fn apply_remote(&self, id: &SubmissionId, incoming: &IncomingSubmission) -> Result<()> {
        let (latitude, longitude, altitude, accuracy) = location_columns(incoming.location);
        self.conn
            .execute(
                "UPDATE submissions
                 SET remote_uuid = ?1, submitted_by = ?2, latitude = ?3, longitude = ?4,
                     altitude = ?5, accuracy = ?6, answers = ?7, sync_status = 'synced',
                     sync_attempts = 0, sync_error = NULL, updated_at = ?8,
                     remote_updated_at = ?8, last_synced_at = ?9
                 WHERE id = ?10",
                params![
                    incoming.remote_uuid.clone(),
                    incoming.submitted_by.clone(),
                    latitude,
                    longitude,
                    altitude,
                    accuracy,
                    serde_json::to_string(&incoming.answers)?,
                    incoming.remote_updated_at,
                    now_millis(),
                    id.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    async fn record_conflict(
        &self,
        local: &Submission,
        incoming: &IncomingSubmission,
        winner: ConflictWinner,
    ) -> Result<SyncConflict> {
        let resolved_at = now_millis();
        self.conn
            .execute(
                "INSERT INTO sync_conflicts (
                    submission_id, form_id, remote_id, local_updated_at,
                    remote_updated_at, winner, strategy, resolved_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    local.id.as_str(),
                    incoming.form_id.clone(),
                    incoming.remote_id,
                    local.updated_at,
                    incoming.remote_updated_at,
                    winner.as_str(),
                    LWW_STRATEGY,
                    resolved_at
                ],
            )
            .await?;

        Ok(SyncConflict {
            id: self.conn.last_insert_rowid(),
            submission_id: local.id.as_str(),
            form_id: incoming.form_id.clone(),
            remote_id: incoming.remote_id,
            local_updated_at: local.updated_at,
            remote_updated_at: incoming.remote_updated_at,
            winner,
            resolved_at,
            strategy: LWW_STRATEGY.to_string(),
        })
    }

    /// Body of `upsert_remote`; runs inside the caller's transaction.
    async fn reconcile(&self, incoming: &IncomingSubmission) -> Result<UpsertOutcome> {
        if let Some(local) = self
            .get_by_remote_id(&incoming.form_id, incoming.remote_id)
            .await?
        {
            return match policy::resolve(&local, incoming.remote_updated_at) {
                Resolution::Unchanged => Ok(UpsertOutcome::Unchanged(local.id)),
                Resolution::ApplyRemote => {
                    self.apply_remote(&local.id, incoming).await?;
                    Ok(UpsertOutcome::Updated(local.id))
                }
                Resolution::Conflict(ConflictWinner::Remote) => {
                    self.apply_remote(&local.id, incoming).await?;
                    let conflict = self
                        .record_conflict(&local, incoming, ConflictWinner::Remote)
                        .await?;
                    Ok(UpsertOutcome::Conflict(conflict))
                }
                Resolution::Conflict(ConflictWinner::Local) => {
                    // Remember the remote version so the same edit is not re-reported
                    self.conn
                        .execute(
                            "UPDATE submissions
                             SET sync_status = 'conflict', remote_updated_at = ?1
                             WHERE id = ?2",
                            params![incoming.remote_updated_at, local.id.as_str()],
                        )
                        .await?;
                    let conflict = self
                        .record_conflict(&local, incoming, ConflictWinner::Local)
                        .await?;
                    Ok(UpsertOutcome::Conflict(conflict))
                }
            };
        }

        let instance_id = incoming
            .remote_uuid
            .as_deref()
            .and_then(|uuid| uuid.parse::<SubmissionId>().ok());

        if let Some(id) = instance_id {
            if let Some(local) = self.get(&id).await? {
                if local.form_id == incoming.form_id && local.remote_id.is_none() {
                    self.link(&local.id, incoming).await?;
                    return Ok(UpsertOutcome::Linked(local.id));
                }
            }
        }

        let id = match instance_id {
            Some(id) if self.get(&id).await?.is_none() => id,
            _ => SubmissionId::new(),
        };
        let now = now_millis();
        let submission = Submission {
            id,
            form_id: incoming.form_id.clone(),
            remote_id: Some(incoming.remote_id),
            remote_uuid: incoming.remote_uuid.clone(),
            submitted_by: incoming.submitted_by.clone(),
            location: incoming.location,
            answers: incoming.answers.clone(),
            sync_status: SyncStatus::Synced,
            sync_attempts: 0,
            sync_error: None,
            created_at: incoming.submitted_at,
            updated_at: incoming.remote_updated_at,
            remote_updated_at: Some(incoming.remote_updated_at),
            last_synced_at: Some(now),
        };
        self.insert(&submission).await?;
        Ok(UpsertOutcome::Inserted(id))
    }

    /// Attach a remote identity to a local record whose push response was lost.
    async fn link(&self, id: &SubmissionId, incoming: &IncomingSubmission) -> Result<()> {
        self.conn
            .execute(
                "UPDATE submissions
                 SET remote_id = ?1, remote_uuid = ?2, remote_updated_at = ?3,
                     sync_status = 'synced', sync_attempts = 0, sync_error = NULL,
                     last_synced_at = ?4
                 WHERE id = ?5 AND remote_id IS NULL",
                params![
                    incoming.remote_id,
                    incoming.remote_uuid.clone(),
                    incoming.remote_updated_at,
                    now_millis(),
                    id.as_str()
                ],
            )
            .await?;
        Ok(())
    }
}

impl SubmissionRepository for LibSqlSubmissionRepository<'_> {
    async fn create(&self, submission: &Submission) -> Result<()> {
        if let Some(location) = &submission.location {
            location.validate().map_err(Error::InvalidInput)?;
        }
        self.insert(submission).await
    }

    async fn get(&self, id: &SubmissionId) -> Result<Option<Submission>> {
        self.fetch_one("id = ?1", vec![id.as_str().into()]).await
    }

    async fn get_by_remote_id(&self, form_id: &str, remote_id: i64) -> Result<Option<Submission>> {
        self.fetch_one(
            "form_id = ?1 AND remote_id = ?2",
            vec![form_id.to_string().into(), remote_id.into()],
        )
        .await
    }

    async fn query(&self, query: &SubmissionQuery) -> Result<Vec<Submission>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(form_id) = &query.form_id {
            clauses.push("form_id = ?");
            params.push(form_id.clone().into());
        }
        if let Some(status) = query.status {
            clauses.push("sync_status = ?");
            params.push(status.as_str().to_string().into());
        }
        if let Some(after) = query.created_after {
            clauses.push("created_at >= ?");
            params.push(after.into());
        }
        if let Some(before) = query.created_before {
            clauses.push("created_at <= ?");
            params.push(before.into());
        }
        let radius_box = query
            .near
            .map(|(center, radius_km)| BoundingBox::around(&center, radius_km));
        for bbox in query.bbox.iter().chain(radius_box.iter()) {
            clauses.push(if bbox.crosses_antimeridian() {
                "latitude BETWEEN ? AND ? AND (longitude >= ? OR longitude <= ?)"
            } else {
                "latitude BETWEEN ? AND ? AND longitude BETWEEN ? AND ?"
            });
            params.extend([
                bbox.min_latitude.into(),
                bbox.max_latitude.into(),
                bbox.min_longitude.into(),
                bbox.max_longitude.into(),
            ]);
        }

        let mut sql = format!("SELECT {SUBMISSION_COLUMNS} FROM submissions");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        // Radius filtering happens after the box prefilter, so page in memory
        if query.near.is_none() {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push((query.limit as i64).into());
            params.push((query.offset as i64).into());
        }

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(params))
            .await?;
        let mut submissions = Vec::new();
        while let Some(row) = rows.next().await? {
            submissions.push(parse_submission(&row)?);
        }

        if let Some((center, radius_km)) = query.near {
            submissions = submissions
                .into_iter()
                .filter(|submission| {
                    submission
                        .location
                        .is_some_and(|point| point.distance_km(&center) <= radius_km)
                })
                .skip(query.offset)
                .take(query.limit)
                .collect();
        }

        Ok(submissions)
    }

    async fn count(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM submissions", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    async fn update_local(&self, id: &SubmissionId, patch: &SubmissionPatch) -> Result<Submission> {
        let mut submission = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("submission {id}")))?;

        if let Some(answers) = &patch.answers {
            for (key, value) in answers {
                submission.answers.insert(key.clone(), value.clone());
            }
        }
        if let Some(location) = patch.location {
            location.validate().map_err(Error::InvalidInput)?;
            submission.location = Some(location);
        }
        if let Some(submitted_by) = &patch.submitted_by {
            submission.submitted_by = Some(submitted_by.clone());
        }
        submission.updated_at = now_millis().max(submission.updated_at + 1);
        submission.sync_status = SyncStatus::Unsynced;

        let (latitude, longitude, altitude, accuracy) = location_columns(submission.location);
        self.conn
            .execute(
                "UPDATE submissions
                 SET answers = ?1, latitude = ?2, longitude = ?3, altitude = ?4, accuracy = ?5,
                     submitted_by = ?6, sync_status = 'unsynced', updated_at = ?7
                 WHERE id = ?8",
                params![
                    serde_json::to_string(&submission.answers)?,
                    latitude,
                    longitude,
                    altitude,
                    accuracy,
                    submission.submitted_by.clone(),
                    submission.updated_at,
                    id.as_str()
                ],
            )
            .await?;

        Ok(submission)
    }

    async fn upsert_remote(&self, incoming: &IncomingSubmission) -> Result<UpsertOutcome> {
        let tx = self.conn.transaction().await?;
        let outcome = LibSqlSubmissionRepository::new(&tx)
            .reconcile(incoming)
            .await;
        match outcome {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(error) => {
                tx.rollback().await.ok();
                Err(error)
            }
        }
    }

    async fn mark_synced(&self, id: &SubmissionId, remote_id: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE submissions
                 SET remote_id = ?1, sync_status = 'synced', sync_attempts = 0,
                     sync_error = NULL, last_synced_at = ?2
                 WHERE id = ?3 AND (remote_id IS NULL OR remote_id = ?1)",
                params![remote_id, now_millis(), id.as_str()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::InvalidInput(format!(
                "submission {id} is missing or already linked to a different remote id"
            )));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &SubmissionId, error: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE submissions
                 SET sync_status = 'failed', sync_attempts = sync_attempts + 1, sync_error = ?1
                 WHERE id = ?2",
                params![error, id.as_str()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(format!("submission {id}")));
        }
        Ok(())
    }

    async fn pending_push(
        &self,
        form_id: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        let sql = format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions
             WHERE form_id = ?1 AND remote_id IS NULL
               AND sync_status IN ('unsynced', 'failed') AND sync_attempts < ?2
             ORDER BY created_at ASC
             LIMIT ?3"
        );
        let mut rows = self
            .conn
            .query(
                &sql,
                params![form_id, i64::from(max_attempts), limit as i64],
            )
            .await?;
        let mut submissions = Vec::new();
        while let Some(row) = rows.next().await? {
            submissions.push(parse_submission(&row)?);
        }
        Ok(submissions)
    }

    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?1"
        );
        let mut rows = self.conn.query(&sql, [limit as i64]).await?;
        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(SyncConflict {
                id: row.get(0)?,
                submission_id: row.get(1)?,
                form_id: row.get(2)?,
                remote_id: row.get(3)?,
                local_updated_at: row.get(4)?,
                remote_updated_at: row.get(5)?,
                winner: ConflictWinner::parse(&row.get::<String>(6)?),
                resolved_at: row.get(7)?,
                strategy: row.get(8)?,
            });
        }
        Ok(conflicts)
    }
}

type LocationColumns = (Option<f64>, Option<f64>, Option<f64>, Option<f64>);

fn location_columns(location: Option<GeoPoint>) -> LocationColumns {
    location.map_or((None, None, None, None), |point| {
        (
            Some(point.latitude),
            Some(point.longitude),
            point.altitude,
            point.accuracy,
        )
    })
}

fn parse_submission(row: &Row) -> Result<Submission> {
    let id: String = row.get(0)?;
    let latitude: Option<f64> = row.get(5)?;
    let longitude: Option<f64> = row.get(6)?;
    let location = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint {
            latitude,
            longitude,
            altitude: row.get(7)?,
            accuracy: row.get(8)?,
        }),
        _ => None,
    };
    let answers: String = row.get(9)?;
    let status: String = row.get(10)?;

    Ok(Submission {
        id: id
            .parse()
            .map_err(|_| Error::Database(format!("invalid submission id `{id}`")))?,
        form_id: row.get(1)?,
        remote_id: row.get(2)?,
        remote_uuid: row.get(3)?,
        submitted_by: row.get(4)?,
        location,
        answers: serde_json::from_str(&answers)?,
        sync_status: status.parse().map_err(Error::Database)?,
        sync_attempts: u32::try_from(row.get::<i64>(11)?).unwrap_or(0),
        sync_error: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        remote_updated_at: row.get(15)?,
        last_synced_at: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn answers(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn incoming(remote_id: i64, updated_at: i64, species: &str) -> IncomingSubmission {
        IncomingSubmission {
            form_id: "aForm".to_string(),
            remote_id,
            remote_uuid: None,
            submitted_by: Some("ranger".to_string()),
            location: Some(GeoPoint::new(-1.28, 36.82).unwrap()),
            answers: answers(json!({"species": species})),
            submitted_at: updated_at,
            remote_updated_at: updated_at,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_and_get_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let submission = Submission::new(
            "aForm",
            answers(json!({"species": "lion", "animal_count": 2})),
            Some("ranger".to_string()),
            Some(GeoPoint::new(-1.5, 36.2).unwrap()),
        );
        repo.create(&submission).await.unwrap();

        let stored = repo.get(&submission.id).await.unwrap().unwrap();
        assert_eq!(stored, submission);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_is_idempotent_per_remote_id() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let first = repo.upsert_remote(&incoming(10, 1_000, "lion")).await.unwrap();
        let UpsertOutcome::Inserted(id) = first else {
            panic!("expected insert, got {first:?}");
        };
        let again = repo.upsert_remote(&incoming(10, 1_000, "lion")).await.unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged(id));
        assert_eq!(repo.count().await.unwrap(), 1);

        let edited = repo.upsert_remote(&incoming(10, 2_000, "leopard")).await.unwrap();
        assert_eq!(edited, UpsertOutcome::Updated(id));
        let stored = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.answers["species"], json!("leopard"));
        assert_eq!(stored.remote_id, Some(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_remote_edit_wins_conflict() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let UpsertOutcome::Inserted(id) = repo.upsert_remote(&incoming(5, 1_000, "lion")).await.unwrap() else {
            panic!("expected insert");
        };
        let patch = SubmissionPatch {
            answers: Some(answers(json!({"species": "hyena"}))),
            ..SubmissionPatch::default()
        };
        let edited = repo.update_local(&id, &patch).await.unwrap();
        assert_eq!(edited.sync_status, SyncStatus::Unsynced);

        let remote = incoming(5, edited.updated_at + 10_000, "elephant");
        let outcome = repo.upsert_remote(&remote).await.unwrap();
        let UpsertOutcome::Conflict(conflict) = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(conflict.winner, ConflictWinner::Remote);

        let stored = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.answers["species"], json!("elephant"));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(repo.list_conflicts(10).await.unwrap(), vec![conflict]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_local_edit_is_kept_and_marked_conflict() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let UpsertOutcome::Inserted(id) = repo.upsert_remote(&incoming(6, 1_000, "lion")).await.unwrap() else {
            panic!("expected insert");
        };
        let patch = SubmissionPatch {
            answers: Some(answers(json!({"species": "hyena"}))),
            ..SubmissionPatch::default()
        };
        let edited = repo.update_local(&id, &patch).await.unwrap();

        let remote = incoming(6, edited.updated_at - 1, "elephant");
        let outcome = repo.upsert_remote(&remote).await.unwrap();
        assert!(matches!(
            outcome,
            UpsertOutcome::Conflict(SyncConflict {
                winner: ConflictWinner::Local,
                ..
            })
        ));
        let stored = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.answers["species"], json!("hyena"));
        assert_eq!(stored.sync_status, SyncStatus::Conflict);

        // Same remote version again is not a second conflict
        assert_eq!(
            repo.upsert_remote(&remote).await.unwrap(),
            UpsertOutcome::Unchanged(id)
        );
        assert_eq!(repo.list_conflicts(10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pulled_copy_links_to_unsynced_local_record() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let local = Submission::new("aForm", answers(json!({"species": "lion"})), None, None);
        repo.create(&local).await.unwrap();
        assert_eq!(repo.pending_push("aForm", 3, 10).await.unwrap().len(), 1);

        let mut remote = incoming(42, 5_000, "lion");
        remote.remote_uuid = Some(local.id.to_string());
        assert_eq!(
            repo.upsert_remote(&remote).await.unwrap(),
            UpsertOutcome::Linked(local.id)
        );

        let stored = repo.get(&local.id).await.unwrap().unwrap();
        assert_eq!(stored.remote_id, Some(42));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(repo.pending_push("aForm", 3, 10).await.unwrap().is_empty());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_id_cannot_be_reassigned() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let local = Submission::new("aForm", answers(json!({"species": "lion"})), None, None);
        repo.create(&local).await.unwrap();
        repo.mark_synced(&local.id, 100).await.unwrap();
        repo.mark_synced(&local.id, 100).await.unwrap();
        assert!(repo.mark_synced(&local.id, 101).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_pushes_stop_after_max_attempts() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let local = Submission::new("aForm", answers(json!({"species": "lion"})), None, None);
        repo.create(&local).await.unwrap();
        repo.mark_failed(&local.id, "upstream down").await.unwrap();
        repo.mark_failed(&local.id, "upstream down").await.unwrap();

        let stored = repo.get(&local.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.sync_attempts, 2);
        assert_eq!(stored.sync_error.as_deref(), Some("upstream down"));
        assert_eq!(repo.pending_push("aForm", 3, 10).await.unwrap().len(), 1);
        assert!(repo.pending_push("aForm", 2, 10).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_filters_by_status_time_and_geography() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let points = [
            (1, -1.2921, 36.8219, 1_000), // Nairobi
            (2, -1.3733, 36.8580, 2_000), // ~10 km south
            (3, -3.3869, 36.6830, 3_000), // Arusha
        ];
        for (remote_id, latitude, longitude, at) in points {
            let mut record = incoming(remote_id, at, "lion");
            record.location = Some(GeoPoint::new(latitude, longitude).unwrap());
            repo.upsert_remote(&record).await.unwrap();
        }
        let local = Submission::new("aForm", answers(json!({"species": "lion"})), None, None);
        repo.create(&local).await.unwrap();

        let all = repo.query(&SubmissionQuery::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let unsynced = repo
            .query(&SubmissionQuery {
                status: Some(SyncStatus::Unsynced),
                ..SubmissionQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(unsynced.len(), 1);

        let window = repo
            .query(&SubmissionQuery {
                created_after: Some(1_500),
                created_before: Some(3_000),
                ..SubmissionQuery::default()
            })
            .await
            .unwrap();
        let remote_ids: Vec<_> = window.iter().filter_map(|s| s.remote_id).collect();
        assert_eq!(remote_ids, vec![3, 2]);

        let nearby = repo
            .query(&SubmissionQuery {
                near: Some((GeoPoint::new(-1.2921, 36.8219).unwrap(), 15.0)),
                ..SubmissionQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(nearby.len(), 2);

        let boxed = repo
            .query(&SubmissionQuery {
                bbox: Some(BoundingBox::new(-4.0, 36.0, -3.0, 37.0).unwrap()),
                ..SubmissionQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(boxed.len(), 1);
        assert_eq!(boxed[0].remote_id, Some(3));

        let paged = repo
            .query(&SubmissionQuery {
                limit: 2,
                offset: 1,
                ..SubmissionQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn radius_search_reaches_across_antimeridian() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlSubmissionRepository::new(db.connection());

        let points = [
            (1, -17.0, 179.95, 1_000),
            (2, -17.0, -179.95, 2_000),
            (3, -17.0, 178.0, 3_000),
        ];
        for (remote_id, latitude, longitude, at) in points {
            let mut record = incoming(remote_id, at, "dugong");
            record.location = Some(GeoPoint::new(latitude, longitude).unwrap());
            repo.upsert_remote(&record).await.unwrap();
        }

        let nearby = repo
            .query(&SubmissionQuery {
                near: Some((GeoPoint::new(-17.0, 179.95).unwrap(), 20.0)),
                ..SubmissionQuery::default()
            })
            .await
            .unwrap();
        let mut remote_ids: Vec<_> = nearby.iter().filter_map(|s| s.remote_id).collect();
        remote_ids.sort_unstable();
        assert_eq!(remote_ids, vec![1, 2]);
    }
}
