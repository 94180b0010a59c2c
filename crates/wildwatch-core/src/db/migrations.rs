//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run `statements` in one transaction, rolling back on the first failure.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: Initial schema
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Cached remote form definitions
        "CREATE TABLE IF NOT EXISTS forms (
            form_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            title TEXT NOT NULL,
            version TEXT,
            deployment_active INTEGER NOT NULL DEFAULT 0,
            definition TEXT NOT NULL,
            cached_at INTEGER NOT NULL
        )",
        // Incident submissions
        "CREATE TABLE IF NOT EXISTS submissions (
            id TEXT PRIMARY KEY,
            form_id TEXT NOT NULL,
            remote_id INTEGER,
            remote_uuid TEXT,
            submitted_by TEXT,
            latitude REAL,
            longitude REAL,
            altitude REAL,
            accuracy REAL,
            answers TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'unsynced',
            sync_attempts INTEGER NOT NULL DEFAULT 0,
            sync_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            remote_updated_at INTEGER,
            last_synced_at INTEGER
        )",
        // One local row per remote submission; NULL remote ids do not collide
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_submissions_remote
            ON submissions(form_id, remote_id)",
        "CREATE INDEX IF NOT EXISTS idx_submissions_form_created
            ON submissions(form_id, created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_submissions_created ON submissions(created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(sync_status)",
        "CREATE INDEX IF NOT EXISTS idx_submissions_location ON submissions(latitude, longitude)",
        // Per-form pull watermark
        "CREATE TABLE IF NOT EXISTS sync_cursors (
            form_id TEXT PRIMARY KEY,
            last_submission_time INTEGER NOT NULL DEFAULT 0,
            last_remote_id INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            submission_id TEXT NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
            form_id TEXT NOT NULL,
            remote_id INTEGER NOT NULL,
            local_updated_at INTEGER NOT NULL,
            remote_updated_at INTEGER NOT NULL,
            winner TEXT NOT NULL,
            strategy TEXT NOT NULL DEFAULT 'lww',
            resolved_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_submission
            ON sync_conflicts(submission_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at
            ON sync_conflicts(resolved_at DESC)",
        "CREATE TABLE IF NOT EXISTS sync_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            form_id TEXT NOT NULL,
            status TEXT NOT NULL,
            fetched INTEGER NOT NULL DEFAULT 0,
            inserted INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            unchanged INTEGER NOT NULL DEFAULT 0,
            conflicts INTEGER NOT NULL DEFAULT 0,
            pushed INTEGER NOT NULL DEFAULT 0,
            push_failed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_runs_form ON sync_runs(form_id, started_at DESC)",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: remote edit watermark and skipped-record counts
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "ALTER TABLE sync_cursors ADD COLUMN last_edited_at INTEGER NOT NULL DEFAULT 0",
        "ALTER TABLE sync_cursors ADD COLUMN last_edited_remote_id INTEGER NOT NULL DEFAULT 0",
        "ALTER TABLE sync_runs ADD COLUMN skipped INTEGER NOT NULL DEFAULT 0",
    ];

    apply(conn, 2, &statements).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn memory_connection() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn migrations_are_idempotent() {
        let conn = memory_connection().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();
        assert_eq!(get_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_id_is_unique_per_form() {
        let conn = memory_connection().await;
        run(&conn).await.unwrap();

        let insert = "INSERT INTO submissions (id, form_id, remote_id, answers, created_at, updated_at)
                      VALUES (?1, ?2, ?3, '{}', 0, 0)";
        conn.execute(insert, libsql::params!["a", "form", 7])
            .await
            .unwrap();
        conn.execute(insert, libsql::params!["b", "other", 7])
            .await
            .unwrap();
        assert!(conn
            .execute(insert, libsql::params!["c", "form", 7])
            .await
            .is_err());

        // Unsynced rows carry no remote id and never collide
        let unsynced = "INSERT INTO submissions (id, form_id, answers, created_at, updated_at)
                        VALUES (?1, 'form', '{}', 0, 0)";
        conn.execute(unsynced, ["d"]).await.unwrap();
        conn.execute(unsynced, ["e"]).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn v1_database_upgrades_in_place() {
        let conn = memory_connection().await;
        migrate_v1(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO sync_cursors (form_id, last_submission_time, last_remote_id, updated_at)
             VALUES ('form', 1000, 7, 0)",
            (),
        )
        .await
        .unwrap();

        run(&conn).await.unwrap();
        assert_eq!(get_version(&conn).await.unwrap(), 2);

        let mut rows = conn
            .query(
                "SELECT last_remote_id, last_edited_at FROM sync_cursors WHERE form_id = 'form'",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
        assert_eq!(row.get::<i64>(1).unwrap(), 0);
    }
}
