//! Database connection management

use crate::config::DatabaseConfig;
use crate::error::Result;
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;

use super::migrations;

/// Database wrapper for libSQL connections
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
    remote: bool,
}

impl Database {
    /// Open the database described by `config`.
    pub async fn open_config(config: &DatabaseConfig) -> Result<Self> {
        match config {
            DatabaseConfig::Local { path } => Self::open(path).await,
            DatabaseConfig::Remote { url, auth_token } => {
                Self::open_remote(url.clone(), auth_token.clone()).await
            }
        }
    }

    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        let database = Self {
            _db: db,
            conn,
            remote: false,
        };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    /// Connect to a remote libSQL server. Every statement goes over the network.
    pub async fn open_remote(url: String, auth_token: String) -> Result<Self> {
        tracing::info!(%url, "Connecting to remote libSQL database");
        let db = Builder::new_remote(url, auth_token).build().await?;
        let conn = db.connect()?;

        let database = Self {
            _db: db,
            conn,
            remote: true,
        };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Configure `SQLite` pragmas
    async fn configure(&self) -> Result<()> {
        if !self.remote {
            // Not supported for in-memory databases; ignore
            self.conn
                .execute("PRAGMA journal_mode = WAL;", ())
                .await
                .ok();
            self.conn
                .execute("PRAGMA synchronous = NORMAL;", ())
                .await
                .ok();
            self.conn
                .execute("PRAGMA busy_timeout = 5000;", ())
                .await
                .ok();
        }
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Whether this database lives on a remote server
    pub const fn is_remote(&self) -> bool {
        self.remote
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}
