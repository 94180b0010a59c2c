//! Cache of parsed remote form definitions

use libsql::{params, Connection};

use crate::error::Result;
use crate::models::FormDefinition;

/// Trait for form cache operations (async)
#[allow(async_fn_in_trait)]
pub trait FormRepository {
    /// Insert or replace a cached form
    async fn save(&self, form: &FormDefinition) -> Result<()>;

    /// Get a cached form by remote uid
    async fn get(&self, form_id: &str) -> Result<Option<FormDefinition>>;

    /// All cached forms ordered by title
    async fn list(&self) -> Result<Vec<FormDefinition>>;

    /// Number of cached forms
    async fn count(&self) -> Result<i64>;
}

/// libSQL implementation of `FormRepository`
pub struct LibSqlFormRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlFormRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl FormRepository for LibSqlFormRepository<'_> {
    async fn save(&self, form: &FormDefinition) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO forms (form_id, name, title, version, deployment_active, definition, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(form_id) DO UPDATE SET
                    name = excluded.name,
                    title = excluded.title,
                    version = excluded.version,
                    deployment_active = excluded.deployment_active,
                    definition = excluded.definition,
                    cached_at = excluded.cached_at",
                params![
                    form.form_id.clone(),
                    form.name.clone(),
                    form.title.clone(),
                    form.version.clone(),
                    i64::from(form.deployment_active),
                    serde_json::to_string(form)?,
                    form.cached_at
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, form_id: &str) -> Result<Option<FormDefinition>> {
        let mut rows = self
            .conn
            .query("SELECT definition FROM forms WHERE form_id = ?1", [form_id])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(serde_json::from_str(&row.get::<String>(0)?)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<FormDefinition>> {
        let mut rows = self
            .conn
            .query("SELECT definition FROM forms ORDER BY title COLLATE NOCASE", ())
            .await?;
        let mut forms = Vec::new();
        while let Some(row) = rows.next().await? {
            forms.push(serde_json::from_str(&row.get::<String>(0)?)?);
        }
        Ok(forms)
    }

    async fn count(&self) -> Result<i64> {
        let mut rows = self.conn.query("SELECT COUNT(*) FROM forms", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}
