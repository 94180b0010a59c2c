use std::path::Path;
use std::sync::Arc;

use wildwatch_core::config::{CoreConfig, DatabaseConfig};
use wildwatch_core::kobo::KoboClient;
use wildwatch_core::models::{FormDefinition, SyncConflict, SyncCursor, SyncRun};
use wildwatch_core::services::DatabaseService;
use wildwatch_core::sync::{SyncCoordinator, SyncOptions};
use wildwatch_core::Submission;

use crate::error::CliError;

/// Open the database named by `--db-path`, or by `DATABASE_URL` otherwise.
pub async fn open_database(db_path: Option<&Path>) -> Result<DatabaseService, CliError> {
    let config = match db_path {
        Some(path) => DatabaseConfig::Local {
            path: path.to_string_lossy().to_string(),
        },
        None => DatabaseConfig::from_env()?,
    };
    Ok(DatabaseService::open(&config).await?)
}

/// Everything a command talking to Kobo needs.
pub struct SyncContext {
    pub db: DatabaseService,
    pub kobo: Arc<KoboClient>,
    pub coordinator: SyncCoordinator,
}

pub async fn open_sync_context(db_path: Option<&Path>) -> Result<SyncContext, CliError> {
    let config = CoreConfig::from_env()?;
    let db = match db_path {
        Some(_) => open_database(db_path).await?,
        None => DatabaseService::open(&config.database).await?,
    };
    let kobo = Arc::new(KoboClient::new(config.kobo)?);
    let coordinator = SyncCoordinator::new(
        kobo.clone(),
        Arc::new(db.clone()),
        SyncOptions {
            page_size: config.sync.page_size,
            max_push_attempts: config.sync.max_push_attempts,
        },
    );
    Ok(SyncContext {
        db,
        kobo,
        coordinator,
    })
}

pub fn normalize_form_id(form_id: &str) -> Result<String, CliError> {
    let trimmed = form_id.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyFormId);
    }
    Ok(trimmed.to_string())
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn format_form_lines(forms: &[FormDefinition]) -> Vec<String> {
    forms
        .iter()
        .map(|form| {
            format!(
                "{:<24}  {:>3} questions  {}  {}",
                form.form_id,
                form.questions.len(),
                if form.deployment_active {
                    "deployed"
                } else {
                    "draft   "
                },
                form.title
            )
        })
        .collect()
}

pub fn format_submission_lines(submissions: &[Submission], now_ms: i64) -> Vec<String> {
    submissions
        .iter()
        .map(|submission| {
            let location = submission.location.map_or_else(
                || "-".to_string(),
                |point| format!("{:.5},{:.5}", point.latitude, point.longitude),
            );
            let remote = submission
                .remote_id
                .map_or_else(|| "-".to_string(), |id| id.to_string());
            format!(
                "{}  {:<8}  {:<8}  remote={}  at={}  {}",
                submission.id,
                submission.sync_status,
                format_relative_time(submission.created_at, now_ms),
                remote,
                location,
                submission.submitted_by.as_deref().unwrap_or("unknown")
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<4}  winner={:<6}  form={}  submission={}  remote={}  local={} incoming={}",
                format_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.winner.as_str(),
                conflict.form_id,
                conflict.submission_id,
                conflict.remote_id,
                conflict.local_updated_at,
                conflict.remote_updated_at
            )
        })
        .collect()
}

pub fn format_cursor(cursor: &SyncCursor) -> String {
    if cursor.updated_at == 0 {
        return format!("{}: nothing pulled yet", cursor.form_id);
    }
    let mut line = format!(
        "{}: last submission {} (remote id {})",
        cursor.form_id,
        format_timestamp(cursor.last_submission_time),
        cursor.last_remote_id,
    );
    if cursor.last_edited_at > 0 {
        line.push_str(&format!(
            ", last edit {} (remote id {})",
            format_timestamp(cursor.last_edited_at),
            cursor.last_edited_remote_id
        ));
    }
    line.push_str(&format!(", advanced {}", format_timestamp(cursor.updated_at)));
    line

}

pub fn format_run_line(run: &SyncRun) -> String {
    let counts = run.counts;
    let mut line = format!(
        "{}  {:<9}  fetched={} inserted={} updated={} unchanged={} skipped={} conflicts={} pushed={} push_failed={}",
        format_timestamp(run.started_at),
        run.status,
        counts.fetched,
        counts.inserted,
        counts.updated,
        counts.unchanged,
        counts.skipped,
        counts.conflicts,
        counts.pushed,
        counts.push_failed
    );
    if let Some(error) = &run.error {
        line.push_str("  error=");
        line.push_str(error);
    }
    line
}
