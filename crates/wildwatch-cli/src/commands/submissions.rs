use std::path::Path;

use wildwatch_core::db::SubmissionQuery;
use wildwatch_core::models::SyncStatus;
use wildwatch_core::util::now_millis;

use crate::commands::common::{format_submission_lines, open_database};
use crate::error::CliError;

pub fn build_query(
    form: Option<&str>,
    status: Option<&str>,
    limit: usize,
) -> Result<SubmissionQuery, CliError> {
    let status = status
        .map(str::parse::<SyncStatus>)
        .transpose()
        .map_err(CliError::InvalidStatus)?;
    Ok(SubmissionQuery {
        form_id: form
            .map(str::trim)
            .filter(|form| !form.is_empty())
            .map(str::to_string),
        status,
        limit: limit.max(1),
        ..SubmissionQuery::default()
    })
}

pub async fn run_submissions(
    form: Option<&str>,
    status: Option<&str>,
    limit: usize,
    as_json: bool,
    db_path: Option<&Path>,
) -> Result<(), CliError> {
    let query = build_query(form, status, limit)?;
    let db = open_database(db_path).await?;
    let submissions = db.query_submissions(&query).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&submissions)?);
        return Ok(());
    }

    if submissions.is_empty() {
        println!("No submissions found.");
        return Ok(());
    }
    for line in format_submission_lines(&submissions, now_millis()) {
        println!("{line}");
    }
    Ok(())
}
