use std::path::Path;

use tokio_util::sync::CancellationToken;
use wildwatch_core::forms::parse_form;
use wildwatch_core::kobo::FormGateway;
use wildwatch_core::models::RunStatus;
use wildwatch_core::sync::SyncMode;

use crate::commands::common::{
    format_conflict_lines, format_cursor, format_run_line, normalize_form_id, open_database,
    open_sync_context,
};
use crate::error::CliError;

const RECENT_RUNS: usize = 5;

pub async fn run_sync(
    form: &str,
    full: bool,
    as_json: bool,
    db_path: Option<&Path>,
) -> Result<(), CliError> {
    let form_id = normalize_form_id(form)?;
    let context = open_sync_context(db_path).await?;

    // Cache the definition so pulled answers are normalized against it
    if context.db.cached_form(&form_id).await?.is_none() {
        let asset = context
            .kobo
            .get_form(&form_id)
            .await?
            .ok_or_else(|| CliError::FormNotFound(form_id.clone()))?;
        context.db.save_form(&parse_form(&asset)?).await?;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; stopping after the current page");
            on_interrupt.cancel();
        }
    });

    let mode = if full {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    };
    let report = context.coordinator.run(&form_id, mode, &cancel).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", format_run_line(&report.run));
        println!("{}", format_cursor(&report.cursor));
        for line in format_conflict_lines(&report.conflicts) {
            println!("{line}");
        }
    }

    match report.run.status {
        RunStatus::Success => Ok(()),
        status => Err(CliError::SyncIncomplete(form_id, status.to_string())),
    }
}

pub async fn run_cursor(form: Option<&str>, db_path: Option<&Path>) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let Some(form) = form else {
        let cursors = db.list_cursors().await?;
        if cursors.is_empty() {
            println!("No forms have been synced yet.");
        }
        for cursor in &cursors {
            println!("{}", format_cursor(cursor));
        }
        return Ok(());
    };
    let form_id = normalize_form_id(form)?;

    println!("{}", format_cursor(&db.cursor(&form_id).await?));
    let runs = db.recent_runs(&form_id, RECENT_RUNS).await?;
    if runs.is_empty() {
        println!("No sync runs recorded.");
    }
    for run in &runs {
        println!("{}", format_run_line(run));
    }
    Ok(())
}

pub async fn run_conflicts(
    limit: usize,
    as_json: bool,
    db_path: Option<&Path>,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let conflicts = db.list_conflicts(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
