use clap::Parser;
use serde_json::Map;
use wildwatch_core::models::{
    ConflictWinner, GeoPoint, RunStatus, SyncConflict, SyncCounts, SyncCursor, SyncRun,
    SyncStatus,
};
use wildwatch_core::Submission;

use crate::cli::{Cli, Commands, CompletionShell};
use crate::commands::common::{
    format_conflict_lines, format_cursor, format_relative_time, format_run_line,
    format_submission_lines, normalize_form_id, open_database,
};
use crate::commands::completions::render_completions;
use crate::commands::submissions::build_query;
use crate::error::CliError;

#[test]
fn parses_sync_subcommand_with_flags() {
    let cli = Cli::try_parse_from(["wildwatch", "sync", "aWildlife001", "--full"]).unwrap();
    match cli.command {
        Commands::Sync { form, full, json } => {
            assert_eq!(form, "aWildlife001");
            assert!(full);
            assert!(!json);
        }
        _ => panic!("expected sync command"),
    }
}

#[test]
fn db_path_is_global() {
    let cli = Cli::try_parse_from(["wildwatch", "conflicts", "--db-path", "/tmp/w.db"]).unwrap();
    assert_eq!(cli.db_path.unwrap().to_string_lossy(), "/tmp/w.db");
}

#[test]
fn normalize_form_id_rejects_blank() {
    assert!(matches!(normalize_form_id("  "), Err(CliError::EmptyFormId)));
    assert_eq!(normalize_form_id(" aForm ").unwrap(), "aForm");
}

#[test]
fn build_query_parses_status_and_form() {
    let query = build_query(Some(" aForm "), Some("failed"), 5).unwrap();
    assert_eq!(query.form_id.as_deref(), Some("aForm"));
    assert_eq!(query.status, Some(SyncStatus::Failed));
    assert_eq!(query.limit, 5);

    let err = build_query(None, Some("lost"), 5).unwrap_err();
    assert!(err.to_string().contains("unknown sync status"));
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn submission_lines_show_status_and_location() {
    let mut submission = Submission::new(
        "aForm",
        Map::new(),
        Some("ranger".to_string()),
        GeoPoint::new(-1.292_07, 36.821_95).ok(),
    );
    submission.remote_id = Some(42);
    submission.sync_status = SyncStatus::Synced;

    let lines = format_submission_lines(&[submission.clone()], submission.created_at);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with(&submission.id.to_string()));
    assert!(lines[0].contains("synced"));
    assert!(lines[0].contains("remote=42"));
    assert!(lines[0].contains("-1.29207,36.82195"));
    assert!(lines[0].ends_with("ranger"));
}

#[test]
fn conflict_lines_name_the_winner() {
    let conflict = SyncConflict {
        id: 1,
        submission_id: "0190e0a0-0000-7000-8000-000000000001".to_string(),
        form_id: "aForm".to_string(),
        remote_id: 9,
        local_updated_at: 1_000,
        remote_updated_at: 2_000,
        winner: ConflictWinner::Remote,
        resolved_at: 1_705_320_000_000,
        strategy: "lww".to_string(),
    };
    let lines = format_conflict_lines(&[conflict]);
    assert!(lines[0].starts_with("2024-01-15 12:00:00 UTC"));
    assert!(lines[0].contains("winner=remote"));
    assert!(lines[0].contains("local=1000 incoming=2000"));
}

#[test]
fn cursor_and_run_formatting() {
    assert_eq!(
        format_cursor(&SyncCursor::start("aForm")),
        "aForm: nothing pulled yet"
    );

    let cursor = SyncCursor {
        last_submission_time: 1_705_320_000_000,
        last_remote_id: 7,
        last_edited_at: 1_705_406_400_000,
        last_edited_remote_id: 3,
        updated_at: 1_705_406_401_000,
        ..SyncCursor::start("aForm")
    };
    assert_eq!(
        format_cursor(&cursor),
        "aForm: last submission 2024-01-15 12:00:00 UTC (remote id 7), \
         last edit 2024-01-16 12:00:00 UTC (remote id 3), \
         advanced 2024-01-16 12:00:01 UTC"
    );

    let run = SyncRun {
        id: 3,
        form_id: "aForm".to_string(),
        status: RunStatus::Partial,
        counts: SyncCounts {
            fetched: 4,
            inserted: 3,
            push_failed: 1,
            ..SyncCounts::default()
        },
        error: None,
        started_at: 1_705_320_000_000,
        completed_at: 1_705_320_001_000,
    };
    let line = format_run_line(&run);
    assert!(line.contains("partial"));
    assert!(line.contains("fetched=4 inserted=3"));
    assert!(line.contains("push_failed=1"));
    assert!(line.contains("skipped=0"));
}

#[test]
fn cursor_subcommand_form_is_optional() {
    let cli = Cli::try_parse_from(["wildwatch", "cursor"]).unwrap();
    assert!(matches!(cli.command, Commands::Cursor { form: None }));

    let cli = Cli::try_parse_from(["wildwatch", "cursor", "aForm"]).unwrap();
    assert!(matches!(cli.command, Commands::Cursor { form: Some(ref form) } if form == "aForm"));
}

#[test]
fn completions_use_binary_name() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("wildwatch"));
}

#[tokio::test(flavor = "multi_thread")]
async fn open_database_honors_db_path_override() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cli").join("wildwatch.db");

    let db = open_database(Some(&path)).await.unwrap();
    db.ping().await.unwrap();
    assert!(path.exists());
    assert_eq!(db.count_submissions().await.unwrap(), 0);
}
