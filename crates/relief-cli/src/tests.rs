use std::path::{Path, PathBuf};

use pretty_assertions::assert_eq;
use relief_core::db::LocalEditContext;
use relief_core::models::{
    ChangeArchiveAction, IncidentDataSyncStats, LocalChange, PendingWorksite, WorksiteId,
};
use relief_core::services::DatabaseService;
use relief_core::{SyncSettings, Worksite};

use crate::commands::changes::{run_changes, run_retry};
use crate::commands::common::{
    change_status, change_to_item, format_change_lines, load_settings, open_database,
    pending_worksite_to_item, resolve_db_path, stats_to_item,
};
use crate::commands::incidents::{run_params, run_reset};
use crate::error::CliError;

fn temp_db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("relief.db")
}

async fn save_offline_worksite(db_path: &Path, name: &str) -> WorksiteId {
    let db = DatabaseService::open_path(db_path.to_path_buf()).await.unwrap();
    let mut worksite = Worksite::new(3, 29.95, -90.07);
    worksite.name = name.to_string();
    let context = LocalEditContext {
        organization_id: 5,
        app_version: 1,
        edited_at: 1_700_000_000_000,
    };
    db.save_worksite_change(None, &worksite, None, context)
        .await
        .unwrap()
        .unwrap()
        .worksite_id
}

fn change(save_attempt: i32, archive_action: ChangeArchiveAction) -> LocalChange {
    LocalChange {
        id: 7,
        app_version: 1,
        organization_id: 5,
        worksite_id: WorksiteId(2),
        sync_uuid: "uuid".to_string(),
        change_model_version: 1,
        change_data: String::new(),
        created_at: 1_700_000_000_000,
        save_attempt,
        save_attempt_at: 0,
        archive_action,
        last_error: Some("  HTTP 400: invalid phone ".to_string()),
    }
}

#[test]
fn resolve_db_path_prefers_explicit_path() {
    let explicit = PathBuf::from("/tmp/relief-test.db");
    assert_eq!(resolve_db_path(Some(explicit.clone())).unwrap(), explicit);
}

#[test]
fn load_settings_reads_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync-settings.json");
    std::fs::write(&path, r#"{ "max_sync_tries": 5 }"#).unwrap();
    assert_eq!(load_settings(Some(&path)).unwrap().max_sync_tries, 5);
    assert_eq!(load_settings(None).unwrap(), SyncSettings::default());
}

#[test]
fn load_settings_rejects_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync-settings.json");
    std::fs::write(&path, r#"{ "page_size": 0 }"#).unwrap();
    assert!(matches!(load_settings(Some(&path)), Err(CliError::Core(_))));
}

#[test]
fn change_status_reports_stalled_changes() {
    assert_eq!(change_status(&change(0, ChangeArchiveAction::Pending), 3), "pending");
    assert_eq!(change_status(&change(4, ChangeArchiveAction::Pending), 3), "stalled");
    assert_eq!(change_status(&change(4, ChangeArchiveAction::Synced), 3), "synced");
}

#[test]
fn change_lines_show_trimmed_error() {
    let item = change_to_item(&change(2, ChangeArchiveAction::Pending), 3);
    assert_eq!(item.last_error.as_deref(), Some("HTTP 400: invalid phone"));
    let lines = format_change_lines(&[item]);
    assert!(lines[0].ends_with("HTTP 400: invalid phone"));
}

#[test]
fn pending_item_reports_backoff_deadline() {
    let settings = SyncSettings {
        retry_delay_secs: 60,
        ..SyncSettings::default()
    };
    let mut pending = PendingWorksite {
        worksite_id: WorksiteId(4),
        network_id: -1,
        case_number: String::new(),
        pending_changes: 2,
        oldest_change_at: 1_700_000_000_000,
        last_attempt_at: 1_700_000_000_000,
        sync_attempt: 0,
    };
    let item = pending_worksite_to_item(&pending, &settings);
    assert_eq!(item.case_number, "(new)");
    assert_eq!(item.retry_after, "-");

    pending.sync_attempt = 2;
    let item = pending_worksite_to_item(&pending, &settings);
    assert!(item.retry_after.starts_with("2023-11-14T22:15:20"));
}

#[test]
fn stats_item_flags_outdated_build() {
    let settings = SyncSettings {
        data_build_version: 4,
        ..SyncSettings::default()
    };
    let stats = IncidentDataSyncStats::new(3, 1_000, 50, 2);
    assert!(stats_to_item(&stats, &settings, 2_000).is_outdated);
}

#[tokio::test]
async fn run_changes_requires_existing_worksite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = temp_db_path(&dir);
    let error = run_changes(99, false, &SyncSettings::default(), &db_path)
        .await
        .unwrap_err();
    assert!(matches!(error, CliError::WorksiteNotFound(99)));
}

#[tokio::test]
async fn run_retry_releases_stalled_change() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = temp_db_path(&dir);
    let worksite_id = save_offline_worksite(&db_path, "Rowan").await;

    let db = open_database(&db_path).await.unwrap();
    let change_id = db.get_ordered_changes(worksite_id).await.unwrap()[0].id;
    for attempt in 0..4 {
        db.record_change_attempt(change_id, false, Some("rejected"), attempt)
            .await
            .unwrap();
    }
    assert_eq!(db.stalled_changes(3).await.unwrap().len(), 1);

    run_retry(change_id, &db_path).await.unwrap();
    assert!(db.stalled_changes(3).await.unwrap().is_empty());

    assert!(matches!(
        run_retry(change_id + 100, &db_path).await.unwrap_err(),
        CliError::ChangeNotRetryable(_)
    ));
}

#[tokio::test]
async fn run_reset_keeps_worksites_with_pending_changes() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = temp_db_path(&dir);
    save_offline_worksite(&db_path, "Sawyer").await;

    run_reset(3, &db_path).await.unwrap();

    let db = open_database(&db_path).await.unwrap();
    assert_eq!(db.count_incident_worksites(3).await.unwrap(), 1);
    run_params(Some(3), true, &db_path).await.unwrap();
}
