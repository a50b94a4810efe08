//! Upload planning over a stored change log

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relief_core::db::LocalEditContext;
use relief_core::services::DatabaseService;
use relief_core::sync::fake::{FakeAccount, FakeNetwork};
use relief_core::sync::{
    plan_change_sync, AccountDataSource, ChangeSyncPlan, WorksiteChangeSyncer, WorksiteSyncOutcome,
};
use relief_core::{SyncSettings, Worksite, WorksiteId};

const INCIDENT_ID: i64 = 42;

const fn edit_context(edited_at: i64) -> LocalEditContext {
    LocalEditContext {
        organization_id: 5,
        app_version: 3,
        edited_at,
    }
}

async fn rename_locally(db: &DatabaseService, id: WorksiteId, name: &str, edited_at: i64) -> i64 {
    let start = db.get_worksite(id).await.unwrap().unwrap().worksite;
    let mut change = start.clone();
    change.name = name.to_string();
    db.save_worksite_change(Some(&start), &change, None, edit_context(edited_at))
        .await
        .unwrap()
        .unwrap()
        .change_id
}

#[tokio::test(flavor = "multi_thread")]
async fn archived_middle_change_becomes_reference() {
    let db = DatabaseService::open_in_memory().await.unwrap();
    let mut worksite = Worksite::new(INCIDENT_ID, 35.0, -80.0);
    worksite.name = "Lane".to_string();
    let id = db
        .save_worksite_change(None, &worksite, None, edit_context(1_000))
        .await
        .unwrap()
        .unwrap()
        .worksite_id;
    rename_locally(&db, id, "Lane Ortiz", 1_100).await;
    rename_locally(&db, id, "Lane Ortiz-Park", 1_200).await;

    let changes = db.get_ordered_changes(id).await.unwrap();
    assert_eq!(changes.len(), 3);
    assert!(db
        .record_change_attempt(changes[1].id, true, None, 2_000)
        .await
        .unwrap());

    let changes = db.get_ordered_changes(id).await.unwrap();
    assert_eq!(
        plan_change_sync(&changes),
        Some(ChangeSyncPlan {
            starting_sync_index: 2,
            reference_index: Some(1),
            has_prior_unsynced_changes: false,
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fully_archived_log_has_nothing_to_plan() {
    let db = DatabaseService::open_in_memory().await.unwrap();
    let worksite = Worksite::new(INCIDENT_ID, 35.0, -80.0);
    let saved = db
        .save_worksite_change(None, &worksite, None, edit_context(1_000))
        .await
        .unwrap()
        .unwrap();
    db.record_change_attempt(saved.change_id, true, None, 2_000)
        .await
        .unwrap();

    let changes = db.get_ordered_changes(saved.worksite_id).await.unwrap();
    assert_eq!(plan_change_sync(&changes), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_change_is_superseded_by_later_upload() {
    let db = DatabaseService::open_in_memory().await.unwrap();
    let server = Arc::new(FakeNetwork::new());
    let settings = SyncSettings::default();
    let mut worksite = Worksite::new(INCIDENT_ID, 35.0, -80.0);
    worksite.name = "Quill".to_string();
    let saved = db
        .save_worksite_change(None, &worksite, None, edit_context(1_000))
        .await
        .unwrap()
        .unwrap();
    for attempt in 0..=settings.max_sync_tries {
        db.record_change_attempt(saved.change_id, false, Some("HTTP 422"), i64::from(attempt))
            .await
            .unwrap();
    }
    rename_locally(&db, saved.worksite_id, "Quill Ames", 1_100).await;

    let account = FakeAccount::signed_in().account().await.unwrap();
    let syncer = WorksiteChangeSyncer::new(db.clone(), server.clone(), settings);
    let outcome = syncer.sync_worksite(saved.worksite_id, &account).await.unwrap();
    assert!(matches!(
        outcome,
        WorksiteSyncOutcome::Uploaded(summary) if summary.is_fully_synced
    ));

    let root = db.get_worksite_root(saved.worksite_id).await.unwrap().unwrap();
    assert!(!root.is_local_modified);
    assert_eq!(server.server_worksite(root.network_id).unwrap().name, "Quill Ames");
    assert!(db.get_ordered_changes(saved.worksite_id).await.unwrap().is_empty());
    assert_eq!(
        syncer.sync_worksite(saved.worksite_id, &account).await.unwrap(),
        WorksiteSyncOutcome::NothingToSync
    );
}
