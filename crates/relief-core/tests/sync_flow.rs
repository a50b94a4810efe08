//! End-to-end sync flows against the in-memory server

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relief_core::db::LocalEditContext;
use relief_core::services::DatabaseService;
use relief_core::sync::fake::{FakeAccount, FakeConnectivity, FakeNetwork};
use relief_core::sync::{
    CancellationSignal, MergeOutcome, PassEnd, RefreshOutcome, SyncOrchestrator,
    WorksiteSyncOutcome, WorksiteSyncStatus,
};
use relief_core::{SyncSettings, Worksite, WorksiteId};

const INCIDENT_ID: i64 = 42;

struct Client {
    db: DatabaseService,
    server: Arc<FakeNetwork>,
    orchestrator: SyncOrchestrator,
}

async fn client(settings: SyncSettings) -> Client {
    let db = DatabaseService::open_in_memory().await.unwrap();
    let server = Arc::new(FakeNetwork::new());
    let orchestrator = SyncOrchestrator::new(
        db.clone(),
        server.clone(),
        Arc::new(FakeAccount::signed_in()),
        Arc::new(FakeConnectivity::online()),
        settings,
    );
    Client {
        db,
        server,
        orchestrator,
    }
}

const fn edit_context(edited_at: i64) -> LocalEditContext {
    LocalEditContext {
        organization_id: 5,
        app_version: 3,
        edited_at,
    }
}

/// Publish a worksite as another client would; returns its network id
fn publish(server: &FakeNetwork, name: &str) -> i64 {
    let mut worksite = Worksite::new(INCIDENT_ID, 35.0, -80.0);
    worksite.name = name.to_string();
    worksite.case_number = format!("S-{name}");
    server.insert_worksite(worksite)
}

fn rename_on_server(server: &FakeNetwork, network_id: i64, name: &str) {
    server.edit_worksite(network_id, |worksite| worksite.name = name.to_string());
}

async fn rename_locally(db: &DatabaseService, id: WorksiteId, name: &str) {
    let start = db.get_worksite(id).await.unwrap().unwrap().worksite;
    let mut change = start.clone();
    change.name = name.to_string();
    db.save_worksite_change(Some(&start), &change, None, edit_context(9_000))
        .await
        .unwrap()
        .unwrap();
}

async fn create_offline(db: &DatabaseService, name: &str) -> WorksiteId {
    let mut worksite = Worksite::new(INCIDENT_ID, 35.2, -80.8);
    worksite.name = name.to_string();
    worksite.address = "12 Levee Rd".to_string();
    db.save_worksite_change(None, &worksite, None, edit_context(8_000))
        .await
        .unwrap()
        .unwrap()
        .worksite_id
}

async fn local_name(db: &DatabaseService, network_id: i64) -> String {
    db.get_worksite_by_network_id(network_id)
        .await
        .unwrap()
        .unwrap()
        .worksite
        .name
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_worksite_uploads_and_receives_server_edits() {
    let c = client(SyncSettings::default()).await;
    let id = create_offline(&c.db, "Morgan").await;

    let status = c.orchestrator.sync_worksite(id).await.unwrap();
    let WorksiteSyncStatus::Completed(WorksiteSyncOutcome::Uploaded(summary)) = status else {
        panic!("expected upload, got {status:?}");
    };
    assert!(summary.is_fully_synced);
    assert_eq!(summary.synced, 1);

    let root = c.db.get_worksite_root(id).await.unwrap().unwrap();
    assert_eq!(root.network_id, summary.network_id);
    assert!(!root.is_local_modified);
    assert!(c.db.get_ordered_changes(id).await.unwrap().is_empty());
    assert_eq!(
        c.db.get_worksite(id).await.unwrap().unwrap().worksite.case_number,
        format!("V{}", root.network_id)
    );

    rename_on_server(&c.server, root.network_id, "Morgan Ellis");
    let outcome = c
        .orchestrator
        .refresh_worksites(INCIDENT_ID, true, &CancellationSignal::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RefreshOutcome::Pulled(_)));
    assert_eq!(local_name(&c.db, root.network_id).await, "Morgan Ellis");
    assert_eq!(c.db.count_incident_worksites(INCIDENT_ID).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn local_edits_survive_pulls_until_uploaded() {
    let c = client(SyncSettings::default()).await;
    let first = publish(&c.server, "Harper");
    let second = publish(&c.server, "Jules");
    c.orchestrator
        .refresh_worksites(INCIDENT_ID, false, &CancellationSignal::new())
        .await
        .unwrap();

    let local_id = c
        .db
        .get_worksite_by_network_id(first)
        .await
        .unwrap()
        .unwrap()
        .root
        .id;
    rename_locally(&c.db, local_id, "Harper (gate code 1234)").await;

    rename_on_server(&c.server, first, "Harper Quinn");
    rename_on_server(&c.server, second, "Jules Moreau");
    let outcome = c
        .orchestrator
        .refresh_worksites(INCIDENT_ID, true, &CancellationSignal::new())
        .await
        .unwrap();
    let RefreshOutcome::Pulled(summary) = outcome else {
        panic!("expected pull, got {outcome:?}");
    };
    assert!(summary.skipped_locally_modified >= 1);
    assert!(summary.written >= 1);
    assert_eq!(local_name(&c.db, first).await, "Harper (gate code 1234)");
    assert_eq!(local_name(&c.db, second).await, "Jules Moreau");

    let status = c.orchestrator.sync_worksite(local_id).await.unwrap();
    assert!(matches!(status, WorksiteSyncStatus::Completed(_)));
    assert_eq!(
        c.server.server_worksite(first).unwrap().name,
        "Harper (gate code 1234)"
    );
    let request = c.server.requests().pop().unwrap();
    assert_eq!(request.worksite_network_id, first);
    assert_eq!(request.changes.len(), 1);
    assert!(request.reference_change.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn synced_worksite_takes_newer_snapshot() {
    let c = client(SyncSettings::default()).await;
    let network_id = publish(&c.server, "Rory");
    let snapshot = c.server.server_worksite(network_id).unwrap();

    let outcomes = c
        .db
        .sync_network_worksites(&[snapshot.clone()], 1_000, false)
        .await
        .unwrap();
    let MergeOutcome::Inserted(id) = outcomes[0] else {
        panic!("expected insert, got {outcomes:?}");
    };

    rename_on_server(&c.server, network_id, "Rory Vance");
    let newer = c.server.server_worksite(network_id).unwrap();
    for _ in 0..2 {
        let outcomes = c
            .db
            .sync_network_worksites(&[newer.clone()], 2_000, false)
            .await
            .unwrap();
        assert_eq!(outcomes, vec![MergeOutcome::Updated(id)]);
    }

    let root = c.db.get_worksite_root(id).await.unwrap().unwrap();
    assert_eq!(root.synced_at, 2_000);
    assert_eq!(root.sync_attempt, 0);
    assert!(!root.is_local_modified);
    assert_eq!(local_name(&c.db, network_id).await, "Rory Vance");
    assert_eq!(c.db.count_incident_worksites(INCIDENT_ID).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_cursors_only_move_forward() {
    let settings = SyncSettings {
        page_size: 2,
        ..SyncSettings::default()
    };
    let c = client(settings).await;
    for name in ["Ash", "Bay", "Cove"] {
        publish(&c.server, name);
    }
    c.orchestrator
        .refresh_worksites(INCIDENT_ID, false, &CancellationSignal::new())
        .await
        .unwrap();
    let first = c.db.get_sync_parameters(INCIDENT_ID).await.unwrap().unwrap();
    assert!(first.core.is_backfilled());

    let newest = publish(&c.server, "Dune");
    let stamp = c.server.server_worksite(newest).unwrap().updated_at.unwrap();
    c.orchestrator
        .refresh_worksites(INCIDENT_ID, true, &CancellationSignal::new())
        .await
        .unwrap();
    let second = c.db.get_sync_parameters(INCIDENT_ID).await.unwrap().unwrap();

    assert!(second.core.after > first.core.after);
    assert_eq!(second.core.after, stamp);
    assert_eq!(second.additional.after, stamp);
    assert!(second.core.is_backfilled());
    assert_eq!(c.db.count_incident_worksites(INCIDENT_ID).await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_connection_leaves_change_log_untouched() {
    let c = client(SyncSettings::default()).await;
    let id = create_offline(&c.db, "Ellis").await;
    c.server.set_offline(true);

    let status = c.orchestrator.sync_worksite(id).await.unwrap();
    assert!(matches!(status, WorksiteSyncStatus::FailedRetryLater(_)));

    let changes = c.db.get_ordered_changes(id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].save_attempt, 0);
    let root = c.db.get_worksite_root(id).await.unwrap().unwrap();
    assert!(root.is_local_modified);
    assert_eq!(root.sync_attempt, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_pass_uploads_every_worksite() {
    let c = client(SyncSettings::default()).await;
    create_offline(&c.db, "Finley").await;
    create_offline(&c.db, "Greer").await;

    let summary = c
        .orchestrator
        .sync_pending_worksites(&CancellationSignal::new())
        .await
        .unwrap();
    assert_eq!(summary.synced, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.end, PassEnd::Completed);
    assert!(c
        .db
        .worksites_pending_sync(10, c.orchestrator.settings().max_sync_tries)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(c.server.requests().len(), 2);
}
