//! Uploading a worksite's change log.
//!
//! A pass submits every unarchived change after the newest archived one,
//! together with the newest synced change before them as the diff baseline.
//! Per-change outcomes are recorded against each change; connectivity and
//! credential failures abort the pass and leave the log untouched. Once the
//! server accepted the changes the authoritative copy is pulled back and
//! merged, closing the loop.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::models::{LocalChange, LocalWorksite, WorksiteId};
use crate::services::DatabaseService;
use crate::util::now_millis;

use super::network::{with_timeout, AccountData, ChangeSyncRequest, WorksiteNetwork};

/// Which part of a change log a pass uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSyncPlan {
    /// First change of the uploaded suffix
    pub starting_sync_index: usize,
    /// Newest synced change before the suffix, or the first change
    pub reference_index: Option<usize>,
    /// Archived but not fully synced changes sit between reference and suffix
    pub has_prior_unsynced_changes: bool,
}

/// Plan an upload of `changes`, ordered oldest first.
///
/// Returns `None` when every change is archived.
#[must_use]
pub fn plan_change_sync(changes: &[LocalChange]) -> Option<ChangeSyncPlan> {
    let mut start = changes.len();
    while start > 0 && !changes[start - 1].is_archived() {
        start -= 1;
    }
    if start == changes.len() {
        return None;
    }

    let mut reference = start.saturating_sub(1);
    while reference > 0 && !changes[reference].is_synced() {
        reference -= 1;
    }
    let reference_index = (reference < start).then_some(reference);

    Some(ChangeSyncPlan {
        starting_sync_index: start,
        reference_index,
        has_prior_unsynced_changes: reference_index.is_some_and(|reference| start > reference + 1),
    })
}

/// Result of one upload pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorksiteSyncOutcome {
    /// The worksite has no change log
    NothingToSync,
    /// Every change is archived or stalled
    NotSyncable,
    Uploaded(UploadSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub synced: usize,
    pub partially_synced: usize,
    pub failed: usize,
    /// Server id of the worksite after the pass, `-1` when still unknown
    pub network_id: i64,
    pub is_fully_synced: bool,
}

/// Uploads worksite change logs to the network
#[derive(Clone)]
pub struct WorksiteChangeSyncer {
    db: DatabaseService,
    network: Arc<dyn WorksiteNetwork>,
    settings: SyncSettings,
}

impl WorksiteChangeSyncer {
    pub fn new(db: DatabaseService, network: Arc<dyn WorksiteNetwork>, settings: SyncSettings) -> Self {
        Self {
            db,
            network,
            settings,
        }
    }

    /// Upload the pending changes of one worksite.
    ///
    /// Pass-fatal network errors are returned untouched. Other request
    /// failures are recorded against every submitted change, then returned.
    pub async fn sync_worksite(
        &self,
        worksite_id: WorksiteId,
        account: &AccountData,
    ) -> Result<WorksiteSyncOutcome> {
        let changes = self.db.get_ordered_changes(worksite_id).await?;
        if changes.is_empty() {
            return Ok(WorksiteSyncOutcome::NothingToSync);
        }

        let Some(plan) = plan_change_sync(&changes) else {
            tracing::info!("Worksite {worksite_id} has no syncable changes");
            return Ok(WorksiteSyncOutcome::NotSyncable);
        };

        let max_sync_tries = self.settings.max_sync_tries;
        let pending: Vec<LocalChange> = changes[plan.starting_sync_index..]
            .iter()
            .filter(|change| !change.is_stalled(max_sync_tries))
            .cloned()
            .collect();
        if pending.is_empty() {
            tracing::warn!(
                "Worksite {worksite_id} has only stalled changes; manual retry required"
            );
            return Ok(WorksiteSyncOutcome::NotSyncable);
        }

        let local = self
            .db
            .get_worksite(worksite_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Worksite {worksite_id}")))?;
        let request = build_request(&local, account, &changes, plan, pending);

        let timeout = self.settings.network_timeout();
        let attempted_at = now_millis();
        let result = match with_timeout(timeout, self.network.sync_worksite_changes(&request)).await
        {
            Ok(result) => result,
            Err(error) if error.is_pass_fatal() => {
                tracing::warn!("Aborting upload of worksite {worksite_id}: {error}");
                return Err(error.into());
            }
            Err(error) => {
                tracing::warn!("Upload of worksite {worksite_id} failed: {error}");
                let summary = error.to_string();
                for change in &request.changes {
                    self.db
                        .record_change_attempt(change.id, false, Some(&summary), attempted_at)
                        .await?;
                }
                return Err(error.into());
            }
        };

        let recorded = self
            .db
            .record_change_sync_result(worksite_id, &result, attempted_at)
            .await?;
        if let Some(error) = result.first_fatal_error() {
            tracing::warn!("Aborting upload of worksite {worksite_id}: {error}");
            return Err(error.clone().into());
        }

        let network_id = self
            .db
            .get_worksite_root(worksite_id)
            .await?
            .map_or(local.root.network_id, |root| root.network_id);
        let network_worksite = if network_id > 0 {
            match with_timeout(timeout, self.network.get_worksite(network_id)).await {
                Ok(worksite) => worksite,
                Err(error) if error.is_pass_fatal() => return Err(error.into()),
                Err(error) => {
                    tracing::warn!("Could not refetch worksite {network_id} after upload: {error}");
                    None
                }
            }
        } else {
            None
        };

        let finish = self
            .db
            .finish_worksite_sync(worksite_id, network_worksite.as_ref(), now_millis())
            .await?;

        tracing::info!(
            "Uploaded worksite {worksite_id}: {} synced, {} partial, {} failed{}",
            recorded.synced,
            recorded.partially_synced,
            recorded.failed,
            if finish.is_fully_synced { ", fully synced" } else { "" }
        );

        Ok(WorksiteSyncOutcome::Uploaded(UploadSummary {
            synced: recorded.synced,
            partially_synced: recorded.partially_synced,
            failed: recorded.failed,
            network_id,
            is_fully_synced: finish.is_fully_synced,
        }))
    }
}

fn build_request(
    local: &LocalWorksite,
    account: &AccountData,
    changes: &[LocalChange],
    plan: ChangeSyncPlan,
    pending: Vec<LocalChange>,
) -> ChangeSyncRequest {
    let worksite = &local.worksite;
    let flag_id_lookup: HashMap<i64, i64> = worksite
        .flags
        .iter()
        .filter(|flag| flag.id > 0 && flag.network_id > 0)
        .map(|flag| (flag.id, flag.network_id))
        .collect();
    let note_id_lookup: HashMap<i64, i64> = worksite
        .notes
        .iter()
        .filter(|note| note.id > 0 && note.network_id > 0)
        .map(|note| (note.id, note.network_id))
        .collect();
    let work_type_id_lookup: HashMap<i64, i64> = worksite
        .work_types
        .iter()
        .filter(|work_type| work_type.id > 0 && work_type.network_id > 0)
        .map(|work_type| (work_type.id, work_type.network_id))
        .collect();

    ChangeSyncRequest {
        account: account.clone(),
        worksite_id: local.root.id,
        worksite_network_id: local.root.network_id,
        reference_change: plan.reference_index.map(|index| changes[index].clone()),
        changes: pending,
        has_prior_unsynced_changes: plan.has_prior_unsynced_changes,
        flag_id_lookup,
        note_id_lookup,
        work_type_id_lookup,
        affiliate_organization_ids: account.affiliate_organization_ids.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LocalEditContext;
    use crate::models::{ChangeArchiveAction, WorkType, Worksite, WorksiteNote};
    use crate::sync::fake::{FakeAccount, FakeNetwork};
    use crate::sync::network::{AccountDataSource, NetworkError};
    use pretty_assertions::assert_eq;

    fn change(id: i64, archive_action: ChangeArchiveAction) -> LocalChange {
        LocalChange {
            id,
            app_version: 1,
            organization_id: 5,
            worksite_id: WorksiteId(1),
            sync_uuid: LocalChange::new_sync_uuid(),
            change_model_version: 1,
            change_data: String::new(),
            created_at: id,
            save_attempt: 0,
            save_attempt_at: 0,
            archive_action,
            last_error: None,
        }
    }

    #[test]
    fn test_plan_uploads_suffix_after_archived_change() {
        let changes = vec![
            change(1, ChangeArchiveAction::Pending),
            change(2, ChangeArchiveAction::Synced),
            change(3, ChangeArchiveAction::Pending),
        ];
        assert_eq!(
            plan_change_sync(&changes),
            Some(ChangeSyncPlan {
                starting_sync_index: 2,
                reference_index: Some(1),
                has_prior_unsynced_changes: false,
            })
        );
    }

    #[test]
    fn test_plan_without_archived_changes() {
        let changes = vec![
            change(1, ChangeArchiveAction::Pending),
            change(2, ChangeArchiveAction::Pending),
        ];
        assert_eq!(
            plan_change_sync(&changes),
            Some(ChangeSyncPlan {
                starting_sync_index: 0,
                reference_index: None,
                has_prior_unsynced_changes: false,
            })
        );
    }

    #[test]
    fn test_plan_flags_partially_synced_changes_before_suffix() {
        let changes = vec![
            change(1, ChangeArchiveAction::Synced),
            change(2, ChangeArchiveAction::PartiallySynced),
            change(3, ChangeArchiveAction::Pending),
        ];
        let plan = plan_change_sync(&changes).unwrap();
        assert_eq!(plan.starting_sync_index, 2);
        assert_eq!(plan.reference_index, Some(0));
        assert!(plan.has_prior_unsynced_changes);
    }

    #[test]
    fn test_plan_reference_points_to_synced_or_first_change() {
        let changes = vec![
            change(1, ChangeArchiveAction::PartiallySynced),
            change(2, ChangeArchiveAction::PartiallySynced),
            change(3, ChangeArchiveAction::Pending),
        ];
        let plan = plan_change_sync(&changes).unwrap();
        assert_eq!(plan.reference_index, Some(0));
        assert!(plan.has_prior_unsynced_changes);
    }

    #[test]
    fn test_plan_rejects_fully_archived_log() {
        let changes = vec![
            change(1, ChangeArchiveAction::Synced),
            change(2, ChangeArchiveAction::Synced),
        ];
        assert_eq!(plan_change_sync(&changes), None);
        assert_eq!(plan_change_sync(&[]), None);
    }

    fn context(edited_at: i64) -> LocalEditContext {
        LocalEditContext {
            organization_id: 5,
            app_version: 1,
            edited_at,
        }
    }

    async fn create_offline_worksite(db: &DatabaseService) -> WorksiteId {
        let mut worksite = Worksite::new(1, 29.95, -90.07);
        worksite.name = "Morgan".to_string();
        worksite.address = "12 Levee St".to_string();
        let work_type = WorkType::new("tarp", "open_unassigned");
        worksite.key_work_type = Some(work_type.clone());
        worksite.work_types.push(work_type.clone());
        worksite.notes.push(WorksiteNote::new("Roof damage", 100));
        db.save_worksite_change(None, &worksite, Some(&work_type), context(100))
            .await
            .unwrap()
            .unwrap()
            .worksite_id
    }

    fn syncer(db: &DatabaseService, network: &Arc<FakeNetwork>) -> WorksiteChangeSyncer {
        WorksiteChangeSyncer::new(db.clone(), network.clone(), SyncSettings::default())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upload_creates_worksite_and_closes_loop() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let network = Arc::new(FakeNetwork::new());
        let account = FakeAccount::signed_in().account().await.unwrap();
        let id = create_offline_worksite(&db).await;

        let outcome = syncer(&db, &network)
            .sync_worksite(id, &account)
            .await
            .unwrap();
        let WorksiteSyncOutcome::Uploaded(summary) = outcome else {
            panic!("expected upload, got {outcome:?}");
        };
        assert_eq!(summary.synced, 1);
        assert!(summary.is_fully_synced);
        assert!(summary.network_id > 0);

        let local = db.get_worksite(id).await.unwrap().unwrap();
        assert!(!local.root.is_local_modified);
        assert_eq!(local.root.network_id, summary.network_id);
        assert!(local.root.local_global_uuid.is_empty());
        assert!(!local.worksite.has_unsynced_children());
        assert_eq!(local.worksite.case_number, format!("V{}", summary.network_id));
        assert!(db.get_ordered_changes(id).await.unwrap().is_empty());

        let request = &network.requests()[0];
        assert_eq!(request.worksite_network_id, -1);
        assert_eq!(request.reference_change, None);
        assert_eq!(request.affiliate_organization_ids, vec![5, 6]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connectivity_failure_leaves_changes_untouched() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let network = Arc::new(FakeNetwork::new());
        network.fail_requests(Some(NetworkError::NoConnection));
        let account = FakeAccount::signed_in().account().await.unwrap();
        let id = create_offline_worksite(&db).await;

        let error = syncer(&db, &network)
            .sync_worksite(id, &account)
            .await
            .unwrap_err();
        assert!(error.is_pass_fatal());

        let changes = db.get_ordered_changes(id).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].save_attempt, 0);
        assert_eq!(changes[0].last_error, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_failure_is_recorded_per_change() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let network = Arc::new(FakeNetwork::new());
        network.fail_requests(Some(NetworkError::Status {
            code: 503,
            message: "unavailable".to_string(),
        }));
        let account = FakeAccount::signed_in().account().await.unwrap();
        let id = create_offline_worksite(&db).await;

        let error = syncer(&db, &network)
            .sync_worksite(id, &account)
            .await
            .unwrap_err();
        assert!(!error.is_pass_fatal());

        let changes = db.get_ordered_changes(id).await.unwrap();
        assert_eq!(changes[0].save_attempt, 1);
        assert!(changes[0].last_error.as_deref().unwrap().contains("503"));
        assert!(db.get_worksite(id).await.unwrap().unwrap().root.is_local_modified);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stalled_changes_are_not_uploaded() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let network = Arc::new(FakeNetwork::new());
        let account = FakeAccount::signed_in().account().await.unwrap();
        let id = create_offline_worksite(&db).await;
        let change_id = db.get_ordered_changes(id).await.unwrap()[0].id;

        for attempt in 0..=SyncSettings::default().max_sync_tries {
            db.record_change_attempt(change_id, false, Some("rejected"), i64::from(attempt))
                .await
                .unwrap();
        }

        let outcome = syncer(&db, &network)
            .sync_worksite(id, &account)
            .await
            .unwrap();
        assert_eq!(outcome, WorksiteSyncOutcome::NotSyncable);
        assert!(network.requests().is_empty());
    }

    async fn stall_change(db: &DatabaseService, change_id: i64) {
        for attempt in 0..=SyncSettings::default().max_sync_tries {
            db.record_change_attempt(change_id, false, Some("HTTP 400"), i64::from(attempt))
                .await
                .unwrap();
        }
    }

    async fn rename(db: &DatabaseService, id: WorksiteId, name: &str, edited_at: i64) -> i64 {
        let start = db.get_worksite(id).await.unwrap().unwrap().worksite;
        let mut edited = start.clone();
        edited.name = name.to_string();
        db.save_worksite_change(Some(&start), &edited, None, context(edited_at))
            .await
            .unwrap()
            .unwrap()
            .change_id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_later_edit_supersedes_stalled_change() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let network = Arc::new(FakeNetwork::new());
        let account = FakeAccount::signed_in().account().await.unwrap();
        let id = create_offline_worksite(&db).await;
        let stalled_id = db.get_ordered_changes(id).await.unwrap()[0].id;
        stall_change(&db, stalled_id).await;
        let later_id = rename(&db, id, "Morgan Reyes", 200).await;

        let outcome = syncer(&db, &network)
            .sync_worksite(id, &account)
            .await
            .unwrap();
        let WorksiteSyncOutcome::Uploaded(summary) = outcome else {
            panic!("expected upload, got {outcome:?}");
        };
        assert_eq!(summary.synced, 1);
        assert!(summary.is_fully_synced);

        let submitted: Vec<i64> = network.requests()[0]
            .changes
            .iter()
            .map(|change| change.id)
            .collect();
        assert_eq!(submitted, vec![later_id]);

        let local = db.get_worksite(id).await.unwrap().unwrap();
        assert!(!local.root.is_local_modified);
        assert_eq!(local.worksite.name, "Morgan Reyes");
        assert!(db.get_ordered_changes(id).await.unwrap().is_empty());
        assert!(db
            .stalled_changes(SyncSettings::default().max_sync_tries)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            network.server_worksite(summary.network_id).unwrap().notes.len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reset_stalled_change_is_uploaded_again() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let network = Arc::new(FakeNetwork::new());
        let account = FakeAccount::signed_in().account().await.unwrap();
        let id = create_offline_worksite(&db).await;
        let stalled_id = db.get_ordered_changes(id).await.unwrap()[0].id;
        stall_change(&db, stalled_id).await;
        let later_id = rename(&db, id, "Morgan Reyes", 200).await;

        assert!(db.reset_change_attempts(stalled_id).await.unwrap());
        let outcome = syncer(&db, &network)
            .sync_worksite(id, &account)
            .await
            .unwrap();
        let WorksiteSyncOutcome::Uploaded(summary) = outcome else {
            panic!("expected upload, got {outcome:?}");
        };
        assert_eq!(summary.synced, 2);
        assert!(summary.is_fully_synced);

        let request = &network.requests()[0];
        let submitted: Vec<i64> = request.changes.iter().map(|change| change.id).collect();
        assert_eq!(submitted, vec![stalled_id, later_id]);
        assert_eq!(request.reference_change, None);
        assert!(!db.get_worksite(id).await.unwrap().unwrap().root.is_local_modified);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejected_change_keeps_worksite_modified() {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let network = Arc::new(FakeNetwork::new());
        let account = FakeAccount::signed_in().account().await.unwrap();
        let id = create_offline_worksite(&db).await;
        let change_id = db.get_ordered_changes(id).await.unwrap()[0].id;
        network.fail_change(
            change_id,
            NetworkError::Status {
                code: 400,
                message: "invalid phone".to_string(),
            },
        );

        let outcome = syncer(&db, &network)
            .sync_worksite(id, &account)
            .await
            .unwrap();
        let WorksiteSyncOutcome::Uploaded(summary) = outcome else {
            panic!("expected upload, got {outcome:?}");
        };
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_fully_synced);

        let local = db.get_worksite(id).await.unwrap().unwrap();
        assert!(local.root.is_local_modified);
        assert_eq!(db.get_ordered_changes(id).await.unwrap()[0].save_attempt, 1);
    }
}
