//! Shared database service wrapper used by the sync engine and clients.
//!
//! All access goes through one `Database` behind an async mutex, making the
//! service the single serialized writer. Every committed write bumps a data
//! version; observers re-run their query when the version changes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::db::{
    Database, LibSqlChangeLogRepository, LibSqlIncidentRepository, LibSqlSyncParametersRepository,
    LibSqlSyncStatsRepository, LibSqlWorksiteRepository, LocalEditContext,
    WorksiteChildRepository,
};
use crate::error::Result;
use crate::models::{
    BoundedRegion, BoundingBox, Incident, IncidentDataSyncParameters, IncidentDataSyncStats,
    LocalChange, LocalWorksite, PendingWorksite, SavedLocalChange, WorkType, Worksite, WorksiteId,
    WorksiteLocalModifiedAt, WorksiteRoot, WorksiteSummary,
};
use crate::sync::{ChangeOutcome, ChangeSyncResult, MergeOutcome, SyncIdMapping, WorksiteMerger};
use crate::util::compact_text;

/// Which time window cursor to advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCursor {
    CoreBefore,
    CoreAfter,
    AdditionalBefore,
    AdditionalAfter,
}

/// Per-change outcomes persisted after an upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordedChangeResults {
    pub synced: usize,
    pub partially_synced: usize,
    pub failed: usize,
}

/// Local state after closing the loop on an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorksiteSyncFinish {
    /// Every change reached the server and every child has a network id
    pub is_fully_synced: bool,
    /// Merge of the refetched server copy, when one was applied
    pub merge: Option<MergeOutcome>,
}

/// Rows removed by an incident reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncidentReset {
    pub deleted_worksites: u64,
    /// Worksites kept because they hold unsynced local changes
    pub retained_worksites: i64,
}

/// Thread-safe service for DB and repository operations.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    data_version: Arc<watch::Sender<u64>>,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::debug!("Opening worksite store at {}", db_path.display());
        let db = Database::open(&db_path).await?;
        Ok(Self::from_database(db, Some(db_path)))
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::from_database(db, None))
    }

    fn from_database(db: Database, db_path: Option<PathBuf>) -> Self {
        let (data_version, _) = watch::channel(0);
        Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
            data_version: Arc::new(data_version),
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn notify_changed(&self) {
        self.data_version.send_modify(|version| *version += 1);
    }

    /// Observe the result of `query`.
    ///
    /// The first result is computed before returning. The query re-runs
    /// after each committed write and subscribers are notified only when
    /// the result differs. The background task ends when every receiver
    /// is dropped.
    pub async fn observe<T, F, Fut>(&self, query: F) -> Result<watch::Receiver<T>>
    where
        T: PartialEq + Send + Sync + 'static,
        F: Fn(Self) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut version = self.data_version.subscribe();
        version.borrow_and_update();
        let initial = query(self.clone()).await?;
        let (tx, rx) = watch::channel(initial);
        let service = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = version.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = tx.closed() => break,
                }

                match query(service.clone()).await {
                    Ok(value) => {
                        tx.send_if_modified(|current| {
                            if *current == value {
                                false
                            } else {
                                *current = value;
                                true
                            }
                        });
                    }
                    Err(error) => tracing::warn!("Observed query failed: {error}"),
                }
            }
        });

        Ok(rx)
    }

    // ---------------------------------------------------------------------
    // Worksite record store
    // ---------------------------------------------------------------------

    /// Fetch a worksite aggregate by local id.
    pub async fn get_worksite(&self, id: WorksiteId) -> Result<Option<LocalWorksite>> {
        let db = self.db.lock().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());
        repo.get_worksite(id).await
    }

    /// Fetch a worksite aggregate by network id.
    pub async fn get_worksite_by_network_id(
        &self,
        network_id: i64,
    ) -> Result<Option<LocalWorksite>> {
        let db = self.db.lock().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());
        repo.get_worksite_by_network_id(network_id).await
    }

    pub async fn get_worksite_root(&self, id: WorksiteId) -> Result<Option<WorksiteRoot>> {
        let db = self.db.lock().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());
        repo.get_root(id).await
    }

    pub async fn get_local_modified_at(
        &self,
        network_id: i64,
    ) -> Result<Option<WorksiteLocalModifiedAt>> {
        let db = self.db.lock().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());
        repo.get_local_modified_at(network_id).await
    }

    pub async fn count_incident_worksites(&self, incident_id: i64) -> Result<i64> {
        let db = self.db.lock().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());
        repo.count_incident_worksites(incident_id).await
    }

    /// List worksite summaries of an incident by case number.
    pub async fn list_worksite_summaries(
        &self,
        incident_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WorksiteSummary>> {
        let db = self.db.lock().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());
        repo.list_summaries(incident_id, limit, offset).await
    }

    pub async fn list_worksite_summaries_in_bounds(
        &self,
        incident_id: i64,
        bounds: &BoundingBox,
    ) -> Result<Vec<WorksiteSummary>> {
        let db = self.db.lock().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());
        repo.list_summaries_in_bounds(incident_id, bounds).await
    }

    /// Save a local edit and append it to the change log atomically.
    pub async fn save_worksite_change(
        &self,
        start: Option<&Worksite>,
        change: &Worksite,
        primary_work_type: Option<&WorkType>,
        context: LocalEditContext,
    ) -> Result<Option<SavedLocalChange>> {
        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let saved = LibSqlChangeLogRepository::new(&tx)
            .append(start, change, primary_work_type, context)
            .await?;
        tx.commit().await?;
        drop(db);

        if saved.is_some() {
            self.notify_changed();
        }
        Ok(saved)
    }

    /// Merge server snapshots, one transaction per worksite.
    pub async fn sync_network_worksites(
        &self,
        worksites: &[Worksite],
        synced_at: i64,
        keep_key_work_type: bool,
    ) -> Result<Vec<MergeOutcome>> {
        let mut outcomes = Vec::with_capacity(worksites.len());
        for worksite in worksites {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            let outcome = WorksiteMerger::new(&tx)
                .merge_network_worksite(worksite, synced_at, keep_key_work_type)
                .await?;
            tx.commit().await?;
            outcomes.push(outcome);
        }

        if outcomes.iter().any(|outcome| outcome.is_written()) {
            self.notify_changed();
        }
        Ok(outcomes)
    }

    /// Count a failed sync pass against a worksite.
    pub async fn increment_worksite_sync_attempt(&self, id: WorksiteId) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlWorksiteRepository::new(db.connection());
            repo.increment_sync_attempt(id).await?;
        }
        self.notify_changed();
        Ok(())
    }

    /// Observe a worksite's full aggregate.
    pub async fn observe_worksite(
        &self,
        id: WorksiteId,
    ) -> Result<watch::Receiver<Option<LocalWorksite>>> {
        self.observe(move |service| async move { service.get_worksite(id).await })
            .await
    }

    // ---------------------------------------------------------------------
    // Change log
    // ---------------------------------------------------------------------

    pub async fn get_ordered_changes(&self, worksite_id: WorksiteId) -> Result<Vec<LocalChange>> {
        let db = self.db.lock().await;
        let repo = LibSqlChangeLogRepository::new(db.connection());
        repo.get_ordered(worksite_id).await
    }

    pub async fn get_change(&self, change_id: i64) -> Result<Option<LocalChange>> {
        let db = self.db.lock().await;
        let repo = LibSqlChangeLogRepository::new(db.connection());
        repo.get(change_id).await
    }

    pub async fn mark_changes_synced(&self, change_ids: &[i64]) -> Result<u64> {
        let updated = {
            let db = self.db.lock().await;
            let repo = LibSqlChangeLogRepository::new(db.connection());
            repo.mark_synced(change_ids).await?
        };
        if updated > 0 {
            self.notify_changed();
        }
        Ok(updated)
    }

    /// Record one upload attempt of a change.
    pub async fn record_change_attempt(
        &self,
        change_id: i64,
        success: bool,
        error_summary: Option<&str>,
        attempted_at: i64,
    ) -> Result<bool> {
        let error_summary = error_summary.map(compact_text);
        let updated = {
            let db = self.db.lock().await;
            let repo = LibSqlChangeLogRepository::new(db.connection());
            repo.record_attempt(change_id, success, error_summary.as_deref(), attempted_at)
                .await?
        };
        if updated {
            self.notify_changed();
        }
        Ok(updated)
    }

    /// Make a stalled change eligible for upload again.
    pub async fn reset_change_attempts(&self, change_id: i64) -> Result<bool> {
        let updated = {
            let db = self.db.lock().await;
            let repo = LibSqlChangeLogRepository::new(db.connection());
            repo.reset_attempts(change_id).await?
        };
        if updated {
            self.notify_changed();
        }
        Ok(updated)
    }

    pub async fn pending_change_count(
        &self,
        worksite_id: WorksiteId,
        max_sync_tries: i32,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        let repo = LibSqlChangeLogRepository::new(db.connection());
        repo.pending_change_count(worksite_id, max_sync_tries).await
    }

    pub async fn worksites_pending_sync(
        &self,
        limit: usize,
        max_sync_tries: i32,
    ) -> Result<Vec<PendingWorksite>> {
        let db = self.db.lock().await;
        let repo = LibSqlChangeLogRepository::new(db.connection());
        repo.worksites_pending_sync(limit, max_sync_tries).await
    }

    pub async fn stalled_changes(&self, max_sync_tries: i32) -> Result<Vec<LocalChange>> {
        let db = self.db.lock().await;
        let repo = LibSqlChangeLogRepository::new(db.connection());
        repo.stalled_changes(max_sync_tries).await
    }

    /// Observe worksites waiting to upload.
    pub async fn observe_pending_worksites(
        &self,
        limit: usize,
        max_sync_tries: i32,
    ) -> Result<watch::Receiver<Vec<PendingWorksite>>> {
        self.observe(move |service| async move {
            service.worksites_pending_sync(limit, max_sync_tries).await
        })
        .await
    }

    /// Persist the outcome of an upload in one transaction.
    ///
    /// Network ids are attached first. Changes whose failure is pass-fatal
    /// are left untouched so the next pass retries them without penalty.
    pub async fn record_change_sync_result(
        &self,
        worksite_id: WorksiteId,
        result: &ChangeSyncResult,
        attempted_at: i64,
    ) -> Result<RecordedChangeResults> {
        let mut recorded = RecordedChangeResults::default();
        {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            apply_id_mapping(&tx, worksite_id, &result.id_mapping).await?;

            let changes = LibSqlChangeLogRepository::new(&tx);
            for change_result in &result.change_results {
                match &change_result.outcome {
                    ChangeOutcome::Synced => {
                        if changes
                            .record_attempt(change_result.change_id, true, None, attempted_at)
                            .await?
                        {
                            recorded.synced += 1;
                        }
                    }
                    ChangeOutcome::PartiallySynced => {
                        changes
                            .record_attempt(change_result.change_id, false, None, attempted_at)
                            .await?;
                        if changes
                            .mark_partially_synced(change_result.change_id)
                            .await?
                        {
                            recorded.partially_synced += 1;
                        }
                    }
                    ChangeOutcome::Failed(error) if error.is_pass_fatal() => {}
                    ChangeOutcome::Failed(error) => {
                        let summary = compact_text(&error.to_string());
                        if changes
                            .record_attempt(
                                change_result.change_id,
                                false,
                                Some(&summary),
                                attempted_at,
                            )
                            .await?
                        {
                            recorded.failed += 1;
                        }
                    }
                }
            }
            tx.commit().await?;
        }

        self.notify_changed();
        Ok(recorded)
    }

    /// Settle local state once an upload pass finished.
    ///
    /// Pending changes older than the newest synced change are superseded
    /// first. With nothing left to upload the worksite takes the server copy
    /// and its change log is cleared. Otherwise the server copy only fills gaps
    /// and archived changes before the newest synced one are pruned.
    pub async fn finish_worksite_sync(
        &self,
        worksite_id: WorksiteId,
        network_worksite: Option<&Worksite>,
        synced_at: i64,
    ) -> Result<WorksiteSyncFinish> {
        let finish = {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            let worksites = LibSqlWorksiteRepository::new(&tx);
            let changes = LibSqlChangeLogRepository::new(&tx);
            let merger = WorksiteMerger::new(&tx);

            let superseded = changes.supersede_before_synced(worksite_id).await?;
            if superseded > 0 {
                tracing::debug!("Superseded {superseded} earlier changes of worksite {worksite_id}");
            }
            let has_pending = changes.has_pending_changes(worksite_id).await?;
            let has_unsynced_children = worksites
                .get_worksite(worksite_id)
                .await?
                .is_some_and(|local| local.worksite.has_unsynced_children());

            let finish = if !has_pending && !has_unsynced_children {
                worksites.set_root_unmodified(worksite_id, synced_at).await?;
                let mut merge = None;
                if let Some(network_worksite) = network_worksite {
                    match worksites
                        .get_local_modified_at(network_worksite.network_id)
                        .await?
                    {
                        Some(stamp) if stamp.id == worksite_id => {
                            merge = Some(
                                merger
                                    .update_synced_worksite(&stamp, network_worksite, synced_at, false)
                                    .await?,
                            );
                        }
                        _ => tracing::warn!(
                            "Network worksite {} is not owned by worksite {worksite_id}",
                            network_worksite.network_id
                        ),
                    }
                }
                changes.delete_worksite_changes(worksite_id).await?;
                WorksiteSyncFinish {
                    is_fully_synced: true,
                    merge,
                }
            } else {
                if let Some(network_worksite) = network_worksite {
                    merger.fill_worksite(worksite_id, network_worksite).await?;
                }
                changes.prune_superseded(worksite_id).await?;
                WorksiteSyncFinish {
                    is_fully_synced: false,
                    merge: None,
                }
            };
            tx.commit().await?;
            finish
        };

        self.notify_changed();
        Ok(finish)
    }

    // ---------------------------------------------------------------------
    // Sync parameters and stats
    // ---------------------------------------------------------------------

    pub async fn get_sync_parameters(
        &self,
        incident_id: i64,
    ) -> Result<Option<IncidentDataSyncParameters>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncParametersRepository::new(db.connection());
        repo.get_parameters(incident_id).await
    }

    pub async fn list_sync_parameters(&self) -> Result<Vec<IncidentDataSyncParameters>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncParametersRepository::new(db.connection());
        repo.list_parameters().await
    }

    /// Create unsynced parameters for an incident unless present, then read them.
    pub async fn ensure_sync_parameters(
        &self,
        incident_id: i64,
    ) -> Result<IncidentDataSyncParameters> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncParametersRepository::new(db.connection());
        repo.insert_if_absent(incident_id).await?;
        Ok(repo
            .get_parameters(incident_id)
            .await?
            .unwrap_or_else(|| IncidentDataSyncParameters::new(incident_id)))
    }

    /// Write one window cursor. Returns `false` when the incident has no row.
    pub async fn advance_sync_cursor(
        &self,
        incident_id: i64,
        cursor: WindowCursor,
        timestamp: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncParametersRepository::new(db.connection());
        match cursor {
            WindowCursor::CoreBefore => repo.advance_core_before(incident_id, timestamp).await,
            WindowCursor::CoreAfter => repo.advance_core_after(incident_id, timestamp).await,
            WindowCursor::AdditionalBefore => {
                repo.advance_additional_before(incident_id, timestamp).await
            }
            WindowCursor::AdditionalAfter => {
                repo.advance_additional_after(incident_id, timestamp).await
            }
        }
    }

    pub async fn update_bounded_region(
        &self,
        incident_id: i64,
        region: &BoundedRegion,
        synced_at: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncParametersRepository::new(db.connection());
        repo.update_bounded_region(incident_id, region, synced_at)
            .await
    }

    pub async fn delete_sync_parameters(&self, incident_id: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncParametersRepository::new(db.connection());
        repo.delete_parameters(incident_id).await
    }

    pub async fn get_sync_stats(&self, incident_id: i64) -> Result<Option<IncidentDataSyncStats>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStatsRepository::new(db.connection());
        repo.get_stats(incident_id).await
    }

    pub async fn list_sync_stats(&self) -> Result<Vec<IncidentDataSyncStats>> {
        let db = self.db.lock().await;
        let repo = LibSqlSyncStatsRepository::new(db.connection());
        repo.list_stats().await
    }

    pub async fn save_sync_stats(&self, stats: &IncidentDataSyncStats) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlSyncStatsRepository::new(db.connection());
            repo.upsert_stats(stats).await?;
        }
        self.notify_changed();
        Ok(())
    }

    /// Observe an incident's pull statistics.
    pub async fn observe_sync_stats(
        &self,
        incident_id: i64,
    ) -> Result<watch::Receiver<Option<IncidentDataSyncStats>>> {
        self.observe(move |service| async move { service.get_sync_stats(incident_id).await })
            .await
    }

    /// Drop an incident's cached worksites, cursors and stats.
    ///
    /// Worksites with unsynced local changes are kept.
    pub async fn reset_incident(&self, incident_id: i64) -> Result<IncidentReset> {
        let reset = {
            let db = self.db.lock().await;
            let tx = db.connection().transaction().await?;
            let worksites = LibSqlWorksiteRepository::new(&tx);
            let deleted_worksites = worksites
                .delete_unmodified_incident_worksites(incident_id)
                .await?;
            let retained_worksites = worksites.count_incident_worksites(incident_id).await?;
            LibSqlSyncParametersRepository::new(&tx)
                .delete_parameters(incident_id)
                .await?;
            LibSqlSyncStatsRepository::new(&tx)
                .delete_stats(incident_id)
                .await?;
            tx.commit().await?;
            IncidentReset {
                deleted_worksites,
                retained_worksites,
            }
        };

        tracing::info!(
            "Reset incident {incident_id}: deleted {} worksites, kept {} with local changes",
            reset.deleted_worksites,
            reset.retained_worksites
        );
        self.notify_changed();
        Ok(reset)
    }

    // ---------------------------------------------------------------------
    // Incidents
    // ---------------------------------------------------------------------

    pub async fn save_incident(&self, incident: &Incident) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlIncidentRepository::new(db.connection());
            repo.upsert_incident(incident).await?;
        }
        self.notify_changed();
        Ok(())
    }

    pub async fn get_incident(&self, id: i64) -> Result<Option<Incident>> {
        let db = self.db.lock().await;
        let repo = LibSqlIncidentRepository::new(db.connection());
        repo.get_incident(id).await
    }

    pub async fn list_incidents(&self) -> Result<Vec<Incident>> {
        let db = self.db.lock().await;
        let repo = LibSqlIncidentRepository::new(db.connection());
        repo.list_incidents().await
    }
}

async fn apply_id_mapping(
    conn: &libsql::Connection,
    worksite_id: WorksiteId,
    mapping: &SyncIdMapping,
) -> Result<()> {
    if let Some(network_id) = mapping.worksite_network_id {
        LibSqlWorksiteRepository::new(conn)
            .assign_network_id(worksite_id, network_id)
            .await?;
    }

    let children = WorksiteChildRepository::new(conn);
    for (id, network_id) in &mapping.flag_ids {
        children.set_flag_network_id(*id, *network_id).await?;
    }
    for (id, network_id) in &mapping.note_ids {
        children.set_note_network_id(*id, *network_id).await?;
    }
    for (id, network_id) in &mapping.work_type_ids {
        children.set_work_type_network_id(*id, *network_id).await?;
    }
    for (id, network_id) in &mapping.work_type_request_ids {
        children
            .set_work_type_request_network_id(*id, *network_id)
            .await?;
    }
    Ok(())
}
