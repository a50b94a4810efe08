//! Sync orchestration: deciding what to pull or upload, and when.
//!
//! Worksite uploads pass through a guard allowing one concurrent sync per
//! worksite; a second request is rejected rather than queued. Reachability
//! and credentials are checked before any network call and their absence is
//! a normal, logged rejection. Incident pulls walk the core and additional
//! time windows page by page, committing cursors after each page so that a
//! cancelled or failed pull resumes where it stopped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::models::{
    backoff_millis, BoundedRegion, Incident, IncidentDataSyncParameters, IncidentDataSyncStats,
    IncidentFieldSet, LatLng, ListModel, ListObjectLookup, PendingWorksite, SyncTimeMarker,
    WorkType, Worksite, WorksiteId, WorksiteSummary,
};
use crate::services::{DatabaseService, WindowCursor};
use crate::util::now_millis;

use super::bounded::BoundedGrid;
use super::cancel::CancellationSignal;
use super::change_syncer::{WorksiteChangeSyncer, WorksiteSyncOutcome};
use super::claim::{ClaimCloseThreshold, ClaimThresholdStatus, NotSpecifiedClaimThreshold};
use super::guard::SyncingIds;
use super::merge::MergeOutcome;
use super::network::{
    with_timeout, AccountData, AccountDataSource, ConnectivityMonitor, NetworkError, RetryClass,
    WorksiteFieldSet, WorksiteNetwork, WorksitePageQuery,
};
use super::observe::combine_latest;

/// Result of a request to sync one worksite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorksiteSyncStatus {
    /// Another sync of the same worksite is running
    AlreadySyncing,
    Offline,
    NotAuthenticated,
    Completed(WorksiteSyncOutcome),
    /// Connectivity or credentials failed mid-pass; changes are untouched
    FailedRetryLater(String),
    /// Failure recorded against the worksite and its changes
    Failed { reason: String, retryable: bool },
}

impl WorksiteSyncStatus {
    /// Whether no further worksite can sync in the current pass
    #[must_use]
    pub const fn aborts_pass(&self) -> bool {
        matches!(
            self,
            Self::Offline | Self::NotAuthenticated | Self::FailedRetryLater(_)
        )
    }
}

/// How a multi-step pass ended
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PassEnd {
    #[default]
    Completed,
    Cancelled,
    Aborted(String),
}

/// Summary of uploading every pending worksite
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSyncSummary {
    pub synced: usize,
    pub failed: usize,
    /// Skipped while their retry backoff runs
    pub deferred: usize,
    pub end: PassEnd,
}

/// Counters of an incident pull
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub core_pages: usize,
    pub additional_pages: usize,
    pub written: usize,
    pub skipped_locally_modified: usize,
    pub concurrently_modified: usize,
}

impl PullSummary {
    fn tally(&mut self, outcomes: &[MergeOutcome]) {
        for outcome in outcomes {
            match outcome {
                MergeOutcome::Inserted(_) | MergeOutcome::Updated(_) => self.written += 1,
                MergeOutcome::SkippedLocallyModified(_) => self.skipped_locally_modified += 1,
                MergeOutcome::ConcurrentlyModified(_) => self.concurrently_modified += 1,
            }
        }
    }
}

/// Result of refreshing an incident's worksites
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Offline,
    /// Local data is complete and fresh
    Skipped { local_count: i64, target_count: i64 },
    Pulled(PullSummary),
    Cancelled(PullSummary),
}

/// Result of caching the region around a point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundedSyncOutcome {
    Disabled,
    Offline,
    /// A cached region already covers the requested one
    AlreadyCached,
    Synced { cells: usize, summary: PullSummary },
    Cancelled { cells: usize, summary: PullSummary },
}

/// Local worksites found around a point
#[derive(Debug, Clone, PartialEq)]
pub struct NearestWorksites {
    /// Nearest first
    pub worksites: Vec<WorksiteSummary>,
    pub cells_scanned: usize,
    pub cancelled: bool,
}

/// Reference-counted "is syncing" flag shared by concurrent operations
struct SyncActivity {
    active: Mutex<usize>,
    is_syncing: watch::Sender<bool>,
}

impl SyncActivity {
    fn begin(self: &Arc<Self>) -> ActivityGuard {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active += 1;
        self.is_syncing.send_if_modified(|syncing| !std::mem::replace(syncing, true));
        ActivityGuard {
            activity: Arc::clone(self),
        }
    }
}

struct ActivityGuard {
    activity: Arc<SyncActivity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let mut active = self
            .activity
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.activity
                .is_syncing
                .send_if_modified(|syncing| std::mem::replace(syncing, false));
        }
    }
}

/// Coordinates uploads and pulls against one local store
#[derive(Clone)]
pub struct SyncOrchestrator {
    db: DatabaseService,
    network: Arc<dyn WorksiteNetwork>,
    account: Arc<dyn AccountDataSource>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    claim_threshold: Arc<dyn ClaimCloseThreshold>,
    settings: SyncSettings,
    syncing_ids: SyncingIds,
    change_syncer: WorksiteChangeSyncer,
    activity: Arc<SyncActivity>,
    syncing_worksite: Arc<watch::Sender<Option<WorksiteId>>>,
}

impl SyncOrchestrator {
    pub fn new(
        db: DatabaseService,
        network: Arc<dyn WorksiteNetwork>,
        account: Arc<dyn AccountDataSource>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        settings: SyncSettings,
    ) -> Self {
        let change_syncer =
            WorksiteChangeSyncer::new(db.clone(), Arc::clone(&network), settings.clone());
        let (is_syncing, _) = watch::channel(false);
        let (syncing_worksite, _) = watch::channel(None);
        Self {
            db,
            network,
            account,
            connectivity,
            claim_threshold: Arc::new(NotSpecifiedClaimThreshold),
            settings,
            syncing_ids: SyncingIds::new(),
            change_syncer,
            activity: Arc::new(SyncActivity {
                active: Mutex::new(0),
                is_syncing,
            }),
            syncing_worksite: Arc::new(syncing_worksite),
        }
    }

    /// Share a syncing id set with other components
    #[must_use]
    pub fn with_syncing_ids(mut self, syncing_ids: SyncingIds) -> Self {
        self.syncing_ids = syncing_ids;
        self
    }

    #[must_use]
    pub fn with_claim_threshold(mut self, claim_threshold: Arc<dyn ClaimCloseThreshold>) -> Self {
        self.claim_threshold = claim_threshold;
        self
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub const fn syncing_ids(&self) -> &SyncingIds {
        &self.syncing_ids
    }

    fn timeout<T>(
        &self,
        call: impl std::future::Future<Output = std::result::Result<T, NetworkError>>,
    ) -> impl std::future::Future<Output = std::result::Result<T, NetworkError>> {
        with_timeout(self.settings.network_timeout(), call)
    }

    /// Signed-in account with a valid token
    async fn active_account(&self) -> Option<AccountData> {
        self.account
            .account()
            .await
            .filter(|account| account.has_valid_token(now_millis()))
    }

    // ---------------------------------------------------------------------
    // Uploads
    // ---------------------------------------------------------------------

    /// Upload one worksite's pending changes
    pub async fn sync_worksite(&self, worksite_id: WorksiteId) -> Result<WorksiteSyncStatus> {
        let Some(_guard) = self.syncing_ids.try_acquire(worksite_id) else {
            tracing::info!("Worksite {worksite_id} is already syncing");
            return Ok(WorksiteSyncStatus::AlreadySyncing);
        };
        if !self.connectivity.is_online() {
            tracing::info!("Offline, not syncing worksite {worksite_id}");
            return Ok(WorksiteSyncStatus::Offline);
        }
        let Some(account) = self.active_account().await else {
            tracing::info!("No valid credentials, not syncing worksite {worksite_id}");
            return Ok(WorksiteSyncStatus::NotAuthenticated);
        };

        let _activity = self.activity.begin();
        self.syncing_worksite.send_replace(Some(worksite_id));
        let result = self.change_syncer.sync_worksite(worksite_id, &account).await;
        self.syncing_worksite.send_if_modified(|current| {
            if *current == Some(worksite_id) {
                *current = None;
                true
            } else {
                false
            }
        });

        match result {
            Ok(outcome) => {
                if let WorksiteSyncOutcome::Uploaded(summary) = outcome {
                    if summary.failed > 0 {
                        self.db.increment_worksite_sync_attempt(worksite_id).await?;
                    }
                }
                Ok(WorksiteSyncStatus::Completed(outcome))
            }
            Err(error) if error.is_pass_fatal() => {
                tracing::warn!("Sync of worksite {worksite_id} failed, will retry later: {error}");
                Ok(WorksiteSyncStatus::FailedRetryLater(error.to_string()))
            }
            Err(Error::Network(error)) => {
                self.db.increment_worksite_sync_attempt(worksite_id).await?;
                Ok(WorksiteSyncStatus::Failed {
                    reason: error.to_string(),
                    retryable: error.classify() == RetryClass::Retryable,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Upload every worksite with pending changes, oldest edits first.
    ///
    /// Worksites inside their retry backoff are deferred. Connectivity or
    /// credential loss ends the pass early.
    pub async fn sync_pending_worksites(
        &self,
        cancel: &CancellationSignal,
    ) -> Result<PendingSyncSummary> {
        let mut summary = PendingSyncSummary::default();
        let pending = self
            .db
            .worksites_pending_sync(self.settings.page_size as usize, self.settings.max_sync_tries)
            .await?;
        let now = now_millis();

        for worksite in pending {
            if cancel.is_cancelled() {
                summary.end = PassEnd::Cancelled;
                break;
            }
            if self.is_backing_off(&worksite, now) {
                summary.deferred += 1;
                continue;
            }

            let status = self.sync_worksite(worksite.worksite_id).await?;
            match &status {
                WorksiteSyncStatus::Completed(WorksiteSyncOutcome::Uploaded(upload))
                    if upload.failed > 0 =>
                {
                    summary.failed += 1;
                }
                WorksiteSyncStatus::Completed(_) => summary.synced += 1,
                WorksiteSyncStatus::Failed { .. } => summary.failed += 1,
                WorksiteSyncStatus::AlreadySyncing => summary.deferred += 1,
                WorksiteSyncStatus::Offline => {
                    summary.end = PassEnd::Aborted("offline".to_string());
                }
                WorksiteSyncStatus::NotAuthenticated => {
                    summary.end = PassEnd::Aborted("not authenticated".to_string());
                }
                WorksiteSyncStatus::FailedRetryLater(reason) => {
                    summary.end = PassEnd::Aborted(reason.clone());
                }
            }
            if status.aborts_pass() {
                break;
            }
        }

        tracing::info!(
            "Pending sync pass: {} synced, {} failed, {} deferred ({:?})",
            summary.synced,
            summary.failed,
            summary.deferred,
            summary.end
        );
        Ok(summary)
    }

    fn is_backing_off(&self, worksite: &PendingWorksite, now: i64) -> bool {
        let delay = backoff_millis(self.settings.retry_delay_ms(), worksite.sync_attempt);
        delay > 0 && now.saturating_sub(worksite.last_attempt_at) < delay
    }

    // ---------------------------------------------------------------------
    // Incident pulls
    // ---------------------------------------------------------------------

    /// Refresh an incident's worksites from the network.
    ///
    /// Pulls when a passive sync is due, the last pull stopped before paging
    /// through every worksite, the local cache holds fewer worksites than
    /// the server reports, or `force_delta` is set. A failed count is
    /// recorded against the incident stats like a failed pull.
    pub async fn refresh_worksites(
        &self,
        incident_id: i64,
        force_delta: bool,
        cancel: &CancellationSignal,
    ) -> Result<RefreshOutcome> {
        if !self.connectivity.is_online() {
            tracing::info!("Offline, not refreshing incident {incident_id}");
            return Ok(RefreshOutcome::Offline);
        }

        let _activity = self.activity.begin();
        let stats = match self.current_stats(incident_id).await {
            Ok(stats) => stats,
            Err(error) => {
                tracing::warn!("Counting worksites of incident {incident_id} failed: {error}");
                if let Err(record_error) = self.record_count_failure(incident_id).await {
                    tracing::warn!("Could not record failed refresh of {incident_id}: {record_error}");
                }
                return Err(error);
            }
        };
        let parameters = self.db.ensure_sync_parameters(incident_id).await?;

        let now = now_millis();
        let local_count = self.db.count_incident_worksites(incident_id).await?;
        let is_due = stats.should_sync_passively(
            now,
            self.settings.passive_sync_interval_ms(),
            self.settings.retry_delay_ms(),
        );
        let is_current = stats.is_paging_complete() && local_count >= stats.data_count;
        if !force_delta && !is_due && is_current {
            tracing::debug!(
                "Incident {incident_id} is fresh ({local_count}/{} worksites)",
                stats.data_count
            );
            return Ok(RefreshOutcome::Skipped {
                local_count,
                target_count: stats.data_count,
            });
        }

        let mut summary = PullSummary::default();
        match self.pull_incident(&parameters, cancel, &mut summary).await {
            Ok(true) => {
                let paged_count = self.db.count_incident_worksites(incident_id).await?;
                self.db
                    .save_sync_stats(&stats.with_success(now_millis(), paged_count))
                    .await?;
                tracing::info!(
                    "Refreshed incident {incident_id}: {} written, {} skipped as locally modified",
                    summary.written,
                    summary.skipped_locally_modified
                );
                Ok(RefreshOutcome::Pulled(summary))
            }
            Ok(false) => {
                tracing::info!("Refresh of incident {incident_id} cancelled");
                Ok(RefreshOutcome::Cancelled(summary))
            }
            Err(error) => {
                tracing::warn!("Refresh of incident {incident_id} failed: {error}");
                self.db
                    .save_sync_stats(&stats.with_failure(now_millis()))
                    .await?;
                Err(error)
            }
        }
    }

    /// Count a failed refresh against the incident's stats.
    ///
    /// Without cached stats a placeholder is saved with no sync start, so
    /// the next refresh counts again.
    async fn record_count_failure(&self, incident_id: i64) -> Result<()> {
        let stats = self
            .db
            .get_sync_stats(incident_id)
            .await?
            .unwrap_or_else(|| {
                IncidentDataSyncStats::new(incident_id, 0, 0, self.settings.app_build_version)
            });
        self.db.save_sync_stats(&stats.with_failure(now_millis())).await
    }

    /// Cached stats, re-counted when missing or outdated.
    ///
    /// Stats written by an older data build also reset the pull cursors.
    async fn current_stats(&self, incident_id: i64) -> Result<IncidentDataSyncStats> {
        let now = now_millis();
        let cached = self.db.get_sync_stats(incident_id).await?;
        if let Some(stats) = &cached {
            if !stats.is_data_version_outdated(
                self.settings.data_build_version,
                now,
                self.settings.stats_max_age_ms(),
            ) {
                return Ok(stats.clone());
            }
        }

        let data_count = self
            .timeout(self.network.count_worksites(incident_id, 0))
            .await?;
        let stats = match cached {
            Some(stats) if stats.app_build_version_code >= self.settings.data_build_version => {
                IncidentDataSyncStats {
                    sync_start: now,
                    data_count,
                    ..stats
                }
            }
            Some(_) => {
                tracing::info!("Incident {incident_id} data predates this build; resetting cursors");
                self.db.delete_sync_parameters(incident_id).await?;
                IncidentDataSyncStats::new(
                    incident_id,
                    now,
                    data_count,
                    self.settings.app_build_version,
                )
            }
            None => IncidentDataSyncStats::new(
                incident_id,
                now,
                data_count,
                self.settings.app_build_version,
            ),
        };
        self.db.save_sync_stats(&stats).await?;
        Ok(stats)
    }

    /// Pull both windows of an incident. Returns `false` when cancelled.
    async fn pull_incident(
        &self,
        parameters: &IncidentDataSyncParameters,
        cancel: &CancellationSignal,
        summary: &mut PullSummary,
    ) -> Result<bool> {
        let incident_id = parameters.incident_id;
        if !self
            .pull_window(incident_id, WorksiteFieldSet::Core, parameters.core, cancel, summary)
            .await?
        {
            return Ok(false);
        }
        self.pull_window(
            incident_id,
            WorksiteFieldSet::Additional,
            parameters.additional,
            cancel,
            summary,
        )
        .await
    }

    /// Backfill a window toward the oldest record, then pull deltas.
    ///
    /// Pages are keyed by update time and network id, so records sharing a
    /// timestamp across a page boundary are neither skipped nor looped on.
    /// Only timestamps are persisted: a resumed walk re-reads the boundary
    /// timestamp and merges it idempotently. Cursors move after each
    /// committed page, `before` only backward and `after` only forward.
    async fn pull_window(
        &self,
        incident_id: i64,
        fields: WorksiteFieldSet,
        mut marker: SyncTimeMarker,
        cancel: &CancellationSignal,
        summary: &mut PullSummary,
    ) -> Result<bool> {
        let (before_cursor, after_cursor) = match fields {
            WorksiteFieldSet::Core => (WindowCursor::CoreBefore, WindowCursor::CoreAfter),
            WorksiteFieldSet::Additional => {
                (WindowCursor::AdditionalBefore, WindowCursor::AdditionalAfter)
            }
        };
        let limit = self.settings.page_size;
        let keep_key_work_type = fields == WorksiteFieldSet::Additional;

        let mut boundary_network_id = None;
        while !marker.is_backfilled() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let query = WorksitePageQuery {
                incident_id,
                fields,
                updated_before: marker.has_synced().then_some(marker.before),
                updated_after: None,
                boundary_network_id,
                limit,
            };
            let page = self.timeout(self.network.get_worksites_page(&query)).await?;
            let outcomes = self
                .db
                .sync_network_worksites(&page, now_millis(), keep_key_work_type)
                .await?;
            summary.tally(&outcomes);
            count_page(summary, fields);

            if let Some((newest, _)) = page.iter().filter_map(page_key).max() {
                if newest > marker.after {
                    self.db
                        .advance_sync_cursor(incident_id, after_cursor, newest)
                        .await?;
                    marker.after = newest;
                }
            }

            let oldest = page.iter().filter_map(page_key).min();
            let next_before = match oldest {
                Some((updated_at, network_id)) if page.len() >= limit as usize => {
                    boundary_network_id = Some(network_id);
                    updated_at
                }
                _ => 0,
            };
            self.db
                .advance_sync_cursor(incident_id, before_cursor, next_before)
                .await?;
            marker.before = next_before;
        }

        boundary_network_id = None;
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let query = WorksitePageQuery {
                incident_id,
                fields,
                updated_before: None,
                updated_after: Some(marker.after),
                boundary_network_id,
                limit,
            };
            let page = self.timeout(self.network.get_worksites_page(&query)).await?;
            let outcomes = self
                .db
                .sync_network_worksites(&page, now_millis(), keep_key_work_type)
                .await?;
            summary.tally(&outcomes);
            count_page(summary, fields);

            if let Some((newest, network_id)) = page.iter().filter_map(page_key).max() {
                if newest > marker.after {
                    self.db
                        .advance_sync_cursor(incident_id, after_cursor, newest)
                        .await?;
                    marker.after = newest;
                }
                boundary_network_id = Some(network_id);
            }
            if page.len() < limit as usize {
                return Ok(true);
            }
        }
    }

    /// Cache every worksite within the configured radius of `center`,
    /// loading grid cells nearest first
    pub async fn sync_bounded_region(
        &self,
        incident_id: i64,
        center: LatLng,
        cancel: &CancellationSignal,
    ) -> Result<BoundedSyncOutcome> {
        if !self.settings.is_bounded_sync_enabled {
            return Ok(BoundedSyncOutcome::Disabled);
        }
        let region = BoundedRegion {
            latitude: center.latitude,
            longitude: center.longitude,
            radius_miles: self.settings.bounded_region_radius_miles,
        };
        let parameters = self.db.ensure_sync_parameters(incident_id).await?;
        if parameters.is_bounded_region_cached(
            &region,
            now_millis(),
            self.settings.bounded_region_max_age_ms(),
        ) {
            return Ok(BoundedSyncOutcome::AlreadyCached);
        }
        if !self.connectivity.is_online() {
            return Ok(BoundedSyncOutcome::Offline);
        }

        let _activity = self.activity.begin();
        let grid = BoundedGrid::new(region.bounding_box(), self.settings.bounded_grid_divisions);
        let mut summary = PullSummary::default();
        let mut cells = 0;
        for cell in grid.cells_nearest_first(center) {
            if cancel.is_cancelled() {
                tracing::info!("Bounded sync of incident {incident_id} cancelled after {cells} cells");
                return Ok(BoundedSyncOutcome::Cancelled { cells, summary });
            }
            let worksites = self
                .timeout(self.network.get_worksites_in_bounds(incident_id, &cell.bounds))
                .await?;
            let outcomes = self
                .db
                .sync_network_worksites(&worksites, now_millis(), false)
                .await?;
            summary.tally(&outcomes);
            cells += 1;
        }

        self.db
            .update_bounded_region(incident_id, &region, now_millis())
            .await?;
        tracing::info!(
            "Cached {} worksites within {} miles for incident {incident_id}",
            summary.written,
            region.radius_miles
        );
        Ok(BoundedSyncOutcome::Synced { cells, summary })
    }

    /// Scan the local cache outward from `center` until `limit` worksites
    /// within the configured radius are found
    pub async fn nearest_worksites(
        &self,
        incident_id: i64,
        center: LatLng,
        limit: usize,
        cancel: &CancellationSignal,
    ) -> Result<NearestWorksites> {
        let radius_miles = self.settings.bounded_region_radius_miles;
        let region = BoundedRegion {
            latitude: center.latitude,
            longitude: center.longitude,
            radius_miles,
        };
        let grid = BoundedGrid::new(region.bounding_box(), self.settings.bounded_grid_divisions);

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut cells_scanned = 0;
        let mut cancelled = false;
        for cell in grid.cells_nearest_first(center) {
            if found.len() >= limit {
                break;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let summaries = self
                .db
                .list_worksite_summaries_in_bounds(incident_id, &cell.bounds)
                .await?;
            cells_scanned += 1;
            for summary in summaries {
                let distance =
                    center.distance_miles(LatLng::new(summary.latitude, summary.longitude));
                if distance <= radius_miles && seen.insert(summary.id) {
                    found.push((distance, summary));
                }
            }
        }

        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(NearestWorksites {
            worksites: found
                .into_iter()
                .take(limit)
                .map(|(_, summary)| summary)
                .collect(),
            cells_scanned,
            cancelled,
        })
    }

    // ---------------------------------------------------------------------
    // Incidents and lookups
    // ---------------------------------------------------------------------

    /// Pull an incident and cache it
    pub async fn refresh_incident(
        &self,
        incident_id: i64,
        fields: IncidentFieldSet,
    ) -> Result<Incident> {
        if !self.connectivity.is_online() {
            return Err(NetworkError::NoConnection.into());
        }
        let incident = self
            .timeout(self.network.get_incident(incident_id, fields))
            .await?;
        self.db.save_incident(&incident).await?;
        Ok(incident)
    }

    /// Resolve list entries of one model kind
    pub async fn lookup_list_objects(
        &self,
        model: ListModel,
        ids: &[i64],
    ) -> Result<ListObjectLookup> {
        if ids.is_empty() {
            return Ok(ListObjectLookup::empty(model));
        }
        if !self.connectivity.is_online() {
            return Err(NetworkError::NoConnection.into());
        }
        Ok(self
            .timeout(self.network.lookup_list_objects(model, ids))
            .await?)
    }

    /// Claim-close policy results for the open claims of `organization_id`
    pub async fn claim_close_statuses(
        &self,
        worksite_id: WorksiteId,
        organization_id: i64,
    ) -> Result<Vec<(WorkType, ClaimThresholdStatus)>> {
        let local = self
            .db
            .get_worksite(worksite_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Worksite {worksite_id}")))?;
        let worksite: &Worksite = &local.worksite;
        Ok(super::claim::open_claims(worksite, organization_id)
            .into_iter()
            .map(|work_type| {
                (
                    work_type.clone(),
                    self.claim_threshold.is_within_claim_close_threshold(
                        worksite,
                        work_type,
                        organization_id,
                    ),
                )
            })
            .collect())
    }

    // ---------------------------------------------------------------------
    // Observables
    // ---------------------------------------------------------------------

    pub fn observe_is_syncing(&self) -> watch::Receiver<bool> {
        self.activity.is_syncing.subscribe()
    }

    pub fn observe_syncing_worksite(&self) -> watch::Receiver<Option<WorksiteId>> {
        self.syncing_worksite.subscribe()
    }

    /// "Is syncing" paired with the worksite currently uploading
    pub fn observe_sync_state(&self) -> watch::Receiver<(bool, Option<WorksiteId>)> {
        combine_latest(self.observe_is_syncing(), self.observe_syncing_worksite())
    }

    pub async fn observe_pending_worksites(
        &self,
        limit: usize,
    ) -> Result<watch::Receiver<Vec<PendingWorksite>>> {
        self.db
            .observe_pending_worksites(limit, self.settings.max_sync_tries)
            .await
    }

    pub async fn observe_incident_stats(
        &self,
        incident_id: i64,
    ) -> Result<watch::Receiver<Option<IncidentDataSyncStats>>> {
        self.db.observe_sync_stats(incident_id).await
    }
}

/// Position of a pulled record in page order
fn page_key(worksite: &Worksite) -> Option<(i64, i64)> {
    worksite
        .updated_at
        .map(|updated_at| (updated_at, worksite.network_id))
}

const fn count_page(summary: &mut PullSummary, fields: WorksiteFieldSet) {
    match fields {
        WorksiteFieldSet::Core => summary.core_pages += 1,
        WorksiteFieldSet::Additional => summary.additional_pages += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LocalEditContext;
    use crate::sync::fake::{FakeAccount, FakeConnectivity, FakeNetwork};
    use pretty_assertions::assert_eq;

    struct Harness {
        db: DatabaseService,
        network: Arc<FakeNetwork>,
        account: Arc<FakeAccount>,
        connectivity: Arc<FakeConnectivity>,
        orchestrator: SyncOrchestrator,
    }

    async fn harness(settings: SyncSettings) -> Harness {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let network = Arc::new(FakeNetwork::new());
        let account = Arc::new(FakeAccount::signed_in());
        let connectivity = Arc::new(FakeConnectivity::online());
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            network.clone(),
            account.clone(),
            connectivity.clone(),
            settings,
        );
        Harness {
            db,
            network,
            account,
            connectivity,
            orchestrator,
        }
    }

    fn server_worksite(incident_id: i64, name: &str, updated_at: i64) -> Worksite {
        let mut worksite = Worksite::new(incident_id, 29.95, -90.07);
        worksite.name = name.to_string();
        worksite.case_number = format!("C-{name}");
        worksite.updated_at = Some(updated_at);
        let mut work_type = WorkType::new("muck_out", "open_unassigned");
        work_type.network_id = updated_at;
        worksite.key_work_type = Some(work_type.clone());
        worksite.work_types.push(work_type);
        worksite
    }

    async fn offline_edit(db: &DatabaseService, name: &str) -> WorksiteId {
        let mut worksite = Worksite::new(1, 29.95, -90.07);
        worksite.name = name.to_string();
        let context = LocalEditContext {
            organization_id: 5,
            app_version: 1,
            edited_at: 100,
        };
        db.save_worksite_change(None, &worksite, None, context)
            .await
            .unwrap()
            .unwrap()
            .worksite_id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejects_when_offline_or_signed_out() {
        let h = harness(SyncSettings::default()).await;
        let id = offline_edit(&h.db, "Parker").await;

        h.connectivity.set_online(false);
        assert_eq!(
            h.orchestrator.sync_worksite(id).await.unwrap(),
            WorksiteSyncStatus::Offline
        );

        h.connectivity.set_online(true);
        h.account.set(None);
        assert_eq!(
            h.orchestrator.sync_worksite(id).await.unwrap(),
            WorksiteSyncStatus::NotAuthenticated
        );
        assert!(h.network.requests().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_concurrent_sync_is_rejected() {
        let h = harness(SyncSettings::default()).await;
        let id = offline_edit(&h.db, "Quinn").await;

        let held = h.orchestrator.syncing_ids().try_acquire(id).unwrap();
        assert_eq!(
            h.orchestrator.sync_worksite(id).await.unwrap(),
            WorksiteSyncStatus::AlreadySyncing
        );
        drop(held);

        let status = h.orchestrator.sync_worksite(id).await.unwrap();
        assert!(matches!(status, WorksiteSyncStatus::Completed(_)));
        assert!(h.orchestrator.syncing_ids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fatal_failure_does_not_count_against_worksite() {
        let h = harness(SyncSettings::default()).await;
        let id = offline_edit(&h.db, "Reese").await;
        h.network.fail_requests(Some(NetworkError::ExpiredToken));

        let status = h.orchestrator.sync_worksite(id).await.unwrap();
        assert!(matches!(status, WorksiteSyncStatus::FailedRetryLater(_)));
        assert_eq!(h.db.get_worksite_root(id).await.unwrap().unwrap().sync_attempt, 0);

        h.network.fail_requests(Some(NetworkError::Timeout));
        let status = h.orchestrator.sync_worksite(id).await.unwrap();
        assert_eq!(
            status,
            WorksiteSyncStatus::Failed {
                reason: "Request timed out".to_string(),
                retryable: true,
            }
        );
        assert_eq!(h.db.get_worksite_root(id).await.unwrap().unwrap().sync_attempt, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_pass_defers_backed_off_worksites() {
        let h = harness(SyncSettings::default()).await;
        let first = offline_edit(&h.db, "Sage").await;
        let second = offline_edit(&h.db, "Tatum").await;

        h.network.fail_requests(Some(NetworkError::Timeout));
        h.orchestrator.sync_worksite(first).await.unwrap();
        h.network.fail_requests(None);

        let summary = h
            .orchestrator
            .sync_pending_worksites(&CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.end, PassEnd::Completed);
        assert!(!h.db.get_worksite_root(second).await.unwrap().unwrap().is_local_modified);
        assert!(h.db.get_worksite_root(first).await.unwrap().unwrap().is_local_modified);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_pass_stops_when_cancelled() {
        let h = harness(SyncSettings::default()).await;
        offline_edit(&h.db, "Uma").await;
        let cancel = CancellationSignal::new();
        cancel.cancel();

        let summary = h.orchestrator.sync_pending_worksites(&cancel).await.unwrap();
        assert_eq!(summary.end, PassEnd::Cancelled);
        assert!(h.network.requests().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_pages_backward_then_skips_when_fresh() {
        let settings = SyncSettings {
            page_size: 2,
            ..SyncSettings::default()
        };
        let h = harness(settings).await;
        for (index, name) in ["Avery", "Blake", "Cameron", "Dakota", "Emerson"]
            .iter()
            .enumerate()
        {
            h.network
                .insert_worksite(server_worksite(1, name, 100 + index as i64 * 10));
        }

        let outcome = h
            .orchestrator
            .refresh_worksites(1, false, &CancellationSignal::new())
            .await
            .unwrap();
        let RefreshOutcome::Pulled(summary) = outcome else {
            panic!("expected pull, got {outcome:?}");
        };
        assert!(summary.core_pages >= 3);
        assert_eq!(h.db.count_incident_worksites(1).await.unwrap(), 5);

        let parameters = h.db.get_sync_parameters(1).await.unwrap().unwrap();
        assert!(parameters.core.is_backfilled());
        assert_eq!(parameters.core.after, 140);
        assert!(parameters.additional.is_backfilled());

        let stats = h.db.get_sync_stats(1).await.unwrap().unwrap();
        assert_eq!(stats.data_count, 5);
        assert_eq!(stats.paged_count, 5);
        assert_eq!(stats.attempted_counter, 0);

        let outcome = h
            .orchestrator
            .refresh_worksites(1, false, &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RefreshOutcome::Skipped {
                local_count: 5,
                target_count: 5
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_failure_is_recorded_in_stats() {
        let h = harness(SyncSettings::default()).await;
        h.network.insert_worksite(server_worksite(1, "Finley", 100));
        h.orchestrator
            .refresh_worksites(1, false, &CancellationSignal::new())
            .await
            .unwrap();

        h.network.fail_fetches(Some(NetworkError::Status {
            code: 502,
            message: "bad gateway".to_string(),
        }));
        let error = h
            .orchestrator
            .refresh_worksites(1, true, &CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Network(NetworkError::Status { code: 502, .. })));

        let stats = h.db.get_sync_stats(1).await.unwrap().unwrap();
        assert_eq!(stats.attempted_counter, 1);
        assert_eq!(stats.paged_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_count_is_recorded_in_stats() {
        let h = harness(SyncSettings::default()).await;
        h.network.insert_worksite(server_worksite(1, "Ellis", 100));
        h.network.fail_fetches(Some(NetworkError::Timeout));

        let error = h
            .orchestrator
            .refresh_worksites(1, false, &CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Network(NetworkError::Timeout)));
        let stats = h.db.get_sync_stats(1).await.unwrap().unwrap();
        assert_eq!(stats.attempted_counter, 1);
        assert_eq!(stats.successful_sync, None);
        assert!(stats.attempted_sync.is_some());

        h.orchestrator
            .refresh_worksites(1, false, &CancellationSignal::new())
            .await
            .unwrap_err();
        assert_eq!(h.db.get_sync_stats(1).await.unwrap().unwrap().attempted_counter, 2);

        h.network.fail_fetches(None);
        let outcome = h
            .orchestrator
            .refresh_worksites(1, false, &CancellationSignal::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Pulled(_)));
        let stats = h.db.get_sync_stats(1).await.unwrap().unwrap();
        assert_eq!(stats.data_count, 1);
        assert_eq!(stats.attempted_counter, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pages_sharing_a_timestamp_are_not_skipped() {
        let settings = SyncSettings {
            page_size: 2,
            ..SyncSettings::default()
        };
        let h = harness(settings).await;
        let publish = |name: &str, updated_at: i64, work_type_id: i64| {
            let mut worksite = server_worksite(1, name, updated_at);
            worksite.work_types[0].network_id = work_type_id;
            worksite.key_work_type = Some(worksite.work_types[0].clone());
            h.network.insert_worksite(worksite)
        };
        for (index, name) in ["Ari", "Bo", "Cy", "Di", "Ez"].iter().enumerate() {
            publish(name, 100, 500 + index as i64);
        }
        publish("Fen", 200, 600);
        publish("Gil", 200, 601);

        let outcome = h
            .orchestrator
            .refresh_worksites(1, false, &CancellationSignal::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Pulled(_)));
        assert_eq!(h.db.count_incident_worksites(1).await.unwrap(), 7);
        let parameters = h.db.get_sync_parameters(1).await.unwrap().unwrap();
        assert!(parameters.core.is_backfilled());
        assert_eq!(parameters.core.after, 200);

        let backward: Vec<(Option<i64>, Option<i64>)> = h
            .network
            .page_queries()
            .iter()
            .filter(|query| query.fields == WorksiteFieldSet::Core && query.is_backward())
            .map(|query| (query.updated_before, query.boundary_network_id))
            .collect();
        assert_eq!(backward[0], (None, None));
        assert!(backward[1..]
            .iter()
            .all(|(before, boundary)| before.is_some() && boundary.is_some()));

        for (index, name) in ["Hal", "Ivo", "Jun"].iter().enumerate() {
            publish(name, 200, 700 + index as i64);
        }
        h.orchestrator
            .refresh_worksites(1, true, &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(h.db.count_incident_worksites(1).await.unwrap(), 10);
        assert_eq!(
            h.db.get_sync_parameters(1).await.unwrap().unwrap().core.after,
            200
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_refresh_keeps_committed_cursors() {
        let h = harness(SyncSettings::default()).await;
        h.network.insert_worksite(server_worksite(1, "Gray", 100));
        let cancel = CancellationSignal::new();
        cancel.cancel();

        let outcome = h.orchestrator.refresh_worksites(1, true, &cancel).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Cancelled(PullSummary::default()));
        assert!(h.db.get_sync_stats(1).await.unwrap().unwrap().successful_sync.is_none());
        assert_eq!(
            h.db.get_sync_parameters(1).await.unwrap().unwrap().core,
            SyncTimeMarker::UNSYNCED
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bounded_sync_caches_region_once() {
        let settings = SyncSettings {
            bounded_grid_divisions: 3,
            ..SyncSettings::default()
        };
        let h = harness(settings).await;
        h.network.insert_worksite(server_worksite(1, "Harper", 100));
        let mut far = server_worksite(1, "Indigo", 110);
        far.latitude = 40.0;
        h.network.insert_worksite(far);

        let center = LatLng::new(29.95, -90.07);
        let outcome = h
            .orchestrator
            .sync_bounded_region(1, center, &CancellationSignal::new())
            .await
            .unwrap();
        let BoundedSyncOutcome::Synced { cells, summary } = outcome else {
            panic!("expected bounded sync, got {outcome:?}");
        };
        assert_eq!(cells, 9);
        assert_eq!(summary.written, 1);
        assert_eq!(h.db.count_incident_worksites(1).await.unwrap(), 1);

        assert_eq!(
            h.orchestrator
                .sync_bounded_region(1, center, &CancellationSignal::new())
                .await
                .unwrap(),
            BoundedSyncOutcome::AlreadyCached
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bounded_region_is_pulled_again_once_expired() {
        let settings = SyncSettings {
            bounded_grid_divisions: 2,
            bounded_region_max_age_secs: 60,
            ..SyncSettings::default()
        };
        let h = harness(settings.clone()).await;
        let network_id = h.network.insert_worksite(server_worksite(1, "Harper", 100));
        let center = LatLng::new(29.95, -90.07);
        h.orchestrator
            .sync_bounded_region(1, center, &CancellationSignal::new())
            .await
            .unwrap();

        h.network
            .edit_worksite(network_id, |worksite| worksite.name = "Harper Lane".to_string());
        let region = BoundedRegion {
            latitude: center.latitude,
            longitude: center.longitude,
            radius_miles: settings.bounded_region_radius_miles,
        };
        let expired_at = now_millis() - settings.bounded_region_max_age_ms() - 1_000;
        h.db.update_bounded_region(1, &region, expired_at)
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .sync_bounded_region(1, center, &CancellationSignal::new())
            .await
            .unwrap();
        assert!(matches!(outcome, BoundedSyncOutcome::Synced { cells: 4, .. }));
        let local = h
            .db
            .get_worksite_by_network_id(network_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.worksite.name, "Harper Lane");
        assert!(h.db.get_sync_parameters(1).await.unwrap().unwrap().bounded_synced_at > expired_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nearest_worksites_sorted_by_distance() {
        let h = harness(SyncSettings::default()).await;
        let mut near = server_worksite(1, "Jordan", 100);
        near.latitude = 29.951;
        let mut nearer = server_worksite(1, "Kai", 110);
        nearer.latitude = 29.9501;
        let mut outside = server_worksite(1, "Lane", 120);
        outside.latitude = 31.0;
        h.db.sync_network_worksites(
            &[
                Worksite { network_id: 1, ..near },
                Worksite { network_id: 2, ..nearer },
                Worksite { network_id: 3, ..outside },
            ],
            1,
            false,
        )
        .await
        .unwrap();

        let nearest = h
            .orchestrator
            .nearest_worksites(1, LatLng::new(29.95, -90.07), 5, &CancellationSignal::new())
            .await
            .unwrap();
        let names: Vec<&str> = nearest.worksites.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["Kai", "Jordan"]);
        assert!(!nearest.cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_state_observables() {
        let h = harness(SyncSettings::default()).await;
        let state = h.orchestrator.observe_sync_state();
        assert_eq!(*state.borrow(), (false, None));

        let id = offline_edit(&h.db, "Morgan").await;
        let mut is_syncing = h.orchestrator.observe_is_syncing();
        h.orchestrator.sync_worksite(id).await.unwrap();
        assert!(!*is_syncing.borrow_and_update());
        assert_eq!(*h.orchestrator.observe_syncing_worksite().borrow(), None);

        let pending = h.orchestrator.observe_pending_worksites(10).await.unwrap();
        assert!(pending.borrow().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_incident_caches_full_incident() {
        let h = harness(SyncSettings::default()).await;
        h.network.insert_incident(Incident {
            id: 9,
            name: "Hurricane Ida".to_string(),
            short_name: "ida".to_string(),
            start_at: 1_630_000_000_000,
            is_archived: false,
            form_fields: Vec::new(),
        });

        let incident = h
            .orchestrator
            .refresh_incident(9, IncidentFieldSet::Full)
            .await
            .unwrap();
        assert_eq!(incident.short_name, "ida");
        assert_eq!(h.db.get_incident(9).await.unwrap(), Some(incident));

        h.connectivity.set_online(false);
        assert!(h
            .orchestrator
            .refresh_incident(9, IncidentFieldSet::Short)
            .await
            .unwrap_err()
            .is_pass_fatal());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_claim_close_defaults_to_not_specified() {
        let h = harness(SyncSettings::default()).await;
        let mut worksite = server_worksite(1, "Nova", 100);
        worksite.network_id = 77;
        worksite.work_types[0].org_claim = Some(5);
        let id = h.db.sync_network_worksites(&[worksite], 1, false).await.unwrap()[0].worksite_id();

        let statuses = h.orchestrator.claim_close_statuses(id, 5).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1, ClaimThresholdStatus::NotSpecified);
    }
}
