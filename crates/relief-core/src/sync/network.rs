//! Network data source interfaces consumed by the sync engine

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    BoundingBox, Incident, IncidentFieldSet, ListModel, ListObjectLookup, LocalChange, Worksite,
    WorksiteId,
};

/// Typed failures reported by the network data source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("No network connection")]
    NoConnection,

    #[error("Access token expired")]
    ExpiredToken,

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

/// How a failed request should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Retry policy for HTTP-like status codes
pub const fn classify_status(code: u16) -> RetryClass {
    match code {
        401 | 403 => RetryClass::ReauthRequired,
        408 | 409 | 423 | 425 | 429 | 500..=599 => RetryClass::Retryable,
        _ => RetryClass::Permanent,
    }
}

impl NetworkError {
    pub const fn classify(&self) -> RetryClass {
        match self {
            Self::NoConnection | Self::Timeout => RetryClass::Retryable,
            Self::ExpiredToken => RetryClass::ReauthRequired,
            Self::Status { code, .. } => classify_status(*code),
            Self::Decode(_) | Self::Other(_) => RetryClass::Permanent,
        }
    }

    /// Connectivity loss or expired credentials abort a whole sync pass
    pub const fn is_pass_fatal(&self) -> bool {
        matches!(self, Self::NoConnection)
            || matches!(self.classify(), RetryClass::ReauthRequired)
    }
}

/// Run a network call with a timeout, reporting expiry as [`NetworkError::Timeout`]
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, NetworkError>
where
    F: Future<Output = Result<T, NetworkError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(NetworkError::Timeout))
}

/// Field set of a worksite page pull
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorksiteFieldSet {
    /// Fields needed for lists and map markers
    Core,
    /// Everything else: notes, form data, files, requests
    Additional,
}

/// One page of an incident's worksites in a time window.
///
/// With `updated_before` set, pages walk backward and results come newest
/// first. With `updated_after` set, pages walk forward and results come
/// oldest first. Both bounds are inclusive. Ties on `updated_at` are ordered
/// by network id, in the same direction as the walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorksitePageQuery {
    pub incident_id: i64,
    pub fields: WorksiteFieldSet,
    pub updated_before: Option<i64>,
    pub updated_after: Option<i64>,
    /// Last network id already read at the bound timestamp. Records updated
    /// exactly at the bound are limited to ids past it in walk order.
    #[serde(default)]
    pub boundary_network_id: Option<i64>,
    pub limit: u32,
}

impl WorksitePageQuery {
    /// Whether a record updated at `updated_at` with `network_id` falls in
    /// the page window
    #[must_use]
    pub fn includes(&self, updated_at: i64, network_id: i64) -> bool {
        let backward = self.is_backward();
        let past_boundary = |bound: i64| {
            updated_at != bound
                || self.boundary_network_id.map_or(true, |boundary| {
                    if backward {
                        network_id < boundary
                    } else {
                        network_id > boundary
                    }
                })
        };
        self.updated_before
            .map_or(true, |before| updated_at <= before && (!backward || past_boundary(before)))
            && self
                .updated_after
                .map_or(true, |after| updated_at >= after && (backward || past_boundary(after)))
    }

    /// Whether results walk backward from `updated_before`
    #[must_use]
    pub const fn is_backward(&self) -> bool {
        self.updated_before.is_some() || self.updated_after.is_none()
    }
}

/// Signed-in account data needed to submit changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountData {
    pub user_id: i64,
    pub organization_id: i64,
    pub organization_name: String,
    /// Unix ms when the access token expires
    pub token_expiry: i64,
    #[serde(default)]
    pub affiliate_organization_ids: Vec<i64>,
}

impl AccountData {
    #[must_use]
    pub const fn has_valid_token(&self, now: i64) -> bool {
        self.token_expiry > now
    }
}

/// Everything the server needs to replay a worksite's unsynced changes
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSyncRequest {
    pub account: AccountData,
    pub worksite_id: WorksiteId,
    /// `-1` when the server has never seen the worksite
    pub worksite_network_id: i64,
    /// Latest synced change preceding `changes`, the baseline for diffs
    pub reference_change: Option<LocalChange>,
    /// Unsynced changes, oldest first
    pub changes: Vec<LocalChange>,
    /// Archived but not fully synced changes lie between the reference and `changes`
    pub has_prior_unsynced_changes: bool,
    /// Local child id to network id
    pub flag_id_lookup: HashMap<i64, i64>,
    pub note_id_lookup: HashMap<i64, i64>,
    pub work_type_id_lookup: HashMap<i64, i64>,
    pub affiliate_organization_ids: Vec<i64>,
}

/// Server outcome of one change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    Synced,
    PartiallySynced,
    Failed(NetworkError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeResult {
    pub change_id: i64,
    pub outcome: ChangeOutcome,
}

impl ChangeResult {
    /// Fatal failure that must abort the pass
    #[must_use]
    pub fn fatal_error(&self) -> Option<&NetworkError> {
        match &self.outcome {
            ChangeOutcome::Failed(error) if error.is_pass_fatal() => Some(error),
            _ => None,
        }
    }
}

/// Network ids the server assigned while replaying changes, keyed by local id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncIdMapping {
    pub worksite_network_id: Option<i64>,
    pub flag_ids: HashMap<i64, i64>,
    pub note_ids: HashMap<i64, i64>,
    pub work_type_ids: HashMap<i64, i64>,
    pub work_type_request_ids: HashMap<i64, i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSyncResult {
    pub change_results: Vec<ChangeResult>,
    pub id_mapping: SyncIdMapping,
}

impl ChangeSyncResult {
    /// First fatal failure among the change results
    #[must_use]
    pub fn first_fatal_error(&self) -> Option<&NetworkError> {
        self.change_results.iter().find_map(ChangeResult::fatal_error)
    }
}

/// Remote worksite API
#[async_trait]
pub trait WorksiteNetwork: Send + Sync {
    async fn get_incident(
        &self,
        incident_id: i64,
        fields: IncidentFieldSet,
    ) -> Result<Incident, NetworkError>;

    /// Number of worksites in an incident updated at or after `updated_after`
    async fn count_worksites(&self, incident_id: i64, updated_after: i64)
        -> Result<i64, NetworkError>;

    async fn get_worksite(&self, network_id: i64) -> Result<Option<Worksite>, NetworkError>;

    async fn get_worksites_page(
        &self,
        query: &WorksitePageQuery,
    ) -> Result<Vec<Worksite>, NetworkError>;

    async fn get_worksites_in_bounds(
        &self,
        incident_id: i64,
        bounds: &BoundingBox,
    ) -> Result<Vec<Worksite>, NetworkError>;

    /// Replay a worksite's changes on the server
    async fn sync_worksite_changes(
        &self,
        request: &ChangeSyncRequest,
    ) -> Result<ChangeSyncResult, NetworkError>;

    /// Resolve list entries of one model kind
    async fn lookup_list_objects(
        &self,
        model: ListModel,
        ids: &[i64],
    ) -> Result<ListObjectLookup, NetworkError>;
}

/// Source of the signed-in account
#[async_trait]
pub trait AccountDataSource: Send + Sync {
    /// `None` when nobody is signed in
    async fn account(&self) -> Option<AccountData>;
}

/// Network reachability
pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}
