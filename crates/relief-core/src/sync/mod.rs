//! Offline-first sync engine.
//!
//! Local edits are appended to a per-worksite change log and uploaded by
//! [`WorksiteChangeSyncer`]. Server snapshots are merged by
//! [`WorksiteMerger`], which never overwrites a worksite holding unsynced
//! edits. [`SyncOrchestrator`] decides when to upload or pull and exposes
//! the sync state as `watch` observables.

mod bounded;
mod cancel;
mod change_syncer;
mod claim;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
mod guard;
mod merge;
mod network;
mod observe;
mod orchestrator;

pub use bounded::{BoundedGrid, GridCell};
pub use cancel::CancellationSignal;
pub use change_syncer::{
    plan_change_sync, ChangeSyncPlan, UploadSummary, WorksiteChangeSyncer, WorksiteSyncOutcome,
};
pub use claim::{open_claims, ClaimCloseThreshold, ClaimThresholdStatus, NotSpecifiedClaimThreshold};
pub use guard::{SyncingGuard, SyncingIds};
pub use merge::{MergeOutcome, WorksiteMerger};
pub use network::{
    classify_status, with_timeout, AccountData, AccountDataSource, ChangeOutcome, ChangeResult,
    ChangeSyncRequest, ChangeSyncResult, ConnectivityMonitor, NetworkError, RetryClass,
    SyncIdMapping, WorksiteFieldSet, WorksiteNetwork, WorksitePageQuery,
};
pub use observe::combine_latest;
pub use orchestrator::{
    BoundedSyncOutcome, NearestWorksites, PassEnd, PendingSyncSummary, PullSummary,
    RefreshOutcome, SyncOrchestrator, WorksiteSyncStatus,
};
