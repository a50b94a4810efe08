//! At-most-one concurrent sync per worksite

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::WorksiteId;

/// Set of worksites currently syncing.
///
/// Cloning shares the set, so one value can be injected into every
/// component that must respect the same guard.
#[derive(Debug, Clone, Default)]
pub struct SyncingIds {
    ids: Arc<Mutex<HashSet<WorksiteId>>>,
}

impl SyncingIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a worksite for syncing.
    ///
    /// Returns `None` when the worksite is already syncing. The claim is
    /// released when the returned guard drops.
    #[must_use]
    pub fn try_acquire(&self, id: WorksiteId) -> Option<SyncingGuard> {
        let inserted = self
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        inserted.then(|| SyncingGuard {
            ids: self.clone(),
            id,
        })
    }

    #[must_use]
    pub fn contains(&self, id: WorksiteId) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn release(&self, id: WorksiteId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Claim on one syncing worksite
#[derive(Debug)]
pub struct SyncingGuard {
    ids: SyncingIds,
    id: WorksiteId,
}

impl SyncingGuard {
    #[must_use]
    pub const fn worksite_id(&self) -> WorksiteId {
        self.id
    }
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        self.ids.release(self.id);
    }
}
