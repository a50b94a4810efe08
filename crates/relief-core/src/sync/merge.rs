//! Snapshot merge: applying server worksite snapshots to the local store.
//!
//! A snapshot is inserted when the worksite is unknown locally, written in
//! place when the local copy has no unsynced edits, and skipped when it does.
//! In-place writes are guarded by the local modification stamp read at the
//! start of the merge; a stamp that moved in between leaves the record
//! untouched and reports [`MergeOutcome::ConcurrentlyModified`].

use libsql::Connection;

use crate::db::{ChildWrite, LibSqlWorksiteRepository, WorksiteChildRepository};
use crate::error::{Error, Result};
use crate::models::{Worksite, WorksiteId, WorksiteLocalModifiedAt};

/// What a merge did with one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(WorksiteId),
    Updated(WorksiteId),
    /// Local copy has unsynced edits; nothing written
    SkippedLocallyModified(WorksiteId),
    /// Local copy changed between read and write; nothing written
    ConcurrentlyModified(WorksiteId),
}

impl MergeOutcome {
    #[must_use]
    pub const fn worksite_id(self) -> WorksiteId {
        match self {
            Self::Inserted(id)
            | Self::Updated(id)
            | Self::SkippedLocallyModified(id)
            | Self::ConcurrentlyModified(id) => id,
        }
    }

    /// Whether the snapshot was written
    #[must_use]
    pub const fn is_written(self) -> bool {
        matches!(self, Self::Inserted(_) | Self::Updated(_))
    }
}

/// Merges server snapshots on one connection.
///
/// Callers run each merge inside a transaction.
pub struct WorksiteMerger<'a> {
    conn: &'a Connection,
}

impl<'a> WorksiteMerger<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Merge one server snapshot.
    ///
    /// `keep_key_work_type` leaves the local denormalized key work type in
    /// place on updates.
    pub async fn merge_network_worksite(
        &self,
        worksite: &Worksite,
        synced_at: i64,
        keep_key_work_type: bool,
    ) -> Result<MergeOutcome> {
        if !worksite.has_network_id() {
            return Err(Error::InvalidInput(format!(
                "Network worksite snapshot without a network id (case {})",
                worksite.case_number
            )));
        }

        let worksites = LibSqlWorksiteRepository::new(self.conn);
        let Some(stamp) = worksites.get_local_modified_at(worksite.network_id).await? else {
            let id = worksites
                .insert_network_root(worksite.network_id, worksite.incident_id, synced_at)
                .await?;
            worksites.upsert_core(id, worksite, false).await?;
            self.write_children(id, worksite, ChildWrite::Network)
                .await?;
            tracing::debug!("Inserted network worksite {} as {id}", worksite.network_id);
            return Ok(MergeOutcome::Inserted(id));
        };

        if stamp.is_local_modified {
            tracing::debug!(
                "Skipping network worksite {}: local worksite {} has unsynced changes",
                worksite.network_id,
                stamp.id
            );
            return Ok(MergeOutcome::SkippedLocallyModified(stamp.id));
        }

        self.update_synced_worksite(&stamp, worksite, synced_at, keep_key_work_type)
            .await
    }

    /// Overwrite a synced worksite when its stamp still matches `stamp`
    pub async fn update_synced_worksite(
        &self,
        stamp: &WorksiteLocalModifiedAt,
        worksite: &Worksite,
        synced_at: i64,
        keep_key_work_type: bool,
    ) -> Result<MergeOutcome> {
        let worksites = LibSqlWorksiteRepository::new(self.conn);
        if !worksites.update_network_root(stamp, synced_at).await? {
            tracing::warn!(
                "Worksite {} changed locally during merge of network worksite {}",
                stamp.id,
                stamp.network_id
            );
            return Ok(MergeOutcome::ConcurrentlyModified(stamp.id));
        }

        worksites
            .upsert_core(stamp.id, worksite, keep_key_work_type)
            .await?;
        self.write_children(stamp.id, worksite, ChildWrite::Network)
            .await?;
        Ok(MergeOutcome::Updated(stamp.id))
    }

    /// Additive merge into a worksite that still has unsynced local edits.
    ///
    /// Fills empty core fields and inserts children whose natural key is
    /// missing locally. Never overwrites local values.
    pub async fn fill_worksite(&self, id: WorksiteId, worksite: &Worksite) -> Result<bool> {
        let worksites = LibSqlWorksiteRepository::new(self.conn);
        if worksites.get_root(id).await?.is_none() {
            return Ok(false);
        }
        worksites.fill_core(id, worksite).await?;
        self.write_children(id, worksite, ChildWrite::Fill).await?;
        tracing::debug!("Filled worksite {id} from network worksite {}", worksite.network_id);
        Ok(true)
    }

    async fn write_children(&self, id: WorksiteId, worksite: &Worksite, mode: ChildWrite) -> Result<()> {
        let children = WorksiteChildRepository::new(self.conn);
        children.write_work_types(id, &worksite.work_types, mode).await?;
        children.write_flags(id, &worksite.flags, mode).await?;
        children.write_notes(id, &worksite.notes, mode).await?;
        children.write_form_data(id, &worksite.form_data, mode).await?;
        children
            .write_work_type_requests(id, &worksite.work_type_requests, mode)
            .await?;
        children.write_files(id, &worksite.files, mode).await?;
        Ok(())
    }
}
