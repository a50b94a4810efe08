//! Local change log: ordered, replayable record of local worksite edits

#![allow(clippy::cast_possible_wrap)]

use libsql::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::{
    ChangeArchiveAction, LocalChange, PendingWorksite, SavedLocalChange, SavedWorksiteChange,
    WorkType, Worksite, WorksiteId, CHANGE_MODEL_VERSION,
};

use super::child_repository::{ChildWrite, WorksiteChildRepository};
use super::worksite_repository::LibSqlWorksiteRepository;

const CHANGE_COLUMNS: &str = "id, app_version, organization_id, worksite_id, sync_uuid, \
     change_model_version, change_data, created_at, save_attempt, save_attempt_at, \
     archive_action, last_error";

/// Identity and clock of a local edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEditContext {
    pub organization_id: i64,
    pub app_version: i64,
    pub edited_at: i64,
}

/// libSQL implementation of the local change log
pub struct LibSqlChangeLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlChangeLogRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Write a local edit to the record store and append it to the log.
    ///
    /// `start` is the state the edit began from (`None` for a worksite
    /// created offline). Returns `None` when the edit changes nothing.
    /// Callers run this inside a transaction.
    pub async fn append(
        &self,
        start: Option<&Worksite>,
        change: &Worksite,
        primary_work_type: Option<&WorkType>,
        context: LocalEditContext,
    ) -> Result<Option<SavedLocalChange>> {
        if start == Some(change) {
            tracing::debug!("Skipping unchanged edit of worksite {}", change.id);
            return Ok(None);
        }

        let worksites = LibSqlWorksiteRepository::new(self.conn);
        let worksite_id = if change.id.is_saved() {
            if worksites.get_root(change.id).await?.is_none() {
                return Err(Error::NotFound(format!("Worksite {}", change.id)));
            }
            worksites
                .mark_local_modified(change.id, context.edited_at)
                .await?;
            change.id
        } else {
            let uuid = LocalChange::new_sync_uuid();
            worksites
                .insert_local_root(change.incident_id, &uuid, context.edited_at)
                .await?
        };

        worksites.upsert_core(worksite_id, change, false).await?;

        let children = WorksiteChildRepository::new(self.conn);
        children
            .write_work_types(worksite_id, &change.work_types, ChildWrite::Local)
            .await?;
        children
            .write_flags(worksite_id, &change.flags, ChildWrite::Local)
            .await?;
        children
            .write_notes(worksite_id, &change.notes, ChildWrite::Local)
            .await?;
        children
            .write_form_data(worksite_id, &change.form_data, ChildWrite::Local)
            .await?;
        children
            .write_work_type_requests(worksite_id, &change.work_type_requests, ChildWrite::Local)
            .await?;

        // Snapshot the stored state so every child carries its local id
        let stored = worksites
            .get_worksite(worksite_id)
            .await?
            .ok_or_else(|| Error::Database(format!("Worksite {worksite_id} missing after write")))?
            .worksite;
        let primary_work_type = primary_work_type.map(|primary| {
            stored
                .work_types
                .iter()
                .find(|work_type| work_type.work_type == primary.work_type)
                .cloned()
                .unwrap_or_else(|| primary.clone())
        });
        let saved = SavedWorksiteChange {
            start: start.cloned(),
            change: stored,
            primary_work_type,
        };
        let change_data = serde_json::to_string(&saved)?;

        self.conn
            .execute(
                "INSERT INTO worksite_changes (
                    app_version, organization_id, worksite_id, sync_uuid,
                    change_model_version, change_data, created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    context.app_version,
                    context.organization_id,
                    worksite_id.as_i64(),
                    LocalChange::new_sync_uuid(),
                    CHANGE_MODEL_VERSION,
                    change_data,
                    context.edited_at
                ],
            )
            .await?;
        let change_id = self.conn.last_insert_rowid();

        tracing::debug!("Appended change {change_id} for worksite {worksite_id}");
        Ok(Some(SavedLocalChange {
            worksite_id,
            change_id,
        }))
    }

    /// Changes of a worksite ordered by creation time, oldest first
    pub async fn get_ordered(&self, worksite_id: WorksiteId) -> Result<Vec<LocalChange>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM worksite_changes
                     WHERE worksite_id = ?
                     ORDER BY created_at ASC, id ASC"
                ),
                params![worksite_id.as_i64()],
            )
            .await?;

        let mut changes = Vec::new();
        while let Some(row) = rows.next().await? {
            changes.push(parse_change(&row)?);
        }
        Ok(changes)
    }

    pub async fn get(&self, change_id: i64) -> Result<Option<LocalChange>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CHANGE_COLUMNS} FROM worksite_changes WHERE id = ?"),
                params![change_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_change(&row)?)),
            None => Ok(None),
        }
    }

    /// Archive changes as synced. Already archived changes are left alone.
    pub async fn mark_synced(&self, change_ids: &[i64]) -> Result<u64> {
        let mut updated = 0;
        for change_id in change_ids {
            updated += self
                .set_archive_action(*change_id, ChangeArchiveAction::Synced)
                .await?;
        }
        Ok(updated)
    }

    /// Archive a change the server accepted only in part
    pub async fn mark_partially_synced(&self, change_id: i64) -> Result<bool> {
        Ok(self
            .set_archive_action(change_id, ChangeArchiveAction::PartiallySynced)
            .await?
            > 0)
    }

    /// Record one upload attempt of a pending change.
    ///
    /// A successful attempt archives the change as synced. A failed attempt
    /// keeps it pending with the error summary; once the attempt count
    /// exceeds the retry limit the change is stalled. Returns `false` when
    /// the change is missing or already archived.
    pub async fn record_attempt(
        &self,
        change_id: i64,
        success: bool,
        error_summary: Option<&str>,
        attempted_at: i64,
    ) -> Result<bool> {
        let archive_action = if success {
            ChangeArchiveAction::Synced
        } else {
            ChangeArchiveAction::Pending
        };
        let updated = self
            .conn
            .execute(
                "UPDATE worksite_changes
                 SET save_attempt = save_attempt + 1,
                     save_attempt_at = ?,
                     archive_action = ?,
                     last_error = ?
                 WHERE id = ? AND archive_action = ''",
                params![
                    attempted_at,
                    archive_action.literal(),
                    error_summary.map(str::to_string),
                    change_id
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    /// Archive pending changes logged before the newest synced change.
    ///
    /// Each change carries the full edited state, so once a later change
    /// reached the server the earlier ones, stalled or not, have nothing
    /// left to upload. They are archived as partially synced.
    pub async fn supersede_before_synced(&self, worksite_id: WorksiteId) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "UPDATE worksite_changes SET archive_action = ?1
                 WHERE worksite_id = ?2
                   AND archive_action = ''
                   AND (created_at, id) < (
                       SELECT created_at, id FROM worksite_changes
                       WHERE worksite_id = ?2 AND archive_action = 'synced'
                       ORDER BY created_at DESC, id DESC
                       LIMIT 1
                   )",
                params![
                    ChangeArchiveAction::PartiallySynced.literal(),
                    worksite_id.as_i64()
                ],
            )
            .await?)
    }

    /// Make a stalled change eligible for upload again
    pub async fn reset_attempts(&self, change_id: i64) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE worksite_changes
                 SET save_attempt = 0, last_error = NULL
                 WHERE id = ? AND archive_action = ''",
                params![change_id],
            )
            .await?;
        Ok(updated > 0)
    }

    /// Unarchived changes that can still be uploaded
    pub async fn pending_change_count(
        &self,
        worksite_id: WorksiteId,
        max_sync_tries: i32,
    ) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM worksite_changes
                 WHERE worksite_id = ? AND archive_action = '' AND save_attempt <= ?",
                params![worksite_id.as_i64(), max_sync_tries],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Worksites with uploadable changes, oldest pending change first
    pub async fn worksites_pending_sync(
        &self,
        limit: usize,
        max_sync_tries: i32,
    ) -> Result<Vec<PendingWorksite>> {
        let mut rows = self
            .conn
            .query(
                "SELECT c.worksite_id, r.network_id, COALESCE(w.case_number, ''),
                        COUNT(*), MIN(c.created_at), MAX(c.save_attempt_at), r.sync_attempt
                 FROM worksite_changes c
                 JOIN worksites_root r ON r.id = c.worksite_id
                 LEFT JOIN worksites w ON w.id = c.worksite_id
                 WHERE c.archive_action = '' AND c.save_attempt <= ?
                 GROUP BY c.worksite_id
                 ORDER BY MIN(c.created_at) ASC, c.worksite_id ASC
                 LIMIT ?",
                params![max_sync_tries, limit as i64],
            )
            .await?;

        let mut pending = Vec::new();
        while let Some(row) = rows.next().await? {
            pending.push(PendingWorksite {
                worksite_id: WorksiteId(row.get(0)?),
                network_id: row.get(1)?,
                case_number: row.get(2)?,
                pending_changes: row.get(3)?,
                oldest_change_at: row.get(4)?,
                last_attempt_at: row.get(5)?,
                sync_attempt: row.get(6)?,
            });
        }
        Ok(pending)
    }

    /// Pending changes that exhausted their upload attempts
    pub async fn stalled_changes(&self, max_sync_tries: i32) -> Result<Vec<LocalChange>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM worksite_changes
                     WHERE archive_action = '' AND save_attempt > ?
                     ORDER BY created_at ASC, id ASC"
                ),
                params![max_sync_tries],
            )
            .await?;

        let mut changes = Vec::new();
        while let Some(row) = rows.next().await? {
            changes.push(parse_change(&row)?);
        }
        Ok(changes)
    }

    /// Whether a worksite still holds pending changes, stalled or not
    pub async fn has_pending_changes(&self, worksite_id: WorksiteId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM worksite_changes
                    WHERE worksite_id = ? AND archive_action = ''
                 )",
                params![worksite_id.as_i64()],
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get::<i32>(0)? != 0,
            None => false,
        })
    }

    /// Drop a worksite's log once everything in it reached the server
    pub async fn delete_worksite_changes(&self, worksite_id: WorksiteId) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "DELETE FROM worksite_changes WHERE worksite_id = ?",
                params![worksite_id.as_i64()],
            )
            .await?)
    }

    /// Drop archived changes older than the newest synced change.
    ///
    /// The newest synced change stays as the reference for later uploads.
    pub async fn prune_superseded(&self, worksite_id: WorksiteId) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "DELETE FROM worksite_changes
                 WHERE worksite_id = ?1
                   AND archive_action != ''
                   AND created_at < (
                       SELECT MAX(created_at) FROM worksite_changes
                       WHERE worksite_id = ?1 AND archive_action = 'synced'
                   )",
                params![worksite_id.as_i64()],
            )
            .await?)
    }

    async fn set_archive_action(
        &self,
        change_id: i64,
        archive_action: ChangeArchiveAction,
    ) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "UPDATE worksite_changes SET archive_action = ?
                 WHERE id = ? AND archive_action = ''",
                params![archive_action.literal(), change_id],
            )
            .await?)
    }
}

fn parse_change(row: &Row) -> Result<LocalChange> {
    let archive_action: String = row.get(10)?;
    Ok(LocalChange {
        id: row.get(0)?,
        app_version: row.get(1)?,
        organization_id: row.get(2)?,
        worksite_id: WorksiteId(row.get(3)?),
        sync_uuid: row.get(4)?,
        change_model_version: row.get(5)?,
        change_data: row.get(6)?,
        created_at: row.get(7)?,
        save_attempt: row.get(8)?,
        save_attempt_at: row.get(9)?,
        archive_action: archive_action.parse()?,
        last_error: row.get(11)?,
    })
}
