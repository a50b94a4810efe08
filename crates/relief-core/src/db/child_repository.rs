//! Worksite child collections: work types, flags, notes, form data, work
//! type requests, and files

use std::collections::{BTreeMap, HashSet};

use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{
    FormDataValue, NetworkFile, WorkType, WorkTypeRequest, WorksiteFlag, WorksiteId, WorksiteNote,
};

/// How an incoming child row treats a row with the same natural key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildWrite {
    /// Server snapshot: overwrite fields including the network id
    Network,
    /// Local edit: overwrite fields, keep a known network id
    Local,
    /// Fill: insert only when the natural key is missing
    Fill,
}

pub struct WorksiteChildRepository<'a> {
    conn: &'a Connection,
}

impl<'a> WorksiteChildRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn work_types(&self, worksite_id: WorksiteId) -> Result<Vec<WorkType>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, network_id, created_at, org_claim, next_recur_at, phase, recur,
                        status, work_type
                 FROM work_types WHERE worksite_id = ? ORDER BY id ASC",
                params![worksite_id.as_i64()],
            )
            .await?;

        let mut work_types = Vec::new();
        while let Some(row) = rows.next().await? {
            work_types.push(WorkType {
                id: row.get(0)?,
                network_id: row.get(1)?,
                created_at: row.get(2)?,
                org_claim: row.get(3)?,
                next_recur_at: row.get(4)?,
                phase: row.get(5)?,
                recur: row.get(6)?,
                status: row.get(7)?,
                work_type: row.get(8)?,
            });
        }
        Ok(work_types)
    }

    pub async fn flags(&self, worksite_id: WorksiteId) -> Result<Vec<WorksiteFlag>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, network_id, action, created_at, is_high_priority, notes, reason_t,
                        requested_action
                 FROM worksite_flags WHERE worksite_id = ? ORDER BY id ASC",
                params![worksite_id.as_i64()],
            )
            .await?;

        let mut flags = Vec::new();
        while let Some(row) = rows.next().await? {
            flags.push(WorksiteFlag {
                id: row.get(0)?,
                network_id: row.get(1)?,
                action: row.get(2)?,
                created_at: row.get(3)?,
                is_high_priority: row.get::<i32>(4)? != 0,
                notes: row.get(5)?,
                reason: row.get(6)?,
                requested_action: row.get(7)?,
            });
        }
        Ok(flags)
    }

    /// Notes in display order
    pub async fn notes(&self, worksite_id: WorksiteId) -> Result<Vec<WorksiteNote>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, network_id, created_at, is_survivor, note
                 FROM worksite_notes WHERE worksite_id = ?",
                params![worksite_id.as_i64()],
            )
            .await?;

        let mut notes = Vec::new();
        while let Some(row) = rows.next().await? {
            notes.push(WorksiteNote {
                id: row.get(0)?,
                network_id: row.get(1)?,
                created_at: row.get(2)?,
                is_survivor: row.get::<i32>(3)? != 0,
                note: row.get(4)?,
            });
        }
        notes.sort_by(crate::models::note_display_order);
        Ok(notes)
    }

    pub async fn form_data(
        &self,
        worksite_id: WorksiteId,
    ) -> Result<BTreeMap<String, FormDataValue>> {
        let mut rows = self
            .conn
            .query(
                "SELECT field_key, is_bool_value, value_string, value_bool
                 FROM worksite_form_data WHERE worksite_id = ?",
                params![worksite_id.as_i64()],
            )
            .await?;

        let mut form_data = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            form_data.insert(
                row.get::<String>(0)?,
                FormDataValue {
                    is_boolean: row.get::<i32>(1)? != 0,
                    value_string: row.get(2)?,
                    value_bool: row.get::<i32>(3)? != 0,
                },
            );
        }
        Ok(form_data)
    }

    pub async fn work_type_requests(
        &self,
        worksite_id: WorksiteId,
    ) -> Result<Vec<WorkTypeRequest>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, network_id, work_type, reason, by_org, to_org, created_at,
                        approved_at, rejected_at, approved_rejected_reason
                 FROM work_type_requests WHERE worksite_id = ? ORDER BY id ASC",
                params![worksite_id.as_i64()],
            )
            .await?;

        let mut requests = Vec::new();
        while let Some(row) = rows.next().await? {
            requests.push(WorkTypeRequest {
                id: row.get(0)?,
                network_id: row.get(1)?,
                work_type: row.get(2)?,
                reason: row.get(3)?,
                by_org: row.get(4)?,
                to_org: row.get(5)?,
                created_at: row.get(6)?,
                approved_at: row.get(7)?,
                rejected_at: row.get(8)?,
                approved_rejected_reason: row.get(9)?,
            });
        }
        Ok(requests)
    }

    pub async fn files(&self, worksite_id: WorksiteId) -> Result<Vec<NetworkFile>> {
        let mut rows = self
            .conn
            .query(
                "SELECT f.id, f.created_at, f.file_id, f.file_type_t, f.full_url,
                        f.large_thumbnail_url, f.mime_content_type, f.small_thumbnail_url,
                        f.tag, f.title, f.url
                 FROM network_files f
                 JOIN worksite_to_network_file a ON a.network_file_id = f.id
                 WHERE a.worksite_id = ?
                 ORDER BY f.created_at ASC",
                params![worksite_id.as_i64()],
            )
            .await?;

        let mut files = Vec::new();
        while let Some(row) = rows.next().await? {
            files.push(NetworkFile {
                network_id: row.get(0)?,
                created_at: row.get(1)?,
                file_id: row.get(2)?,
                file_type: row.get(3)?,
                full_url: row.get(4)?,
                large_thumbnail_url: row.get(5)?,
                mime_content_type: row.get(6)?,
                small_thumbnail_url: row.get(7)?,
                tag: row.get(8)?,
                title: row.get(9)?,
                url: row.get(10)?,
            });
        }
        Ok(files)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Write work types keyed by work type name.
    ///
    /// `Network` and `Local` writes delete rows absent from `work_types`.
    pub async fn write_work_types(
        &self,
        worksite_id: WorksiteId,
        work_types: &[WorkType],
        mode: ChildWrite,
    ) -> Result<()> {
        if mode != ChildWrite::Fill {
            let keep: HashSet<&str> = work_types
                .iter()
                .map(|work_type| work_type.work_type.as_str())
                .collect();
            self.retain_keys("work_types", "work_type", worksite_id, &keep)
                .await?;
        }

        let conflict = match mode {
            ChildWrite::Network => {
                "DO UPDATE SET
                    network_id = excluded.network_id,
                    created_at = excluded.created_at,
                    org_claim = excluded.org_claim,
                    next_recur_at = excluded.next_recur_at,
                    phase = excluded.phase,
                    recur = excluded.recur,
                    status = excluded.status"
            }
            ChildWrite::Local => {
                "DO UPDATE SET
                    network_id = CASE WHEN excluded.network_id > 0
                        THEN excluded.network_id ELSE work_types.network_id END,
                    org_claim = excluded.org_claim,
                    next_recur_at = excluded.next_recur_at,
                    phase = excluded.phase,
                    recur = excluded.recur,
                    status = excluded.status"
            }
            ChildWrite::Fill => "DO NOTHING",
        };
        let sql = format!(
            "INSERT INTO work_types (
                worksite_id, network_id, created_at, org_claim, next_recur_at, phase, recur,
                status, work_type
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(worksite_id, work_type) {conflict}"
        );

        for work_type in work_types {
            self.conn
                .execute(
                    &sql,
                    params![
                        worksite_id.as_i64(),
                        work_type.network_id,
                        work_type.created_at,
                        work_type.org_claim,
                        work_type.next_recur_at,
                        work_type.phase,
                        work_type.recur.clone(),
                        work_type.status.as_str(),
                        work_type.work_type.as_str()
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Write flags keyed by reason
    pub async fn write_flags(
        &self,
        worksite_id: WorksiteId,
        flags: &[WorksiteFlag],
        mode: ChildWrite,
    ) -> Result<()> {
        if mode != ChildWrite::Fill {
            let keep: HashSet<&str> = flags.iter().map(|flag| flag.reason.as_str()).collect();
            self.retain_keys("worksite_flags", "reason_t", worksite_id, &keep)
                .await?;
        }

        let conflict = match mode {
            ChildWrite::Network => {
                "DO UPDATE SET
                    network_id = excluded.network_id,
                    action = excluded.action,
                    created_at = excluded.created_at,
                    is_high_priority = excluded.is_high_priority,
                    notes = excluded.notes,
                    requested_action = excluded.requested_action"
            }
            ChildWrite::Local => {
                "DO UPDATE SET
                    network_id = CASE WHEN excluded.network_id > 0
                        THEN excluded.network_id ELSE worksite_flags.network_id END,
                    action = excluded.action,
                    is_high_priority = excluded.is_high_priority,
                    notes = excluded.notes,
                    requested_action = excluded.requested_action"
            }
            ChildWrite::Fill => "DO NOTHING",
        };
        let sql = format!(
            "INSERT INTO worksite_flags (
                worksite_id, network_id, action, created_at, is_high_priority, notes, reason_t,
                requested_action
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(worksite_id, reason_t) {conflict}"
        );

        for flag in flags {
            self.conn
                .execute(
                    &sql,
                    params![
                        worksite_id.as_i64(),
                        flag.network_id,
                        flag.action.clone(),
                        flag.created_at,
                        i32::from(flag.is_high_priority),
                        flag.notes.as_str(),
                        flag.reason.as_str(),
                        flag.requested_action.clone()
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Write notes.
    ///
    /// Synced notes are keyed by network id. A `Network` write removes
    /// synced notes the server no longer lists but never local-only notes.
    /// A `Local` write only inserts notes that were never saved.
    pub async fn write_notes(
        &self,
        worksite_id: WorksiteId,
        notes: &[WorksiteNote],
        mode: ChildWrite,
    ) -> Result<()> {
        if mode == ChildWrite::Local {
            for note in notes.iter().filter(|note| note.id <= 0) {
                self.insert_note(worksite_id, note).await?;
            }
            return Ok(());
        }

        let existing = self.note_ids_by_network_id(worksite_id).await?;
        if mode == ChildWrite::Network {
            let incoming: HashSet<i64> = notes.iter().map(|note| note.network_id).collect();
            for (network_id, id) in &existing {
                if !incoming.contains(network_id) {
                    self.conn
                        .execute("DELETE FROM worksite_notes WHERE id = ?", params![*id])
                        .await?;
                }
            }
        }

        for note in notes.iter().filter(|note| !note.is_local_only()) {
            match existing.get(&note.network_id) {
                Some(id) if mode == ChildWrite::Network => {
                    self.conn
                        .execute(
                            "UPDATE worksite_notes
                             SET created_at = ?, is_survivor = ?, note = ?
                             WHERE id = ?",
                            params![
                                note.created_at,
                                i32::from(note.is_survivor),
                                note.note.as_str(),
                                *id
                            ],
                        )
                        .await?;
                }
                Some(_) => {}
                None => self.insert_note(worksite_id, note).await?,
            }
        }
        Ok(())
    }

    /// Write form data keyed by field key
    pub async fn write_form_data(
        &self,
        worksite_id: WorksiteId,
        form_data: &BTreeMap<String, FormDataValue>,
        mode: ChildWrite,
    ) -> Result<()> {
        if mode != ChildWrite::Fill {
            let keep: HashSet<&str> = form_data.keys().map(String::as_str).collect();
            self.retain_keys("worksite_form_data", "field_key", worksite_id, &keep)
                .await?;
        }

        let conflict = if mode == ChildWrite::Fill {
            "DO NOTHING"
        } else {
            "DO UPDATE SET
                is_bool_value = excluded.is_bool_value,
                value_string = excluded.value_string,
                value_bool = excluded.value_bool"
        };
        let sql = format!(
            "INSERT INTO worksite_form_data (
                worksite_id, field_key, is_bool_value, value_string, value_bool
             ) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(worksite_id, field_key) {conflict}"
        );

        for (key, value) in form_data {
            self.conn
                .execute(
                    &sql,
                    params![
                        worksite_id.as_i64(),
                        key.as_str(),
                        i32::from(value.is_boolean),
                        value.value_string.as_str(),
                        i32::from(value.value_bool)
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Write work type requests keyed by (work type, requesting organization).
    ///
    /// A `Local` write only inserts requests that were never saved.
    pub async fn write_work_type_requests(
        &self,
        worksite_id: WorksiteId,
        requests: &[WorkTypeRequest],
        mode: ChildWrite,
    ) -> Result<()> {
        if mode == ChildWrite::Network {
            let keep: HashSet<(&str, i64)> = requests
                .iter()
                .map(|request| (request.work_type.as_str(), request.by_org))
                .collect();
            let mut rows = self
                .conn
                .query(
                    "SELECT id, work_type, by_org FROM work_type_requests WHERE worksite_id = ?",
                    params![worksite_id.as_i64()],
                )
                .await?;
            let mut stale = Vec::new();
            while let Some(row) = rows.next().await? {
                let work_type: String = row.get(1)?;
                if !keep.contains(&(work_type.as_str(), row.get::<i64>(2)?)) {
                    stale.push(row.get::<i64>(0)?);
                }
            }
            for id in stale {
                self.conn
                    .execute("DELETE FROM work_type_requests WHERE id = ?", params![id])
                    .await?;
            }
        }

        let conflict = if mode == ChildWrite::Network {
            "DO UPDATE SET
                network_id = excluded.network_id,
                reason = excluded.reason,
                to_org = excluded.to_org,
                created_at = excluded.created_at,
                approved_at = excluded.approved_at,
                rejected_at = excluded.rejected_at,
                approved_rejected_reason = excluded.approved_rejected_reason"
        } else {
            "DO NOTHING"
        };
        let sql = format!(
            "INSERT INTO work_type_requests (
                worksite_id, network_id, work_type, reason, by_org, to_org, created_at,
                approved_at, rejected_at, approved_rejected_reason
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(worksite_id, work_type, by_org) {conflict}"
        );

        let writes = requests
            .iter()
            .filter(|request| mode != ChildWrite::Local || request.id <= 0);
        for request in writes {
            self.conn
                .execute(
                    &sql,
                    params![
                        worksite_id.as_i64(),
                        request.network_id,
                        request.work_type.as_str(),
                        request.reason.as_str(),
                        request.by_org,
                        request.to_org,
                        request.created_at,
                        request.approved_at,
                        request.rejected_at,
                        request.approved_rejected_reason.as_str()
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Upsert file metadata and the worksite associations.
    ///
    /// A `Network` write drops associations the server no longer lists.
    pub async fn write_files(
        &self,
        worksite_id: WorksiteId,
        files: &[NetworkFile],
        mode: ChildWrite,
    ) -> Result<()> {
        if mode == ChildWrite::Local {
            return Ok(());
        }

        if mode == ChildWrite::Network {
            let keep: HashSet<i64> = files.iter().map(|file| file.network_id).collect();
            let mut rows = self
                .conn
                .query(
                    "SELECT network_file_id FROM worksite_to_network_file WHERE worksite_id = ?",
                    params![worksite_id.as_i64()],
                )
                .await?;
            let mut stale = Vec::new();
            while let Some(row) = rows.next().await? {
                let file_id: i64 = row.get(0)?;
                if !keep.contains(&file_id) {
                    stale.push(file_id);
                }
            }
            for file_id in stale {
                self.conn
                    .execute(
                        "DELETE FROM worksite_to_network_file
                         WHERE worksite_id = ? AND network_file_id = ?",
                        params![worksite_id.as_i64(), file_id],
                    )
                    .await?;
            }
        }

        for file in files {
            self.conn
                .execute(
                    "INSERT INTO network_files (
                        id, created_at, file_id, file_type_t, full_url, large_thumbnail_url,
                        mime_content_type, small_thumbnail_url, tag, title, url
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        created_at = excluded.created_at,
                        file_id = excluded.file_id,
                        file_type_t = excluded.file_type_t,
                        full_url = excluded.full_url,
                        large_thumbnail_url = excluded.large_thumbnail_url,
                        mime_content_type = excluded.mime_content_type,
                        small_thumbnail_url = excluded.small_thumbnail_url,
                        tag = excluded.tag,
                        title = excluded.title,
                        url = excluded.url",
                    params![
                        file.network_id,
                        file.created_at,
                        file.file_id,
                        file.file_type.as_str(),
                        file.full_url.clone(),
                        file.large_thumbnail_url.clone(),
                        file.mime_content_type.as_str(),
                        file.small_thumbnail_url.clone(),
                        file.tag.clone(),
                        file.title.clone(),
                        file.url.as_str()
                    ],
                )
                .await?;
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO worksite_to_network_file (worksite_id, network_file_id)
                     VALUES (?, ?)",
                    params![worksite_id.as_i64(), file.network_id],
                )
                .await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Network id assignment
    // ---------------------------------------------------------------------

    pub async fn set_work_type_network_id(&self, id: i64, network_id: i64) -> Result<()> {
        self.set_network_id("work_types", id, network_id).await
    }

    pub async fn set_flag_network_id(&self, id: i64, network_id: i64) -> Result<()> {
        self.set_network_id("worksite_flags", id, network_id).await
    }

    pub async fn set_note_network_id(&self, id: i64, network_id: i64) -> Result<()> {
        self.set_network_id("worksite_notes", id, network_id).await
    }

    pub async fn set_work_type_request_network_id(&self, id: i64, network_id: i64) -> Result<()> {
        self.set_network_id("work_type_requests", id, network_id)
            .await
    }

    async fn set_network_id(&self, table: &str, id: i64, network_id: i64) -> Result<()> {
        self.conn
            .execute(
                &format!("UPDATE {table} SET network_id = ? WHERE id = ?"),
                params![network_id, id],
            )
            .await?;
        Ok(())
    }

    async fn insert_note(&self, worksite_id: WorksiteId, note: &WorksiteNote) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO worksite_notes (worksite_id, network_id, created_at, is_survivor, note)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    worksite_id.as_i64(),
                    note.network_id,
                    note.created_at,
                    i32::from(note.is_survivor),
                    note.note.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    async fn note_ids_by_network_id(
        &self,
        worksite_id: WorksiteId,
    ) -> Result<std::collections::HashMap<i64, i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT network_id, id FROM worksite_notes
                 WHERE worksite_id = ? AND network_id > 0",
                params![worksite_id.as_i64()],
            )
            .await?;
        let mut ids = std::collections::HashMap::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<i64>(0)?, row.get::<i64>(1)?);
        }
        Ok(ids)
    }

    /// Delete rows of `table` whose `key_column` is not in `keep`
    async fn retain_keys(
        &self,
        table: &str,
        key_column: &str,
        worksite_id: WorksiteId,
        keep: &HashSet<&str>,
    ) -> Result<()> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {key_column} FROM {table} WHERE worksite_id = ?"),
                params![worksite_id.as_i64()],
            )
            .await?;
        let mut stale = Vec::new();
        while let Some(row) = rows.next().await? {
            let key: String = row.get(0)?;
            if !keep.contains(key.as_str()) {
                stale.push(key);
            }
        }

        for key in stale {
            self.conn
                .execute(
                    &format!("DELETE FROM {table} WHERE worksite_id = ? AND {key_column} = ?"),
                    params![worksite_id.as_i64(), key],
                )
                .await?;
        }
        Ok(())
    }
}
