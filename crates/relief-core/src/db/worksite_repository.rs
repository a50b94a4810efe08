//! Worksite record store: roots, core fields, and aggregate queries

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::{
    BoundingBox, LocalWorksite, WorkType, Worksite, WorksiteId, WorksiteLocalModifiedAt,
    WorksiteRoot, WorksiteSummary, UNSYNCED_NETWORK_ID,
};

use super::child_repository::WorksiteChildRepository;

const ROOT_COLUMNS: &str = "id, network_id, incident_id, is_local_modified, local_modified_at, \
     synced_at, sync_attempt, local_global_uuid";

const WORKSITE_COLUMNS: &str = "id, network_id, incident_id, address, auto_contact_frequency_t, \
     case_number, city, county, created_at, email, favorite_id, is_assigned_to_org_member, \
     key_work_type_type, key_work_type_org, key_work_type_status, latitude, longitude, name, \
     phone1, phone2, plus_code, postal_code, reported_by, state, svi, updated_at, what3words";

const UPSERT_CORE_SQL: &str = "INSERT INTO worksites (
        id, network_id, incident_id, address, auto_contact_frequency_t, case_number, city,
        county, created_at, email, favorite_id, is_assigned_to_org_member, key_work_type_type,
        key_work_type_org, key_work_type_status, latitude, longitude, name, phone1, phone2,
        plus_code, postal_code, reported_by, state, svi, updated_at, what3words
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        network_id = excluded.network_id,
        incident_id = excluded.incident_id,
        address = excluded.address,
        auto_contact_frequency_t = excluded.auto_contact_frequency_t,
        case_number = excluded.case_number,
        city = excluded.city,
        county = excluded.county,
        created_at = excluded.created_at,
        email = excluded.email,
        favorite_id = excluded.favorite_id,
        is_assigned_to_org_member = excluded.is_assigned_to_org_member,
        latitude = excluded.latitude,
        longitude = excluded.longitude,
        name = excluded.name,
        phone1 = excluded.phone1,
        phone2 = excluded.phone2,
        plus_code = excluded.plus_code,
        postal_code = excluded.postal_code,
        reported_by = excluded.reported_by,
        state = excluded.state,
        svi = excluded.svi,
        updated_at = excluded.updated_at,
        what3words = excluded.what3words";

const UPDATE_KEY_WORK_TYPE_SQL: &str = "UPDATE worksites SET
        key_work_type_type = ?,
        key_work_type_org = ?,
        key_work_type_status = ?
    WHERE id = ?";

/// Fills only empty local values; non-empty local values always win
const FILL_CORE_SQL: &str = "UPDATE worksites SET
        address = CASE WHEN address = '' THEN ? ELSE address END,
        auto_contact_frequency_t = CASE WHEN auto_contact_frequency_t = '' THEN ? ELSE auto_contact_frequency_t END,
        case_number = CASE WHEN case_number = '' THEN ? ELSE case_number END,
        city = CASE WHEN city = '' THEN ? ELSE city END,
        county = CASE WHEN county = '' THEN ? ELSE county END,
        created_at = COALESCE(created_at, ?),
        email = COALESCE(NULLIF(email, ''), ?),
        favorite_id = COALESCE(favorite_id, ?),
        name = CASE WHEN name = '' THEN ? ELSE name END,
        phone1 = CASE WHEN phone1 = '' THEN ? ELSE phone1 END,
        phone2 = COALESCE(NULLIF(phone2, ''), ?),
        plus_code = COALESCE(NULLIF(plus_code, ''), ?),
        postal_code = CASE WHEN postal_code = '' THEN ? ELSE postal_code END,
        reported_by = COALESCE(reported_by, ?),
        state = CASE WHEN state = '' THEN ? ELSE state END,
        svi = COALESCE(svi, ?),
        updated_at = COALESCE(updated_at, ?),
        what3words = COALESCE(NULLIF(what3words, ''), ?)
    WHERE id = ?";

/// libSQL implementation of the worksite record store
pub struct LibSqlWorksiteRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlWorksiteRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    /// Modification stamp of the synced worksite with `network_id`
    pub async fn get_local_modified_at(
        &self,
        network_id: i64,
    ) -> Result<Option<WorksiteLocalModifiedAt>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, network_id, local_modified_at, is_local_modified
                 FROM worksites_root
                 WHERE network_id = ? AND local_global_uuid = ''",
                params![network_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(WorksiteLocalModifiedAt {
            id: WorksiteId(row.get(0)?),
            network_id: row.get(1)?,
            local_modified_at: row.get(2)?,
            is_local_modified: row.get::<i32>(3)? != 0,
        }))
    }

    pub async fn get_root(&self, id: WorksiteId) -> Result<Option<WorksiteRoot>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ROOT_COLUMNS} FROM worksites_root WHERE id = ?"),
                params![id.as_i64()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_root(&row)?)),
            None => Ok(None),
        }
    }

    /// Local id of the synced worksite with `network_id`
    pub async fn local_id_for_network_id(&self, network_id: i64) -> Result<Option<WorksiteId>> {
        Ok(self
            .get_local_modified_at(network_id)
            .await?
            .map(|stamp| stamp.id))
    }

    /// Insert the root of a worksite first seen from the network
    pub async fn insert_network_root(
        &self,
        network_id: i64,
        incident_id: i64,
        synced_at: i64,
    ) -> Result<WorksiteId> {
        self.conn
            .execute(
                "INSERT INTO worksites_root (
                    local_modified_at, synced_at, local_global_uuid, is_local_modified,
                    sync_attempt, network_id, incident_id
                 ) VALUES (?, ?, '', 0, 0, ?, ?)",
                params![synced_at, synced_at, network_id, incident_id],
            )
            .await?;
        Ok(WorksiteId(self.conn.last_insert_rowid()))
    }

    /// Insert the root of a worksite created offline
    pub async fn insert_local_root(
        &self,
        incident_id: i64,
        local_global_uuid: &str,
        modified_at: i64,
    ) -> Result<WorksiteId> {
        self.conn
            .execute(
                "INSERT INTO worksites_root (
                    local_modified_at, synced_at, local_global_uuid, is_local_modified,
                    sync_attempt, network_id, incident_id
                 ) VALUES (?, 0, ?, 1, 0, ?, ?)",
                params![modified_at, local_global_uuid, UNSYNCED_NETWORK_ID, incident_id],
            )
            .await?;
        Ok(WorksiteId(self.conn.last_insert_rowid()))
    }

    /// Guarded update of a root after a network write.
    ///
    /// Affects zero rows when `localModifiedAt` moved since `stamp` was read.
    pub async fn update_network_root(
        &self,
        stamp: &WorksiteLocalModifiedAt,
        synced_at: i64,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE worksites_root
                 SET synced_at = ?, sync_attempt = 0, is_local_modified = 0
                 WHERE id = ? AND network_id = ? AND local_modified_at = ?",
                params![
                    synced_at,
                    stamp.id.as_i64(),
                    stamp.network_id,
                    stamp.local_modified_at
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    /// Flag a root as holding unsynced local edits
    pub async fn mark_local_modified(&self, id: WorksiteId, modified_at: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE worksites_root SET is_local_modified = 1, local_modified_at = ? WHERE id = ?",
                params![modified_at, id.as_i64()],
            )
            .await?;
        Ok(())
    }

    /// Clear the local-modified flag once every change reached the server
    pub async fn set_root_unmodified(&self, id: WorksiteId, synced_at: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE worksites_root
                 SET is_local_modified = 0, sync_attempt = 0, synced_at = ?
                 WHERE id = ?",
                params![synced_at, id.as_i64()],
            )
            .await?;
        Ok(())
    }

    /// Record a failed worksite sync pass
    pub async fn increment_sync_attempt(&self, id: WorksiteId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE worksites_root SET sync_attempt = sync_attempt + 1 WHERE id = ?",
                params![id.as_i64()],
            )
            .await?;
        Ok(())
    }

    /// Attach the server id to a worksite.
    ///
    /// The offline identity (`localGlobalUuid`) is cleared so the root takes
    /// the synced identity key. A stale, unmodified copy of the same server
    /// record pulled in the meantime is removed first. Returns `false` when a
    /// locally modified copy already owns the synced identity.
    pub async fn assign_network_id(&self, id: WorksiteId, network_id: i64) -> Result<bool> {
        if network_id <= 0 {
            return Ok(false);
        }
        if let Some(existing) = self.get_local_modified_at(network_id).await? {
            if existing.id == id {
                return Ok(true);
            }
            if existing.is_local_modified {
                tracing::warn!(
                    "Worksite {} maps to network worksite {} already owned by locally modified worksite {}",
                    id,
                    network_id,
                    existing.id
                );
                self.conn
                    .execute(
                        "UPDATE worksites_root SET network_id = ? WHERE id = ?",
                        params![network_id, id.as_i64()],
                    )
                    .await?;
                self.conn
                    .execute(
                        "UPDATE worksites SET network_id = ? WHERE id = ?",
                        params![network_id, id.as_i64()],
                    )
                    .await?;
                return Ok(false);
            }
            tracing::debug!(
                "Removing unmodified copy {} of network worksite {}",
                existing.id,
                network_id
            );
            self.conn
                .execute(
                    "DELETE FROM worksites_root WHERE id = ?",
                    params![existing.id.as_i64()],
                )
                .await?;
        }

        self.conn
            .execute(
                "UPDATE worksites_root SET network_id = ?, local_global_uuid = '' WHERE id = ?",
                params![network_id, id.as_i64()],
            )
            .await?;
        self.conn
            .execute(
                "UPDATE worksites SET network_id = ? WHERE id = ?",
                params![network_id, id.as_i64()],
            )
            .await?;
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Core fields
    // ---------------------------------------------------------------------

    /// Insert or overwrite the core row of worksite `id`
    pub async fn upsert_core(
        &self,
        id: WorksiteId,
        worksite: &Worksite,
        keep_key_work_type: bool,
    ) -> Result<()> {
        self.conn
            .execute(
                UPSERT_CORE_SQL,
                params![
                    id.as_i64(),
                    worksite.network_id,
                    worksite.incident_id,
                    worksite.address.as_str(),
                    worksite.auto_contact_frequency.as_str(),
                    worksite.case_number.as_str(),
                    worksite.city.as_str(),
                    worksite.county.as_str(),
                    worksite.created_at,
                    worksite.email.clone(),
                    worksite.favorite_id,
                    i32::from(worksite.is_assigned_to_org_member),
                    "",
                    Option::<i64>::None,
                    "",
                    worksite.latitude,
                    worksite.longitude,
                    worksite.name.as_str(),
                    worksite.phone1.as_str(),
                    worksite.phone2.clone(),
                    worksite.plus_code.clone(),
                    worksite.postal_code.as_str(),
                    worksite.reported_by,
                    worksite.state.as_str(),
                    worksite.svi,
                    worksite.updated_at,
                    worksite.what3words.clone()
                ],
            )
            .await?;

        if !keep_key_work_type {
            self.write_key_work_type(id, worksite.key_work_type.as_ref())
                .await?;
        }
        Ok(())
    }

    /// Overwrite the denormalized key work type
    pub async fn write_key_work_type(
        &self,
        id: WorksiteId,
        key_work_type: Option<&WorkType>,
    ) -> Result<()> {
        let (work_type, org_claim, status) = key_work_type.map_or(
            (String::new(), None, String::new()),
            |work_type| {
                (
                    work_type.work_type.clone(),
                    work_type.org_claim,
                    work_type.status.clone(),
                )
            },
        );
        self.conn
            .execute(
                UPDATE_KEY_WORK_TYPE_SQL,
                params![work_type, org_claim, status, id.as_i64()],
            )
            .await?;
        Ok(())
    }

    /// Fill empty core fields of worksite `id` from `worksite`
    pub async fn fill_core(&self, id: WorksiteId, worksite: &Worksite) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                FILL_CORE_SQL,
                params![
                    worksite.address.as_str(),
                    worksite.auto_contact_frequency.as_str(),
                    worksite.case_number.as_str(),
                    worksite.city.as_str(),
                    worksite.county.as_str(),
                    worksite.created_at,
                    worksite.email.clone(),
                    worksite.favorite_id,
                    worksite.name.as_str(),
                    worksite.phone1.as_str(),
                    worksite.phone2.clone(),
                    worksite.plus_code.clone(),
                    worksite.postal_code.as_str(),
                    worksite.reported_by,
                    worksite.state.as_str(),
                    worksite.svi,
                    worksite.updated_at,
                    worksite.what3words.clone(),
                    id.as_i64()
                ],
            )
            .await?;

        if worksite.key_work_type.is_some() {
            self.conn
                .execute(
                    "UPDATE worksites SET
                        key_work_type_type = ?,
                        key_work_type_org = ?,
                        key_work_type_status = ?
                     WHERE id = ? AND key_work_type_type = ''",
                    params![
                        worksite
                            .key_work_type
                            .as_ref()
                            .map(|work_type| work_type.work_type.clone()),
                        worksite
                            .key_work_type
                            .as_ref()
                            .and_then(|work_type| work_type.org_claim),
                        worksite
                            .key_work_type
                            .as_ref()
                            .map(|work_type| work_type.status.clone()),
                        id.as_i64()
                    ],
                )
                .await?;
        }
        Ok(updated > 0)
    }

    // ---------------------------------------------------------------------
    // Aggregate queries
    // ---------------------------------------------------------------------

    /// Full worksite aggregate (root, core, children) by local id
    pub async fn get_worksite(&self, id: WorksiteId) -> Result<Option<LocalWorksite>> {
        let Some(root) = self.get_root(id).await? else {
            return Ok(None);
        };

        let mut rows = self
            .conn
            .query(
                &format!("SELECT {WORKSITE_COLUMNS} FROM worksites WHERE id = ?"),
                params![id.as_i64()],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let mut worksite = parse_worksite(&row)?;

        let children = WorksiteChildRepository::new(self.conn);
        worksite.work_types = children.work_types(id).await?;
        worksite.flags = children.flags(id).await?;
        worksite.notes = children.notes(id).await?;
        worksite.form_data = children.form_data(id).await?;
        worksite.work_type_requests = children.work_type_requests(id).await?;
        worksite.files = children.files(id).await?;

        if let Some(key) = worksite.key_work_type.take() {
            let matching = worksite
                .work_types
                .iter()
                .find(|work_type| work_type.work_type == key.work_type)
                .cloned();
            worksite.key_work_type = Some(matching.unwrap_or(key));
        }

        Ok(Some(LocalWorksite { root, worksite }))
    }

    /// Full worksite aggregate of the synced worksite with `network_id`
    pub async fn get_worksite_by_network_id(&self, network_id: i64) -> Result<Option<LocalWorksite>> {
        match self.local_id_for_network_id(network_id).await? {
            Some(id) => self.get_worksite(id).await,
            None => Ok(None),
        }
    }

    /// Number of worksites cached for an incident
    pub async fn count_incident_worksites(&self, incident_id: i64) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM worksites_root WHERE incident_id = ?",
                params![incident_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Worksite summaries of an incident ordered by case number
    pub async fn list_summaries(
        &self,
        incident_id: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WorksiteSummary>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "{SUMMARY_SELECT} WHERE w.incident_id = ?
                     ORDER BY w.case_number ASC, w.id ASC
                     LIMIT ? OFFSET ?"
                ),
                params![incident_id, limit as i64, offset as i64],
            )
            .await?;
        collect_summaries(rows).await
    }

    /// Worksite summaries of an incident inside a bounding box
    pub async fn list_summaries_in_bounds(
        &self,
        incident_id: i64,
        bounds: &BoundingBox,
    ) -> Result<Vec<WorksiteSummary>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "{SUMMARY_SELECT} WHERE w.incident_id = ?
                       AND w.latitude BETWEEN ? AND ?
                       AND w.longitude BETWEEN ? AND ?
                     ORDER BY w.id ASC"
                ),
                params![
                    incident_id,
                    bounds.south,
                    bounds.north,
                    bounds.west,
                    bounds.east
                ],
            )
            .await?;
        collect_summaries(rows).await
    }

    /// Delete an incident's worksites that carry no unsynced local work.
    ///
    /// Returns the number of worksites removed.
    pub async fn delete_unmodified_incident_worksites(&self, incident_id: i64) -> Result<u64> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM worksites_root
                 WHERE incident_id = ?
                   AND is_local_modified = 0
                   AND id NOT IN (
                       SELECT worksite_id FROM worksite_changes WHERE archive_action = ''
                   )",
                params![incident_id],
            )
            .await?;
        Ok(deleted)
    }
}

const SUMMARY_SELECT: &str = "SELECT w.id, w.network_id, w.incident_id, w.case_number, w.name,
        w.address, w.latitude, w.longitude, w.key_work_type_type, w.key_work_type_status,
        r.is_local_modified
    FROM worksites w
    JOIN worksites_root r ON r.id = w.id";

async fn collect_summaries(mut rows: libsql::Rows) -> Result<Vec<WorksiteSummary>> {
    let mut summaries = Vec::new();
    while let Some(row) = rows.next().await? {
        let key_work_type: String = row.get(8)?;
        let key_status: String = row.get(9)?;
        summaries.push(WorksiteSummary {
            id: WorksiteId(row.get(0)?),
            network_id: row.get(1)?,
            incident_id: row.get(2)?,
            case_number: row.get(3)?,
            name: row.get(4)?,
            address: row.get(5)?,
            latitude: row.get(6)?,
            longitude: row.get(7)?,
            key_work_type: (!key_work_type.is_empty()).then_some(key_work_type),
            key_work_type_status: (!key_status.is_empty()).then_some(key_status),
            is_local_modified: row.get::<i32>(10)? != 0,
        });
    }
    Ok(summaries)
}

fn parse_root(row: &Row) -> Result<WorksiteRoot> {
    Ok(WorksiteRoot {
        id: WorksiteId(row.get(0)?),
        network_id: row.get(1)?,
        incident_id: row.get(2)?,
        is_local_modified: row.get::<i32>(3)? != 0,
        local_modified_at: row.get(4)?,
        synced_at: row.get(5)?,
        sync_attempt: row.get(6)?,
        local_global_uuid: row.get(7)?,
    })
}

fn parse_worksite(row: &Row) -> Result<Worksite> {
    let key_work_type_type: String = row.get(12)?;
    let key_work_type = if key_work_type_type.is_empty() {
        None
    } else {
        let mut work_type = WorkType::new(key_work_type_type, row.get::<String>(14)?);
        work_type.org_claim = row.get(13)?;
        Some(work_type)
    };

    Ok(Worksite {
        id: WorksiteId(row.get(0)?),
        network_id: row.get(1)?,
        incident_id: row.get(2)?,
        address: row.get(3)?,
        auto_contact_frequency: row.get(4)?,
        case_number: row.get(5)?,
        city: row.get(6)?,
        county: row.get(7)?,
        created_at: row.get(8)?,
        email: row.get(9)?,
        favorite_id: row.get(10)?,
        is_assigned_to_org_member: row.get::<i32>(11)? != 0,
        key_work_type,
        latitude: row.get(15)?,
        longitude: row.get(16)?,
        name: row.get(17)?,
        phone1: row.get(18)?,
        phone2: row.get(19)?,
        plus_code: row.get(20)?,
        postal_code: row.get(21)?,
        reported_by: row.get(22)?,
        state: row.get(23)?,
        svi: row.get(24)?,
        updated_at: row.get(25)?,
        what3words: row.get(26)?,
        work_types: Vec::new(),
        flags: Vec::new(),
        notes: Vec::new(),
        form_data: std::collections::BTreeMap::new(),
        work_type_requests: Vec::new(),
        files: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn network_worksite(network_id: i64) -> Worksite {
        let mut worksite = Worksite::new(1, 29.95, -90.07);
        worksite.network_id = network_id;
        worksite.case_number = format!("W{network_id}");
        worksite.name = "Dana".to_string();
        worksite.address = "12 Canal St".to_string();
        worksite.key_work_type = Some(WorkType::new("muck_out", "open_unassigned"));
        worksite
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_read_aggregate() {
        let db = setup().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());

        let id = repo.insert_network_root(500, 1, 1_000).await.unwrap();
        repo.upsert_core(id, &network_worksite(500), false)
            .await
            .unwrap();

        let local = repo.get_worksite(id).await.unwrap().unwrap();
        assert_eq!(local.root.network_id, 500);
        assert_eq!(local.root.synced_at, 1_000);
        assert_eq!(local.root.local_global_uuid, "");
        assert_eq!(local.worksite.case_number, "W500");
        assert_eq!(
            local.worksite.key_work_type.map(|work_type| work_type.work_type),
            Some("muck_out".to_string())
        );

        let by_network = repo.get_worksite_by_network_id(500).await.unwrap().unwrap();
        assert_eq!(by_network.root.id, id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guarded_root_update_rejects_stale_stamp() {
        let db = setup().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());

        let id = repo.insert_network_root(7, 1, 100).await.unwrap();
        let stamp = repo.get_local_modified_at(7).await.unwrap().unwrap();
        assert_eq!(stamp.id, id);

        repo.mark_local_modified(id, 200).await.unwrap();
        assert!(!repo.update_network_root(&stamp, 300).await.unwrap());

        let fresh = repo.get_local_modified_at(7).await.unwrap().unwrap();
        assert!(repo.update_network_root(&fresh, 300).await.unwrap());
        let root = repo.get_root(id).await.unwrap().unwrap();
        assert!(!root.is_local_modified);
        assert_eq!(root.synced_at, 300);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fill_core_keeps_local_values() {
        let db = setup().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());

        let id = repo.insert_local_root(1, "uuid-1", 10).await.unwrap();
        let mut local = Worksite::new(1, 29.9, -90.1);
        local.name = "Local Name".to_string();
        repo.upsert_core(id, &local, false).await.unwrap();

        let mut incoming = network_worksite(42);
        incoming.name = "Server Name".to_string();
        incoming.email = Some("dana@example.org".to_string());
        repo.fill_core(id, &incoming).await.unwrap();

        let filled = repo.get_worksite(id).await.unwrap().unwrap().worksite;
        assert_eq!(filled.name, "Local Name");
        assert_eq!(filled.address, "12 Canal St");
        assert_eq!(filled.email.as_deref(), Some("dana@example.org"));
        assert_eq!(
            filled.key_work_type.map(|work_type| work_type.work_type),
            Some("muck_out".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_assign_network_id_replaces_unmodified_copy() {
        let db = setup().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());

        let pulled = repo.insert_network_root(90, 1, 10).await.unwrap();
        repo.upsert_core(pulled, &network_worksite(90), false)
            .await
            .unwrap();

        let local = repo.insert_local_root(1, "uuid-2", 20).await.unwrap();
        repo.upsert_core(local, &Worksite::new(1, 0.0, 0.0), false)
            .await
            .unwrap();

        assert!(repo.assign_network_id(local, 90).await.unwrap());
        assert!(repo.get_root(pulled).await.unwrap().is_none());

        let root = repo.get_root(local).await.unwrap().unwrap();
        assert_eq!(root.network_id, 90);
        assert_eq!(root.local_global_uuid, "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_summaries_in_bounds() {
        let db = setup().await;
        let repo = LibSqlWorksiteRepository::new(db.connection());

        for (network_id, latitude) in [(1, 29.95), (2, 29.96), (3, 35.0)] {
            let id = repo.insert_network_root(network_id, 1, 10).await.unwrap();
            let mut worksite = network_worksite(network_id);
            worksite.latitude = latitude;
            repo.upsert_core(id, &worksite, false).await.unwrap();
        }

        let bounds = BoundingBox {
            south: 29.9,
            west: -90.2,
            north: 30.0,
            east: -90.0,
        };
        let summaries = repo.list_summaries_in_bounds(1, &bounds).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(repo.count_incident_worksites(1).await.unwrap(), 3);
        assert_eq!(repo.list_summaries(1, 2, 0).await.unwrap().len(), 2);
    }
}
