//! Per-incident pull cursors and bounded region cache state

use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{BoundedRegion, IncidentDataSyncParameters, SyncTimeMarker};

/// Which cursor column an advance writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    CoreBefore,
    CoreAfter,
    AdditionalBefore,
    AdditionalAfter,
}

impl Cursor {
    const fn column(self) -> &'static str {
        match self {
            Self::CoreBefore => "updated_before",
            Self::CoreAfter => "updated_after",
            Self::AdditionalBefore => "additional_updated_before",
            Self::AdditionalAfter => "additional_updated_after",
        }
    }
}

/// libSQL implementation of the sync parameter tracker.
///
/// Advances write the given value as is. Keeping `after` monotonic forward
/// and `before` monotonic backward is the caller's job.
pub struct LibSqlSyncParametersRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncParametersRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub async fn get_parameters(
        &self,
        incident_id: i64,
    ) -> Result<Option<IncidentDataSyncParameters>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, updated_before, updated_after, additional_updated_before,
                        additional_updated_after, bounded_region, bounded_synced_at
                 FROM incident_data_sync_parameters WHERE id = ?",
                params![incident_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let bounded_region: String = row.get(5)?;
        let bounded_region = if bounded_region.is_empty() {
            None
        } else {
            match serde_json::from_str::<BoundedRegion>(&bounded_region) {
                Ok(region) => Some(region),
                Err(error) => {
                    tracing::warn!(
                        "Ignoring unreadable bounded region of incident {incident_id}: {error}"
                    );
                    None
                }
            }
        };

        Ok(Some(IncidentDataSyncParameters {
            incident_id: row.get(0)?,
            core: SyncTimeMarker {
                before: row.get(1)?,
                after: row.get(2)?,
            },
            additional: SyncTimeMarker {
                before: row.get(3)?,
                after: row.get(4)?,
            },
            bounded_region,
            bounded_synced_at: row.get(6)?,
        }))
    }

    /// Create the unsynced parameters row unless one exists
    pub async fn insert_if_absent(&self, incident_id: i64) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO incident_data_sync_parameters (
                    id, updated_before, updated_after,
                    additional_updated_before, additional_updated_after
                 ) VALUES (?, ?, 0, ?, 0)",
                params![
                    incident_id,
                    SyncTimeMarker::UNSYNCED_BEFORE,
                    SyncTimeMarker::UNSYNCED_BEFORE
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    pub async fn advance_core_before(&self, incident_id: i64, timestamp: i64) -> Result<bool> {
        self.write_cursor(incident_id, Cursor::CoreBefore, timestamp)
            .await
    }

    pub async fn advance_core_after(&self, incident_id: i64, timestamp: i64) -> Result<bool> {
        self.write_cursor(incident_id, Cursor::CoreAfter, timestamp)
            .await
    }

    pub async fn advance_additional_before(
        &self,
        incident_id: i64,
        timestamp: i64,
    ) -> Result<bool> {
        self.write_cursor(incident_id, Cursor::AdditionalBefore, timestamp)
            .await
    }

    pub async fn advance_additional_after(
        &self,
        incident_id: i64,
        timestamp: i64,
    ) -> Result<bool> {
        self.write_cursor(incident_id, Cursor::AdditionalAfter, timestamp)
            .await
    }

    /// Record the region most recently cached for an incident
    pub async fn update_bounded_region(
        &self,
        incident_id: i64,
        region: &BoundedRegion,
        synced_at: i64,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE incident_data_sync_parameters
                 SET bounded_region = ?, bounded_synced_at = ?
                 WHERE id = ?",
                params![serde_json::to_string(region)?, synced_at, incident_id],
            )
            .await?;
        Ok(updated > 0)
    }

    pub async fn delete_parameters(&self, incident_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM incident_data_sync_parameters WHERE id = ?",
                params![incident_id],
            )
            .await?;
        Ok(deleted > 0)
    }

    pub async fn list_parameters(&self) -> Result<Vec<IncidentDataSyncParameters>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM incident_data_sync_parameters ORDER BY id ASC",
                (),
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<i64>(0)?);
        }

        let mut parameters = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(found) = self.get_parameters(id).await? {
                parameters.push(found);
            }
        }
        Ok(parameters)
    }

    async fn write_cursor(&self, incident_id: i64, cursor: Cursor, timestamp: i64) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                &format!(
                    "UPDATE incident_data_sync_parameters SET {} = ? WHERE id = ?",
                    cursor.column()
                ),
                params![timestamp, incident_id],
            )
            .await?;
        Ok(updated > 0)
    }
}
