//! Per-incident pull statistics

use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::IncidentDataSyncStats;

const STATS_COLUMNS: &str = "incident_id, sync_start, data_count, paged_count, successful_sync, \
     attempted_sync, attempted_counter, app_build_version_code";

pub struct LibSqlSyncStatsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncStatsRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub async fn get_stats(&self, incident_id: i64) -> Result<Option<IncidentDataSyncStats>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {STATS_COLUMNS} FROM incident_data_sync_stats WHERE incident_id = ?"
                ),
                params![incident_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_stats(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_stats(&self) -> Result<Vec<IncidentDataSyncStats>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {STATS_COLUMNS} FROM incident_data_sync_stats ORDER BY incident_id ASC"
                ),
                (),
            )
            .await?;
        let mut stats = Vec::new();
        while let Some(row) = rows.next().await? {
            stats.push(parse_stats(&row)?);
        }
        Ok(stats)
    }

    pub async fn upsert_stats(&self, stats: &IncidentDataSyncStats) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO incident_data_sync_stats (
                    incident_id, sync_start, data_count, paged_count, successful_sync,
                    attempted_sync, attempted_counter, app_build_version_code
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(incident_id) DO UPDATE SET
                    sync_start = excluded.sync_start,
                    data_count = excluded.data_count,
                    paged_count = excluded.paged_count,
                    successful_sync = excluded.successful_sync,
                    attempted_sync = excluded.attempted_sync,
                    attempted_counter = excluded.attempted_counter,
                    app_build_version_code = excluded.app_build_version_code",
                params![
                    stats.incident_id,
                    stats.sync_start,
                    stats.data_count,
                    stats.paged_count,
                    stats.successful_sync,
                    stats.attempted_sync,
                    stats.attempted_counter,
                    stats.app_build_version_code
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn delete_stats(&self, incident_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM incident_data_sync_stats WHERE incident_id = ?",
                params![incident_id],
            )
            .await?;
        Ok(deleted > 0)
    }
}

fn parse_stats(row: &Row) -> Result<IncidentDataSyncStats> {
    Ok(IncidentDataSyncStats {
        incident_id: row.get(0)?,
        sync_start: row.get(1)?,
        data_count: row.get(2)?,
        paged_count: row.get(3)?,
        successful_sync: row.get(4)?,
        attempted_sync: row.get(5)?,
        attempted_counter: row.get(6)?,
        app_build_version_code: row.get(7)?,
    })
}
