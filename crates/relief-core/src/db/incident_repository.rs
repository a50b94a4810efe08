//! Cached incident details

use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::{Incident, IncidentFormField};

pub struct LibSqlIncidentRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlIncidentRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Store an incident.
    ///
    /// A pull without form fields keeps the form fields already cached.
    pub async fn upsert_incident(&self, incident: &Incident) -> Result<()> {
        let form_fields = serde_json::to_string(&incident.form_fields)?;
        let keep_form_fields = incident.form_fields.is_empty();
        self.conn
            .execute(
                "INSERT INTO incidents (id, name, short_name, start_at, is_archived, form_fields)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    short_name = excluded.short_name,
                    start_at = excluded.start_at,
                    is_archived = excluded.is_archived,
                    form_fields = CASE WHEN ? THEN incidents.form_fields
                        ELSE excluded.form_fields END",
                params![
                    incident.id,
                    incident.name.as_str(),
                    incident.short_name.as_str(),
                    incident.start_at,
                    i32::from(incident.is_archived),
                    form_fields,
                    i32::from(keep_form_fields)
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_incident(&self, id: i64) -> Result<Option<Incident>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, short_name, start_at, is_archived, form_fields
                 FROM incidents WHERE id = ?",
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_incident(&row)?)),
            None => Ok(None),
        }
    }

    /// Incidents newest first
    pub async fn list_incidents(&self) -> Result<Vec<Incident>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, short_name, start_at, is_archived, form_fields
                 FROM incidents ORDER BY start_at DESC, id DESC",
                (),
            )
            .await?;
        let mut incidents = Vec::new();
        while let Some(row) = rows.next().await? {
            incidents.push(parse_incident(&row)?);
        }
        Ok(incidents)
    }
}

fn parse_incident(row: &Row) -> Result<Incident> {
    let form_fields: String = row.get(5)?;
    Ok(Incident {
        id: row.get(0)?,
        name: row.get(1)?,
        short_name: row.get(2)?,
        start_at: row.get(3)?,
        is_archived: row.get::<i32>(4)? != 0,
        form_fields: serde_json::from_str::<Vec<IncidentFormField>>(&form_fields)?,
    })
}
