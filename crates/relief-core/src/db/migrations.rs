//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Schema version written by this build
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = current_version(conn).await?;
    if version >= CURRENT_VERSION {
        return Ok(());
    }

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Highest applied migration, `0` for a fresh database
pub async fn current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run statements in one transaction, rolling back on the first failure
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: worksites, child collections, and the change log
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        "CREATE TABLE IF NOT EXISTS worksites_root (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            local_modified_at INTEGER NOT NULL DEFAULT 0,
            synced_at INTEGER NOT NULL DEFAULT 0,
            local_global_uuid TEXT NOT NULL DEFAULT '',
            is_local_modified INTEGER NOT NULL DEFAULT 0,
            sync_attempt INTEGER NOT NULL DEFAULT 0,
            network_id INTEGER NOT NULL DEFAULT -1,
            incident_id INTEGER NOT NULL
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS unique_worksite_root_identity
            ON worksites_root(network_id, local_global_uuid)",
        "CREATE INDEX IF NOT EXISTS idx_worksite_root_incident
            ON worksites_root(incident_id, network_id)",
        "CREATE INDEX IF NOT EXISTS idx_worksite_root_modified
            ON worksites_root(is_local_modified, local_modified_at)",
        "CREATE TABLE IF NOT EXISTS worksites (
            id INTEGER PRIMARY KEY REFERENCES worksites_root(id) ON DELETE CASCADE,
            network_id INTEGER NOT NULL DEFAULT -1,
            incident_id INTEGER NOT NULL,
            address TEXT NOT NULL DEFAULT '',
            auto_contact_frequency_t TEXT NOT NULL DEFAULT '',
            case_number TEXT NOT NULL DEFAULT '',
            city TEXT NOT NULL DEFAULT '',
            county TEXT NOT NULL DEFAULT '',
            created_at INTEGER,
            email TEXT,
            favorite_id INTEGER,
            is_assigned_to_org_member INTEGER NOT NULL DEFAULT 0,
            key_work_type_type TEXT NOT NULL DEFAULT '',
            key_work_type_org INTEGER,
            key_work_type_status TEXT NOT NULL DEFAULT '',
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            phone1 TEXT NOT NULL DEFAULT '',
            phone2 TEXT,
            plus_code TEXT,
            postal_code TEXT NOT NULL DEFAULT '',
            reported_by INTEGER,
            state TEXT NOT NULL DEFAULT '',
            svi REAL,
            updated_at INTEGER,
            what3words TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_worksites_incident_network
            ON worksites(incident_id, network_id)",
        "CREATE INDEX IF NOT EXISTS idx_worksites_incident_coordinates
            ON worksites(incident_id, latitude, longitude)",
        "CREATE TABLE IF NOT EXISTS work_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            network_id INTEGER NOT NULL DEFAULT -1,
            worksite_id INTEGER NOT NULL REFERENCES worksites(id) ON DELETE CASCADE,
            created_at INTEGER,
            org_claim INTEGER,
            next_recur_at INTEGER,
            phase INTEGER,
            recur TEXT,
            status TEXT NOT NULL,
            work_type TEXT NOT NULL,
            UNIQUE (worksite_id, work_type)
        )",
        "CREATE TABLE IF NOT EXISTS worksite_flags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            network_id INTEGER NOT NULL DEFAULT -1,
            worksite_id INTEGER NOT NULL REFERENCES worksites(id) ON DELETE CASCADE,
            action TEXT,
            created_at INTEGER NOT NULL,
            is_high_priority INTEGER NOT NULL DEFAULT 0,
            notes TEXT NOT NULL DEFAULT '',
            reason_t TEXT NOT NULL,
            requested_action TEXT,
            UNIQUE (worksite_id, reason_t)
        )",
        "CREATE TABLE IF NOT EXISTS worksite_notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            network_id INTEGER NOT NULL DEFAULT -1,
            worksite_id INTEGER NOT NULL REFERENCES worksites(id) ON DELETE CASCADE,
            created_at INTEGER NOT NULL,
            is_survivor INTEGER NOT NULL DEFAULT 0,
            note TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_worksite_notes_network
            ON worksite_notes(worksite_id, network_id)",
        "CREATE TABLE IF NOT EXISTS worksite_form_data (
            worksite_id INTEGER NOT NULL REFERENCES worksites(id) ON DELETE CASCADE,
            field_key TEXT NOT NULL,
            is_bool_value INTEGER NOT NULL DEFAULT 0,
            value_string TEXT NOT NULL DEFAULT '',
            value_bool INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (worksite_id, field_key)
        )",
        "CREATE TABLE IF NOT EXISTS work_type_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            network_id INTEGER NOT NULL DEFAULT -1,
            worksite_id INTEGER NOT NULL REFERENCES worksites(id) ON DELETE CASCADE,
            work_type TEXT NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            by_org INTEGER NOT NULL,
            to_org INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            approved_at INTEGER,
            rejected_at INTEGER,
            approved_rejected_reason TEXT NOT NULL DEFAULT '',
            UNIQUE (worksite_id, work_type, by_org)
        )",
        "CREATE TABLE IF NOT EXISTS network_files (
            id INTEGER PRIMARY KEY,
            created_at INTEGER NOT NULL,
            file_id INTEGER NOT NULL,
            file_type_t TEXT NOT NULL DEFAULT '',
            full_url TEXT,
            large_thumbnail_url TEXT,
            mime_content_type TEXT NOT NULL DEFAULT '',
            small_thumbnail_url TEXT,
            tag TEXT,
            title TEXT,
            url TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS worksite_to_network_file (
            worksite_id INTEGER NOT NULL REFERENCES worksites(id) ON DELETE CASCADE,
            network_file_id INTEGER NOT NULL REFERENCES network_files(id) ON DELETE CASCADE,
            PRIMARY KEY (worksite_id, network_file_id)
        )",
        "CREATE TABLE IF NOT EXISTS worksite_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            app_version INTEGER NOT NULL,
            organization_id INTEGER NOT NULL,
            worksite_id INTEGER NOT NULL REFERENCES worksites_root(id) ON DELETE CASCADE,
            sync_uuid TEXT NOT NULL,
            change_model_version INTEGER NOT NULL,
            change_data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            save_attempt INTEGER NOT NULL DEFAULT 0,
            archive_action TEXT NOT NULL DEFAULT '',
            save_attempt_at INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_worksite_changes_order
            ON worksite_changes(worksite_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_worksite_changes_pending
            ON worksite_changes(archive_action, save_attempt)",
        "CREATE TABLE IF NOT EXISTS incident_data_sync_parameters (
            id INTEGER PRIMARY KEY,
            updated_before INTEGER NOT NULL DEFAULT 9223372036854775807,
            updated_after INTEGER NOT NULL DEFAULT 0,
            additional_updated_before INTEGER NOT NULL DEFAULT 9223372036854775807,
            additional_updated_after INTEGER NOT NULL DEFAULT 0,
            bounded_region TEXT NOT NULL DEFAULT '',
            bounded_synced_at INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE TABLE IF NOT EXISTS incident_data_sync_stats (
            incident_id INTEGER PRIMARY KEY,
            sync_start INTEGER NOT NULL,
            data_count INTEGER NOT NULL,
            paged_count INTEGER NOT NULL DEFAULT 0,
            successful_sync INTEGER,
            attempted_sync INTEGER,
            attempted_counter INTEGER NOT NULL DEFAULT 0,
            app_build_version_code INTEGER NOT NULL
        )",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: cached incident details
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            short_name TEXT NOT NULL DEFAULT '',
            start_at INTEGER NOT NULL DEFAULT 0,
            is_archived INTEGER NOT NULL DEFAULT 0,
            form_fields TEXT NOT NULL DEFAULT '[]'
        )",
        "CREATE INDEX IF NOT EXISTS idx_incidents_start ON incidents(start_at DESC)",
    ];

    apply(conn, 2, &statements).await
}
