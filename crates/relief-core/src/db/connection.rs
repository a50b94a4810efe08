//! Local libSQL store for worksites and their change logs

use std::path::Path;

use libsql::{Builder, Connection, Database as LibSqlDatabase};

use crate::error::Result;

use super::migrations;

/// Pragmas applied on open; optional ones are skipped where unsupported
const PRAGMAS: &[(&str, bool)] = &[
    ("PRAGMA journal_mode = WAL;", false),
    ("PRAGMA synchronous = NORMAL;", false),
    ("PRAGMA busy_timeout = 5000;", false),
    ("PRAGMA foreign_keys = ON;", true),
];

/// One libSQL database with the worksite schema applied
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open or create the store file and bring its schema up to date
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Builder::new_local(path.as_ref()).build().await?).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::init(Builder::new_local(":memory:").build().await?).await
    }

    async fn init(db: LibSqlDatabase) -> Result<Self> {
        let conn = db.connect()?;
        for (pragma, required) in PRAGMAS {
            match conn.execute(pragma, ()).await {
                Ok(_) => {}
                Err(error) if *required => return Err(error.into()),
                Err(error) => tracing::debug!("Skipping {pragma}: {error}"),
            }
        }
        migrations::run(&conn).await?;
        Ok(Self { _db: db, conn })
    }

    pub async fn schema_version(&self) -> Result<i32> {
        migrations::current_version(&self.conn).await
    }

    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fresh_store_is_fully_migrated() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), migrations::CURRENT_VERSION);

        let mut rows = db.connection().query("PRAGMA foreign_keys", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reopening_keeps_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relief.db");

        {
            let db = Database::open(&path).await.unwrap();
            db.connection()
                .execute(
                    "INSERT INTO incident_data_sync_parameters (id) VALUES (7)",
                    (),
                )
                .await
                .unwrap();
        }

        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), migrations::CURRENT_VERSION);
        let mut rows = db
            .connection()
            .query("SELECT id FROM incident_data_sync_parameters", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 7);
    }
}
