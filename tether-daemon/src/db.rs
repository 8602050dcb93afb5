//! Database service for durable device storage.
//!
//! Each device is one row holding its full JSON record. Rows are written
//! per mutation and as a full snapshot on demand.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tether_core::Device;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode device record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("store write timed out")]
    Timeout,
}

/// A stored row that could not be turned back into a device.
#[derive(Debug, Clone)]
pub struct SkippedRow {
    pub udid: String,
    pub reason: String,
}

/// Devices read at startup.
#[derive(Debug, Default)]
pub struct LoadedDevices {
    pub devices: Vec<Device>,
    pub skipped: Vec<SkippedRow>,
}

/// Database service wrapping SQLite access.
#[derive(Clone)]
pub struct DbService {
    pool: SqlitePool,
}

impl DbService {
    /// Open or create a database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                sqlx::Error::Configuration(format!("Failed to create db directory: {}", e).into())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // single writer
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                udid TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace one device row.
    pub async fn save_device(&self, device: &Device) -> Result<(), StoreError> {
        let record = serde_json::to_string(device)?;
        sqlx::query(UPSERT)
            .bind(device.id.as_str())
            .bind(record)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Write every device in one transaction.
    pub async fn save_all(&self, devices: &[Device]) -> Result<(), StoreError> {
        let records = devices
            .iter()
            .map(|d| serde_json::to_string(d).map(|record| (d.id.as_str(), record)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        let updated_at = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        for (udid, record) in records {
            sqlx::query(UPSERT)
                .bind(udid)
                .bind(record)
                .bind(&updated_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Read every device row, setting aside rows that fail to decode.
    pub async fn load_all(&self) -> Result<LoadedDevices, StoreError> {
        let rows = sqlx::query("SELECT udid, record FROM devices ORDER BY udid")
            .fetch_all(&self.pool)
            .await?;

        let mut loaded = LoadedDevices::default();
        for row in rows {
            let udid: String = row.try_get("udid")?;
            let record: String = row.try_get("record")?;
            match serde_json::from_str::<Device>(&record) {
                Ok(device) if device.id.as_str() == udid => loaded.devices.push(device),
                Ok(device) => loaded.skipped.push(SkippedRow {
                    reason: format!("record belongs to {}", device.id),
                    udid,
                }),
                Err(e) => loaded.skipped.push(SkippedRow {
                    udid,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(loaded)
    }
}

const UPSERT: &str = r#"
    INSERT INTO devices (udid, record, updated_at) VALUES (?1, ?2, ?3)
    ON CONFLICT(udid) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tether_core::DeviceId;

    fn device(id: &str) -> Device {
        Device::new(DeviceId::new(id), Utc::now())
    }

    #[tokio::test]
    async fn open_creates_table_and_parent_dir() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("tether.db");

        let db = DbService::open(&db_path).await.unwrap();

        let rows: Vec<(String,)> = sqlx::query_as("SELECT udid FROM devices")
            .fetch_all(db.pool())
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn save_device_overwrites_existing_row() {
        let dir = tempdir().unwrap();
        let db = DbService::open(dir.path().join("tether.db")).await.unwrap();

        let mut d = device("D1");
        db.save_device(&d).await.unwrap();
        d.metadata.owner = Some("alice".into());
        db.save_device(&d).await.unwrap();

        let loaded = db.load_all().await.unwrap();
        assert_eq!(loaded.devices, vec![d]);
        assert!(loaded.skipped.is_empty());
    }

    #[tokio::test]
    async fn save_all_writes_every_device() {
        let dir = tempdir().unwrap();
        let db = DbService::open(dir.path().join("tether.db")).await.unwrap();

        db.save_all(&[device("B"), device("A"), device("C")])
            .await
            .unwrap();

        let ids: Vec<String> = db
            .load_all()
            .await
            .unwrap()
            .devices
            .into_iter()
            .map(|d| d.id.0)
            .collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn corrupt_rows_are_skipped() {
        let dir = tempdir().unwrap();
        let db = DbService::open(dir.path().join("tether.db")).await.unwrap();
        db.save_device(&device("GOOD")).await.unwrap();

        sqlx::query("INSERT INTO devices (udid, record, updated_at) VALUES ('BAD', '{not json', '')")
            .execute(db.pool())
            .await
            .unwrap();
        let stray = serde_json::to_string(&device("OTHER")).unwrap();
        sqlx::query("INSERT INTO devices (udid, record, updated_at) VALUES ('MISMATCH', ?1, '')")
            .bind(stray)
            .execute(db.pool())
            .await
            .unwrap();

        let loaded = db.load_all().await.unwrap();
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].id.as_str(), "GOOD");
        let skipped: Vec<&str> = loaded.skipped.iter().map(|s| s.udid.as_str()).collect();
        assert_eq!(skipped, vec!["BAD", "MISMATCH"]);
    }

    #[tokio::test]
    async fn reopen_preserves_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tether.db");
        {
            let db = DbService::open(&path).await.unwrap();
            db.save_device(&device("D1")).await.unwrap();
            db.pool().close().await;
        }
        let db = DbService::open(&path).await.unwrap();
        assert_eq!(db.load_all().await.unwrap().devices.len(), 1);
    }
}
