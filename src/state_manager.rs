// src/state_manager.rs

use crate::models::TransferRecord;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const NEXT_HANDLE_KEY: &str = "next_handle";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Manages the persistence of transfer records to an SQLite database.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Creates a new StateManager and connects to the database file.
    /// It will create the database and necessary tables if they don't exist.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    /// In-memory store, gone when the last clone is dropped.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS downloads (
                        id              INTEGER PRIMARY KEY,
                        updated_at      INTEGER NOT NULL,
                        record_data     TEXT NOT NULL
                    )",
                    [],
                )?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS meta (
                        key             TEXT PRIMARY KEY,
                        value           INTEGER NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Saves (inserts or updates) a record.
    pub async fn save_record(&self, record: &TransferRecord) -> Result<(), StateError> {
        let record_data = serde_json::to_string(record)?;
        let id = record.handle;
        let updated_at = record.updated_at.timestamp();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO downloads (id, updated_at, record_data) VALUES (?1, ?2, ?3)",
                    params![id, updated_at, record_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Saves a freshly issued record together with the advanced handle counter,
    /// in one transaction so the counter can never fall behind a stored record.
    pub async fn save_new_record(
        &self,
        record: &TransferRecord,
        next_handle: u64,
    ) -> Result<(), StateError> {
        let record_data = serde_json::to_string(record)?;
        let id = record.handle;
        let updated_at = record.updated_at.timestamp();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR REPLACE INTO downloads (id, updated_at, record_data) VALUES (?1, ?2, ?3)",
                    params![id, updated_at, record_data],
                )?;
                tx.execute(
                    "INSERT INTO meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
                    params![NEXT_HANDLE_KEY, next_handle],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Loads one record by handle.
    pub async fn load_record(&self, handle: u64) -> Result<Option<TransferRecord>, StateError> {
        let data = self
            .conn
            .call(move |conn| {
                let data: Option<String> = conn
                    .query_row(
                        "SELECT record_data FROM downloads WHERE id = ?1",
                        params![handle],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(data)
            })
            .await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Loads all records from the database.
    pub async fn load_all_records(&self) -> Result<Vec<TransferRecord>, StateError> {
        let records = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record_data FROM downloads ORDER BY id")?;
                let record_iter = stmt.query_map([], |row| {
                    let record_data: String = row.get(0)?;
                    let record: TransferRecord = serde_json::from_str(&record_data).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                    Ok(record)
                })?;

                let records: Result<Vec<TransferRecord>, rusqlite::Error> = record_iter.collect();
                Ok(records?)
            })
            .await?;
        Ok(records)
    }

    /// Handles of every stored record.
    pub async fn load_handles(&self) -> Result<Vec<u64>, StateError> {
        let handles = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM downloads ORDER BY id")?;
                let ids: Result<Vec<u64>, rusqlite::Error> =
                    stmt.query_map([], |row| row.get(0))?.collect();
                Ok(ids?)
            })
            .await?;
        Ok(handles)
    }

    /// The first handle the next process may issue: the persisted counter, or
    /// one past the largest stored handle, whichever is greater. Never below 1.
    pub async fn next_handle(&self) -> Result<u64, StateError> {
        let next = self
            .conn
            .call(|conn| {
                let counter: Option<u64> = conn
                    .query_row(
                        "SELECT value FROM meta WHERE key = ?1",
                        params![NEXT_HANDLE_KEY],
                        |row| row.get(0),
                    )
                    .optional()?;
                let max_id: Option<u64> =
                    conn.query_row("SELECT MAX(id) FROM downloads", [], |row| row.get(0))?;
                Ok(counter
                    .unwrap_or(1)
                    .max(max_id.map_or(1, |id| id + 1))
                    .max(1))
            })
            .await?;
        Ok(next)
    }

    /// Deletes a record by handle. Deleting a missing record is not an error.
    pub async fn delete_record(&self, handle: u64) -> Result<(), StateError> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM downloads WHERE id = ?1", params![handle])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
