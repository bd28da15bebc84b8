//! Embedded metadata store
//!
//! A single sqlite database holding long-lived metadata: per-service records,
//! request activity history, and optional API keys. Writes on the request
//! path are best-effort and asynchronous; a store failure is logged and never
//! fails a request. In-flight queues are never persisted.

use chrono::Utc;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// One recorded request.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub service_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
}

/// Stored service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_id: String,
    pub status: String,
    pub active_base_url: Option<String>,
    pub last_used: String,
}

/// sqlite-backed metadata store.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS service_states (
                 service_id      TEXT PRIMARY KEY,
                 status          TEXT NOT NULL DEFAULT 'cold',
                 active_base_url TEXT,
                 last_used       TEXT NOT NULL,
                 updated_at      TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS activities (
                 id          INTEGER PRIMARY KEY AUTOINCREMENT,
                 service_id  TEXT NOT NULL,
                 method      TEXT NOT NULL,
                 path        TEXT NOT NULL,
                 status      INTEGER NOT NULL,
                 duration_ms INTEGER NOT NULL,
                 created_at  TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_activities_service
                 ON activities (service_id, created_at);
             CREATE TABLE IF NOT EXISTS auth_keys (
                 id         TEXT PRIMARY KEY,
                 name       TEXT NOT NULL,
                 hashed_key TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 disabled   INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        Ok(())
    }

    /// Upsert a service's persisted status.
    pub fn update_service_status(
        &self,
        service_id: &str,
        status: &str,
        active_base_url: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO service_states (service_id, status, active_base_url, last_used, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(service_id) DO UPDATE SET
                 status = excluded.status,
                 active_base_url = excluded.active_base_url,
                 last_used = excluded.last_used,
                 updated_at = excluded.updated_at",
            params![service_id, status, active_base_url, now],
        )?;
        Ok(())
    }

    pub fn get_service_record(&self, service_id: &str) -> Result<Option<ServiceRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT service_id, status, active_base_url, last_used
             FROM service_states WHERE service_id = ?1",
        )?;
        let mut rows = stmt.query(params![service_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(ServiceRecord {
                service_id: row.get(0)?,
                status: row.get(1)?,
                active_base_url: row.get(2)?,
                last_used: row.get(3)?,
            })),
            None => Ok(None),
        }
    }

    /// Append one activity row.
    pub fn record_activity(&self, row: &ActivityRow) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activities (service_id, method, path, status, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.service_id,
                row.method,
                row.path,
                row.status,
                row.duration_ms as i64,
                now
            ],
        )?;
        Ok(())
    }

    pub fn activity_count(&self, service_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM activities WHERE service_id = ?1",
            params![service_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Register an API key. The key itself is never stored, only its hash.
    pub fn add_api_key(&self, name: &str, key: &str) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO auth_keys (id, name, hashed_key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, hash_key(key), now],
        )?;
        Ok(id)
    }

    /// Check a presented key against enabled stored hashes.
    pub fn verify_api_key(&self, key: &str) -> Result<bool, StoreError> {
        let hashed = hash_key(key);
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM auth_keys WHERE hashed_key = ?1 AND disabled = 0",
            params![hashed],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// True when at least one enabled key exists.
    pub fn has_api_keys(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM auth_keys WHERE disabled = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fire-and-forget activity write off the request path.
pub fn record_activity_async(store: &Arc<MetadataStore>, row: ActivityRow) {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = store.record_activity(&row) {
            tracing::warn!(service_id = %row.service_id, error = %e, "Failed to record activity");
        }
    });
}

/// Fire-and-forget status write off the request path.
pub fn record_status_async(
    store: &Arc<MetadataStore>,
    service_id: String,
    status: &'static str,
    active_base_url: Option<String>,
) {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || {
        if let Err(e) =
            store.update_service_status(&service_id, status, active_base_url.as_deref())
        {
            tracing::warn!(service_id = %service_id, error = %e, "Failed to persist service status");
        }
    });
}
