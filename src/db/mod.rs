//! SQLite persistence for device connection records and the bounded discovery
//! history log.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Result, params};

use crate::device::{ConnectionInfo, DeviceKind};

/// A persisted connection record with its bookkeeping counters
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConnection {
    pub info: ConnectionInfo,
    pub failure_count: u32,
    pub last_connected: Option<i64>,
    pub last_discovered: Option<i64>,
}

/// One validation attempt recorded during discovery
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub kind: DeviceKind,
    pub ip: String,
    pub port: u16,
    pub response_time_ms: Option<u64>,
    pub success: bool,
    pub detail: Option<String>,
    pub recorded_at: i64,
}

/// Key-value-ish store for per-device connection details
pub trait ConnectionStore: Send + Sync {
    fn get_active(&self, kind: DeviceKind) -> Result<Option<StoredConnection>>;
    /// Record for one address, active or not
    fn get(&self, kind: DeviceKind, ip: &str, port: u16) -> Result<Option<StoredConnection>>;
    fn upsert(&self, kind: DeviceKind, info: &ConnectionInfo) -> Result<()>;
    fn record_failure(&self, kind: DeviceKind, ip: &str, port: u16) -> Result<()>;
    fn record_success(&self, kind: DeviceKind, ip: &str, port: u16) -> Result<()>;
    fn append_history(&self, entry: &HistoryEntry) -> Result<()>;
    /// Keep only the newest `max_entries` rows; returns how many were deleted
    fn prune_history(&self, kind: DeviceKind, max_entries: usize) -> Result<usize>;
    fn history(&self, kind: DeviceKind, limit: usize) -> Result<Vec<HistoryEntry>>;
    fn clear_token(&self, kind: DeviceKind) -> Result<()>;
}

/// Strip an optional `sqlite://` scheme from a database URL
pub fn resolve_db_path(url: &str) -> &str {
    url.strip_prefix("sqlite://").unwrap_or(url)
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(url: &str) -> Result<Self> {
        let path = resolve_db_path(url);
        let conn = Connection::open(path).inspect_err(|e| {
            tracing::error!("Failed to open database at '{}': {}", path, e);
        })?;

        // Busy timeout first, it needs no locks
        let _ = conn.execute_batch("PRAGMA busy_timeout = 30000;");
        // May fail while another connection holds a transaction, which is fine
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");
        let _ = conn.execute_batch("PRAGMA synchronous = NORMAL;");

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::create_tables_if_not_exist(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn create_tables_if_not_exist(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS device_connections (
                id INTEGER PRIMARY KEY,
                device_kind TEXT NOT NULL,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                auth_token TEXT,
                device_id TEXT,
                device_name TEXT,
                mac_address TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_connected INTEGER,
                last_discovered INTEGER,
                UNIQUE(device_kind, ip, port)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS discovery_history (
                id INTEGER PRIMARY KEY,
                device_kind TEXT NOT NULL,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                response_time_ms INTEGER,
                success INTEGER NOT NULL,
                detail TEXT,
                recorded_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_discovery_history_kind ON discovery_history (device_kind, recorded_at);",
            [],
        )?;
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }
}

const CONNECTION_COLUMNS: &str = "ip, port, auth_token, device_id, device_name, mac_address, \
     failure_count, last_connected, last_discovered";

fn stored_from_row(row: &rusqlite::Row<'_>) -> Result<StoredConnection> {
    Ok(StoredConnection {
        info: ConnectionInfo {
            ip: row.get(0)?,
            port: row.get(1)?,
            auth_token: row.get(2)?,
            device_id: row.get(3)?,
            device_name: row.get(4)?,
            mac_address: row.get(5)?,
        },
        failure_count: row.get(6)?,
        last_connected: row.get(7)?,
        last_discovered: row.get(8)?,
    })
}

fn kind_from_str(s: &str) -> DeviceKind {
    if s == DeviceKind::Tv.as_str() {
        DeviceKind::Tv
    } else {
        DeviceKind::Avr
    }
}

impl ConnectionStore for SqliteStore {
    fn get_active(&self, kind: DeviceKind) -> Result<Option<StoredConnection>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM device_connections
                     WHERE device_kind = ?1 AND is_active = 1
                     ORDER BY COALESCE(last_connected, 0) DESC, id DESC
                     LIMIT 1",
                    CONNECTION_COLUMNS
                ),
                [kind.as_str()],
                stored_from_row,
            )
            .optional()
        })
    }

    fn get(&self, kind: DeviceKind, ip: &str, port: u16) -> Result<Option<StoredConnection>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM device_connections
                     WHERE device_kind = ?1 AND ip = ?2 AND port = ?3",
                    CONNECTION_COLUMNS
                ),
                params![kind.as_str(), ip, port],
                stored_from_row,
            )
            .optional()
        })
    }

    fn upsert(&self, kind: DeviceKind, info: &ConnectionInfo) -> Result<()> {
        let now = Utc::now().timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE device_connections SET is_active = 0 WHERE device_kind = ?1 AND NOT (ip = ?2 AND port = ?3)",
                params![kind.as_str(), info.ip, info.port],
            )?;
            // Absent fields keep what an earlier pairing or scan recorded
            conn.execute(
                "INSERT INTO device_connections
                    (device_kind, ip, port, auth_token, device_id, device_name, mac_address, is_active, last_discovered)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
                 ON CONFLICT(device_kind, ip, port) DO UPDATE SET
                    auth_token = COALESCE(excluded.auth_token, auth_token),
                    device_id = COALESCE(excluded.device_id, device_id),
                    device_name = COALESCE(excluded.device_name, device_name),
                    mac_address = COALESCE(excluded.mac_address, mac_address),
                    is_active = 1,
                    last_discovered = excluded.last_discovered",
                params![
                    kind.as_str(),
                    info.ip,
                    info.port,
                    info.auth_token,
                    info.device_id,
                    info.device_name,
                    info.mac_address,
                    now
                ],
            )?;
            Ok(())
        })
    }

    fn record_failure(&self, kind: DeviceKind, ip: &str, port: u16) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE device_connections SET failure_count = failure_count + 1
                 WHERE device_kind = ?1 AND ip = ?2 AND port = ?3",
                params![kind.as_str(), ip, port],
            )?;
            Ok(())
        })
    }

    fn record_success(&self, kind: DeviceKind, ip: &str, port: u16) -> Result<()> {
        let now = Utc::now().timestamp();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE device_connections SET failure_count = 0, last_connected = ?4
                 WHERE device_kind = ?1 AND ip = ?2 AND port = ?3",
                params![kind.as_str(), ip, port, now],
            )?;
            Ok(())
        })
    }

    fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO discovery_history
                    (device_kind, ip, port, response_time_ms, success, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.kind.as_str(),
                    entry.ip,
                    entry.port,
                    entry.response_time_ms.map(|ms| ms as i64),
                    entry.success,
                    entry.detail,
                    entry.recorded_at
                ],
            )?;
            Ok(())
        })
    }

    fn prune_history(&self, kind: DeviceKind, max_entries: usize) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM discovery_history
                 WHERE device_kind = ?1 AND id NOT IN (
                    SELECT id FROM discovery_history
                    WHERE device_kind = ?1
                    ORDER BY recorded_at DESC, id DESC
                    LIMIT ?2
                 )",
                params![kind.as_str(), max_entries as i64],
            )
        })
    }

    fn history(&self, kind: DeviceKind, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_kind, ip, port, response_time_ms, success, detail, recorded_at
                 FROM discovery_history
                 WHERE device_kind = ?1
                 ORDER BY recorded_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![kind.as_str(), limit as i64], |row| {
                Ok(HistoryEntry {
                    kind: kind_from_str(&row.get::<_, String>(0)?),
                    ip: row.get(1)?,
                    port: row.get(2)?,
                    response_time_ms: row.get::<_, Option<i64>>(3)?.map(|ms| ms as u64),
                    success: row.get(4)?,
                    detail: row.get(5)?,
                    recorded_at: row.get(6)?,
                })
            })?;
            rows.collect()
        })
    }

    fn clear_token(&self, kind: DeviceKind) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE device_connections SET auth_token = NULL WHERE device_kind = ?1",
                [kind.as_str()],
            )?;
            Ok(())
        })
    }
}
