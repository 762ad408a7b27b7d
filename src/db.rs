//! Low-level SQLite connection helpers.
//!
//! # For AI Agents
//!
//! - **Always use `pool::global_pool()`**: don't call `db_connect` directly.
//! - **WAL mode enabled**: write-ahead logging for better concurrency.
//! - **Busy timeout**: configurable retry window for lock contention.

use crate::error::BridgeError;
use rusqlite::Connection;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_stream (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at TEXT NOT NULL,
    event TEXT NOT NULL
);
";

pub fn db_connect_pooled(db_path: &str, busy_timeout_secs: u32) -> Result<Connection, BridgeError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(busy_timeout_secs as u64))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}
