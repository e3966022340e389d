//! SQLite schema definition and upgrades.
//!
//! Upgrades are append-only: each migration may create tables, columns and
//! indexes, but never drops or truncates anything that already exists.

use rusqlite::Connection;
use tracing::info;

use super::{DbError, DbResult};

/// v1: the original patient and test stores.
const V1_BASE_STORES: &str = r#"
CREATE TABLE IF NOT EXISTS patients (
    id TEXT PRIMARY KEY,
    serial INTEGER NOT NULL,
    date TEXT NOT NULL,
    data TEXT NOT NULL                           -- JSON Patient
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_patients_serial ON patients(serial);
CREATE INDEX IF NOT EXISTS idx_patients_date ON patients(date);

CREATE TABLE IF NOT EXISTS tests (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    data TEXT NOT NULL                           -- JSON LabTest
);

CREATE INDEX IF NOT EXISTS idx_tests_name ON tests(name);
"#;

/// v2: durability stores.
const V2_DURABILITY_STORES: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,                  -- ms since epoch
    data TEXT NOT NULL                           -- JSON Backup
);

CREATE INDEX IF NOT EXISTS idx_backups_timestamp ON backups(timestamp);

CREATE TABLE IF NOT EXISTS pending_writes (
    id TEXT PRIMARY KEY,
    store TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('add', 'update', 'delete')),
    data TEXT NOT NULL,                          -- JSON payload to replay
    timestamp INTEGER NOT NULL                   -- ms since epoch
);

CREATE INDEX IF NOT EXISTS idx_pending_writes_timestamp ON pending_writes(timestamp);
"#;

/// v3: receipt lookup and the serial high-water mark.
const V3_RECEIPTS: &str = r#"
ALTER TABLE patients ADD COLUMN receipt_id TEXT;
UPDATE patients SET receipt_id = json_extract(data, '$.receiptId');
CREATE INDEX IF NOT EXISTS idx_patients_receipt_id ON patients(receipt_id);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

-- Serials are never reused, even after the newest patient is deleted
INSERT OR IGNORE INTO meta (key, value)
SELECT 'serial_high_water', COALESCE(MAX(serial), 0) FROM patients;
"#;

/// Ordered migrations; entry `i` upgrades the schema to version `i + 1`.
pub const MIGRATIONS: &[&str] = &[V1_BASE_STORES, V2_DURABILITY_STORES, V3_RECEIPTS];

/// Schema version this build writes.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Read `PRAGMA user_version`.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Apply every migration newer than the database's version.
///
/// Returns the version the database was at before upgrading.
pub fn migrate(conn: &Connection) -> DbResult<u32> {
    migrate_to(conn, SCHEMA_VERSION)
}

/// Apply migrations up to `target` (inclusive).
pub fn migrate_to(conn: &Connection, target: u32) -> DbResult<u32> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(DbError::StorageUnavailable(format!(
            "database schema v{} is newer than supported v{}",
            current, SCHEMA_VERSION
        )));
    }

    for (index, sql) in MIGRATIONS
        .iter()
        .enumerate()
        .take(target as usize)
        .skip(current as usize)
    {
        let version = index as u32 + 1;
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!(version, "applied schema migration");
    }

    Ok(current)
}
