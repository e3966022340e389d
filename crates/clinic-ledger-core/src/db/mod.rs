//! Storage engine for the clinic ledger.
//!
//! Each named store is a table keyed by `id` whose `data` column holds the
//! record as JSON; indexed fields are mirrored into their own columns.

mod schema;
mod backups;
mod catalog;
mod patients;
mod pending;

pub use schema::*;
#[allow(unused_imports)]
pub use backups::*;
#[allow(unused_imports)]
pub use catalog::*;
#[allow(unused_imports)]
pub use patients::*;
pub use pending::*;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::PoisonError;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::info;

use crate::models::{RecordViolation, StoreName};

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Import format error: {0}")]
    ImportFormat(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] RecordViolation),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        let rusqlite::Error::SqliteFailure(failure, _) = &e else {
            return DbError::Sqlite(e);
        };
        match failure.code {
            ErrorCode::ConstraintViolation
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                DbError::DuplicateKey(e.to_string())
            }
            ErrorCode::DiskFull
            | ErrorCode::ReadOnly
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::OperationAborted => DbError::WriteFailed(e.to_string()),
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::PermissionDenied
            | ErrorCode::DatabaseCorrupt => DbError::StorageUnavailable(e.to_string()),
            _ => DbError::Sqlite(e),
        }
    }
}

impl<T> From<PoisonError<T>> for DbError {
    fn from(e: PoisonError<T>) -> Self {
        DbError::StorageUnavailable(format!("Lock poisoned: {}", e))
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection wrapper.
pub struct Database {
    conn: Connection,
    /// Committed log entries this connection still has to clear, oldest first
    uncleared: RefCell<VecDeque<String>>,
}

impl Database {
    /// Open database at path, creating or upgrading it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            DbError::StorageUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let db = Self::with_connection(conn);
        db.initialize()?;
        info!(path = %path.display(), "opened ledger database");
        Ok(db)
    }

    /// Create in-memory database (for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DbError::StorageUnavailable(e.to_string()))?;
        let db = Self::with_connection(conn);
        db.initialize()?;
        Ok(db)
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn,
            uncleared: RefCell::new(VecDeque::new()),
        }
    }

    /// Bring the schema up to date.
    fn initialize(&self) -> DbResult<()> {
        migrate(&self.conn).map_err(|e| match e {
            DbError::StorageUnavailable(_) => e,
            other => DbError::StorageUnavailable(format!("schema upgrade failed: {}", other)),
        })?;
        Ok(())
    }

    /// How long to wait on a lock held by another connection before failing.
    pub fn set_busy_timeout(&self, timeout: Duration) -> DbResult<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Get raw connection (for advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a write transaction.
    ///
    /// The write lock is taken up front, so reads made inside the transaction
    /// cannot be invalidated by another connection before commit. Every
    /// `Database` call made while the transaction is open joins it.
    pub fn write_txn(&self) -> DbResult<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Current schema version.
    pub fn schema_version(&self) -> DbResult<u32> {
        schema_version(&self.conn)
    }

    /// Whether a record with this key exists in the store.
    pub fn record_exists(&self, store: StoreName, id: &str) -> DbResult<bool> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)", store.as_str());
        let exists: bool = self.conn.query_row(&sql, [id], |row| row.get(0))?;
        Ok(exists)
    }

    /// Delete a record by key. Deleting a missing key is a no-op returning `false`.
    pub fn delete_record(&self, store: StoreName, id: &str) -> DbResult<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?", store.as_str());
        let rows_affected = self.conn.execute(&sql, [id])?;
        Ok(rows_affected > 0)
    }

    /// Number of records in the store.
    pub fn count_records(&self, store: StoreName) -> DbResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", store.as_str());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn test_schema_initialized() {
        let db = Database::open_in_memory().unwrap();

        // Check that tables exist
        let tables: Vec<String> = db
            .conn()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for store in ["patients", "tests", "backups", "pending_writes", "meta"] {
            assert!(tables.contains(&store.to_string()), "missing {}", store);
        }
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_open_file_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_open_unreadable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file
        let result = Database::open(dir.path());
        assert!(matches!(result, Err(DbError::StorageUnavailable(_))));
    }

    #[test]
    fn test_duplicate_primary_key_is_classified() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute("INSERT INTO tests (id, name, data) VALUES ('t1', 'a', '{}')", [])
            .unwrap();

        let err: DbError = db
            .conn()
            .execute("INSERT INTO tests (id, name, data) VALUES ('t1', 'b', '{}')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, DbError::DuplicateKey(_)));
    }

    #[test]
    fn test_generic_record_primitives() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute("INSERT INTO tests (id, name, data) VALUES ('t1', 'a', '{}')", [])
            .unwrap();

        assert!(db.record_exists(StoreName::Tests, "t1").unwrap());
        assert_eq!(db.count_records(StoreName::Tests).unwrap(), 1);
        assert!(db.delete_record(StoreName::Tests, "t1").unwrap());
        assert!(!db.delete_record(StoreName::Tests, "t1").unwrap());
        assert!(!db.record_exists(StoreName::Tests, "t1").unwrap());
    }

    #[test]
    fn test_write_txn_rolls_back_on_drop() {
        let db = Database::open_in_memory().unwrap();
        {
            let _tx = db.write_txn().unwrap();
            db.conn()
                .execute("INSERT INTO tests (id, name, data) VALUES ('t1', 'a', '{}')", [])
                .unwrap();
        }
        assert_eq!(db.count_records(StoreName::Tests).unwrap(), 0);
    }
}
