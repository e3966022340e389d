//! Pending-write (write-ahead log) store operations.

use rusqlite::params;

use super::{Database, DbError, DbResult};
use crate::models::PendingWrite;

/// A raw log row, decoded per entry so one corrupt entry cannot hide the rest.
#[derive(Debug, Clone)]
pub struct PendingWriteRow {
    pub id: String,
    pub store: String,
    pub operation: String,
    pub data: String,
    pub timestamp: i64,
}

impl TryFrom<PendingWriteRow> for PendingWrite {
    type Error = DbError;

    fn try_from(row: PendingWriteRow) -> Result<Self, Self::Error> {
        Ok(PendingWrite {
            store: row.store.parse().map_err(DbError::Corrupt)?,
            operation: row.operation.parse().map_err(DbError::Corrupt)?,
            data: serde_json::from_str(&row.data)
                .map_err(|e| DbError::Corrupt(format!("entry {} payload: {}", row.id, e)))?,
            id: row.id,
            timestamp: row.timestamp,
        })
    }
}

impl Database {
    /// Persist a log entry.
    pub fn insert_pending_write(&self, entry: &PendingWrite) -> DbResult<()> {
        let data = serde_json::to_string(&entry.data)?;
        self.conn.execute(
            r#"
            INSERT INTO pending_writes (id, store, operation, data, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.id,
                entry.store.as_str(),
                entry.operation.as_str(),
                data,
                entry.timestamp,
            ],
        )?;
        Ok(())
    }

    /// All log entries, oldest first (insertion order breaks timestamp ties).
    pub fn list_pending_writes(&self) -> DbResult<Vec<PendingWriteRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, store, operation, data, timestamp
            FROM pending_writes
            ORDER BY timestamp, rowid
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(PendingWriteRow {
                id: row.get(0)?,
                store: row.get(1)?,
                operation: row.get(2)?,
                data: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Remove a log entry.
    pub fn delete_pending_write(&self, id: &str) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM pending_writes WHERE id = ?", [id])?;
        Ok(rows_affected > 0)
    }

    /// Clear a committed log entry along with any left over from an earlier
    /// failed cleanup on this connection.
    ///
    /// Entries are cleared oldest first and the first failure stops the pass,
    /// so an entry is never cleared while an older one is still logged. The
    /// rest are retried on the next call.
    pub fn clear_committed_write(&self, id: &str) -> DbResult<()> {
        let mut queue = self.uncleared.borrow_mut();
        queue.push_back(id.to_string());
        while let Some(next) = queue.front() {
            self.delete_pending_write(next)?;
            queue.pop_front();
        }
        Ok(())
    }

    /// Number of committed entries waiting for a cleanup retry.
    pub fn uncleared_writes(&self) -> usize {
        self.uncleared.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StoreName, WriteOp};

    #[test]
    fn test_insert_and_decode() {
        let db = Database::open_in_memory().unwrap();
        let entry = PendingWrite::delete(StoreName::Patients, "p-1");
        db.insert_pending_write(&entry).unwrap();

        let rows = db.list_pending_writes().unwrap();
        assert_eq!(rows.len(), 1);

        let decoded: PendingWrite = rows[0].clone().try_into().unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.operation, WriteOp::Delete);
    }

    #[test]
    fn test_ordered_by_timestamp() {
        let db = Database::open_in_memory().unwrap();
        let mut late = PendingWrite::delete(StoreName::Patients, "late");
        late.timestamp = 200;
        let mut early = PendingWrite::delete(StoreName::Patients, "early");
        early.timestamp = 100;

        db.insert_pending_write(&late).unwrap();
        db.insert_pending_write(&early).unwrap();

        let ids: Vec<String> = db
            .list_pending_writes()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[test]
    fn test_failed_cleanup_retried_in_order() {
        let db = Database::open_in_memory().unwrap();
        let older = PendingWrite::delete(StoreName::Patients, "p-1");
        let newer = PendingWrite::delete(StoreName::Patients, "p-2");
        db.insert_pending_write(&older).unwrap();
        db.insert_pending_write(&newer).unwrap();

        // Cleanup fails while the database refuses writes
        db.conn().pragma_update(None, "query_only", true).unwrap();
        assert!(db.clear_committed_write(&older.id).is_err());
        assert!(db.clear_committed_write(&newer.id).is_err());
        assert_eq!(db.uncleared_writes(), 2);
        assert_eq!(db.list_pending_writes().unwrap().len(), 2);

        db.conn().pragma_update(None, "query_only", false).unwrap();
        let next = PendingWrite::delete(StoreName::Patients, "p-3");
        db.insert_pending_write(&next).unwrap();
        db.clear_committed_write(&next.id).unwrap();

        assert_eq!(db.uncleared_writes(), 0);
        assert!(db.list_pending_writes().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_store_is_corrupt() {
        let row = PendingWriteRow {
            id: "x".into(),
            store: "invoices".into(),
            operation: "add".into(),
            data: "{}".into(),
            timestamp: 0,
        };
        let result: DbResult<PendingWrite> = row.try_into();
        assert!(matches!(result, Err(DbError::Corrupt(_))));
    }
}
