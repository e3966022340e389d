//! Backup store operations.

use rusqlite::{params, OptionalExtension};

use super::{Database, DbResult};
use crate::models::Backup;

impl Database {
    /// Insert a backup snapshot.
    pub fn insert_backup(&self, backup: &Backup) -> DbResult<()> {
        let data = serde_json::to_string(backup)?;
        self.conn.execute(
            "INSERT INTO backups (id, timestamp, data) VALUES (?1, ?2, ?3)",
            params![backup.id, backup.timestamp, data],
        )?;
        Ok(())
    }

    /// Get a backup by ID.
    pub fn get_backup(&self, id: &str) -> DbResult<Option<Backup>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM backups WHERE id = ?", [id], |row| {
                row.get(0)
            })
            .optional()?;
        data.map(|d| serde_json::from_str(&d)).transpose().map_err(Into::into)
    }

    /// Newest backups first, at most `limit` of them.
    pub fn list_backups(&self, limit: usize) -> DbResult<Vec<Backup>> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM backups ORDER BY timestamp DESC, id DESC LIMIT ?",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], |row| row.get::<_, String>(0))?;

        let mut backups = Vec::new();
        for data in rows {
            backups.push(serde_json::from_str(&data?)?);
        }
        Ok(backups)
    }

    /// Timestamp of the newest backup.
    pub fn latest_backup_timestamp(&self) -> DbResult<Option<i64>> {
        let ts: Option<i64> =
            self.conn
                .query_row("SELECT MAX(timestamp) FROM backups", [], |row| row.get(0))?;
        Ok(ts)
    }

    /// Delete every backup except the newest `keep`. Returns how many were removed.
    ///
    /// Runs as one statement, so a backup created concurrently is either
    /// counted among the newest or not yet visible; the retained set never
    /// shrinks below `keep`.
    pub fn prune_backups(&self, keep: usize) -> DbResult<usize> {
        let removed = self.conn.execute(
            r#"
            DELETE FROM backups WHERE id NOT IN (
                SELECT id FROM backups ORDER BY timestamp DESC, id DESC LIMIT ?
            )
            "#,
            [i64::try_from(keep).unwrap_or(i64::MAX)],
        )?;
        Ok(removed)
    }
}
