//! Startup replay of interrupted writes.

use tracing::{error, info};

use crate::db::{Database, DbResult, PendingWriteRow};
use crate::models::PendingWrite;

use super::apply_entry;

/// A log entry that could not be replayed and was left in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedReplay {
    pub entry_id: String,
    pub reason: String,
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries applied and removed, in replay order
    pub replayed: Vec<String>,
    /// Entries kept for manual inspection
    pub failed: Vec<FailedReplay>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Replays surviving pending writes.
pub struct RecoveryManager<'a> {
    db: &'a Database,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Replay every pending write, oldest first, and clear the ones applied.
    ///
    /// The log is read under the write lock, so an entry another connection
    /// has already replayed and cleared is never applied again. All replays
    /// share one transaction; each entry runs in its own savepoint so an
    /// entry that fails is rolled back alone and stays in the log. Safe to
    /// run when nothing is pending.
    pub fn recover(&self) -> DbResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut tx = self.db.write_txn()?;
        let rows = self.db.list_pending_writes()?;
        if rows.is_empty() {
            return Ok(report);
        }

        for row in rows {
            let entry_id = row.id.clone();
            let savepoint = tx.savepoint()?;
            match self.replay(row) {
                Ok(true) => {
                    savepoint.commit()?;
                    report.replayed.push(entry_id);
                }
                Ok(false) => {
                    savepoint.commit()?;
                }
                Err(e) => {
                    // Dropping the savepoint rolls this entry back
                    drop(savepoint);
                    error!(entry = %entry_id, error = %e, "pending write could not be replayed");
                    report.failed.push(FailedReplay {
                        entry_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        tx.commit()?;

        info!(
            replayed = report.replayed.len(),
            failed = report.failed.len(),
            "recovered pending writes"
        );
        Ok(report)
    }

    /// Apply one entry and clear it. Returns `false` without applying when
    /// the entry is no longer in the log.
    fn replay(&self, row: PendingWriteRow) -> DbResult<bool> {
        let entry: PendingWrite = row.try_into()?;
        if !self.db.delete_pending_write(&entry.id)? {
            return Ok(false);
        }
        apply_entry(self.db, &entry, true)?;
        Ok(true)
    }
}
