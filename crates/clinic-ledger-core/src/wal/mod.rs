//! Write-ahead logging for record mutations.
//!
//! Protocol:
//! 1. Describe the write as a [`PendingWrite`]
//! 2. In one write transaction: persist the entry, then apply the write
//! 3. After commit: delete the entry and broadcast the change
//!
//! If step 2 fails the transaction rolls back and nothing is visible. If the
//! process dies between 2 and 3, the surviving entry is replayed by
//! [`RecoveryManager`] on the next startup.

mod recovery;

pub use recovery::*;

use tracing::{debug, warn};

use crate::db::{Database, DbError, DbResult};
use crate::models::{LabTest, Patient, PendingWrite, StoreName, WriteOp};
use crate::notify::{ChangeEvent, ChangeNotifier};

/// Coordinates logged writes against one database.
pub struct WalCoordinator<'a> {
    db: &'a Database,
    notifier: Option<&'a ChangeNotifier>,
}

impl<'a> WalCoordinator<'a> {
    /// Create a coordinator with no cross-tab broadcast.
    pub fn new(db: &'a Database) -> Self {
        Self { db, notifier: None }
    }

    /// Broadcast committed patient changes through `notifier`.
    pub fn with_notifier(mut self, notifier: &'a ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Add a patient; `DuplicateKey` if the id or serial is taken.
    pub fn add_patient(&self, patient: &Patient) -> DbResult<PendingWrite> {
        self.commit_with(|db| {
            if db.record_exists(StoreName::Patients, &patient.id)? {
                return Err(DbError::DuplicateKey(format!("patient {}", patient.id)));
            }
            Ok(PendingWrite::upsert(StoreName::Patients, WriteOp::Add, patient)?)
        })
    }

    /// Replace an existing patient; `NotFound` if it does not exist.
    pub fn update_patient(&self, patient: &Patient) -> DbResult<PendingWrite> {
        self.commit_with(|db| {
            ensure_exists(db, StoreName::Patients, &patient.id)?;
            Ok(PendingWrite::upsert(StoreName::Patients, WriteOp::Update, patient)?)
        })
    }

    /// Delete a patient; `NotFound` if it does not exist.
    pub fn delete_patient(&self, id: &str) -> DbResult<PendingWrite> {
        self.commit_with(|db| {
            ensure_exists(db, StoreName::Patients, id)?;
            Ok(PendingWrite::delete(StoreName::Patients, id))
        })
    }

    /// Add a catalog test; `DuplicateKey` if the id is taken.
    pub fn add_test(&self, test: &LabTest) -> DbResult<PendingWrite> {
        self.commit_with(|db| {
            if db.record_exists(StoreName::Tests, &test.id)? {
                return Err(DbError::DuplicateKey(format!("test {}", test.id)));
            }
            Ok(PendingWrite::upsert(StoreName::Tests, WriteOp::Add, test)?)
        })
    }

    /// Replace an existing catalog test; `NotFound` if it does not exist.
    pub fn update_test(&self, test: &LabTest) -> DbResult<PendingWrite> {
        self.commit_with(|db| {
            ensure_exists(db, StoreName::Tests, &test.id)?;
            Ok(PendingWrite::upsert(StoreName::Tests, WriteOp::Update, test)?)
        })
    }

    /// Delete a catalog test; `NotFound` if it does not exist.
    pub fn delete_test(&self, id: &str) -> DbResult<PendingWrite> {
        self.commit_with(|db| {
            ensure_exists(db, StoreName::Tests, id)?;
            Ok(PendingWrite::delete(StoreName::Tests, id))
        })
    }

    /// Run the logged-write protocol for an entry built inside the transaction.
    ///
    /// `prepare` sees the database under the write lock, so reads it makes
    /// (existence checks, the next serial) cannot race another connection.
    pub fn commit_with<F>(&self, prepare: F) -> DbResult<PendingWrite>
    where
        F: FnOnce(&Database) -> DbResult<PendingWrite>,
    {
        let tx = self.db.write_txn()?;
        let entry = prepare(self.db)?;
        self.db.insert_pending_write(&entry)?;
        apply_entry(self.db, &entry, false)?;
        tx.commit()?;

        debug!(
            entry = %entry.id,
            store = %entry.store,
            op = entry.operation.as_str(),
            "committed logged write"
        );

        // The write is durable; an entry that fails to clear is retried on
        // the next commit and replayed harmlessly if the process dies first.
        if let Err(e) = self.db.clear_committed_write(&entry.id) {
            warn!(
                entry = %entry.id,
                queued = self.db.uncleared_writes(),
                error = %e,
                "failed to clear pending write"
            );
        }

        if let Some(notifier) = self.notifier {
            match change_event(&entry) {
                Ok(Some(event)) => {
                    notifier.publish(&event);
                }
                Ok(None) => {}
                Err(e) => warn!(entry = %entry.id, error = %e, "could not build change event"),
            }
        }

        Ok(entry)
    }
}

fn ensure_exists(db: &Database, store: StoreName, id: &str) -> DbResult<()> {
    if db.record_exists(store, id)? {
        Ok(())
    } else {
        Err(DbError::NotFound(format!("{} {}", store, id)))
    }
}

/// Apply a log entry to its target store.
///
/// With `replay` set, adds become upserts so that re-applying an entry whose
/// write already committed leaves the store unchanged.
pub(crate) fn apply_entry(db: &Database, entry: &PendingWrite, replay: bool) -> DbResult<()> {
    match (entry.store, entry.operation) {
        (StoreName::Patients, WriteOp::Add) if !replay => {
            db.insert_patient(&decode::<Patient>(entry)?)
        }
        (StoreName::Patients, WriteOp::Add | WriteOp::Update) => {
            db.put_patient(&decode::<Patient>(entry)?)
        }
        (StoreName::Tests, WriteOp::Add) if !replay => db.insert_test(&decode::<LabTest>(entry)?),
        (StoreName::Tests, WriteOp::Add | WriteOp::Update) => {
            db.put_test(&decode::<LabTest>(entry)?)
        }
        (store @ (StoreName::Patients | StoreName::Tests), WriteOp::Delete) => {
            let id = entry
                .target_id()
                .ok_or_else(|| DbError::Corrupt(format!("delete entry {} has no id", entry.id)))?;
            db.delete_record(store, id)?;
            Ok(())
        }
        (store, _) => Err(DbError::Corrupt(format!(
            "store '{}' is not write-ahead logged",
            store
        ))),
    }
}

fn decode<T: serde::de::DeserializeOwned>(entry: &PendingWrite) -> DbResult<T> {
    serde_json::from_value(entry.data.clone()).map_err(|e| {
        DbError::Corrupt(format!("entry {} payload: {}", entry.id, e))
    })
}

fn change_event(entry: &PendingWrite) -> DbResult<Option<ChangeEvent>> {
    if entry.store != StoreName::Patients {
        return Ok(None);
    }
    let event = match entry.operation {
        WriteOp::Add => ChangeEvent::PatientAdded(decode(entry)?),
        WriteOp::Update => ChangeEvent::PatientUpdated(decode(entry)?),
        WriteOp::Delete => ChangeEvent::PatientDeleted {
            id: entry.target_id().unwrap_or_default().to_string(),
        },
    };
    Ok(Some(event))
}
