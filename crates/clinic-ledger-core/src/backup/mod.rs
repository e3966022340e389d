//! Point-in-time backups, export and import.

mod export;
mod scheduler;

pub use export::*;
pub use scheduler::*;

use tracing::info;

use crate::db::{Database, DbError, DbResult};
use crate::models::{now_millis, Backup, LabTest, Patient};

/// Default number of backups retained.
pub const DEFAULT_RETENTION: usize = 30;

/// Creates, lists, prunes and restores backups of one database.
pub struct BackupManager<'a> {
    db: &'a Database,
    retention: usize,
}

impl<'a> BackupManager<'a> {
    /// Create a backup manager keeping at most `retention` backups.
    pub fn new(db: &'a Database, retention: usize) -> Self {
        Self { db, retention }
    }

    /// Snapshot all patients and tests. Returns the new backup's ID.
    ///
    /// Timestamps strictly increase even when two backups land in the same
    /// millisecond.
    pub fn create_backup(&self) -> DbResult<String> {
        let tx = self.db.write_txn()?;
        let patients = self.db.list_patients()?;
        let tests = self.db.list_tests()?;
        let timestamp = match self.db.latest_backup_timestamp()? {
            Some(latest) => now_millis().max(latest + 1),
            None => now_millis(),
        };

        let backup = Backup::new(timestamp, patients, tests);
        self.db.insert_backup(&backup)?;
        tx.commit()?;

        info!(
            backup = %backup.id,
            timestamp,
            patients = backup.patients.len(),
            tests = backup.tests.len(),
            "created backup"
        );
        Ok(backup.id)
    }

    /// Retained backups, newest first.
    pub fn list_backups(&self) -> DbResult<Vec<Backup>> {
        self.db.list_backups(self.retention)
    }

    /// Get a backup by ID.
    pub fn get_backup(&self, id: &str) -> DbResult<Option<Backup>> {
        self.db.get_backup(id)
    }

    /// Delete backups beyond the retention bound. Returns how many were removed.
    pub fn prune_backups(&self) -> DbResult<usize> {
        let removed = self.db.prune_backups(self.retention)?;
        if removed > 0 {
            info!(removed, retention = self.retention, "pruned backups");
        }
        Ok(removed)
    }

    /// Serialize every patient, test and backup.
    pub fn export_all(&self) -> DbResult<ExportDocument> {
        let data = ExportData {
            patients: self.db.list_patients()?,
            tests: self.db.list_tests()?,
            backups: self.db.list_backups(usize::MAX)?,
        };
        info!(
            patients = data.patients.len(),
            tests = data.tests.len(),
            backups = data.backups.len(),
            "exported ledger"
        );
        Ok(ExportDocument::new(data))
    }

    /// Upsert the patients and tests of an export document.
    ///
    /// The document is fully validated first and applied in one transaction,
    /// so an import either lands completely or not at all.
    pub fn import_all(&self, json: &str) -> DbResult<ImportSummary> {
        let doc = ExportDocument::from_json(json)?;
        let summary = self.upsert_all(&doc.data.patients, &doc.data.tests)?;
        info!(
            patients = summary.patients,
            tests = summary.tests,
            version = doc.version,
            "imported ledger"
        );
        Ok(summary)
    }

    /// Re-apply a backup's records with the same additive policy as import.
    pub fn restore_backup(&self, id: &str) -> DbResult<ImportSummary> {
        let backup = self
            .db
            .get_backup(id)?
            .ok_or_else(|| DbError::NotFound(format!("backup {}", id)))?;
        let summary = self.upsert_all(&backup.patients, &backup.tests)?;
        info!(backup = %id, patients = summary.patients, tests = summary.tests, "restored backup");
        Ok(summary)
    }

    fn upsert_all(&self, patients: &[Patient], tests: &[LabTest]) -> DbResult<ImportSummary> {
        let tx = self.db.write_txn()?;
        for test in tests {
            self.db.put_test(test)?;
        }
        for patient in patients {
            self.db.put_patient(patient)?;
        }
        tx.commit()?;

        Ok(ImportSummary {
            patients: patients.len(),
            tests: tests.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingDraft, StoreName};

    fn seed(db: &Database, serial: u64) -> Patient {
        let test = LabTest::new(format!("Test {}", serial), 100 * serial);
        db.put_test(&test).unwrap();
        let patient = Patient::from_draft(
            BillingDraft::new(format!("P{}", serial), "017".into()).with_test(&test),
            serial,
        )
        .unwrap();
        db.insert_patient(&patient).unwrap();
        patient
    }

    #[test]
    fn test_create_and_get_backup() {
        let db = Database::open_in_memory().unwrap();
        let patient = seed(&db, 1001);
        let manager = BackupManager::new(&db, DEFAULT_RETENTION);

        let id = manager.create_backup().unwrap();
        let backup = manager.get_backup(&id).unwrap().unwrap();

        assert_eq!(backup.patients, vec![patient]);
        assert_eq!(backup.tests.len(), 1);
    }

    #[test]
    fn test_sequential_backups_distinct_and_increasing() {
        let db = Database::open_in_memory().unwrap();
        let manager = BackupManager::new(&db, DEFAULT_RETENTION);

        let first = manager.create_backup().unwrap();
        let second = manager.create_backup().unwrap();
        assert_ne!(first, second);

        let listed = manager.list_backups().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second);
        assert_eq!(listed[1].id, first);
        assert!(listed[0].timestamp > listed[1].timestamp);
    }

    #[test]
    fn test_retention_keeps_newest() {
        let db = Database::open_in_memory().unwrap();
        let manager = BackupManager::new(&db, DEFAULT_RETENTION);

        let ids: Vec<String> = (0..35).map(|_| manager.create_backup().unwrap()).collect();
        assert_eq!(manager.prune_backups().unwrap(), 5);

        let kept: Vec<String> = manager.list_backups().unwrap().into_iter().map(|b| b.id).collect();
        let expected: Vec<String> = ids.iter().rev().take(30).cloned().collect();
        assert_eq!(kept, expected);
        assert_eq!(db.count_records(crate::models::StoreName::Backups).unwrap(), 30);
    }

    #[test]
    fn test_list_truncates_before_prune() {
        let db = Database::open_in_memory().unwrap();
        let manager = BackupManager::new(&db, 3);
        for _ in 0..5 {
            manager.create_backup().unwrap();
        }
        assert_eq!(manager.list_backups().unwrap().len(), 3);
        assert_eq!(db.count_records(crate::models::StoreName::Backups).unwrap(), 5);
    }

    #[test]
    fn test_export_import_round_trip() {
        let source = Database::open_in_memory().unwrap();
        seed(&source, 1001);
        seed(&source, 1002);
        let json = BackupManager::new(&source, DEFAULT_RETENTION)
            .export_all()
            .unwrap()
            .to_json()
            .unwrap();

        let target = Database::open_in_memory().unwrap();
        let summary = BackupManager::new(&target, DEFAULT_RETENTION)
            .import_all(&json)
            .unwrap();

        assert_eq!(summary, ImportSummary { patients: 2, tests: 2 });
        assert_eq!(target.list_patients().unwrap(), source.list_patients().unwrap());
        assert_eq!(target.list_tests().unwrap(), source.list_tests().unwrap());
    }

    #[test]
    fn test_import_is_additive_and_rerunnable() {
        let db = Database::open_in_memory().unwrap();
        let local_only = seed(&db, 1001);

        let other = Database::open_in_memory().unwrap();
        seed(&other, 2001);
        let json = BackupManager::new(&other, DEFAULT_RETENTION)
            .export_all()
            .unwrap()
            .to_json()
            .unwrap();

        let manager = BackupManager::new(&db, DEFAULT_RETENTION);
        manager.import_all(&json).unwrap();
        manager.import_all(&json).unwrap();

        let patients = db.list_patients().unwrap();
        assert_eq!(patients.len(), 2);
        assert!(patients.contains(&local_only));
    }

    #[test]
    fn test_failed_import_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let manager = BackupManager::new(&db, DEFAULT_RETENTION);

        let json = r#"{"version": 1, "exportDate": "x", "data": {"patients": [{"id": "p"}]}}"#;
        assert!(matches!(manager.import_all(json), Err(DbError::ImportFormat(_))));
        assert!(db.list_patients().unwrap().is_empty());
    }

    #[test]
    fn test_restore_backup() {
        let db = Database::open_in_memory().unwrap();
        let patient = seed(&db, 1001);
        let manager = BackupManager::new(&db, DEFAULT_RETENTION);
        let id = manager.create_backup().unwrap();

        db.delete_record(StoreName::Patients, &patient.id).unwrap();
        let summary = manager.restore_backup(&id).unwrap();

        assert_eq!(summary.patients, 1);
        assert_eq!(db.get_patient(&patient.id).unwrap(), Some(patient));
        assert!(matches!(
            manager.restore_backup("missing"),
            Err(DbError::NotFound(_))
        ));
    }
}
