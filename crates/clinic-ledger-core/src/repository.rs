//! Record repository: the collaborator-facing API of one tab.
//!
//! A [`Repository`] owns one connection to the clinic database. Every
//! mutation of patients or tests goes through the write-ahead log, and
//! committed patient changes are broadcast to the other tabs sharing the
//! [`ChangeHub`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use crossbeam_channel::Receiver;
use tracing::info;

use crate::backup::{AutoBackup, BackupManager, ImportSummary};
use crate::config::StoreConfig;
use crate::db::{Database, DbError, DbResult};
use crate::models::{
    default_tests, Backup, BillingDraft, LabTest, Patient, PendingWrite, RecordViolation,
    StoreName, WriteOp,
};
use crate::notify::{ChangeEvent, ChangeHub, ChangeNotifier};
use crate::receipt::{compute_receipt_hash, verify_receipt};
use crate::report::{search_patients, RevenueSummary};
use crate::wal::{RecoveryManager, RecoveryReport, WalCoordinator};

/// One open handle on a clinic database.
pub struct Repository {
    db: Arc<Mutex<Database>>,
    notifier: ChangeNotifier,
    config: StoreConfig,
    auto_backup: Mutex<Option<AutoBackup>>,
    last_recovery: RecoveryReport,
}

impl Repository {
    /// Open the database at `config.database_path` as a new tab of `hub`.
    ///
    /// Pending writes left by an interrupted session are replayed before
    /// this returns.
    pub fn open(config: StoreConfig, hub: &ChangeHub) -> DbResult<Self> {
        let db = Database::open(&config.database_path)?;
        Self::with_database(db, config, hub)
    }

    /// Open a private in-memory database (for tests).
    pub fn open_in_memory(config: StoreConfig, hub: &ChangeHub) -> DbResult<Self> {
        let db = Database::open_in_memory()?;
        Self::with_database(db, config, hub)
    }

    fn with_database(db: Database, config: StoreConfig, hub: &ChangeHub) -> DbResult<Self> {
        db.set_busy_timeout(config.busy_timeout())?;
        let last_recovery = RecoveryManager::new(&db).recover()?;
        let notifier = hub.open_tab();

        info!(
            tab = notifier.tab_id(),
            replayed = last_recovery.replayed.len(),
            failed = last_recovery.failed.len(),
            "repository ready"
        );

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            notifier,
            config,
            auto_backup: Mutex::new(None),
            last_recovery,
        })
    }

    fn db(&self) -> DbResult<MutexGuard<'_, Database>> {
        Ok(self.db.lock()?)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Identifier of this tab on the hub.
    pub fn tab_id(&self) -> &str {
        self.notifier.tab_id()
    }

    /// Outcome of the recovery pass run when this repository was opened.
    pub fn last_recovery(&self) -> &RecoveryReport {
        &self.last_recovery
    }

    // =========================================================================
    // Patient Operations
    // =========================================================================

    /// All patients by serial ascending.
    pub fn get_patients(&self) -> DbResult<Vec<Patient>> {
        self.db()?.list_patients()
    }

    pub fn get_patient(&self, id: &str) -> DbResult<Option<Patient>> {
        self.db()?.get_patient(id)
    }

    /// Serial the next created patient would receive.
    pub fn get_next_serial(&self) -> DbResult<u64> {
        self.db()?.next_serial(self.config.first_serial)
    }

    /// Bill a new patient, allocating the serial in the same transaction as
    /// the insert. Returns the stored record.
    pub fn create_patient(&self, draft: BillingDraft) -> DbResult<Patient> {
        let first_serial = self.config.first_serial;
        let db = self.db()?;
        let entry = self.wal(&db).commit_with(move |db| {
            let serial = db.next_serial(first_serial)?;
            let patient = seal(Patient::from_draft(draft, serial)?)?;
            Ok(PendingWrite::upsert(StoreName::Patients, WriteOp::Add, &patient)?)
        })?;
        stored_record(entry)
    }

    /// Add a fully formed patient (serial chosen by the caller).
    ///
    /// Assigns a receipt ID if absent and stamps the receipt hash. A serial
    /// that is already taken is `DuplicateKey`.
    pub fn add_patient(&self, patient: &Patient) -> DbResult<Patient> {
        let patient = seal(patient.clone())?;
        let db = self.db()?;
        self.wal(&db).add_patient(&patient)?;
        Ok(patient)
    }

    /// Replace a patient's editable fields. Serial and creation date are fixed.
    pub fn update_patient(&self, patient: &Patient) -> DbResult<Patient> {
        let db = self.db()?;
        let entry = self.wal(&db).commit_with(|db| {
            let stored = db
                .get_patient(&patient.id)?
                .ok_or_else(|| DbError::NotFound(format!("patient {}", patient.id)))?;
            if stored.serial != patient.serial {
                return Err(RecordViolation::SerialChanged {
                    stored: stored.serial,
                    requested: patient.serial,
                }
                .into());
            }
            if stored.date != patient.date {
                return Err(RecordViolation::DateChanged.into());
            }

            let mut next = patient.clone();
            if next.receipt_id.is_none() {
                next.receipt_id = stored.receipt_id;
            }
            let next = seal(next)?;
            Ok(PendingWrite::upsert(StoreName::Patients, WriteOp::Update, &next)?)
        })?;
        stored_record(entry)
    }

    /// Delete a patient; `NotFound` if absent. The serial is not reused.
    pub fn delete_patient(&self, id: &str) -> DbResult<()> {
        let db = self.db()?;
        self.wal(&db).delete_patient(id)?;
        Ok(())
    }

    /// Check a patient's stored receipt hash. `id` may be the record ID or
    /// the receipt ID.
    pub fn verify_receipt(&self, id: &str) -> DbResult<bool> {
        let db = self.db()?;
        let patient = match db.get_patient(id)? {
            Some(patient) => patient,
            None => db
                .get_patient_by_receipt_id(id)?
                .ok_or_else(|| DbError::NotFound(format!("receipt {}", id)))?,
        };
        Ok(verify_receipt(&patient)?)
    }

    /// History search by name, phone or serial, newest first.
    pub fn search_patients(&self, term: &str) -> DbResult<Vec<Patient>> {
        let patients = self.get_patients()?;
        Ok(search_patients(&patients, term))
    }

    /// Today / month / year figures as of now.
    pub fn revenue_summary(&self) -> DbResult<RevenueSummary> {
        let patients = self.get_patients()?;
        Ok(RevenueSummary::compute(&patients, Utc::now()))
    }

    // =========================================================================
    // Test Catalog Operations
    // =========================================================================

    /// Catalog tests by name.
    pub fn get_tests(&self) -> DbResult<Vec<LabTest>> {
        self.db()?.list_tests()
    }

    /// Catalog tests whose name or category contains `term`.
    pub fn search_tests(&self, term: &str) -> DbResult<Vec<LabTest>> {
        let tests = self.get_tests()?;
        Ok(tests.into_iter().filter(|t| t.matches(term)).collect())
    }

    pub fn add_test(&self, test: &LabTest) -> DbResult<()> {
        let db = self.db()?;
        self.wal(&db).add_test(test)?;
        Ok(())
    }

    /// Change a catalog test. Historical receipts keep the old price.
    pub fn update_test(&self, test: &LabTest) -> DbResult<()> {
        let db = self.db()?;
        self.wal(&db).update_test(test)?;
        Ok(())
    }

    pub fn delete_test(&self, id: &str) -> DbResult<()> {
        let db = self.db()?;
        self.wal(&db).delete_test(id)?;
        Ok(())
    }

    /// Seed the default catalog into an empty tests store. Returns the number
    /// of tests inserted (zero when the catalog already has entries).
    pub fn init_default_tests(&self) -> DbResult<usize> {
        let db = self.db()?;
        let tx = db.write_txn()?;
        if db.count_records(StoreName::Tests)? > 0 {
            return Ok(0);
        }

        let tests = default_tests();
        for test in &tests {
            db.insert_test(test)?;
        }
        tx.commit()?;

        info!(count = tests.len(), "seeded default tests");
        Ok(tests.len())
    }

    // =========================================================================
    // Backup Operations
    // =========================================================================

    pub fn create_backup(&self) -> DbResult<String> {
        let db = self.db()?;
        self.backups(&db).create_backup()
    }

    /// Retained backups, newest first.
    pub fn list_backups(&self) -> DbResult<Vec<Backup>> {
        let db = self.db()?;
        self.backups(&db).list_backups()
    }

    pub fn get_backup(&self, id: &str) -> DbResult<Option<Backup>> {
        let db = self.db()?;
        self.backups(&db).get_backup(id)
    }

    pub fn prune_backups(&self) -> DbResult<usize> {
        let db = self.db()?;
        self.backups(&db).prune_backups()
    }

    /// Everything in the ledger as a pretty-printed export document.
    pub fn export_all(&self) -> DbResult<String> {
        let db = self.db()?;
        let doc = self.backups(&db).export_all()?;
        Ok(doc.to_json()?)
    }

    /// Additively merge an export document. All-or-nothing.
    pub fn import_all(&self, json: &str) -> DbResult<ImportSummary> {
        let db = self.db()?;
        self.backups(&db).import_all(json)
    }

    pub fn restore_backup(&self, id: &str) -> DbResult<ImportSummary> {
        let db = self.db()?;
        self.backups(&db).restore_backup(id)
    }

    /// Start periodic backups. Returns the ID of the immediate backup, or
    /// `None` if the scheduler was already running.
    pub fn start_auto_backup(&self) -> DbResult<Option<String>> {
        let mut slot = self
            .auto_backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(None);
        }

        let (timer, first) = AutoBackup::start(
            self.db.clone(),
            self.config.auto_backup_interval(),
            self.config.backup_retention,
        )?;
        *slot = Some(timer);
        Ok(Some(first))
    }

    /// Stop periodic backups. Returns false if none were running.
    pub fn stop_auto_backup(&self) -> bool {
        let timer = self
            .auto_backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match timer {
            Some(timer) => {
                timer.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_auto_backup_running(&self) -> bool {
        self.auto_backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replay pending writes now. Normally done once at open.
    pub fn recover_pending_writes(&self) -> DbResult<RecoveryReport> {
        let db = self.db()?;
        RecoveryManager::new(&db).recover()
    }

    // =========================================================================
    // Cross-Tab Events
    // =========================================================================

    /// Receive patient changes committed by other tabs.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }

    fn wal<'a>(&'a self, db: &'a Database) -> WalCoordinator<'a> {
        WalCoordinator::new(db).with_notifier(&self.notifier)
    }

    fn backups<'a>(&self, db: &'a Database) -> BackupManager<'a> {
        BackupManager::new(db, self.config.backup_retention)
    }
}

/// Validate a patient and stamp its receipt identity.
fn seal(mut patient: Patient) -> DbResult<Patient> {
    patient.validate()?;
    if patient.receipt_id.is_none() {
        patient.receipt_id = Some(uuid::Uuid::new_v4().to_string());
    }
    patient.receipt_hash = Some(compute_receipt_hash(&patient)?);
    Ok(patient)
}

fn stored_record(entry: PendingWrite) -> DbResult<Patient> {
    Ok(serde_json::from_value(entry.data)?)
}
