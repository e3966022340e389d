//! Clinic Ledger Core Library
//!
//! Local-first persistence for clinic patient billing: durable records,
//! write-ahead logging, crash recovery, backups and cross-tab notification.
//!
//! # Architecture
//!
//! ```text
//! Front desk UI (tab)
//!        │
//!        ▼
//!   Repository ──────────────────────────────┐
//!        │                                    │
//!        ▼                                    ▼
//!   WAL Coordinator                     Backup Manager
//!   ┌──────────────────────────────┐    (snapshots, export/import,
//!   │ IMMEDIATE transaction:       │     auto-backup thread)
//!   │   1. pending_writes += entry │          │
//!   │   2. apply to patients/tests │          │
//!   └──────────────┬───────────────┘          │
//!                  │ commit                   │
//!                  ▼                          ▼
//!        clear entry, broadcast ──▶ other tabs (ChangeHub)
//!                  │
//!                  ▼
//!          SQLite (one file per clinic)
//!                  ▲
//!                  │ startup
//!          Recovery Manager (replays surviving entries)
//! ```
//!
//! # Core Principle
//!
//! **A receipt, once issued, is never lost or renumbered.** Serials only grow,
//! and every committed write survives a crash at any point.
//!
//! # Modules
//!
//! - [`db`]: SQLite storage engine with add-only schema migrations
//! - [`models`]: Domain types (Patient, LabTest, Backup, PendingWrite)
//! - [`wal`]: Write-ahead log coordinator and startup recovery
//! - [`backup`]: Backups, retention, export/import, auto-backup
//! - [`notify`]: Cross-tab change broadcast
//! - [`repository`]: Collaborator-facing API
//! - [`receipt`]: Receipt integrity hashes
//! - [`report`]: History search and revenue figures
//! - [`config`]: Store configuration

pub mod backup;
pub mod config;
pub mod db;
pub mod models;
pub mod notify;
pub mod receipt;
pub mod report;
pub mod repository;
pub mod wal;

// Re-export commonly used types
pub use backup::{AutoBackup, BackupManager, ExportDocument, ImportSummary};
pub use config::StoreConfig;
pub use db::{Database, DbError, DbResult};
pub use models::{
    Backup, BillingDraft, Discount, LabTest, Patient, PendingWrite, RecordViolation, StoreName,
    WriteOp,
};
pub use notify::{ChangeEvent, ChangeHub, ChangeNotifier};
pub use report::{PeriodTotals, RevenueSummary};
pub use repository::Repository;
pub use wal::{RecoveryManager, RecoveryReport, WalCoordinator};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crossbeam_channel::Receiver;

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum ClinicLedgerError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Import format error: {0}")]
    ImportFormat(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<DbError> for ClinicLedgerError {
    fn from(e: DbError) -> Self {
        let message = e.to_string();
        match e {
            DbError::StorageUnavailable(_) => ClinicLedgerError::StorageUnavailable(message),
            DbError::WriteFailed(_) => ClinicLedgerError::WriteFailed(message),
            DbError::DuplicateKey(_) => ClinicLedgerError::DuplicateKey(message),
            DbError::NotFound(_) => ClinicLedgerError::NotFound(message),
            DbError::ImportFormat(_) => ClinicLedgerError::ImportFormat(message),
            DbError::InvalidRecord(_) => ClinicLedgerError::InvalidRecord(message),
            DbError::Config(_) => ClinicLedgerError::InvalidInput(message),
            DbError::Corrupt(_) | DbError::Sqlite(_) | DbError::Json(_) => {
                ClinicLedgerError::DatabaseError(message)
            }
        }
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Tabs opened on the same file in this process share one hub.
fn hub_for(path: &Path) -> ChangeHub {
    static HUBS: OnceLock<Mutex<HashMap<PathBuf, ChangeHub>>> = OnceLock::new();
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    HUBS.get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(key)
        .or_default()
        .clone()
}

fn ledger(repo: Repository) -> Arc<ClinicLedger> {
    let events = repo.subscribe();
    Arc::new(ClinicLedger { repo, events })
}

/// Open or create the ledger database at the given path with default settings.
#[uniffi::export]
pub fn open_ledger(path: String) -> Result<Arc<ClinicLedger>, ClinicLedgerError> {
    let config = StoreConfig::at_path(path);
    let hub = hub_for(&config.database_path);
    Ok(ledger(Repository::open(config, &hub)?))
}

/// Open a ledger from a JSON configuration document.
#[uniffi::export]
pub fn open_ledger_with_config(config_json: String) -> Result<Arc<ClinicLedger>, ClinicLedgerError> {
    let config = StoreConfig::from_json_str(&config_json)?;
    let hub = hub_for(&config.database_path);
    Ok(ledger(Repository::open(config, &hub)?))
}

/// Reconstruct how a stored discount was entered, for the edit form.
#[uniffi::export]
pub fn infer_discount(total: u64, discount: u64) -> FfiDiscount {
    Discount::infer(total, discount).into()
}

/// Create an in-memory ledger (for testing).
#[uniffi::export]
pub fn open_ledger_in_memory() -> Result<Arc<ClinicLedger>, ClinicLedgerError> {
    let repo = Repository::open_in_memory(StoreConfig::default(), &ChangeHub::new())?;
    Ok(ledger(repo))
}

// =========================================================================
// Main API Object
// =========================================================================

/// One tab's handle on the ledger, for FFI.
#[derive(uniffi::Object)]
pub struct ClinicLedger {
    repo: Repository,
    events: Receiver<ChangeEvent>,
}

#[uniffi::export]
impl ClinicLedger {
    // =========================================================================
    // Patient Operations
    // =========================================================================

    /// All patients by serial ascending.
    pub fn get_patients(&self) -> Result<Vec<FfiPatient>, ClinicLedgerError> {
        let patients = self.repo.get_patients()?;
        Ok(patients.into_iter().map(|p| p.into()).collect())
    }

    /// Get a patient by ID.
    pub fn get_patient(&self, id: String) -> Result<Option<FfiPatient>, ClinicLedgerError> {
        let patient = self.repo.get_patient(&id)?;
        Ok(patient.map(|p| p.into()))
    }

    /// Bill a new patient; the serial is assigned atomically.
    pub fn create_patient(&self, draft: FfiBillingDraft) -> Result<FfiPatient, ClinicLedgerError> {
        let patient = self.repo.create_patient(draft.into())?;
        Ok(patient.into())
    }

    /// Add a patient with a caller-chosen serial.
    pub fn add_patient(&self, patient: FfiPatient) -> Result<FfiPatient, ClinicLedgerError> {
        let stored = self.repo.add_patient(&patient.into())?;
        Ok(stored.into())
    }

    /// Update a patient's editable fields.
    pub fn update_patient(&self, patient: FfiPatient) -> Result<FfiPatient, ClinicLedgerError> {
        let stored = self.repo.update_patient(&patient.into())?;
        Ok(stored.into())
    }

    pub fn delete_patient(&self, id: String) -> Result<(), ClinicLedgerError> {
        Ok(self.repo.delete_patient(&id)?)
    }

    pub fn get_next_serial(&self) -> Result<u64, ClinicLedgerError> {
        Ok(self.repo.get_next_serial()?)
    }

    /// Check a receipt hash by patient ID or receipt ID.
    pub fn verify_receipt(&self, id: String) -> Result<bool, ClinicLedgerError> {
        Ok(self.repo.verify_receipt(&id)?)
    }

    /// Search history by name, phone or serial.
    pub fn search_patients(&self, term: String) -> Result<Vec<FfiPatient>, ClinicLedgerError> {
        let patients = self.repo.search_patients(&term)?;
        Ok(patients.into_iter().map(|p| p.into()).collect())
    }

    pub fn revenue_summary(&self) -> Result<FfiRevenueSummary, ClinicLedgerError> {
        Ok(self.repo.revenue_summary()?.into())
    }

    // =========================================================================
    // Test Catalog Operations
    // =========================================================================

    pub fn get_tests(&self) -> Result<Vec<FfiLabTest>, ClinicLedgerError> {
        let tests = self.repo.get_tests()?;
        Ok(tests.into_iter().map(|t| t.into()).collect())
    }

    /// Test picker search over name and category.
    pub fn search_tests(&self, term: String) -> Result<Vec<FfiLabTest>, ClinicLedgerError> {
        let tests = self.repo.search_tests(&term)?;
        Ok(tests.into_iter().map(|t| t.into()).collect())
    }

    pub fn add_test(&self, test: FfiLabTest) -> Result<(), ClinicLedgerError> {
        Ok(self.repo.add_test(&test.into())?)
    }

    pub fn update_test(&self, test: FfiLabTest) -> Result<(), ClinicLedgerError> {
        Ok(self.repo.update_test(&test.into())?)
    }

    pub fn delete_test(&self, id: String) -> Result<(), ClinicLedgerError> {
        Ok(self.repo.delete_test(&id)?)
    }

    /// Seed the default catalog if empty. Returns the number inserted.
    pub fn init_default_tests(&self) -> Result<u32, ClinicLedgerError> {
        Ok(self.repo.init_default_tests()? as u32)
    }

    // =========================================================================
    // Backup Operations
    // =========================================================================

    pub fn create_backup(&self) -> Result<String, ClinicLedgerError> {
        Ok(self.repo.create_backup()?)
    }

    /// Retained backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<FfiBackupInfo>, ClinicLedgerError> {
        let backups = self.repo.list_backups()?;
        Ok(backups.into_iter().map(|b| b.into()).collect())
    }

    pub fn prune_backups(&self) -> Result<u32, ClinicLedgerError> {
        Ok(self.repo.prune_backups()? as u32)
    }

    pub fn restore_backup(&self, id: String) -> Result<FfiImportSummary, ClinicLedgerError> {
        Ok(self.repo.restore_backup(&id)?.into())
    }

    /// Export everything as a JSON document.
    pub fn export_all(&self) -> Result<String, ClinicLedgerError> {
        Ok(self.repo.export_all()?)
    }

    /// Merge a JSON export document into the ledger.
    pub fn import_all(&self, json: String) -> Result<FfiImportSummary, ClinicLedgerError> {
        Ok(self.repo.import_all(&json)?.into())
    }

    /// Start periodic backups; returns the immediate backup's ID, or None if
    /// already running.
    pub fn start_auto_backup(&self) -> Result<Option<String>, ClinicLedgerError> {
        Ok(self.repo.start_auto_backup()?)
    }

    pub fn stop_auto_backup(&self) -> bool {
        self.repo.stop_auto_backup()
    }

    pub fn recover_pending_writes(&self) -> Result<FfiRecoveryReport, ClinicLedgerError> {
        Ok(self.repo.recover_pending_writes()?.into())
    }

    // =========================================================================
    // Cross-Tab Events
    // =========================================================================

    /// Drain changes committed by other tabs since the last poll.
    pub fn poll_changes(&self) -> Vec<FfiChangeEvent> {
        self.events.try_iter().map(|e| e.into()).collect()
    }
}

// =========================================================================
// FFI Types
// =========================================================================

/// FFI-safe lab test.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiLabTest {
    pub id: String,
    pub name: String,
    pub price: u64,
    pub category: Option<String>,
}

impl From<LabTest> for FfiLabTest {
    fn from(test: LabTest) -> Self {
        Self {
            id: test.id,
            name: test.name,
            price: test.price,
            category: test.category,
        }
    }
}

impl From<FfiLabTest> for LabTest {
    fn from(test: FfiLabTest) -> Self {
        LabTest {
            id: test.id,
            name: test.name,
            price: test.price,
            category: test.category,
        }
    }
}

/// FFI-safe discount entry.
#[derive(Debug, Clone, Copy, uniffi::Enum)]
pub enum FfiDiscount {
    Flat { amount: u64 },
    Percent { pct: u8 },
}

impl From<Discount> for FfiDiscount {
    fn from(discount: Discount) -> Self {
        match discount {
            Discount::Flat(amount) => FfiDiscount::Flat { amount },
            Discount::Percent(pct) => FfiDiscount::Percent { pct },
        }
    }
}

impl From<FfiDiscount> for Discount {
    fn from(discount: FfiDiscount) -> Self {
        match discount {
            FfiDiscount::Flat { amount } => Discount::Flat(amount),
            FfiDiscount::Percent { pct } => Discount::Percent(pct),
        }
    }
}

/// FFI-safe billing form.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiBillingDraft {
    pub name: String,
    pub phone: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub address: Option<String>,
    pub tests: Vec<FfiLabTest>,
    pub discount: FfiDiscount,
}

impl From<FfiBillingDraft> for BillingDraft {
    fn from(draft: FfiBillingDraft) -> Self {
        BillingDraft {
            name: draft.name,
            phone: draft.phone,
            age: draft.age,
            gender: draft.gender,
            address: draft.address,
            tests: draft.tests.into_iter().map(|t| t.into()).collect(),
            discount: draft.discount.into(),
        }
    }
}

/// FFI-safe patient record.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPatient {
    pub id: String,
    pub serial: u64,
    pub name: String,
    pub phone: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub address: Option<String>,
    pub tests: Vec<FfiLabTest>,
    pub discount: u64,
    pub total: u64,
    pub final_amount: u64,
    pub date: String,
    pub receipt_id: Option<String>,
    pub receipt_hash: Option<String>,
}

impl From<Patient> for FfiPatient {
    fn from(patient: Patient) -> Self {
        Self {
            id: patient.id,
            serial: patient.serial,
            name: patient.name,
            phone: patient.phone,
            age: patient.age,
            gender: patient.gender,
            address: patient.address,
            tests: patient.tests.into_iter().map(|t| t.into()).collect(),
            discount: patient.discount,
            total: patient.total,
            final_amount: patient.final_amount,
            date: patient.date,
            receipt_id: patient.receipt_id,
            receipt_hash: patient.receipt_hash,
        }
    }
}

impl From<FfiPatient> for Patient {
    fn from(patient: FfiPatient) -> Self {
        Patient {
            id: patient.id,
            serial: patient.serial,
            name: patient.name,
            phone: patient.phone,
            age: patient.age,
            gender: patient.gender,
            address: patient.address,
            tests: patient.tests.into_iter().map(|t| t.into()).collect(),
            discount: patient.discount,
            total: patient.total,
            final_amount: patient.final_amount,
            date: patient.date,
            receipt_id: patient.receipt_id,
            receipt_hash: patient.receipt_hash,
        }
    }
}

/// FFI-safe backup listing entry (record bodies stay on the Rust side).
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiBackupInfo {
    pub id: String,
    pub timestamp: i64,
    pub created_at: Option<String>,
    pub patient_count: u32,
    pub test_count: u32,
}

impl From<Backup> for FfiBackupInfo {
    fn from(backup: Backup) -> Self {
        Self {
            created_at: backup.created_at(),
            id: backup.id,
            timestamp: backup.timestamp,
            patient_count: backup.patients.len() as u32,
            test_count: backup.tests.len() as u32,
        }
    }
}

/// FFI-safe import/restore result.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiImportSummary {
    pub patients: u32,
    pub tests: u32,
}

impl From<ImportSummary> for FfiImportSummary {
    fn from(summary: ImportSummary) -> Self {
        Self {
            patients: summary.patients as u32,
            tests: summary.tests as u32,
        }
    }
}

/// FFI-safe replay failure.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiFailedReplay {
    pub entry_id: String,
    pub reason: String,
}

/// FFI-safe recovery result.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRecoveryReport {
    pub replayed: Vec<String>,
    pub failed: Vec<FfiFailedReplay>,
}

impl From<RecoveryReport> for FfiRecoveryReport {
    fn from(report: RecoveryReport) -> Self {
        Self {
            replayed: report.replayed,
            failed: report
                .failed
                .into_iter()
                .map(|f| FfiFailedReplay {
                    entry_id: f.entry_id,
                    reason: f.reason,
                })
                .collect(),
        }
    }
}

/// FFI-safe period figures.
#[derive(Debug, Clone, Copy, uniffi::Record)]
pub struct FfiPeriodTotals {
    pub patients: u32,
    pub revenue: u64,
}

impl From<PeriodTotals> for FfiPeriodTotals {
    fn from(totals: PeriodTotals) -> Self {
        Self {
            patients: totals.patients as u32,
            revenue: totals.revenue,
        }
    }
}

/// FFI-safe revenue summary.
#[derive(Debug, Clone, Copy, uniffi::Record)]
pub struct FfiRevenueSummary {
    pub today: FfiPeriodTotals,
    pub month: FfiPeriodTotals,
    pub year: FfiPeriodTotals,
}

impl From<RevenueSummary> for FfiRevenueSummary {
    fn from(summary: RevenueSummary) -> Self {
        Self {
            today: summary.today.into(),
            month: summary.month.into(),
            year: summary.year.into(),
        }
    }
}

/// FFI-safe change notification. `patient` is set for adds and updates.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiChangeEvent {
    pub kind: String,
    pub patient_id: String,
    pub patient: Option<FfiPatient>,
}

impl From<ChangeEvent> for FfiChangeEvent {
    fn from(event: ChangeEvent) -> Self {
        let patient_id = event.patient_id().to_string();
        match event {
            ChangeEvent::PatientAdded(p) => Self {
                kind: "patient_added".into(),
                patient_id,
                patient: Some(p.into()),
            },
            ChangeEvent::PatientUpdated(p) => Self {
                kind: "patient_updated".into(),
                patient_id,
                patient: Some(p.into()),
            },
            ChangeEvent::PatientDeleted { .. } => Self {
                kind: "patient_deleted".into(),
                patient_id,
                patient: None,
            },
        }
    }
}
