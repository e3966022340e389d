//! Crash recovery and multi-tab integration tests on file-backed databases.

use std::thread;

use clinic_ledger_core::db::Database;
use clinic_ledger_core::models::{BillingDraft, LabTest, Patient, PendingWrite, StoreName, WriteOp};
use clinic_ledger_core::notify::{ChangeEvent, ChangeHub};
use clinic_ledger_core::{Repository, StoreConfig};
use tempfile::TempDir;

fn config(dir: &TempDir) -> StoreConfig {
    StoreConfig::at_path(dir.path().join("clinic.db"))
}

fn draft(name: &str) -> BillingDraft {
    BillingDraft::new(name.to_string(), "01711111111".to_string())
        .with_test(&LabTest::new("CBC".to_string(), 400))
}

#[test]
fn test_records_survive_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let created = {
        let repo = Repository::open(config(&dir), &ChangeHub::new())?;
        repo.init_default_tests()?;
        repo.create_patient(draft("Rahim"))?
    };

    let repo = Repository::open(config(&dir), &ChangeHub::new())?;
    assert_eq!(repo.get_patients()?, vec![created]);
    assert_eq!(repo.get_tests()?.len(), 12);
    assert_eq!(repo.get_next_serial()?, 1002);
    assert!(repo.last_recovery().replayed.is_empty());
    Ok(())
}

#[test]
fn test_interrupted_write_is_replayed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let patient = Patient::from_draft(draft("Karim"), 1001)?;

    // Crash after the log entry was written but before the write applied
    {
        let db = Database::open(dir.path().join("clinic.db"))?;
        let entry = PendingWrite::upsert(StoreName::Patients, WriteOp::Add, &patient)?;
        db.insert_pending_write(&entry)?;
    }

    let repo = Repository::open(config(&dir), &ChangeHub::new())?;
    assert_eq!(repo.last_recovery().replayed.len(), 1);
    assert_eq!(repo.get_patient(&patient.id)?, Some(patient));

    drop(repo);
    let db = Database::open(dir.path().join("clinic.db"))?;
    assert!(db.list_pending_writes()?.is_empty());
    Ok(())
}

#[test]
fn test_replay_of_committed_write_is_harmless() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let patient = Patient::from_draft(draft("Fatema"), 1001)?;

    // Crash after commit but before the log entry was cleared
    {
        let db = Database::open(dir.path().join("clinic.db"))?;
        let entry = PendingWrite::upsert(StoreName::Patients, WriteOp::Add, &patient)?;
        let tx = db.write_txn()?;
        db.insert_pending_write(&entry)?;
        db.insert_patient(&patient)?;
        tx.commit()?;
    }

    let repo = Repository::open(config(&dir), &ChangeHub::new())?;
    assert!(repo.last_recovery().is_clean());
    assert_eq!(repo.get_patients()?, vec![patient]);

    // A second pass has nothing left to do
    let again = repo.recover_pending_writes()?;
    assert!(again.replayed.is_empty());
    assert_eq!(repo.get_patients()?.len(), 1);
    Ok(())
}

#[test]
fn test_malformed_entry_left_for_inspection() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let good = Patient::from_draft(draft("Good"), 1001)?;
    {
        let db = Database::open(dir.path().join("clinic.db"))?;
        let mut bad = PendingWrite::upsert(StoreName::Patients, WriteOp::Add, &good)?;
        bad.data = serde_json::json!({ "unexpected": true });
        bad.timestamp -= 10;
        db.insert_pending_write(&bad)?;
        db.insert_pending_write(&PendingWrite::upsert(
            StoreName::Patients,
            WriteOp::Add,
            &good,
        )?)?;
    }

    let repo = Repository::open(config(&dir), &ChangeHub::new())?;
    let report = repo.last_recovery();
    assert_eq!(report.replayed.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(repo.get_patients()?, vec![good]);

    drop(repo);
    let db = Database::open(dir.path().join("clinic.db"))?;
    assert_eq!(db.list_pending_writes()?.len(), 1);
    Ok(())
}

#[test]
fn test_tabs_share_changes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let hub = ChangeHub::new();
    let front_desk = Repository::open(config(&dir), &hub)?;
    let history = Repository::open(config(&dir), &hub)?;
    let history_events = history.subscribe();
    let own_events = front_desk.subscribe();

    let first = front_desk.create_patient(draft("A"))?;
    let second = history.create_patient(draft("B"))?;
    assert_eq!(first.serial, 1001);
    assert_eq!(second.serial, 1002);

    front_desk.delete_patient(&first.id)?;

    assert_eq!(
        history_events.try_recv()?,
        ChangeEvent::PatientAdded(first.clone())
    );
    assert_eq!(
        history_events.try_recv()?,
        ChangeEvent::PatientDeleted { id: first.id }
    );
    assert!(history_events.try_recv().is_err());

    // The front desk only hears about the other tab's write
    assert_eq!(own_events.try_recv()?, ChangeEvent::PatientAdded(second.clone()));
    assert!(own_events.try_recv().is_err());

    assert_eq!(history.get_patients()?, vec![second]);
    Ok(())
}

#[test]
fn test_concurrent_tabs_never_share_a_serial() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let hub = ChangeHub::new();
    let tabs = vec![
        Repository::open(config(&dir), &hub)?,
        Repository::open(config(&dir), &hub)?,
        Repository::open(config(&dir), &hub)?,
    ];

    let handles: Vec<_> = tabs
        .into_iter()
        .enumerate()
        .map(|(i, repo)| {
            thread::spawn(move || {
                (0..10)
                    .map(|n| {
                        repo.create_patient(draft(&format!("tab{}-{}", i, n)))
                            .map(|p| p.serial)
                    })
                    .collect::<Result<Vec<u64>, _>>()
            })
        })
        .collect();

    let mut serials = Vec::new();
    for handle in handles {
        let issued = handle.join().expect("tab thread panicked")?;
        // Each tab sees its own serials strictly increase
        assert!(issued.windows(2).all(|w| w[0] < w[1]));
        serials.extend(issued);
    }

    serials.sort_unstable();
    assert_eq!(serials, (1001..=1030).collect::<Vec<u64>>());
    Ok(())
}

#[test]
fn test_open_rejects_non_database_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("clinic.db");
    std::fs::write(&path, "not a ledger database\n".repeat(64))?;

    let result = Repository::open(StoreConfig::at_path(path), &ChangeHub::new());
    assert!(matches!(
        result,
        Err(clinic_ledger_core::DbError::StorageUnavailable(_))
    ));
    Ok(())
}
