//! Periodic background backups.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{error, info};

use super::BackupManager;
use crate::db::{Database, DbError, DbResult};

/// Default interval between automatic backups.
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// A running backup timer. Stops when [`AutoBackup::stop`] is called or the
/// value is dropped.
pub struct AutoBackup {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl AutoBackup {
    /// Create one backup immediately, then one (followed by pruning) every
    /// `interval` on a background thread.
    ///
    /// Returns the timer and the ID of the immediate backup.
    pub fn start(
        db: Arc<Mutex<Database>>,
        interval: Duration,
        retention: usize,
    ) -> DbResult<(Self, String)> {
        let first = run_cycle(&db, retention)?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("auto-backup".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = run_cycle(&db, retention) {
                            error!(error = %e, "scheduled backup failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| DbError::WriteFailed(format!("could not start auto-backup: {}", e)))?;

        info!(interval_secs = interval.as_secs(), retention, "auto-backup started");
        Ok((
            Self {
                stop_tx,
                handle: Some(handle),
            },
            first,
        ))
    }

    /// Cancel the timer and wait for an in-flight backup to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.stop_tx.try_send(());
        if handle.join().is_err() {
            error!("auto-backup thread panicked");
        }
        info!("auto-backup stopped");
    }
}

impl Drop for AutoBackup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_cycle(db: &Mutex<Database>, retention: usize) -> DbResult<String> {
    let db = db.lock()?;
    let manager = BackupManager::new(&db, retention);
    let id = manager.create_backup()?;
    manager.prune_backups()?;
    Ok(id)
}
