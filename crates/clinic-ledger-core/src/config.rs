//! Ledger configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::{DEFAULT_BACKUP_INTERVAL, DEFAULT_RETENTION};
use crate::db::{DbError, DbResult};

/// First serial handed out by an empty ledger.
pub const DEFAULT_FIRST_SERIAL: u64 = 1001;

/// Configuration for opening a [`crate::Repository`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file (one file per clinic).
    pub database_path: PathBuf,

    /// Maximum number of backups retained.
    pub backup_retention: usize,

    /// Seconds between automatic backups.
    pub auto_backup_interval_secs: u64,

    /// Serial assigned to the first patient.
    pub first_serial: u64,

    /// How long a write waits for another connection's lock.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("clinic-ledger.db"),
            backup_retention: DEFAULT_RETENTION,
            auto_backup_interval_secs: DEFAULT_BACKUP_INTERVAL.as_secs(),
            first_serial: DEFAULT_FIRST_SERIAL,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Default configuration for a database at `path`.
    pub fn at_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            database_path: path.into(),
            ..Self::default()
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> DbResult<Self> {
        let config: StoreConfig =
            serde_json::from_str(json).map_err(|e| DbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DbError::Config(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Interval between automatic backups.
    pub fn auto_backup_interval(&self) -> Duration {
        Duration::from_secs(self.auto_backup_interval_secs)
    }

    /// Lock wait for writes.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    fn validate(&self) -> DbResult<()> {
        if self.backup_retention == 0 {
            return Err(DbError::Config("backup_retention must be at least 1".into()));
        }
        if self.auto_backup_interval_secs == 0 {
            return Err(DbError::Config(
                "auto_backup_interval_secs must be positive".into(),
            ));
        }
        if self.first_serial == 0 {
            return Err(DbError::Config("first_serial must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.backup_retention, 30);
        assert_eq!(config.auto_backup_interval(), Duration::from_secs(86_400));
        assert_eq!(config.first_serial, 1001);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = StoreConfig::from_json_str(r#"{"backup_retention": 7}"#).unwrap();
        assert_eq!(config.backup_retention, 7);
        assert_eq!(config.first_serial, DEFAULT_FIRST_SERIAL);
    }

    #[test]
    fn test_rejects_zero_retention() {
        assert!(matches!(
            StoreConfig::from_json_str(r#"{"backup_retention": 0}"#),
            Err(DbError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, r#"{"database_path": "/tmp/x.db", "first_serial": 5001}"#).unwrap();

        let config = StoreConfig::from_file(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.first_serial, 5001);

        assert!(StoreConfig::from_file(dir.path().join("missing.json")).is_err());
    }
}
