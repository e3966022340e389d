//! Backup snapshot models.

use serde::{Deserialize, Serialize};

use super::lab_test::LabTest;
use super::patient::Patient;

/// An immutable point-in-time copy of the patient and test collections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backup {
    /// Unique backup ID
    pub id: String,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,
    pub patients: Vec<Patient>,
    pub tests: Vec<LabTest>,
}

impl Backup {
    /// Wrap a snapshot with a fresh ID.
    pub fn new(timestamp: i64, patients: Vec<Patient>, tests: Vec<LabTest>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            patients,
            tests,
        }
    }

    /// Creation time as RFC 3339, if representable.
    pub fn created_at(&self) -> Option<String> {
        chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.timestamp)
            .map(|dt| dt.to_rfc3339())
    }
}
