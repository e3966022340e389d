//! Full-dataset export and import.
//!
//! Document format:
//!
//! ```text
//! {
//!   "version": 3,
//!   "exportDate": "2024-05-01T09:30:00+00:00",
//!   "data": { "patients": [...], "tests": [...], "backups": [...] }
//! }
//! ```
//!
//! Import only consults `data.patients` and `data.tests` and upserts each
//! record by id. It never deletes records missing from the document.

use serde::{Deserialize, Serialize};

use crate::db::{DbError, DbResult, SCHEMA_VERSION};
use crate::models::{Backup, LabTest, Patient};

/// Portable snapshot of the whole ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    /// Schema version of the exporting database
    pub version: u32,
    /// Export timestamp (RFC 3339)
    pub export_date: String,
    pub data: ExportData,
}

/// Record collections carried by an export.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExportData {
    #[serde(default)]
    pub patients: Vec<Patient>,
    #[serde(default)]
    pub tests: Vec<LabTest>,
    #[serde(default)]
    pub backups: Vec<Backup>,
}

/// Counts of records written by an import or restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub patients: usize,
    pub tests: usize,
}

impl ExportDocument {
    /// Wrap collections with the current schema version and time.
    pub fn new(data: ExportData) -> Self {
        Self {
            version: SCHEMA_VERSION,
            export_date: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    /// Export to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse and validate an import document.
    ///
    /// Any problem rejects the whole document before anything is written.
    pub fn from_json(json: &str) -> DbResult<Self> {
        let doc: ExportDocument =
            serde_json::from_str(json).map_err(|e| DbError::ImportFormat(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Check the version and every record's invariants.
    pub fn validate(&self) -> DbResult<()> {
        if self.version > SCHEMA_VERSION {
            return Err(DbError::ImportFormat(format!(
                "document version {} is newer than supported {}",
                self.version, SCHEMA_VERSION
            )));
        }
        for patient in &self.data.patients {
            patient.validate().map_err(|e| {
                DbError::ImportFormat(format!("patient {}: {}", patient.id, e))
            })?;
        }
        if let Some(test) = self.data.tests.iter().find(|t| t.id.is_empty()) {
            return Err(DbError::ImportFormat(format!(
                "test '{}' has an empty id",
                test.name
            )));
        }
        Ok(())
    }
}
