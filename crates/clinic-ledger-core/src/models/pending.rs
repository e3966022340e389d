//! Write-ahead log entry models.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Named record stores in the ledger database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoreName {
    Patients,
    Tests,
    Backups,
    PendingWrites,
}

impl StoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Patients => "patients",
            StoreName::Tests => "tests",
            StoreName::Backups => "backups",
            StoreName::PendingWrites => "pending_writes",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patients" => Ok(StoreName::Patients),
            "tests" => Ok(StoreName::Tests),
            "backups" => Ok(StoreName::Backups),
            "pending_writes" => Ok(StoreName::PendingWrites),
            other => Err(format!("unknown store '{}'", other)),
        }
    }
}

/// Kind of mutation recorded in the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    Add,
    Update,
    Delete,
}

impl WriteOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOp::Add => "add",
            WriteOp::Update => "update",
            WriteOp::Delete => "delete",
        }
    }
}

impl FromStr for WriteOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(WriteOp::Add),
            "update" => Ok(WriteOp::Update),
            "delete" => Ok(WriteOp::Delete),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// An intended write, persisted before the write is applied.
///
/// Lives only between "about to write" and "write committed"; an entry that
/// survives to the next startup marks an interrupted write and is replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    /// Unique entry ID
    pub id: String,
    /// Store the write targets
    pub store: StoreName,
    /// Mutation kind
    pub operation: WriteOp,
    /// Full record for add/update, `{"id": ...}` for delete
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl PendingWrite {
    /// Log entry for an add or update carrying the full record.
    pub fn upsert<T: Serialize>(
        store: StoreName,
        operation: WriteOp,
        record: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::with_data(store, operation, serde_json::to_value(record)?))
    }

    /// Log entry for a delete by key.
    pub fn delete(store: StoreName, id: &str) -> Self {
        Self::with_data(store, WriteOp::Delete, serde_json::json!({ "id": id }))
    }

    fn with_data(store: StoreName, operation: WriteOp, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            store,
            operation,
            data,
            timestamp: now_millis(),
        }
    }

    /// Key of the targeted record, if the payload carries one.
    pub fn target_id(&self) -> Option<&str> {
        self.data.get("id").and_then(|v| v.as_str())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
