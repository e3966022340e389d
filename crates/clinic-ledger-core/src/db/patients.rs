//! Patient store operations.

use rusqlite::{params, OptionalExtension};

use super::{Database, DbError, DbResult};
use crate::models::{Patient, RecordViolation, MAX_SERIAL};

const SERIAL_HIGH_WATER: &str = "serial_high_water";

impl Database {
    /// Insert a new patient. Fails with `DuplicateKey` on an existing id or serial.
    pub fn insert_patient(&self, patient: &Patient) -> DbResult<()> {
        let data = serde_json::to_string(patient)?;
        self.conn.execute(
            r#"
            INSERT INTO patients (id, serial, date, receipt_id, data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                patient.id,
                sql_serial(patient.serial)?,
                patient.date,
                patient.receipt_id,
                data,
            ],
        )?;
        self.bump_serial_high_water(patient.serial)?;
        Ok(())
    }

    /// Insert or replace a patient by id.
    pub fn put_patient(&self, patient: &Patient) -> DbResult<()> {
        let data = serde_json::to_string(patient)?;
        self.conn.execute(
            r#"
            INSERT INTO patients (id, serial, date, receipt_id, data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                serial = excluded.serial,
                date = excluded.date,
                receipt_id = excluded.receipt_id,
                data = excluded.data
            "#,
            params![
                patient.id,
                sql_serial(patient.serial)?,
                patient.date,
                patient.receipt_id,
                data,
            ],
        )?;
        self.bump_serial_high_water(patient.serial)?;
        Ok(())
    }

    /// Get a patient by ID.
    pub fn get_patient(&self, id: &str) -> DbResult<Option<Patient>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM patients WHERE id = ?", [id], |row| {
                row.get(0)
            })
            .optional()?;
        data.map(|d| serde_json::from_str(&d)).transpose().map_err(Into::into)
    }

    /// Get a patient by public receipt ID.
    pub fn get_patient_by_receipt_id(&self, receipt_id: &str) -> DbResult<Option<Patient>> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM patients WHERE receipt_id = ?1 OR (receipt_id IS NULL AND id = ?1)",
                [receipt_id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d)).transpose().map_err(Into::into)
    }

    /// List all patients in serial order.
    pub fn list_patients(&self) -> DbResult<Vec<Patient>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM patients ORDER BY serial")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut patients = Vec::new();
        for data in rows {
            patients.push(serde_json::from_str(&data?)?);
        }
        Ok(patients)
    }

    /// Next serial to assign: one past the highest serial ever stored, and at
    /// least `first_serial`.
    pub fn next_serial(&self, first_serial: u64) -> DbResult<u64> {
        let live_max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(serial) FROM patients", [], |row| row.get(0))?;
        let highest = self
            .serial_high_water()?
            .max(stored_serial(live_max.unwrap_or(0))?);
        let next = highest
            .checked_add(1)
            .filter(|serial| *serial <= MAX_SERIAL)
            .ok_or(RecordViolation::SerialOutOfRange(highest.saturating_add(1)))?;
        Ok(next.max(first_serial))
    }

    /// Highest serial ever assigned in this database.
    pub fn serial_high_water(&self) -> DbResult<u64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?",
                [SERIAL_HIGH_WATER],
                |row| row.get(0),
            )
            .optional()?;
        stored_serial(value.unwrap_or(0))
    }

    fn bump_serial_high_water(&self, serial: u64) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO meta (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)
            "#,
            params![SERIAL_HIGH_WATER, sql_serial(serial)?],
        )?;
        Ok(())
    }
}

fn sql_serial(serial: u64) -> DbResult<i64> {
    i64::try_from(serial).map_err(|_| RecordViolation::SerialOutOfRange(serial).into())
}

fn stored_serial(value: i64) -> DbResult<u64> {
    u64::try_from(value).map_err(|_| DbError::Corrupt(format!("negative serial {}", value)))
}
