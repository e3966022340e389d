//! Test catalog store operations.

use rusqlite::{params, OptionalExtension};

use super::{Database, DbResult};
use crate::models::LabTest;

impl Database {
    /// Insert a new test. Fails with `DuplicateKey` on an existing id.
    pub fn insert_test(&self, test: &LabTest) -> DbResult<()> {
        let data = serde_json::to_string(test)?;
        self.conn.execute(
            "INSERT INTO tests (id, name, data) VALUES (?1, ?2, ?3)",
            params![test.id, test.name, data],
        )?;
        Ok(())
    }

    /// Insert or replace a test by id.
    pub fn put_test(&self, test: &LabTest) -> DbResult<()> {
        let data = serde_json::to_string(test)?;
        self.conn.execute(
            r#"
            INSERT INTO tests (id, name, data) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                data = excluded.data
            "#,
            params![test.id, test.name, data],
        )?;
        Ok(())
    }

    /// Get a test by ID.
    pub fn get_test(&self, id: &str) -> DbResult<Option<LabTest>> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM tests WHERE id = ?", [id], |row| row.get(0))
            .optional()?;
        data.map(|d| serde_json::from_str(&d)).transpose().map_err(Into::into)
    }

    /// List all tests ordered by name.
    pub fn list_tests(&self) -> DbResult<Vec<LabTest>> {
        let mut stmt = self.conn.prepare("SELECT data FROM tests ORDER BY name, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tests = Vec::new();
        for data in rows {
            tests.push(serde_json::from_str(&data?)?);
        }
        Ok(tests)
    }
}
