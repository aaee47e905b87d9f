//! Schema version state machine.
//!
//! The stored version lives in the `meta` table (absent means 0). Each step
//! runs inside its own transaction together with the version bump, so an
//! interrupted upgrade is retried from the last committed step on next start.

use rusqlite::{Connection, OptionalExtension};

use super::schema::{MigrationStep, META_TABLE, META_VERSION_KEY, MIGRATIONS};
use crate::error::{Result, StoreError};

pub struct Migrator<'a> {
    steps: &'a [MigrationStep],
}

impl Default for Migrator<'static> {
    fn default() -> Self {
        Self { steps: MIGRATIONS }
    }
}

impl<'a> Migrator<'a> {
    pub fn with_steps(steps: &'a [MigrationStep]) -> Self {
        Self { steps }
    }

    /// Terminal state for this build.
    pub fn target(&self) -> u32 {
        self.steps.last().map(|s| s.version).unwrap_or(0)
    }

    pub fn stored_version(conn: &Connection) -> Result<u32> {
        conn.execute_batch(META_TABLE).map_err(|e| StoreError::Schema {
            version: 0,
            reason: e.to_string(),
        })?;

        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                [META_VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value.unwrap_or(0).max(0) as u32)
    }

    /// Upgrade `conn` to [`Migrator::target`]. The caller must hold the write lock.
    pub fn run(&self, conn: &mut Connection) -> Result<u32> {
        let mut version = Self::stored_version(conn)?;
        let target = self.target();

        if version > target {
            return Err(StoreError::Schema {
                version,
                reason: format!(
                    "database was written by a newer build (this build supports up to version {})",
                    target
                ),
            });
        }

        if version == target {
            tracing::debug!(version, "Schema is current");
            return Ok(version);
        }

        let start = version;
        for step in self.steps.iter().filter(|s| s.version > start) {
            if step.version != version + 1 {
                return Err(StoreError::Schema {
                    version: step.version,
                    reason: format!("no upgrade path from version {}", version),
                });
            }

            let schema_err = |e: rusqlite::Error| StoreError::Schema {
                version: step.version,
                reason: e.to_string(),
            };

            let tx = conn.transaction().map_err(schema_err)?;
            tx.execute_batch(step.sql).map_err(schema_err)?;
            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                rusqlite::params![META_VERSION_KEY, step.version],
            )
            .map_err(schema_err)?;
            tx.commit().map_err(schema_err)?;

            tracing::info!(from = version, to = step.version, "Applied schema upgrade");
            version = step.version;
        }

        Ok(version)
    }
}
