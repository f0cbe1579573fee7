//! SQLite working store for the surveillance pipeline.
//!
//! One `HealthDb` wraps one `rusqlite::Connection` in WAL mode. Tasks that
//! run concurrently (scheduler, executor, HTTP surface) each open their own
//! handle; WAL plus natural-key upserts keep overlapping runs idempotent.

use std::path::Path;

use rusqlite::Connection;

mod migrations;
pub mod types;

pub mod findings;
pub mod pages;
pub mod snapshots;
pub mod trends;

pub use types::*;

pub struct HealthDb {
    conn: Connection,
}

impl HealthDb {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Open an in-memory database. Test-only convenience.
    #[cfg(test)]
    pub fn open_in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory db");
        migrations::run_migrations(&conn).expect("migrations");
        conn.execute_batch("PRAGMA foreign_keys = ON;").expect("pragma");
        Self { conn }
    }

    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a transaction. Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Write a key into the daemon's config/bookkeeping table.
    pub fn set_config_value(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO thyme_config (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config_value(&self, key: &str) -> Result<Option<String>, DbError> {
        match self.conn.query_row(
            "SELECT value FROM thyme_config WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        ) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::HealthDb;

    /// A throwaway file-backed database under a temp directory. File-backed
    /// (not `:memory:`) so WAL behaves the same as production.
    pub fn scratch_db() -> HealthDb {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("thyme-test.db");
        std::mem::forget(dir);
        HealthDb::open(&path).expect("open scratch db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let db = testing::scratch_db();
        let count: i64 = db
            .conn_ref()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'thyme_%'",
                [],
                |row| row.get(0),
            )
            .expect("count tables");
        assert!(count >= 15, "expected the full table set, got {}", count);
    }

    #[test]
    fn test_config_values_upsert() {
        let db = testing::scratch_db();
        assert_eq!(db.get_config_value("last_scan_at").expect("get"), None);

        db.set_config_value("last_scan_at", "2026-07-27T14:00:00Z")
            .expect("set");
        db.set_config_value("last_scan_at", "2026-07-29T14:00:00Z")
            .expect("overwrite");

        assert_eq!(
            db.get_config_value("last_scan_at").expect("get").as_deref(),
            Some("2026-07-29T14:00:00Z")
        );
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let db = testing::scratch_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.conn_ref()
                .execute(
                    "INSERT INTO thyme_notifications (id, title) VALUES ('n1', 'x')",
                    [],
                )
                .map_err(DbError::Sqlite)?;
            Err(DbError::Migration("forced".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM thyme_notifications", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }
}
