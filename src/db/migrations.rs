//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `thyme_schema_version`
//! table.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS thyme_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Failed to create thyme_schema_version table: {}", e))
}

fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM thyme_schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Run all pending migrations. Returns the number applied.
///
/// Forward-compat guard: a database stamped with a higher version than this
/// binary knows refuses to open rather than running against an unknown schema.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(format!(
            "Database schema version {} is newer than this binary supports ({})",
            current, max_known
        ));
    }

    let mut applied = 0usize;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch("BEGIN")
            .map_err(|e| format!("Failed to begin migration {}: {}", migration.version, e))?;

        let result = conn.execute_batch(migration.sql).and_then(|_| {
            conn.execute(
                "INSERT INTO thyme_schema_version (version) VALUES (?1)",
                [migration.version],
            )
            .map(|_| ())
        });

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| format!("Failed to commit migration {}: {}", migration.version, e))?;
                log::info!("Applied schema migration v{}", migration.version);
                applied += 1;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(format!("Migration {} failed: {}", migration.version, e));
            }
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let conn = Connection::open_in_memory().expect("open");
        let first = run_migrations(&conn).expect("first run");
        assert_eq!(first, MIGRATIONS.len());

        let second = run_migrations(&conn).expect("second run");
        assert_eq!(second, 0, "re-running must be a no-op");
    }

    #[test]
    fn test_forward_compat_guard() {
        let conn = Connection::open_in_memory().expect("open");
        run_migrations(&conn).expect("baseline");
        conn.execute("INSERT INTO thyme_schema_version (version) VALUES (999)", [])
            .expect("stamp future version");
        assert!(run_migrations(&conn).is_err());
    }
}
