//! Ordered schema migrations, applied once at startup and recorded in `schema_migrations`.
//!
//! Mirrors the on-disk layout spec.md §6 describes (`migrations/NNN_*.sql`, applied in
//! lexicographic order) but embeds the `.sql` files at compile time via `include_str!`
//! rather than reading a runtime directory, so `hearth migrate` needs no extra assets
//! to ship alongside the binary.

use rusqlite::Connection;

use super::StoreError;

/// `(version, sql)` pairs in the lexicographic order they must be applied.
const MIGRATIONS: &[(&str, &str)] = &[("001_init", include_str!("../../migrations/001_init.sql"))];

/// Applies every migration in `MIGRATIONS` not yet recorded in `schema_migrations`,
/// in order, each inside its own transaction. Returns the number of migrations applied.
pub fn apply_migrations(conn: &mut Connection) -> Result<usize, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .map_err(|e| StoreError::Storage(e.to_string()))?;

    let mut applied = 0usize;
    for (version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        if already {
            continue;
        }
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        tx.execute_batch(sql)
            .map_err(|e| StoreError::Storage(format!("migration {version}: {e}")))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, crate::store::now_iso()],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        tx.commit().map_err(|e| StoreError::Storage(e.to_string()))?;
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_once_and_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        let first = apply_migrations(&mut conn).unwrap();
        assert_eq!(first, MIGRATIONS.len());
        let second = apply_migrations(&mut conn).unwrap();
        assert_eq!(second, 0, "re-applying should be a no-op");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }

    #[test]
    fn creates_expected_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();
        for table in [
            "sessions",
            "messages",
            "tasks",
            "artifacts",
            "rule_context_rows",
            "app_settings",
        ] {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert!(exists, "table {table} should exist");
        }
    }
}
