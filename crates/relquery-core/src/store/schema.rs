//! SQLite schema DDL and migration framework for the entity store.

use rusqlite::Connection;

use crate::errors::RelQueryResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Core DDL, replay-safe on an initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables ──────────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS entities (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        attributes TEXT,
        metadata TEXT,
        searchable_content TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY(entity_type, entity_id)
    );",
    "CREATE TABLE IF NOT EXISTS relationships (
        from_type TEXT NOT NULL,
        from_id TEXT NOT NULL,
        field_name TEXT NOT NULL,
        to_type TEXT NOT NULL,
        to_id TEXT NOT NULL,
        FOREIGN KEY(from_type, from_id) REFERENCES entities(entity_type, entity_id) ON DELETE CASCADE,
        FOREIGN KEY(to_type, to_id) REFERENCES entities(entity_type, entity_id) ON DELETE CASCADE,
        UNIQUE(from_type, from_id, field_name, to_type, to_id)
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes ─────────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);",
    "CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(from_type, from_id, field_name);",
];

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations up to [`SCHEMA_VERSION`]. Each step runs in its
/// own SAVEPOINT so a failure rolls back only that step.
pub fn migrate_schema(conn: &Connection) -> RelQueryResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT relquery_migrate_step;")?;

        let step_result = (|| -> RelQueryResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                _ => {}
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT relquery_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => current_version = next_version,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT relquery_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT relquery_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Stored schema version, 0 when absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> RelQueryResult<()> {
    conn.execute(
        "INSERT INTO store_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> RelQueryResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline created by `SCHEMA_STATEMENTS`.
fn migrate_to_v1(_conn: &Connection) -> RelQueryResult<()> {
    Ok(())
}

/// v1 -> v2: index for REVERSE traversals, which join on the link target.
fn migrate_to_v2(conn: &Connection) -> RelQueryResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(to_type, to_id, field_name);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(conn: &Connection) {
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(conn).unwrap();
    }

    #[test]
    fn migrations_reach_current_version_and_are_audited() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn);
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM migration_history WHERE status = 'success';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
        let has_reverse_index: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_relationships_to';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(has_reverse_index, 1);
    }

    #[test]
    fn replaying_schema_is_a_no_op() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn);
        init(&conn);
        let steps: i64 = conn
            .query_row("SELECT COUNT(*) FROM migration_history;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
    }
}
