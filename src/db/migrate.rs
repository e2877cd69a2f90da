use rusqlite::{Connection, params};
use crate::error::Result;

/// Migration metadata
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

/// Schema migrations, compiled into the binary so workers and tests never
/// depend on the process working directory.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "001_graph_store",
        sql: include_str!("../../migrations/001_graph_store.sql"),
    },
    Migration {
        version: 2,
        name: "002_update_tasks",
        sql: include_str!("../../migrations/002_update_tasks.sql"),
    },
    Migration {
        version: 3,
        name: "003_kg_changes",
        sql: include_str!("../../migrations/003_kg_changes.sql"),
    },
];

/// Create schema_migrations table if it doesn't exist
fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get list of applied migrations
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

/// Run all pending migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    ensure_migrations_table(conn)?;

    let applied = get_applied_migrations(conn)?;

    for migration in MIGRATIONS {
        if applied.iter().any(|name| name == migration.name) {
            log::debug!("Migration {} already applied, skipping", migration.name);
            continue;
        }

        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;

        log::info!("Migration {} applied successfully", migration.name);
    }

    Ok(())
}

/// Names of all migrations this build knows about, in order.
pub fn known_migrations() -> Vec<&'static str> {
    MIGRATIONS.iter().map(|m| m.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(conn: &Connection, kind: &str) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type = ?1 ORDER BY name")
            .unwrap()
            .query_map([kind], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
            .unwrap()
    }

    #[test]
    fn test_migration_versions_are_ordered() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_full_migration_schema() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();

        run_migrations(&mut conn).unwrap();

        let tables = names(&conn, "table");
        for expected in ["graph_nodes", "graph_edges", "update_tasks", "kg_changes", "schema_migrations"] {
            assert!(tables.contains(&expected.to_string()), "missing table {}", expected);
        }

        let indexes = names(&conn, "index");
        assert!(indexes.contains(&"idx_edges_active_key".to_string()));
        assert!(indexes.contains(&"idx_tasks_visible".to_string()));

        assert_eq!(get_applied_migrations(&conn).unwrap(), known_migrations());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();

        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        assert_eq!(get_applied_migrations(&conn).unwrap().len(), MIGRATIONS.len());
    }
}
