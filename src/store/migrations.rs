//! Version-tracked database migrations for the libSQL backend.
//!
//! The applied version is SQLite's `user_version`. `run_migrations()` applies
//! every newer step in order; a step that fails leaves no trace.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "message_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                collection TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                body TEXT NOT NULL,
                correlation_id TEXT,
                account_id TEXT,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_collection ON messages(collection);
        "#,
    },
    Migration {
        version: 2,
        name: "admission_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS admission_queues (
                name TEXT PRIMARY KEY,
                declared_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS admission_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                published_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_admission_entries_queue
                ON admission_entries(queue_name);
        "#,
    },
];

/// Bring the schema up to the newest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    apply_pending(conn, MIGRATIONS).await
}

async fn apply_pending(conn: &Connection, migrations: &[Migration]) -> Result<(), DatabaseError> {
    let from = schema_version(conn).await?;
    let mut applied = 0;
    for migration in migrations.iter().filter(|m| m.version > from) {
        apply(conn, migration).await?;
        applied += 1;
    }

    if applied == 0 {
        tracing::debug!(version = from, "Schema up to date");
    } else {
        tracing::info!(from, to = schema_version(conn).await?, "Schema migrated");
    }
    Ok(())
}

/// Run one step and bump `user_version` in the same transaction.
async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    tracing::info!(
        version = migration.version,
        name = migration.name,
        "Applying migration"
    );
    let batch = format!(
        "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
        migration.sql, migration.version
    );
    if let Err(e) = conn.execute_batch(&batch).await {
        if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
            tracing::debug!(error = %rollback, "Nothing to roll back");
        }
        return Err(DatabaseError::Migration(format!(
            "V{} ({}) failed: {e}",
            migration.version, migration.name
        )));
    }
    Ok(())
}

/// Applied schema version, kept in the database header. 0 for a fresh file.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read_err = |e: libsql::Error| DatabaseError::Migration(format!("Read user_version: {e}"));
    let mut rows = conn.query("PRAGMA user_version", ()).await.map_err(read_err)?;
    match rows.next().await.map_err(read_err)? {
        Some(row) => row.get::<i64>(0).map_err(read_err),
        None => Ok(0),
    }
}
