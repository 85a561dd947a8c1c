//! Versioned schema migrations.
//!
//! Each migration runs once; applied versions are tracked in `_migrations`.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single schema migration.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "assistants_and_runs",
        sql: "
            CREATE TABLE IF NOT EXISTS assistants (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                name TEXT,
                model TEXT NOT NULL,
                instructions TEXT,
                tools TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                locked_by_run_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                assistant_id TEXT,
                run_id TEXT,
                status TEXT NOT NULL,
                completed_at INTEGER,
                incomplete_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, created_at);

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                thread_id TEXT NOT NULL,
                assistant_id TEXT NOT NULL,
                model TEXT NOT NULL,
                instructions TEXT,
                additional_instructions TEXT,
                tools TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                system_status TEXT,
                claimed_by TEXT,
                system_claimed_by TEXT,
                event_index INTEGER NOT NULL DEFAULT 0,
                required_action TEXT,
                last_error TEXT,
                started_at INTEGER,
                completed_at INTEGER,
                cancelled_at INTEGER,
                failed_at INTEGER,
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_runs_thread ON runs(thread_id);

            CREATE TABLE IF NOT EXISTS run_steps (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                assistant_id TEXT NOT NULL,
                step_type TEXT NOT NULL,
                status TEXT NOT NULL,
                step_details TEXT NOT NULL,
                runner_type TEXT,
                last_error TEXT,
                completed_at INTEGER,
                cancelled_at INTEGER,
                failed_at INTEGER,
                expired_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_run_steps_run ON run_steps(run_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_run_steps_thread ON run_steps(thread_id, created_at);

            CREATE TABLE IF NOT EXISTS run_events (
                request_id TEXT NOT NULL,
                response_idx INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                event_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                done INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (request_id, response_idx)
            );
            CREATE INDEX IF NOT EXISTS idx_run_events_created ON run_events(created_at);
        ",
    },
    Migration {
        version: 2,
        name: "job_queue",
        sql: "
            CREATE TABLE IF NOT EXISTS chat_completion_requests (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                claimed_by TEXT,
                done INTEGER NOT NULL DEFAULT 0,
                response_id TEXT,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_requests_created
                ON chat_completion_requests(created_at);

            CREATE TABLE IF NOT EXISTS chat_completion_responses (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                request_id TEXT NOT NULL UNIQUE,
                status_code INTEGER NOT NULL,
                error TEXT,
                body TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_chat_responses_created
                ON chat_completion_responses(created_at);

            CREATE TABLE IF NOT EXISTS tool_runs (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                tool_call_id TEXT NOT NULL,
                program TEXT NOT NULL,
                env TEXT NOT NULL DEFAULT '{}',
                input TEXT NOT NULL DEFAULT '',
                output TEXT,
                error TEXT,
                confirmed INTEGER,
                UNIQUE (run_id, tool_call_id)
            );
        ",
    },
];

/// Apply all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            record_version(conn, migration.version, migration.name).await?;
        }
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        let version = get_current_version(conn).await?;
        tracing::debug!(version = version, "Database migrations complete");
    }
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn record_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_names(conn: &Connection) -> Vec<String> {
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                (),
            )
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(0).unwrap());
        }
        names
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let names = table_names(&conn).await;
        for table in [
            "assistants",
            "threads",
            "messages",
            "runs",
            "run_steps",
            "run_events",
            "chat_completion_requests",
            "chat_completion_responses",
            "tool_runs",
        ] {
            assert!(names.iter().any(|n| n == table), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(
            get_current_version(&conn).await.unwrap(),
            MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
        );
    }
}
