//! Version-tracked database migrations for the libSQL job store.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

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
        name: "initial_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                report_id TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                job_type TEXT NOT NULL DEFAULT 'FULL_PIPELINE',
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                worker_id TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                logs TEXT NOT NULL DEFAULT '[]',
                job_config TEXT NOT NULL DEFAULT '{}',
                job_results TEXT,
                timeout_seconds INTEGER NOT NULL DEFAULT 3600,
                environment TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_conversation ON jobs(conversation_id);
        "#,
    },
    Migration {
        version: 2,
        name: "batch_tracking",
        sql: r#"
            ALTER TABLE jobs ADD COLUMN batch_id TEXT;
            ALTER TABLE jobs ADD COLUMN batch_job_id TEXT;
            ALTER TABLE jobs ADD COLUMN batch_check_time TEXT;
        "#,
    },
    Migration {
        version: 3,
        name: "job_lineage",
        sql: r#"
            ALTER TABLE jobs ADD COLUMN parent_job_id TEXT;
            ALTER TABLE jobs ADD COLUMN root_job_id TEXT NOT NULL DEFAULT '';
            ALTER TABLE jobs ADD COLUMN job_stage TEXT;
            ALTER TABLE jobs ADD COLUMN child_jobs TEXT NOT NULL DEFAULT '[]';
            UPDATE jobs SET root_job_id = job_id WHERE root_job_id = '';
            CREATE INDEX IF NOT EXISTS idx_jobs_root ON jobs(root_job_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
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
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
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
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
