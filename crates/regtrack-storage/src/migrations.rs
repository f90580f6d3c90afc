//! Database migration runner
//!
//! Migrations are ordered SQL files compiled into the binary and recorded
//! in `schema_migrations`. Each file runs in its own transaction under the
//! write permit, which gives the same exclusion an advisory lock would on
//! a server database.

use sqlx::Row;

use crate::error::{DatabaseError, DatabaseErrorExt, DatabaseOperation, DatabaseResult};
use crate::pool::Database;

/// Migration definitions, applied in order
const MIGRATIONS: &[(i32, &str, &str)] = &[
    (
        1,
        "initial_schema",
        include_str!("../migrations/001_initial_schema.sql"),
    ),
    (2, "indexes", include_str!("../migrations/002_indexes.sql")),
];

/// Run all pending migrations
///
/// # Errors
///
/// Returns an error if the migrations table cannot be created, an applied
/// migration cannot be read back, or a pending migration fails.
pub async fn run_migrations(db: &Database) -> DatabaseResult<()> {
    {
        let mut session = db.write().await?;
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(session.conn())
        .await
        .map_db_err(DatabaseOperation::Migration { version: 0 })?;
        session.commit().await?;
    }

    let applied: Vec<i32> = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
        .fetch_all(db.read_pool())
        .await
        .map_db_err(DatabaseOperation::Migration { version: 0 })?
        .iter()
        .map(|row| row.get(0))
        .collect();

    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            tracing::debug!("Migration {} ({}) already applied", version, name);
            continue;
        }

        tracing::info!("Applying migration {} ({})", version, name);

        let mut session = db.write().await?;

        // SQLite executes one statement per call; split on the separator
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(session.conn())
                .await
                .map_err(|e| DatabaseError::MigrationFailed {
                    version: *version,
                    message: format!("{name}: {e}"),
                })?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES (?, ?)")
            .bind(version)
            .bind(name)
            .execute(session.conn())
            .await
            .map_db_err(DatabaseOperation::Migration { version: *version })?;

        session.commit().await?;

        tracing::info!("Migration {} ({}) completed", version, name);
    }

    Ok(())
}

/// Check whether any migration is still pending
///
/// # Errors
///
/// Returns an error if the check query fails for a reason other than the
/// migrations table not existing yet.
pub async fn needs_migration(db: &Database) -> DatabaseResult<bool> {
    let result = sqlx::query("SELECT COUNT(*) FROM schema_migrations")
        .fetch_one(db.read_pool())
        .await;

    match result {
        Ok(row) => {
            let count: i64 = row.get(0);
            Ok(count < MIGRATIONS.len() as i64)
        }
        // Table doesn't exist, migrations needed
        Err(_) => Ok(true),
    }
}
