//! Connection pool management with read/write separation
//!
//! The embedded store serves concurrent readers from a bounded pool while
//! every write goes through a single-permit semaphore. WAL journaling keeps
//! readers from blocking behind the writer.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{DatabaseError, DatabaseErrorExt, DatabaseOperation, DatabaseResult};
use regtrack_config::DatabaseConfig;

/// Shared handle to the embedded database
///
/// Cloning is cheap; all clones share the same pools and write permit.
#[derive(Clone)]
pub struct Database {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
    write_permit: Arc<Semaphore>,
}

/// An exclusive write transaction
///
/// Holds the process-wide write permit for its whole lifetime, so at most
/// one write transaction exists at any moment. Dropping without `commit`
/// rolls back.
pub struct WriteSession<'a> {
    _permit: SemaphorePermit<'a>,
    tx: Transaction<'static, Sqlite>,
}

impl WriteSession<'_> {
    /// Executor for statements inside this transaction
    pub fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        &mut self.tx
    }

    /// Commit the transaction and release the write permit
    ///
    /// # Errors
    ///
    /// Returns an error if the commit itself fails; the transaction is
    /// rolled back in that case.
    pub async fn commit(self) -> DatabaseResult<()> {
        self.tx.commit().await.map_db_err(DatabaseOperation::Transaction {
            description: "commit".to_string(),
        })
    }

    /// Roll back explicitly (dropping has the same effect)
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback statement fails.
    pub async fn rollback(self) -> DatabaseResult<()> {
        self.tx.rollback().await.map_db_err(DatabaseOperation::Transaction {
            description: "rollback".to_string(),
        })
    }
}

impl Database {
    /// Connect to the database described by the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The database URL is malformed
    /// - The database file cannot be created or opened
    /// - Either pool fails to establish its first connection
    pub async fn connect(config: &DatabaseConfig) -> DatabaseResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| DatabaseError::ConnectionFailed {
                message: format!("invalid database URL: {e}"),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));

        // Writer: one connection, one permit. Readers: bounded pool.
        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                message: format!("write pool: {e}"),
            })?;

        let read_pool = SqlitePoolOptions::new()
            .max_connections(config.read_pool_size)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                message: format!("read pool: {e}"),
            })?;

        Ok(Self {
            read_pool,
            write_pool,
            write_permit: Arc::new(Semaphore::new(1)),
        })
    }

    /// In-memory database for tests
    ///
    /// A single shared connection backs both pools so the schema is visible
    /// everywhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be opened.
    pub async fn connect_in_memory() -> DatabaseResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DatabaseError::ConnectionFailed {
                message: format!("invalid in-memory URL: {e}"),
            })?
            .journal_mode(SqliteJournalMode::Memory)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                message: format!("in-memory pool: {e}"),
            })?;

        Ok(Self {
            read_pool: pool.clone(),
            write_pool: pool,
            write_permit: Arc::new(Semaphore::new(1)),
        })
    }

    /// Pool for SELECT workloads
    pub const fn read_pool(&self) -> &SqlitePool {
        &self.read_pool
    }

    /// Begin an exclusive write transaction
    ///
    /// Waits for the write permit first; writes from other tasks queue here
    /// instead of churning on the database lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be started.
    pub async fn write(&self) -> DatabaseResult<WriteSession<'_>> {
        let permit = self
            .write_permit
            .acquire()
            .await
            .map_err(|_| DatabaseError::ConnectionFailed {
                message: "write permit closed".to_string(),
            })?;

        let tx = self
            .write_pool
            .begin()
            .await
            .map_db_err(DatabaseOperation::Transaction {
                description: "begin".to_string(),
            })?;

        Ok(WriteSession {
            _permit: permit,
            tx,
        })
    }

    /// Close both pools
    pub async fn close(&self) {
        self.read_pool.close().await;
        self.write_pool.close().await;
    }
}
