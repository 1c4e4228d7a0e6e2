//! SQLite handle shared by every query module.
//!
//! One connection behind a tokio `Mutex`; each closure runs on a blocking
//! worker. Opening a database brings its schema up to the newest version
//! recorded in `PRAGMA user_version`.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use super::schema;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cannot encode column value: {0}")]
    Encode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

fn worker_failed(e: tokio::task::JoinError) -> DatabaseError {
    DatabaseError::Worker(e.to_string())
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens or creates the database file in WAL mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::init(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            Ok(conn)
        })
        .await
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::init(|| Ok(Connection::open_in_memory()?)).await
    }

    async fn init<F>(connect: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Connection> + Send + 'static,
    {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let mut conn = connect()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            migrate(&mut conn)?;
            Ok(conn)
        })
        .await
        .map_err(worker_failed)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.blocking_lock()))
            .await
            .map_err(worker_failed)?
    }

    /// Runs `f` in one transaction; an `Err` rolls everything back.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
        .map_err(worker_failed)?
    }
}

/// Applies every migration newer than the stored `user_version`.
fn migrate(conn: &mut Connection) -> Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for migration in schema::MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        for statement in migration.statements {
            tx.execute_batch(statement)?;
        }
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
        tracing::debug!(version = migration.version, "applied schema migration");
    }
    Ok(())
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
