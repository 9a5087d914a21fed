// src/db/mod.rs

//! Run journal database
//!
//! This module handles the SQLite journal of update runs:
//! - Database initialization and schema migration
//! - Connection management
//! - A shareable journal handle the orchestrator appends to

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use models::RunRecord;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Default journal location
pub const DEFAULT_DB_PATH: &str = "/var/lib/ota-updater/journal.db";

/// Initialize a journal database at the specified path
///
/// Creates the database file and brings the schema up to date.
/// This is idempotent - calling it on an existing database is safe.
pub fn init(db_path: &str) -> Result<()> {
    debug!("Initializing database at: {}", db_path);

    // Create parent directories if they don't exist
    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;

    info!("Database initialized successfully");
    Ok(())
}

/// Open an existing journal database
pub fn open(db_path: &str) -> Result<Connection> {
    if !Path::new(db_path).exists() {
        return Err(Error::DatabaseNotFound(db_path.to_string()));
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

    Ok(conn)
}

/// Append-only journal of update runs, safe to share across threads
pub struct Journal {
    conn: Mutex<Connection>,
}

impl Journal {
    /// Open the journal at `db_path`, creating it when missing
    pub fn open(db_path: &str) -> Result<Self> {
        init(db_path)?;
        Ok(Self::from_connection(open(db_path)?))
    }

    /// Wrap a connection whose schema is already migrated
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Persist a finished run
    pub fn record(&self, record: &mut RunRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        record.insert(&conn)
    }

    /// Most recent runs first
    pub fn recent(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        RunRecord::list_recent(&conn, limit)
    }
}
