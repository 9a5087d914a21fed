// src/db/models.rs

//! Data models for the run journal
//!
//! One `RunRecord` per orchestrated run, with methods for inserting and
//! reading rows back for `history`.

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::str::FromStr;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    UpToDate,
    RebootRequired,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &str {
        match self {
            Outcome::UpToDate => "up_to_date",
            Outcome::RebootRequired => "reboot_required",
            Outcome::Failed => "failed",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "up_to_date" => Ok(Outcome::UpToDate),
            "reboot_required" => Ok(Outcome::RebootRequired),
            "failed" => Ok(Outcome::Failed),
            _ => Err(format!("Invalid run outcome: {}", s)),
        }
    }
}

/// A journaled update run
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: Option<i64>,
    /// RFC 3339 start time
    pub started_at: String,
    pub finished_at: Option<String>,
    /// Last stage the run reached
    pub stage: String,
    pub outcome: Outcome,
    pub target_incremental: Option<String>,
    pub build_timestamp: Option<i64>,
    pub package_sha256: Option<String>,
    pub error: Option<String>,
}

const COLUMNS: &str = "id, started_at, finished_at, stage, outcome, target_incremental, \
                       build_timestamp, package_sha256, error";

impl RunRecord {
    /// Start a record stamped with the current time
    pub fn begin() -> Self {
        Self {
            id: None,
            started_at: current_timestamp(),
            finished_at: None,
            stage: String::new(),
            outcome: Outcome::Failed,
            target_incremental: None,
            build_timestamp: None,
            package_sha256: None,
            error: None,
        }
    }

    /// Stamp the finish time and outcome
    pub fn finish(&mut self, stage: &str, outcome: Outcome, error: Option<String>) {
        self.finished_at = Some(current_timestamp());
        self.stage = stage.to_string();
        self.outcome = outcome;
        self.error = error;
    }

    /// Insert this record into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO runs (started_at, finished_at, stage, outcome, target_incremental,
                               build_timestamp, package_sha256, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &self.started_at,
                &self.finished_at,
                &self.stage,
                self.outcome.as_str(),
                &self.target_incremental,
                &self.build_timestamp,
                &self.package_sha256,
                &self.error,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a run by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM runs WHERE id = ?1", COLUMNS))?;

        let record = stmt.query_row([id], Self::from_row).optional()?;

        Ok(record)
    }

    /// List runs, most recent first
    pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY id DESC LIMIT ?1",
            COLUMNS
        ))?;

        let records = stmt
            .query_map([limit as i64], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Convert a database row to a RunRecord
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let outcome_str: String = row.get(4)?;
        let outcome = outcome_str.parse::<Outcome>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            started_at: row.get(1)?,
            finished_at: row.get(2)?,
            stage: row.get(3)?,
            outcome,
            target_incremental: row.get(5)?,
            build_timestamp: row.get(6)?,
            package_sha256: row.get(7)?,
            error: row.get(8)?,
        })
    }
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
