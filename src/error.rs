// src/error.rs

use std::fmt;
use thiserror::Error;

/// Why a fetch failed
///
/// The incremental-to-full fallback is taken for every kind, so a missing
/// incremental package and a transient network error look the same to the
/// caller. The kind is kept only for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    /// Server answered 404
    NotFound,
    /// Any other non-success HTTP status
    Status(u16),
    /// Connect or read timeout
    Timeout,
    /// Connection, TLS or body read failure
    Network(String),
    /// Response arrived but could not be understood
    BadResponse(String),
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferFailure::NotFound => write!(f, "not found"),
            TransferFailure::Status(code) => write!(f, "HTTP {}", code),
            TransferFailure::Timeout => write!(f, "timed out"),
            TransferFailure::Network(msg) => write!(f, "network error: {}", msg),
            TransferFailure::BadResponse(msg) => write!(f, "bad response: {}", msg),
        }
    }
}

/// Core error types for the updater
#[derive(Error, Debug)]
pub enum Error {
    /// Network, timeout or response failure while fetching
    #[error("Transfer of {url} failed: {kind}")]
    Transfer { url: String, kind: TransferFailure },

    /// Local disk write failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Package signature check failed
    #[error("Signature verification failed: {0}")]
    Verification(String),

    /// Embedded build timestamp differs from what the server declared
    #[error("Package post-timestamp {embedded} does not match server-declared {declared}")]
    StaleOrTampered { declared: i64, embedded: i64 },

    /// Missing or unreadable archive entries
    #[error("Malformed package: {0}")]
    MalformedPackage(String),

    /// Update engine finished with a non-success code
    #[error("Update engine reported error code {0}")]
    Apply(i32),

    /// Update engine went away without reporting completion
    #[error("Update engine disconnected before completion")]
    EngineDisconnected,

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Initialization error
    #[error("Failed to initialize: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Parse error for device configuration
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl Error {
    /// Build a `Transfer` error for the given URL
    pub fn transfer(url: &str, kind: TransferFailure) -> Self {
        Error::Transfer {
            url: url.to_string(),
            kind,
        }
    }
}

/// Result type alias using the updater's Error type
pub type Result<T> = std::result::Result<T, Error>;
