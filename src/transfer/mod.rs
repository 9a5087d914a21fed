// src/transfer/mod.rs

//! Update metadata and package downloading
//!
//! This module provides functionality for:
//! - Fetching the server's one-line build metadata
//! - Deciding whether the advertised build is newer than the installed one
//! - Streaming an incremental package, falling back to a full package
//! - Writing the package to the well-known local path

pub mod http;

pub use http::HttpFetcher;

use crate::device::BuildVersion;
use crate::error::{Error, Result, TransferFailure};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect timeout for every request (60 seconds)
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Read timeout for every request (60 seconds)
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default location of the downloaded package
pub const DEFAULT_PACKAGE_PATH: &str = "/data/ota_package/update.zip";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Longest metadata line accepted from the server
const METADATA_LINE_LIMIT: u64 = 4096;

/// Source of server resources
///
/// Implementations open a byte stream for a path relative to the update
/// server's base URL. Failures must surface as `Error::Transfer`.
pub trait Fetcher: Send + Sync {
    /// Open a stream for `path`
    fn fetch(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Human-readable location of `path`, used in logs and errors
    fn describe(&self, path: &str) -> String {
        path.to_string()
    }
}

/// Build advertised by the update server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateMetadata {
    pub target_incremental_id: String,
    pub build_timestamp: i64,
}

impl FromStr for UpdateMetadata {
    type Err = String;

    /// Parse `<targetIncrementalId> <buildTimestampUtcSeconds>`
    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let mut fields = line.split_whitespace();

        let target = fields
            .next()
            .ok_or_else(|| "empty metadata line".to_string())?;
        let timestamp = fields
            .next()
            .ok_or_else(|| format!("missing build timestamp in '{}'", line.trim()))?;
        let build_timestamp = timestamp
            .parse::<i64>()
            .map_err(|e| format!("invalid build timestamp '{}': {}", timestamp, e))?;

        Ok(Self {
            target_incremental_id: target.to_string(),
            build_timestamp,
        })
    }
}

/// Whether the advertised build is strictly newer than the installed one
pub fn is_newer(metadata: &UpdateMetadata, installed: &BuildVersion) -> bool {
    metadata.build_timestamp > installed.timestamp_utc
}

/// Server path of the incremental package from `source` to `target`
pub fn incremental_package_name(device_id: &str, source: &str, target: &str) -> String {
    format!("{}-incremental-{}-{}.zip", device_id, source, target)
}

/// Server path of the full package for `target`
pub fn full_package_name(device_id: &str, target: &str) -> String {
    format!("{}-ota_update-{}.zip", device_id, target)
}

/// A downloaded package at the well-known local path
#[derive(Debug, Clone)]
pub struct PackageHandle {
    path: PathBuf,
    size: u64,
    sha256: Option<String>,
}

impl PackageHandle {
    /// Wrap an archive that already exists on disk
    pub fn existing(path: &Path) -> Result<Self> {
        let size = fs::metadata(path)
            .map_err(|e| Error::Storage(format!("Failed to stat {}: {}", path.display(), e)))?
            .len();

        Ok(Self {
            path: path.to_path_buf(),
            size,
            sha256: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// SHA-256 of the bytes written, when this handle came from a download
    pub fn sha256(&self) -> Option<&str> {
        self.sha256.as_deref()
    }
}

/// Delete the package at `path`; a file that is already gone is not an error
pub fn remove_package(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Deleted package {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete package {}: {}", path.display(), e),
    }
}

/// Downloads metadata and packages from the update server
pub struct TransferManager {
    fetcher: Box<dyn Fetcher>,
    package_path: PathBuf,
}

impl TransferManager {
    /// Create a transfer manager writing packages to `package_path`
    pub fn new(fetcher: Box<dyn Fetcher>, package_path: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            package_path: package_path.into(),
        }
    }

    /// The well-known local package path
    pub fn package_path(&self) -> &Path {
        &self.package_path
    }

    /// Fetch the advertised build for `device_id`
    pub fn fetch_metadata(&self, device_id: &str) -> Result<UpdateMetadata> {
        let location = self.fetcher.describe(device_id);
        info!("Fetching update metadata from {}", location);

        let stream = self.fetcher.fetch(device_id)?;
        let mut line = String::new();
        BufReader::new(stream.take(METADATA_LINE_LIMIT))
            .read_line(&mut line)
            .map_err(|e| Error::transfer(&location, read_failure(&e)))?;
        if !line.ends_with('\n') && line.len() as u64 >= METADATA_LINE_LIMIT {
            return Err(Error::transfer(
                &location,
                TransferFailure::BadResponse(format!(
                    "metadata line exceeds {} bytes",
                    METADATA_LINE_LIMIT
                )),
            ));
        }

        let metadata: UpdateMetadata = line
            .parse()
            .map_err(|e| Error::transfer(&location, TransferFailure::BadResponse(e)))?;

        info!(
            "Server offers build {} (timestamp {})",
            metadata.target_incremental_id, metadata.build_timestamp
        );
        Ok(metadata)
    }

    /// Download the package that moves `source` to `target`
    ///
    /// The incremental package is tried first. Any failure to open it leads
    /// to exactly one attempt at the full package.
    pub fn fetch_package(
        &self,
        device_id: &str,
        source_incremental: &str,
        target_incremental: &str,
    ) -> Result<PackageHandle> {
        remove_package(&self.package_path);

        let incremental =
            incremental_package_name(device_id, source_incremental, target_incremental);
        debug!("Fetching incremental package {}", incremental);

        let (path, stream) = match self.fetcher.fetch(&incremental) {
            Ok(stream) => (incremental, stream),
            Err(e) => {
                info!("Incremental package unavailable ({}), fetching full update", e);
                let full = full_package_name(device_id, target_incremental);
                let stream = self.fetcher.fetch(&full)?;
                (full, stream)
            }
        };

        self.stream_to_disk(&self.fetcher.describe(&path), stream)
    }

    /// Stream `input` to the package path through a temporary sibling file
    fn stream_to_disk(
        &self,
        location: &str,
        mut input: Box<dyn Read + Send>,
    ) -> Result<PackageHandle> {
        let dest = &self.package_path;
        info!("Downloading {} to {}", location, dest.display());

        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| {
            Error::Storage(format!("Failed to create directory {}: {}", parent.display(), e))
        })?;

        let mut temp = tempfile::Builder::new()
            .prefix(".update-")
            .suffix(".part")
            .tempfile_in(&parent)
            .map_err(|e| {
                Error::Storage(format!("Failed to create file in {}: {}", parent.display(), e))
            })?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut size: u64 = 0;
        loop {
            let n = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transfer(location, read_failure(&e))),
            };
            temp.write_all(&buffer[..n])
                .map_err(|e| Error::Storage(format!("Failed to write downloaded data: {}", e)))?;
            hasher.update(&buffer[..n]);
            size += n as u64;
        }

        temp.as_file()
            .sync_all()
            .map_err(|e| Error::Storage(format!("Failed to sync downloaded data: {}", e)))?;

        temp.persist(dest).map_err(|e| {
            Error::Storage(format!("Failed to move package to {}: {}", dest.display(), e.error))
        })?;

        make_world_readable(dest)?;

        let sha256 = format!("{:x}", hasher.finalize());
        info!("Downloaded {} bytes (sha256 {})", size, sha256);

        Ok(PackageHandle {
            path: dest.clone(),
            size,
            sha256: Some(sha256),
        })
    }
}

#[cfg(unix)]
fn make_world_readable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o644)).map_err(|e| {
        Error::Storage(format!("Failed to set permissions on {}: {}", path.display(), e))
    })
}

#[cfg(not(unix))]
fn make_world_readable(_path: &Path) -> Result<()> {
    Ok(())
}

fn read_failure(e: &io::Error) -> TransferFailure {
    if e.kind() == io::ErrorKind::TimedOut {
        TransferFailure::Timeout
    } else {
        TransferFailure::Network(e.to_string())
    }
}
