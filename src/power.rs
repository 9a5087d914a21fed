// src/power.rs

//! Wakefulness leases
//!
//! A run holds a lease from start to finish so the host cannot suspend in
//! the middle of a transfer or while the engine is writing partitions.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Kernel interface for taking a named wake lock
pub const SYSFS_WAKE_LOCK: &str = "/sys/power/wake_lock";

/// Kernel interface for dropping a named wake lock
pub const SYSFS_WAKE_UNLOCK: &str = "/sys/power/wake_unlock";

/// Host facility that keeps the device awake
pub trait WakeLock: Send + Sync {
    fn acquire(&self, tag: &str) -> Result<()>;
    fn release(&self, tag: &str) -> Result<()>;
}

/// Wake locks through the Linux `/sys/power` interface
pub struct SysfsWakeLock {
    lock_path: PathBuf,
    unlock_path: PathBuf,
}

impl SysfsWakeLock {
    pub fn new(lock_path: impl Into<PathBuf>, unlock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            unlock_path: unlock_path.into(),
        }
    }

    fn write_tag(path: &Path, tag: &str) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
            Error::InitError(format!("Failed to open {}: {}", path.display(), e))
        })?;
        file.write_all(tag.as_bytes())?;
        Ok(())
    }
}

impl Default for SysfsWakeLock {
    fn default() -> Self {
        Self::new(SYSFS_WAKE_LOCK, SYSFS_WAKE_UNLOCK)
    }
}

impl WakeLock for SysfsWakeLock {
    fn acquire(&self, tag: &str) -> Result<()> {
        Self::write_tag(&self.lock_path, tag)
    }

    fn release(&self, tag: &str) -> Result<()> {
        Self::write_tag(&self.unlock_path, tag)
    }
}

/// For hosts without wake lock support
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self, _tag: &str) -> Result<()> {
        Ok(())
    }

    fn release(&self, _tag: &str) -> Result<()> {
        Ok(())
    }
}

/// Pick the sysfs wake lock when the kernel offers one
pub fn detect() -> Box<dyn WakeLock> {
    if Path::new(SYSFS_WAKE_LOCK).exists() {
        Box::new(SysfsWakeLock::default())
    } else {
        debug!("No {} on this host, running without wake lock", SYSFS_WAKE_LOCK);
        Box::new(NoWakeLock)
    }
}

/// A held wake lock, released on drop
///
/// Failing to take the lock is logged and the lease is simply not held.
pub struct WakeLease<'a> {
    lock: &'a dyn WakeLock,
    tag: String,
    held: bool,
}

impl<'a> WakeLease<'a> {
    pub fn acquire(lock: &'a dyn WakeLock, tag: &str) -> Self {
        let held = match lock.acquire(tag) {
            Ok(()) => {
                debug!("Acquired wake lock {}", tag);
                true
            }
            Err(e) => {
                warn!("Could not acquire wake lock {}: {}", tag, e);
                false
            }
        };

        Self {
            lock,
            tag: tag.to_string(),
            held,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for WakeLease<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        match self.lock.release(&self.tag) {
            Ok(()) => debug!("Released wake lock {}", self.tag),
            Err(e) => warn!("Failed to release wake lock {}: {}", self.tag, e),
        }
    }
}
