// src/notify.rs

//! Reboot prompts raised after a successful update

use crate::error::{Error, Result};
use crate::transfer::UpdateMetadata;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Conventional location of the pending-reboot marker
pub const DEFAULT_MARKER_PATH: &str = "/run/reboot-required";

const MARKER_BANNER: &str = "*** System restart required ***";

/// UI collaborator told when the device needs a reboot
pub trait Notifier: Send + Sync {
    /// Raise the persistent reboot prompt for the installed build
    fn reboot_required(&self, metadata: &UpdateMetadata) -> Result<()>;
}

/// Writes a `reboot-required` marker for login banners and desktop prompts
pub struct MarkerNotifier {
    path: PathBuf,
}

impl MarkerNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Notifier for MarkerNotifier {
    fn reboot_required(&self, metadata: &UpdateMetadata) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        let content = format!(
            "{}\nSystem update {} installed, reboot to finish.\n",
            MARKER_BANNER, metadata.target_incremental_id
        );
        fs::write(&self.path, content).map_err(|e| {
            Error::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        info!("Reboot required, marker written to {}", self.path.display());
        Ok(())
    }
}

/// Logs the prompt only
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn reboot_required(&self, metadata: &UpdateMetadata) -> Result<()> {
        warn!(
            "System update {} installed, reboot to finish",
            metadata.target_incremental_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_notifier_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/reboot-required");
        let notifier = MarkerNotifier::new(&path);

        let metadata = UpdateMetadata {
            target_incremental_id: "target123".to_string(),
            build_timestamp: 2000,
        };
        notifier.reboot_required(&metadata).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(MARKER_BANNER));
        assert!(content.contains("target123"));
    }
}
