// src/device.rs

//! Device identity and installed build information
//!
//! Values are read from a `build.prop`-style file of `key=value` lines.
//! The updater only compares against them and never writes them back.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Property holding the device codename used in update URLs
pub const PROP_DEVICE: &str = "ro.product.device";

/// Property holding the installed build's UTC timestamp (seconds)
pub const PROP_BUILD_DATE_UTC: &str = "ro.build.date.utc";

/// Property holding the installed build's incremental identifier
pub const PROP_INCREMENTAL: &str = "ro.build.version.incremental";

/// Where the installed build describes itself
pub const DEFAULT_PROPERTIES_PATH: &str = "/system/build.prop";

/// The installed build, used only for comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVersion {
    pub incremental_id: String,
    pub timestamp_utc: i64,
}

/// Device identity plus the build it is currently running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub device_id: String,
    pub build: BuildVersion,
}

impl DeviceProperties {
    /// Load properties from a file on disk
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Reading device properties from {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| {
            Error::InitError(format!(
                "Failed to read properties file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse `key=value` property lines
    ///
    /// Blank lines and `#` comments are skipped. A missing build date is
    /// treated as 0 so that any server build counts as newer.
    pub fn parse(content: &str) -> Result<Self> {
        let props = parse_properties(content);

        let device_id = props
            .get(PROP_DEVICE)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::ParseError(format!("Missing property {}", PROP_DEVICE)))?
            .to_string();

        let timestamp_utc = match props.get(PROP_BUILD_DATE_UTC) {
            Some(value) => value.parse::<i64>().map_err(|e| {
                Error::ParseError(format!("Invalid {} '{}': {}", PROP_BUILD_DATE_UTC, value, e))
            })?,
            None => 0,
        };

        let incremental_id = props
            .get(PROP_INCREMENTAL)
            .map(|v| v.to_string())
            .unwrap_or_default();

        Ok(Self {
            device_id,
            build: BuildVersion {
                incremental_id,
                timestamp_utc,
            },
        })
    }
}

/// Split property lines into a map; later keys win
pub(crate) fn parse_properties(content: &str) -> HashMap<&str, &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}
