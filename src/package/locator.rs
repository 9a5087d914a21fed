// src/package/locator.rs

//! Payload location inside an update package
//!
//! The update engine reads `payload.bin` straight out of the package file,
//! so the locator only has to work out where its bytes start. Offsets are
//! accumulated over entries in physical order; the central directory may
//! list entries in a different order and is never used for the arithmetic.

use super::archive::{Archive, LOCAL_HEADER_SIZE, LocalEntry, checked_sum};
use crate::error::{Error, Result};
use crate::transfer::PackageHandle;
use serde::Serialize;
use tracing::{debug, info};

/// Entry holding the update payload
pub const PAYLOAD_ENTRY: &str = "payload.bin";

/// Entry holding properties passed verbatim to the update engine
pub const PROPERTIES_ENTRY: &str = "payload_properties.txt";

const PROPERTIES_LIMIT: u64 = 1024 * 1024;

/// What the offset arithmetic needs to know about one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub name: String,
    /// Stored name length in bytes
    pub name_len: u64,
    pub extra_len: u64,
    pub compressed_size: u64,
    pub is_dir: bool,
    /// Data descriptor bytes after the entry data
    pub trailer_len: u64,
}

impl EntryDescriptor {
    /// Descriptor for a plain entry with no data descriptor
    pub fn new(name: &str, extra_len: u64, compressed_size: u64) -> Self {
        Self {
            name: name.to_string(),
            name_len: name.len() as u64,
            extra_len,
            compressed_size,
            is_dir: name.ends_with('/'),
            trailer_len: 0,
        }
    }
}

impl From<&LocalEntry> for EntryDescriptor {
    fn from(entry: &LocalEntry) -> Self {
        Self {
            name: entry.name.clone(),
            name_len: entry.name_len,
            extra_len: entry.extra_len,
            compressed_size: entry.compressed_size,
            is_dir: entry.is_dir(),
            trailer_len: entry.trailer_len,
        }
    }
}

/// Where the payload lives and what to tell the engine about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageLayout {
    /// Absolute byte offset of the first payload byte
    pub payload_offset: u64,
    /// Stored payload length; the engine is still told 0
    pub payload_size: u64,
    /// Lines of `payload_properties.txt`, uninterpreted
    pub payload_properties: Vec<String>,
}

/// Compute the absolute offset of `payload.bin` from entries in stream order
///
/// Each entry advances the cursor by its local header, name and extra field;
/// non-directories then advance it past their compressed data. The payload
/// offset is the cursor right after the payload's own header.
pub fn payload_offset(entries: &[EntryDescriptor]) -> Result<u64> {
    let mut cursor = 0u64;

    for entry in entries {
        let out_of_range = || {
            Error::MalformedPackage(format!(
                "Entry '{}' extends past the 64-bit offset range",
                entry.name
            ))
        };

        cursor = checked_sum(&[cursor, LOCAL_HEADER_SIZE, entry.name_len, entry.extra_len])
            .ok_or_else(out_of_range)?;
        if !entry.is_dir {
            if entry.name == PAYLOAD_ENTRY {
                return Ok(cursor);
            }
            cursor = cursor.checked_add(entry.compressed_size).ok_or_else(out_of_range)?;
        }
        cursor = cursor.checked_add(entry.trailer_len).ok_or_else(out_of_range)?;
    }

    Err(Error::MalformedPackage(format!(
        "Package has no {} entry",
        PAYLOAD_ENTRY
    )))
}

/// Scan a downloaded package for its payload layout
pub fn locate(handle: &PackageHandle) -> Result<PackageLayout> {
    debug!("Locating payload in {}", handle.path().display());

    let mut archive = Archive::open(handle.path())?;
    let entries = archive.local_entries()?;

    let descriptors: Vec<EntryDescriptor> = entries.iter().map(EntryDescriptor::from).collect();
    let offset = payload_offset(&descriptors)?;

    let Some(payload) = entries.iter().find(|e| !e.is_dir() && e.name == PAYLOAD_ENTRY) else {
        return Err(Error::MalformedPackage(format!(
            "Package has no {} entry",
            PAYLOAD_ENTRY
        )));
    };
    let header_offset = payload.data_offset()?;
    if header_offset != offset {
        return Err(Error::MalformedPackage(format!(
            "Computed payload offset {} disagrees with header at {}",
            offset, header_offset
        )));
    }

    let properties = match entries
        .iter()
        .find(|e| !e.is_dir() && e.name == PROPERTIES_ENTRY)
    {
        Some(entry) => {
            let raw = archive.read_entry(entry, PROPERTIES_LIMIT)?;
            String::from_utf8_lossy(&raw)
                .lines()
                .map(str::to_string)
                .collect()
        }
        None => Vec::new(),
    };

    info!(
        "Payload at offset {} ({} bytes), {} properties",
        offset,
        payload.compressed_size,
        properties.len()
    );

    Ok(PackageLayout {
        payload_offset: offset,
        payload_size: payload.compressed_size,
        payload_properties: properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::testutil::{ZipBuilder, padding_extra};
    use std::fs;

    fn write_package(bytes: &[u8]) -> (tempfile::TempDir, PackageHandle) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("update.zip");
        fs::write(&path, bytes).unwrap();
        let handle = PackageHandle::existing(&path).unwrap();
        (dir, handle)
    }

    #[test]
    fn test_payload_offset_sums_preceding_entries() {
        let entries = vec![
            EntryDescriptor::new("META-INF/com/android/metadata", 0, 120),
            EntryDescriptor::new("care_map.pb", 4, 33),
            EntryDescriptor::new("payload.bin", 12, 1_000_000),
            EntryDescriptor::new("payload_properties.txt", 0, 150),
        ];

        let expected = (30 + 29 + 120) + (30 + 11 + 4 + 33) + (30 + 11 + 12);
        assert_eq!(payload_offset(&entries).unwrap(), expected);
    }

    #[test]
    fn test_payload_first_entry() {
        let entries = vec![EntryDescriptor::new("payload.bin", 0, 10)];
        assert_eq!(payload_offset(&entries).unwrap(), 30 + 11);
    }

    #[test]
    fn test_directories_do_not_advance_by_size() {
        let mut dir = EntryDescriptor::new("META-INF/", 0, 0);
        // A bogus size on a directory entry must not move the cursor
        dir.compressed_size = 500;
        let entries = vec![dir, EntryDescriptor::new("payload.bin", 0, 10)];

        assert_eq!(payload_offset(&entries).unwrap(), (30 + 9) + (30 + 11));
    }

    #[test]
    fn test_name_length_counts_bytes() {
        let entries = vec![
            EntryDescriptor::new("résumé.txt", 0, 7),
            EntryDescriptor::new("payload.bin", 0, 10),
        ];
        // "résumé.txt" is 10 characters but 12 bytes
        assert_eq!(payload_offset(&entries).unwrap(), (30 + 12 + 7) + (30 + 11));
    }

    #[test]
    fn test_trailer_advances_cursor() {
        let mut streamed = EntryDescriptor::new("care_map.pb", 0, 20);
        streamed.trailer_len = 16;
        let entries = vec![streamed, EntryDescriptor::new("payload.bin", 0, 10)];

        assert_eq!(payload_offset(&entries).unwrap(), (30 + 11 + 20 + 16) + (30 + 11));
    }

    #[test]
    fn test_missing_payload_is_malformed() {
        let entries = vec![
            EntryDescriptor::new("META-INF/com/android/metadata", 0, 120),
            EntryDescriptor::new("payload.bin.sig", 0, 256),
        ];
        assert!(matches!(
            payload_offset(&entries),
            Err(Error::MalformedPackage(_))
        ));
        assert!(matches!(payload_offset(&[]), Err(Error::MalformedPackage(_))));
    }

    #[test]
    fn test_oversized_entries_are_malformed() {
        let huge = vec![
            EntryDescriptor::new("care_map.pb", 0, u64::MAX - 20),
            EntryDescriptor::new("payload.bin", 0, 10),
        ];
        assert!(matches!(payload_offset(&huge), Err(Error::MalformedPackage(_))));

        let mut streamed = EntryDescriptor::new("care_map.pb", 0, 0);
        streamed.trailer_len = u64::MAX;
        let entries = vec![streamed, EntryDescriptor::new("payload.bin", 0, 10)];
        assert!(matches!(payload_offset(&entries), Err(Error::MalformedPackage(_))));

        let mut wide = EntryDescriptor::new("payload.bin", u64::MAX, 10);
        wide.name_len = 1;
        assert!(matches!(payload_offset(&[wide]), Err(Error::MalformedPackage(_))));
    }

    #[test]
    fn test_locate_rejects_zip64_size_past_end() {
        let mut extra = Vec::new();
        extra.extend_from_slice(&0x0001u16.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&3u64.to_le_bytes());
        extra.extend_from_slice(&(u64::MAX - 50).to_le_bytes());

        let mut bytes = ZipBuilder::new()
            .stored_with_extra("care_map.pb", b"map", extra)
            .stored("payload.bin", b"payload")
            .build();
        bytes[18..22].copy_from_slice(&u32::MAX.to_le_bytes());
        bytes[22..26].copy_from_slice(&u32::MAX.to_le_bytes());
        let (_dir, handle) = write_package(&bytes);

        assert!(matches!(locate(&handle), Err(Error::MalformedPackage(_))));
    }

    #[test]
    fn test_locate_real_archive() {
        let payload = b"CrAU payload bytes for the update engine";
        let bytes = ZipBuilder::new()
            .deflated("META-INF/com/android/metadata", b"post-timestamp=2000\n")
            .dir("META-INF/com/")
            .stored_with_extra("care_map.pb", b"care map", padding_extra(8))
            .stored("payload.bin", payload)
            .deflated(
                "payload_properties.txt",
                b"FILE_HASH=abc\nFILE_SIZE=40\nMETADATA_HASH=def\nMETADATA_SIZE=9\n",
            )
            .build();
        let (_dir, handle) = write_package(&bytes);

        let layout = locate(&handle).unwrap();
        let start = layout.payload_offset as usize;
        assert_eq!(&bytes[start..start + payload.len()], payload);
        assert_eq!(layout.payload_size, payload.len() as u64);
        assert_eq!(
            layout.payload_properties,
            vec!["FILE_HASH=abc", "FILE_SIZE=40", "METADATA_HASH=def", "METADATA_SIZE=9"]
        );
    }

    #[test]
    fn test_locate_ignores_central_directory_order() {
        let payload = b"payload";
        let bytes = ZipBuilder::new()
            .stored("first.txt", b"0123456789")
            .stored("payload.bin", payload)
            .stored("last.txt", b"z")
            .reverse_central()
            .build();
        let (_dir, handle) = write_package(&bytes);

        let layout = locate(&handle).unwrap();
        assert_eq!(layout.payload_offset, (30 + 9 + 10) + (30 + 11));
        let start = layout.payload_offset as usize;
        assert_eq!(&bytes[start..start + payload.len()], payload);
    }

    #[test]
    fn test_locate_without_properties() {
        let bytes = ZipBuilder::new().stored("payload.bin", b"p").build();
        let (_dir, handle) = write_package(&bytes);

        let layout = locate(&handle).unwrap();
        assert!(layout.payload_properties.is_empty());
    }

    #[test]
    fn test_locate_without_payload() {
        let bytes = ZipBuilder::new()
            .stored("payload_properties.txt", b"FILE_HASH=abc\n")
            .build();
        let (_dir, handle) = write_package(&bytes);

        assert!(matches!(locate(&handle), Err(Error::MalformedPackage(_))));
    }
}
