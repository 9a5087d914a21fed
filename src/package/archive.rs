// src/package/archive.rs

//! Zip container reader for update packages
//!
//! Local file headers are walked in physical order from byte 0. The central
//! directory is consulted only for the archive comment, for name lookups and
//! for sizes that a local header defers to a data descriptor.

use crate::error::{Error, Result};
use flate2::read::DeflateDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Fixed size of a local file header before the name and extra field
pub const LOCAL_HEADER_SIZE: u64 = 30;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0605_4b50;
const ZIP64_END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

const CENTRAL_HEADER_SIZE: usize = 46;
const END_OF_CENTRAL_DIR_SIZE: u64 = 22;
const ZIP64_LOCATOR_SIZE: u64 = 20;
const ZIP64_END_OF_CENTRAL_DIR_SIZE: usize = 56;
const MAX_COMMENT_SIZE: u64 = 0xFFFF;

const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const ZIP64_EXTRA_ID: u16 = 0x0001;
const U32_SENTINEL: u64 = 0xFFFF_FFFF;

/// One entry as described by its local file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    /// Name length in bytes as stored, not in characters
    pub name_len: u64,
    pub extra_len: u64,
    pub method: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    /// Absolute offset of the local header
    pub header_offset: u64,
    /// Data descriptor bytes following the entry data, 0 when absent
    pub trailer_len: u64,
}

impl LocalEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Absolute offset of the first byte of entry data
    pub fn data_offset(&self) -> Result<u64> {
        checked_sum(&[self.header_offset, LOCAL_HEADER_SIZE, self.name_len, self.extra_len])
            .ok_or_else(|| self.overflow())
    }

    /// Absolute offset just past this entry (data and descriptor)
    pub fn end_offset(&self) -> Result<u64> {
        checked_sum(&[self.data_offset()?, self.compressed_size, self.trailer_len])
            .ok_or_else(|| self.overflow())
    }

    fn overflow(&self) -> Error {
        Error::MalformedPackage(format!(
            "Entry '{}' extends past the 64-bit offset range",
            self.name
        ))
    }
}

/// Sum of `values`, or `None` if it does not fit in a u64
pub(crate) fn checked_sum(values: &[u64]) -> Option<u64> {
    values.iter().try_fold(0u64, |acc, &v| acc.checked_add(v))
}

#[derive(Debug, Clone)]
struct CentralEntry {
    compressed_size: u64,
    uncompressed_size: u64,
    header_offset: u64,
}

/// An opened zip archive
pub struct Archive<R> {
    reader: R,
    central: HashMap<String, CentralEntry>,
    central_offset: u64,
    comment: Vec<u8>,
    comment_offset: u64,
}

impl Archive<BufReader<File>> {
    /// Open the archive at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::MalformedPackage(format!("Failed to open {}: {}", path.display(), e))
        })?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> Archive<R> {
    /// Read the end-of-central-directory record and index the central directory
    pub fn new(mut reader: R) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < END_OF_CENTRAL_DIR_SIZE {
            return Err(Error::MalformedPackage(format!(
                "{} bytes is too short for a zip archive",
                len
            )));
        }

        let tail_len = len.min(END_OF_CENTRAL_DIR_SIZE + MAX_COMMENT_SIZE);
        let tail_start = len - tail_len;
        let mut tail = vec![0u8; tail_len as usize];
        read_exact_at(&mut reader, tail_start, &mut tail)?;

        let eocd = find_end_of_central_dir(&tail).ok_or_else(|| {
            Error::MalformedPackage("End of central directory record not found".to_string())
        })?;
        let eocd_offset = tail_start + eocd as u64;

        let mut entry_count = u64::from(le_u16(&tail, eocd + 10));
        let mut central_size = u64::from(le_u32(&tail, eocd + 12));
        let mut central_offset = u64::from(le_u32(&tail, eocd + 16));
        let comment_len = le_u16(&tail, eocd + 20) as usize;
        let comment = tail[eocd + 22..eocd + 22 + comment_len].to_vec();
        let comment_offset = eocd_offset + END_OF_CENTRAL_DIR_SIZE;

        if central_offset == U32_SENTINEL || central_size == U32_SENTINEL || entry_count == 0xFFFF {
            let (count, size, offset) = read_zip64_end_of_central_dir(&mut reader, eocd_offset)?;
            entry_count = count;
            central_size = size;
            central_offset = offset;
        }

        match central_offset.checked_add(central_size) {
            Some(end) if end <= eocd_offset => {}
            _ => {
                return Err(Error::MalformedPackage(format!(
                    "Central directory at {} ({} bytes) overlaps end record at {}",
                    central_offset, central_size, eocd_offset
                )));
            }
        }

        let mut raw = vec![0u8; central_size as usize];
        read_exact_at(&mut reader, central_offset, &mut raw)?;
        let central = parse_central_directory(&raw, entry_count)?;

        debug!(
            "Indexed {} central directory entries, comment {} bytes",
            central.len(),
            comment.len()
        );

        Ok(Self {
            reader,
            central,
            central_offset,
            comment,
            comment_offset,
        })
    }

    /// The archive comment
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Number of leading bytes covered by a whole-archive signature
    ///
    /// Everything up to, but excluding, the 2-byte comment length field.
    pub fn signed_len(&self) -> u64 {
        self.comment_offset - 2
    }

    /// Rewind and hand out the underlying reader
    pub fn into_inner(mut self) -> Result<R> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(self.reader)
    }

    /// Walk local headers in the order they are stored on disk
    pub fn local_entries(&mut self) -> Result<Vec<LocalEntry>> {
        let mut entries = Vec::new();
        let mut offset = 0u64;

        while offset + LOCAL_HEADER_SIZE <= self.central_offset {
            let mut signature = [0u8; 4];
            read_exact_at(&mut self.reader, offset, &mut signature)?;
            if u32::from_le_bytes(signature) != LOCAL_HEADER_SIGNATURE {
                break;
            }

            let entry = self.read_local_header(offset)?;
            let end = entry.end_offset()?;
            if end > self.central_offset {
                return Err(Error::MalformedPackage(format!(
                    "Entry '{}' runs past the central directory at {}",
                    entry.name, self.central_offset
                )));
            }
            offset = end;
            entries.push(entry);
        }

        if entries.is_empty() && !self.central.is_empty() {
            return Err(Error::MalformedPackage(
                "No local file header at start of archive".to_string(),
            ));
        }

        Ok(entries)
    }

    /// Look up an entry by exact name through the central directory
    pub fn find(&mut self, name: &str) -> Result<Option<LocalEntry>> {
        let Some(header_offset) = self.central.get(name).map(|c| c.header_offset) else {
            return Ok(None);
        };

        let entry = self.read_local_header(header_offset)?;
        if entry.name != name {
            return Err(Error::MalformedPackage(format!(
                "Local header at {} names '{}', central directory says '{}'",
                header_offset, entry.name, name
            )));
        }
        Ok(Some(entry))
    }

    /// Read and decompress an entry, refusing output larger than `limit`
    pub fn read_entry(&mut self, entry: &LocalEntry, limit: u64) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(entry.data_offset()?))?;
        let raw = (&mut self.reader).take(entry.compressed_size);

        let mut content = Vec::new();
        let read = match entry.method {
            METHOD_STORED => raw.take(limit.saturating_add(1)).read_to_end(&mut content),
            METHOD_DEFLATED => DeflateDecoder::new(raw)
                .take(limit.saturating_add(1))
                .read_to_end(&mut content),
            other => {
                return Err(Error::MalformedPackage(format!(
                    "Entry '{}' uses unsupported compression method {}",
                    entry.name, other
                )));
            }
        };
        read.map_err(|e| {
            Error::MalformedPackage(format!("Failed to read entry '{}': {}", entry.name, e))
        })?;

        if content.len() as u64 > limit {
            return Err(Error::MalformedPackage(format!(
                "Entry '{}' exceeds {} bytes",
                entry.name, limit
            )));
        }

        Ok(content)
    }

    fn read_local_header(&mut self, offset: u64) -> Result<LocalEntry> {
        let mut header = [0u8; LOCAL_HEADER_SIZE as usize];
        read_exact_at(&mut self.reader, offset, &mut header)?;

        if le_u32(&header, 0) != LOCAL_HEADER_SIGNATURE {
            return Err(Error::MalformedPackage(format!(
                "Bad local header signature at {}",
                offset
            )));
        }

        let flags = le_u16(&header, 6);
        let method = le_u16(&header, 8);
        let mut compressed_size = u64::from(le_u32(&header, 18));
        let mut uncompressed_size = u64::from(le_u32(&header, 22));
        let name_len = le_u16(&header, 26) as usize;
        let extra_len = le_u16(&header, 28) as usize;

        let mut variable = vec![0u8; name_len + extra_len];
        self.reader.read_exact(&mut variable).map_err(|e| truncated(e, offset))?;
        let name = String::from_utf8_lossy(&variable[..name_len]).into_owned();
        let extra = &variable[name_len..];

        let zip64 = find_extra_field(extra, ZIP64_EXTRA_ID);
        if let Some(field) = zip64 {
            let mut values = Zip64Values::new(field);
            if uncompressed_size == U32_SENTINEL {
                uncompressed_size = values.next(&name)?;
            }
            if compressed_size == U32_SENTINEL {
                compressed_size = values.next(&name)?;
            }
        }

        let mut trailer_len = 0;
        if flags & FLAG_DATA_DESCRIPTOR != 0 {
            let central = self.central.get(&name).ok_or_else(|| {
                Error::MalformedPackage(format!(
                    "Entry '{}' defers its size but is missing from the central directory",
                    name
                ))
            })?;
            compressed_size = central.compressed_size;
            uncompressed_size = central.uncompressed_size;

            let data_end = checked_sum(&[
                offset,
                LOCAL_HEADER_SIZE,
                name_len as u64,
                extra_len as u64,
                compressed_size,
            ])
            .ok_or_else(|| {
                Error::MalformedPackage(format!(
                    "Entry '{}' size {} is out of range",
                    name, compressed_size
                ))
            })?;
            let mut signature = [0u8; 4];
            read_exact_at(&mut self.reader, data_end, &mut signature)?;

            let size_field = if zip64.is_some() { 8 } else { 4 };
            trailer_len = 4 + 2 * size_field;
            if u32::from_le_bytes(signature) == DATA_DESCRIPTOR_SIGNATURE {
                trailer_len += 4;
            }
        }

        Ok(LocalEntry {
            name,
            name_len: name_len as u64,
            extra_len: extra_len as u64,
            method,
            compressed_size,
            uncompressed_size,
            header_offset: offset,
            trailer_len,
        })
    }
}

/// Sequential reader over the values of a zip64 extended information field
struct Zip64Values<'a> {
    field: &'a [u8],
    pos: usize,
}

impl<'a> Zip64Values<'a> {
    fn new(field: &'a [u8]) -> Self {
        Self { field, pos: 0 }
    }

    fn next(&mut self, name: &str) -> Result<u64> {
        if self.pos + 8 > self.field.len() {
            return Err(Error::MalformedPackage(format!(
                "Truncated zip64 field for '{}'",
                name
            )));
        }
        let value = le_u64(self.field, self.pos);
        self.pos += 8;
        Ok(value)
    }
}

/// Scan backwards for an end record whose comment runs exactly to the end
fn find_end_of_central_dir(tail: &[u8]) -> Option<usize> {
    let last = tail.len().checked_sub(END_OF_CENTRAL_DIR_SIZE as usize)?;
    (0..=last).rev().find(|&i| {
        le_u32(tail, i) == END_OF_CENTRAL_DIR_SIGNATURE
            && i + END_OF_CENTRAL_DIR_SIZE as usize + le_u16(tail, i + 20) as usize == tail.len()
    })
}

fn read_zip64_end_of_central_dir<R: Read + Seek>(
    reader: &mut R,
    eocd_offset: u64,
) -> Result<(u64, u64, u64)> {
    let locator_offset = eocd_offset.checked_sub(ZIP64_LOCATOR_SIZE).ok_or_else(|| {
        Error::MalformedPackage("Missing zip64 end of central directory locator".to_string())
    })?;

    let mut locator = [0u8; ZIP64_LOCATOR_SIZE as usize];
    read_exact_at(reader, locator_offset, &mut locator)?;
    if le_u32(&locator, 0) != ZIP64_LOCATOR_SIGNATURE {
        return Err(Error::MalformedPackage(
            "Bad zip64 end of central directory locator".to_string(),
        ));
    }

    let record_offset = le_u64(&locator, 8);
    let mut record = [0u8; ZIP64_END_OF_CENTRAL_DIR_SIZE];
    read_exact_at(reader, record_offset, &mut record)?;
    if le_u32(&record, 0) != ZIP64_END_OF_CENTRAL_DIR_SIGNATURE {
        return Err(Error::MalformedPackage(
            "Bad zip64 end of central directory record".to_string(),
        ));
    }

    Ok((le_u64(&record, 32), le_u64(&record, 40), le_u64(&record, 48)))
}

fn parse_central_directory(
    raw: &[u8],
    entry_count: u64,
) -> Result<HashMap<String, CentralEntry>> {
    let mut central = HashMap::new();
    let mut pos = 0usize;

    for _ in 0..entry_count {
        if pos + CENTRAL_HEADER_SIZE > raw.len() || le_u32(raw, pos) != CENTRAL_HEADER_SIGNATURE {
            return Err(Error::MalformedPackage(format!(
                "Bad central directory header at +{}",
                pos
            )));
        }

        let mut compressed_size = u64::from(le_u32(raw, pos + 20));
        let mut uncompressed_size = u64::from(le_u32(raw, pos + 24));
        let name_len = le_u16(raw, pos + 28) as usize;
        let extra_len = le_u16(raw, pos + 30) as usize;
        let comment_len = le_u16(raw, pos + 32) as usize;
        let mut header_offset = u64::from(le_u32(raw, pos + 42));

        let name_start = pos + CENTRAL_HEADER_SIZE;
        let extra_start = name_start + name_len;
        let next = extra_start + extra_len + comment_len;
        if next > raw.len() {
            return Err(Error::MalformedPackage(
                "Central directory entry runs past its end".to_string(),
            ));
        }

        let name = String::from_utf8_lossy(&raw[name_start..extra_start]).into_owned();

        let extra = &raw[extra_start..extra_start + extra_len];
        if let Some(field) = find_extra_field(extra, ZIP64_EXTRA_ID) {
            let mut values = Zip64Values::new(field);
            if uncompressed_size == U32_SENTINEL {
                uncompressed_size = values.next(&name)?;
            }
            if compressed_size == U32_SENTINEL {
                compressed_size = values.next(&name)?;
            }
            if header_offset == U32_SENTINEL {
                header_offset = values.next(&name)?;
            }
        }

        central.insert(
            name,
            CentralEntry {
                compressed_size,
                uncompressed_size,
                header_offset,
            },
        );
        pos = next;
    }

    Ok(central)
}

/// Find the payload of the extra-field record with the given id
fn find_extra_field(extra: &[u8], id: u16) -> Option<&[u8]> {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let field_id = le_u16(extra, pos);
        let size = le_u16(extra, pos + 2) as usize;
        let end = (pos + 4 + size).min(extra.len());
        if field_id == id {
            return Some(&extra[pos + 4..end]);
        }
        pos = end;
    }
    None
}

fn read_exact_at<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<()> {
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf).map_err(|e| truncated(e, offset))
}

fn truncated(e: io::Error, offset: u64) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::MalformedPackage(format!("Archive truncated reading at {}", offset))
    } else {
        Error::Io(e)
    }
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(bytes)
}
