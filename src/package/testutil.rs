// src/package/testutil.rs

//! In-memory zip writer for building package fixtures
//!
//! Shared by unit tests and by `tests/common`, so it only depends on std
//! and flate2.

use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;

/// Opaque extra field of `len` bytes under an unknown header id
pub fn padding_extra(len: usize) -> Vec<u8> {
    let mut extra = vec![0xfe, 0xca];
    extra.extend_from_slice(&((len - 4) as u16).to_le_bytes());
    extra.resize(len, 0);
    extra
}

struct Pending {
    name: String,
    extra: Vec<u8>,
    method: u16,
    crc: u32,
    data: Vec<u8>,
    uncompressed_size: u32,
    descriptor: bool,
}

#[derive(Default)]
pub struct ZipBuilder {
    entries: Vec<Pending>,
    comment: Vec<u8>,
    reverse_central: bool,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, Vec::new(), false, false)
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, Vec::new(), true, false)
    }

    pub fn stored_with_extra(self, name: &str, data: &[u8], extra: Vec<u8>) -> Self {
        self.entry(name, data, extra, false, false)
    }

    pub fn deflated_with_descriptor(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, data, Vec::new(), true, true)
    }

    pub fn dir(self, name: &str) -> Self {
        self.entry(name, b"", Vec::new(), false, false)
    }

    pub fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// List the central directory in reverse of the physical order
    pub fn reverse_central(mut self) -> Self {
        self.reverse_central = true;
        self
    }

    fn entry(
        mut self,
        name: &str,
        data: &[u8],
        extra: Vec<u8>,
        deflate: bool,
        descriptor: bool,
    ) -> Self {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        let (method, stored) = if deflate {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).unwrap();
            (8, encoder.finish().unwrap())
        } else {
            (0, data.to_vec())
        };
        self.entries.push(Pending {
            name: name.to_string(),
            extra,
            method,
            crc: crc.sum(),
            data: stored,
            uncompressed_size: data.len() as u32,
            descriptor,
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offsets = Vec::new();

        for e in &self.entries {
            offsets.push(out.len() as u32);
            let flags: u16 = if e.descriptor { 1 << 3 } else { 0 };
            let (crc, csize, usize_) = if e.descriptor {
                (0, 0, 0)
            } else {
                (e.crc, e.data.len() as u32, e.uncompressed_size)
            };
            out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&e.method.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&csize.to_le_bytes());
            out.extend_from_slice(&usize_.to_le_bytes());
            out.extend_from_slice(&(e.name.len() as u16).to_le_bytes());
            out.extend_from_slice(&(e.extra.len() as u16).to_le_bytes());
            out.extend_from_slice(e.name.as_bytes());
            out.extend_from_slice(&e.extra);
            out.extend_from_slice(&e.data);
            if e.descriptor {
                out.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
                out.extend_from_slice(&e.crc.to_le_bytes());
                out.extend_from_slice(&(e.data.len() as u32).to_le_bytes());
                out.extend_from_slice(&e.uncompressed_size.to_le_bytes());
            }
        }

        let central_start = out.len() as u32;
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        if self.reverse_central {
            order.reverse();
        }
        for i in order {
            let e = &self.entries[i];
            let flags: u16 = if e.descriptor { 1 << 3 } else { 0 };
            out.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&e.method.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&e.crc.to_le_bytes());
            out.extend_from_slice(&(e.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&e.uncompressed_size.to_le_bytes());
            out.extend_from_slice(&(e.name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&offsets[i].to_le_bytes());
            out.extend_from_slice(e.name.as_bytes());
        }
        let central_size = out.len() as u32 - central_start;

        out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out.extend_from_slice(&central_size.to_le_bytes());
        out.extend_from_slice(&central_start.to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.comment);
        out
    }
}
