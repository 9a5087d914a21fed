// src/package/mod.rs

//! Update package inspection
//!
//! This module provides functionality for:
//! - Reading zip archives in physical entry order
//! - Verifying a package's signature and embedded build timestamp
//! - Locating the payload the update engine reads in place

pub mod archive;
pub mod locator;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil;

pub use locator::{EntryDescriptor, PackageLayout, locate, payload_offset};
pub use verify::{OpenPgpSignatureCheck, SignatureCheck, Verifier};
