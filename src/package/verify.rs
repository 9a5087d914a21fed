// src/package/verify.rs

//! Package authenticity checks
//!
//! A package must carry a valid signature and must describe the same build
//! the server announced before the download started. The second check stops
//! an older package that is still validly signed from being substituted.

use super::archive::Archive;
use crate::error::{Error, Result};
use crate::transfer::PackageHandle;
use sequoia_openpgp as openpgp;
use openpgp::cert::{Cert, CertParser};
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
};
use openpgp::policy::StandardPolicy;
use openpgp::KeyHandle;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Entry holding the package's `key=value` metadata
pub const METADATA_ENTRY: &str = "META-INF/com/android/metadata";

/// Metadata key naming the build timestamp the package installs
pub const POST_TIMESTAMP_KEY: &str = "post-timestamp";

const METADATA_LIMIT: u64 = 1024 * 1024;

/// Platform signature verification, treated as pass/fail
pub trait SignatureCheck: Send + Sync {
    /// Verify the package at `path`; any failure is a `Verification` error
    fn verify_package(&self, path: &Path) -> Result<()>;
}

/// Verifies an ASCII-armored detached OpenPGP signature in the archive comment
///
/// The signature covers every byte of the archive up to the 2-byte comment
/// length field, so appending it as the comment does not change the signed
/// content.
pub struct OpenPgpSignatureCheck {
    certs: Vec<Cert>,
}

impl OpenPgpSignatureCheck {
    /// Trust the given certificates
    pub fn new(certs: Vec<Cert>) -> Self {
        Self { certs }
    }

    /// Load trusted certificates from a keyring file (binary or armored)
    pub fn from_keyring(path: &Path) -> Result<Self> {
        let certs = CertParser::from_file(path)
            .map_err(|e| {
                Error::InitError(format!("Failed to read keyring {}: {}", path.display(), e))
            })?
            .collect::<openpgp::Result<Vec<Cert>>>()
            .map_err(|e| {
                Error::InitError(format!("Failed to parse keyring {}: {}", path.display(), e))
            })?;

        if certs.is_empty() {
            return Err(Error::InitError(format!(
                "Keyring {} contains no certificates",
                path.display()
            )));
        }

        debug!("Loaded {} trusted certificates", certs.len());
        Ok(Self::new(certs))
    }
}

impl SignatureCheck for OpenPgpSignatureCheck {
    fn verify_package(&self, path: &Path) -> Result<()> {
        let archive = Archive::open(path).map_err(|e| Error::Verification(e.to_string()))?;

        let signature = archive.comment().to_vec();
        if signature.is_empty() {
            return Err(Error::Verification("Package is not signed".to_string()));
        }
        let signed_len = archive.signed_len();
        let reader = archive.into_inner()?;

        let policy = StandardPolicy::new();
        let helper = TrustedKeys {
            certs: self.certs.clone(),
        };

        let mut verifier = DetachedVerifierBuilder::from_bytes(&signature)
            .and_then(|builder| builder.with_policy(&policy, None, helper))
            .map_err(|e| Error::Verification(format!("Unusable signature: {}", e)))?;

        verifier
            .verify_reader(reader.take(signed_len))
            .map_err(|e| Error::Verification(e.to_string()))?;

        debug!("Signature over {} bytes verified", signed_len);
        Ok(())
    }
}

struct TrustedKeys {
    certs: Vec<Cert>,
}

impl VerificationHelper for TrustedKeys {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.clone())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.iter().any(|r| r.is_ok()) {
                    return Ok(());
                }
                return Err(anyhow::anyhow!("No valid signature from a trusted key"));
            }
        }
        Err(anyhow::anyhow!("No signature found"))
    }
}

/// Signature plus metadata cross-check for downloaded packages
pub struct Verifier {
    signature: Box<dyn SignatureCheck>,
}

impl Verifier {
    pub fn new(signature: Box<dyn SignatureCheck>) -> Self {
        Self { signature }
    }

    /// Check the package signature, then that it installs `declared_timestamp`
    pub fn verify(&self, handle: &PackageHandle, declared_timestamp: i64) -> Result<()> {
        debug!("Verifying signature of {}", handle.path().display());
        self.signature
            .verify_package(handle.path())
            .map_err(|e| match e {
                Error::Verification(_) => e,
                other => Error::Verification(other.to_string()),
            })?;

        let mut archive = Archive::open(handle.path())?;
        let entry = archive.find(METADATA_ENTRY)?.ok_or_else(|| {
            Error::MalformedPackage(format!("Package has no {} entry", METADATA_ENTRY))
        })?;
        let raw = archive.read_entry(&entry, METADATA_LIMIT)?;

        let embedded = parse_post_timestamp(&String::from_utf8_lossy(&raw))?.ok_or_else(|| {
            Error::MalformedPackage(format!("Package metadata has no {}", POST_TIMESTAMP_KEY))
        })?;

        if embedded != declared_timestamp {
            return Err(Error::StaleOrTampered {
                declared: declared_timestamp,
                embedded,
            });
        }

        info!("Package verified for build timestamp {}", embedded);
        Ok(())
    }
}

/// Find the first `post-timestamp=<n>` line in package metadata
pub fn parse_post_timestamp(metadata: &str) -> Result<Option<i64>> {
    for line in metadata.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() == POST_TIMESTAMP_KEY {
            let value = value.trim();
            return value.parse::<i64>().map(Some).map_err(|e| {
                Error::MalformedPackage(format!(
                    "Invalid {} '{}': {}",
                    POST_TIMESTAMP_KEY, value, e
                ))
            });
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::testutil::ZipBuilder;
    use openpgp::armor;
    use openpgp::cert::CertBuilder;
    use openpgp::serialize::stream::{Armorer, Message, Signer};
    use std::fs;
    use std::io::Write;

    struct Accept;

    impl SignatureCheck for Accept {
        fn verify_package(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct Reject;

    impl SignatureCheck for Reject {
        fn verify_package(&self, _path: &Path) -> Result<()> {
            Err(Error::Verification("bad signature".to_string()))
        }
    }

    fn package_with_metadata(metadata: &[u8]) -> Vec<u8> {
        ZipBuilder::new()
            .deflated(METADATA_ENTRY, metadata)
            .stored("payload.bin", b"payload")
            .build()
    }

    fn write_package(bytes: &[u8]) -> (tempfile::TempDir, PackageHandle) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("update.zip");
        fs::write(&path, bytes).unwrap();
        let handle = PackageHandle::existing(&path).unwrap();
        (dir, handle)
    }

    /// Append an armored detached signature as the archive comment
    fn sign_archive(cert: &Cert, unsigned: &[u8]) -> Vec<u8> {
        // Drop the empty comment length; the signature covers what precedes it
        let prefix = &unsigned[..unsigned.len() - 2];

        let policy = StandardPolicy::new();
        let keypair = cert
            .keys()
            .unencrypted_secret()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .unwrap()
            .key()
            .clone()
            .into_keypair()
            .unwrap();

        let mut signature = Vec::new();
        {
            let message = Message::new(&mut signature);
            let message = Armorer::new(message)
                .kind(armor::Kind::Signature)
                .build()
                .unwrap();
            let mut signer = Signer::new(message, keypair).detached().build().unwrap();
            signer.write_all(prefix).unwrap();
            signer.finalize().unwrap();
        }

        let mut signed = prefix.to_vec();
        signed.extend_from_slice(&(signature.len() as u16).to_le_bytes());
        signed.extend_from_slice(&signature);
        signed
    }

    fn generate_cert() -> Cert {
        let (cert, _revocation) = CertBuilder::general_purpose(None, Some("ota@example.com"))
            .generate()
            .unwrap();
        cert
    }

    #[test]
    fn test_parse_post_timestamp() {
        let metadata = "ota-type=AB\npost-build=x/y/z\npost-timestamp=2000\npre-device=marlin\n";
        assert_eq!(parse_post_timestamp(metadata).unwrap(), Some(2000));
    }

    #[test]
    fn test_parse_post_timestamp_first_match_wins() {
        let metadata = "post-timestamp=1\npost-timestamp=2\n";
        assert_eq!(parse_post_timestamp(metadata).unwrap(), Some(1));
    }

    #[test]
    fn test_parse_post_timestamp_missing_or_invalid() {
        assert_eq!(parse_post_timestamp("ota-type=AB\n").unwrap(), None);
        assert!(matches!(
            parse_post_timestamp("post-timestamp=later\n"),
            Err(Error::MalformedPackage(_))
        ));
    }

    #[test]
    fn test_verify_matching_timestamp() {
        let (_dir, handle) = write_package(&package_with_metadata(b"post-timestamp=2000\n"));
        let verifier = Verifier::new(Box::new(Accept));
        verifier.verify(&handle, 2000).unwrap();
    }

    #[test]
    fn test_verify_stale_package() {
        let (_dir, handle) = write_package(&package_with_metadata(b"post-timestamp=1500\n"));
        let verifier = Verifier::new(Box::new(Accept));

        let err = verifier.verify(&handle, 2000).unwrap_err();
        assert!(matches!(
            err,
            Error::StaleOrTampered {
                declared: 2000,
                embedded: 1500
            }
        ));
    }

    #[test]
    fn test_verify_missing_metadata_entry() {
        let bytes = ZipBuilder::new().stored("payload.bin", b"payload").build();
        let (_dir, handle) = write_package(&bytes);
        let verifier = Verifier::new(Box::new(Accept));

        assert!(matches!(
            verifier.verify(&handle, 2000),
            Err(Error::MalformedPackage(_))
        ));
    }

    #[test]
    fn test_verify_missing_post_timestamp() {
        let (_dir, handle) = write_package(&package_with_metadata(b"ota-type=AB\n"));
        let verifier = Verifier::new(Box::new(Accept));

        assert!(matches!(
            verifier.verify(&handle, 2000),
            Err(Error::MalformedPackage(_))
        ));
    }

    #[test]
    fn test_verify_rejected_signature_skips_metadata() {
        let (_dir, handle) = write_package(&package_with_metadata(b"post-timestamp=1\n"));
        let verifier = Verifier::new(Box::new(Reject));

        assert!(matches!(
            verifier.verify(&handle, 2000),
            Err(Error::Verification(_))
        ));
    }

    #[test]
    fn test_openpgp_signature_round_trip() {
        let cert = generate_cert();
        let signed = sign_archive(&cert, &package_with_metadata(b"post-timestamp=2000\n"));
        let (_dir, handle) = write_package(&signed);

        let check = OpenPgpSignatureCheck::new(vec![cert]);
        check.verify_package(handle.path()).unwrap();

        let verifier = Verifier::new(Box::new(check));
        verifier.verify(&handle, 2000).unwrap();
    }

    #[test]
    fn test_openpgp_rejects_tampered_package() {
        let cert = generate_cert();
        let mut signed = sign_archive(&cert, &package_with_metadata(b"post-timestamp=2000\n"));
        // Flip a byte of the first local header's modification time
        signed[10] ^= 0xFF;
        let (_dir, handle) = write_package(&signed);

        let check = OpenPgpSignatureCheck::new(vec![cert]);
        assert!(matches!(
            check.verify_package(handle.path()),
            Err(Error::Verification(_))
        ));
    }

    #[test]
    fn test_openpgp_rejects_untrusted_key() {
        let signer = generate_cert();
        let trusted = generate_cert();
        let signed = sign_archive(&signer, &package_with_metadata(b"post-timestamp=2000\n"));
        let (_dir, handle) = write_package(&signed);

        let check = OpenPgpSignatureCheck::new(vec![trusted]);
        assert!(matches!(
            check.verify_package(handle.path()),
            Err(Error::Verification(_))
        ));
    }

    #[test]
    fn test_openpgp_rejects_unsigned_package() {
        let (_dir, handle) = write_package(&package_with_metadata(b"post-timestamp=2000\n"));
        let check = OpenPgpSignatureCheck::new(vec![generate_cert()]);

        assert!(matches!(
            check.verify_package(handle.path()),
            Err(Error::Verification(_))
        ));
    }
}
