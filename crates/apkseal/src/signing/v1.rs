//! JAR signing (APK Signature Scheme v1).
//!
//! Adds three entries to the container:
//!
//! - `META-INF/MANIFEST.MF` with a SHA-256 digest of every file entry
//! - `META-INF/<NAME>.SF` with digests of the manifest and each of its sections
//! - `META-INF/<NAME>.RSA` (or `.EC`), a detached PKCS#7 signature of the `.SF`
//!
//! Sections are sorted by entry name and the PKCS#7 block carries no signed
//! attributes, so the output only depends on the entry contents and the key.

use super::{SignatureAlgorithm, SigningIdentity};
use crate::apk::ZipContainer;
use crate::error::SigningError;
use openssl::base64::encode_block;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::x509::X509;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Path of the JAR manifest.
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

const META_INF: &str = "META-INF/";

/// Maximum line length in manifest files, in bytes, excluding the line break.
const MAX_LINE_LENGTH: usize = 72;

/// Maximum length of the signature file base name.
const MAX_SIGNATURE_NAME_LENGTH: usize = 8;

/// Base name used when the signer name has no usable characters.
const FALLBACK_SIGNATURE_NAME: &str = "CERT";

const SIGNATURE_FILE_EXTENSIONS: [&str; 4] = [".SF", ".RSA", ".DSA", ".EC"];

/// Whether `path` is part of a JAR signature.
///
/// Matches the manifest and `.SF`, `.RSA`, `.DSA` and `.EC` files directly
/// inside `META-INF/`, ignoring case.
pub fn is_signature_file(path: &str) -> bool {
    let upper = path.to_ascii_uppercase();
    if upper == MANIFEST_PATH.to_ascii_uppercase() {
        return true;
    }

    match upper.strip_prefix(META_INF) {
        Some(file) if !file.contains('/') => SIGNATURE_FILE_EXTENSIONS
            .iter()
            .any(|ext| file.ends_with(ext)),
        _ => false,
    }
}

/// Base name of the `.SF` and signature block files for a signer.
///
/// Uppercased, characters outside `[A-Z0-9_-]` replaced with `_`, truncated
/// to 8 characters.
pub fn signature_file_name(signer: &str) -> String {
    let name: String = signer
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .map(|c| {
            if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SIGNATURE_NAME_LENGTH)
        .collect();

    if name.is_empty() {
        FALLBACK_SIGNATURE_NAME.to_string()
    } else {
        name
    }
}

/// Append `name: value` to `out`, wrapping at 72 bytes with single-space
/// continuation lines.
fn write_attribute(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{}: {}", name, value);
    let bytes = line.as_bytes();

    let first = bytes.len().min(MAX_LINE_LENGTH);
    out.extend(&bytes[..first]);
    out.extend(b"\r\n");

    for chunk in bytes[first..].chunks(MAX_LINE_LENGTH - 1) {
        out.push(b' ');
        out.extend(chunk);
        out.extend(b"\r\n");
    }
}

fn sha256_base64(data: &[u8]) -> String {
    encode_block(&Sha256::digest(data))
}

/// The manifest and its per-entry sections.
pub(crate) struct Manifest {
    pub(crate) bytes: Vec<u8>,
    /// `(entry name, section bytes)` in manifest order.
    pub(crate) sections: Vec<(String, Vec<u8>)>,
}

/// Build `MANIFEST.MF` for every file entry of `container`.
pub(crate) fn build_manifest(container: &ZipContainer, created_by: &str) -> Result<Manifest, SigningError> {
    let mut bytes = Vec::new();
    write_attribute(&mut bytes, "Manifest-Version", "1.0");
    write_attribute(&mut bytes, "Created-By", created_by);
    bytes.extend(b"\r\n");

    let mut entries: Vec<_> = container
        .entries()
        .filter(|e| !e.is_directory() && !is_signature_file(e.name()))
        .collect();
    entries.sort_by(|a, b| a.name().cmp(b.name()));

    let mut sections = Vec::with_capacity(entries.len());
    for entry in entries {
        let contents = entry
            .contents()
            .map_err(|e| SigningError::InvalidContainer(e.to_string()))?;

        let mut section = Vec::new();
        write_attribute(&mut section, "Name", entry.name());
        write_attribute(&mut section, "SHA-256-Digest", &sha256_base64(&contents));
        section.extend(b"\r\n");

        bytes.extend(&section);
        sections.push((entry.name().to_string(), section));
    }

    Ok(Manifest { bytes, sections })
}

/// Build the `.SF` signature file for `manifest`.
pub(crate) fn build_signature_file(manifest: &Manifest, created_by: &str, v2_signed: bool) -> Vec<u8> {
    let mut sf = Vec::new();
    write_attribute(&mut sf, "Signature-Version", "1.0");
    write_attribute(&mut sf, "Created-By", created_by);
    write_attribute(&mut sf, "SHA-256-Digest-Manifest", &sha256_base64(&manifest.bytes));
    if v2_signed {
        write_attribute(&mut sf, "X-Android-APK-Signed", "2");
    }
    sf.extend(b"\r\n");

    for (name, section) in &manifest.sections {
        write_attribute(&mut sf, "Name", name);
        write_attribute(&mut sf, "SHA-256-Digest", &sha256_base64(section));
        sf.extend(b"\r\n");
    }

    sf
}

/// Add the JAR signature of `container` for `identity`.
///
/// Previous signature files must already have been removed.
pub fn sign(
    container: &mut ZipContainer,
    identity: &SigningIdentity,
    algorithm: SignatureAlgorithm,
    v2_signed: bool,
) -> Result<(), SigningError> {
    let manifest = build_manifest(container, identity.name())?;
    let signature_file = build_signature_file(&manifest, identity.name(), v2_signed);

    let pair = identity.pair();
    let certs: Stack<X509> = Stack::new()?;
    let flags = Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY | Pkcs7Flags::NOATTR | Pkcs7Flags::NOSMIMECAP;
    let signature_block = Pkcs7::sign(pair.certificate(), pair.private_key(), &certs, &signature_file, flags)?
        .to_der()?;

    let base = format!("{}{}", META_INF, signature_file_name(identity.name()));
    let sf_path = format!("{}.SF", base);
    let block_path = format!("{}.{}", base, algorithm.v1_block_extension());

    debug!(
        sections = manifest.sections.len(),
        signature_file = %sf_path,
        "Adding JAR signature"
    );

    for (path, data) in [
        (MANIFEST_PATH, manifest.bytes.as_slice()),
        (sf_path.as_str(), signature_file.as_slice()),
        (block_path.as_str(), signature_block.as_slice()),
    ] {
        container
            .add(path, data, true)
            .map_err(|e| SigningError::InvalidContainer(e.to_string()))?;
    }

    Ok(())
}
