//! APK Signature Scheme v2.
//!
//! The scheme signs a digest of the whole file except the signing block
//! itself. The file is split into three sections:
//!
//! ```text
//! ┌──────────────────────┐
//! │ Entries              │  digested
//! ├──────────────────────┤
//! │ APK Signing Block    │  not digested
//! ├──────────────────────┤
//! │ Central directory    │  digested
//! ├──────────────────────┤
//! │ EOCD                 │  digested, CD offset = start of signing block
//! └──────────────────────┘
//! ```
//!
//! Each section is split into 1 MiB chunks. A chunk digest is
//! `SHA-256(0xa5 || u32 length || chunk)` and the content digest is
//! `SHA-256(0x5a || u32 chunk count || chunk digests)`.
//!
//! All integers in this module are little-endian and every length-prefixed
//! value is prefixed with a `u32` byte count.

use super::{SignatureAlgorithm, SigningIdentity};
use crate::apk::ZipLayout;
use crate::error::SigningError;
use openssl::hash::MessageDigest;
use openssl::sign::Signer;
use sha2::{Digest, Sha256};
use tracing::debug;

/// ID of the v2 signature scheme block inside the APK Signing Block.
pub const APK_SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109_871a;

/// Magic at the end of the APK Signing Block.
pub const APK_SIGNING_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";

/// Chunk size for content digests.
const CHUNK_SIZE: usize = 1024 * 1024;

const CHUNK_PREFIX: u8 = 0xa5;
const TOP_LEVEL_PREFIX: u8 = 0x5a;

/// Compute the chunked SHA-256 content digest over `sections`.
///
/// Chunks never span sections.
pub fn content_digest(sections: &[&[u8]]) -> [u8; 32] {
    let chunk_count: usize = sections
        .iter()
        .map(|s| s.len().div_ceil(CHUNK_SIZE))
        .sum();

    let mut top = Sha256::new();
    top.update([TOP_LEVEL_PREFIX]);
    top.update((chunk_count as u32).to_le_bytes());

    for section in sections {
        for chunk in section.chunks(CHUNK_SIZE) {
            let mut hasher = Sha256::new();
            hasher.update([CHUNK_PREFIX]);
            hasher.update((chunk.len() as u32).to_le_bytes());
            hasher.update(chunk);
            top.update(hasher.finalize());
        }
    }

    top.finalize().into()
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend(&value.to_le_bytes());
}

fn put_length_prefixed(buf: &mut Vec<u8>, value: &[u8]) -> Result<(), SigningError> {
    let len = u32::try_from(value.len())
        .map_err(|_| SigningError::InvalidContainer("Signing block value too large".into()))?;
    put_u32(buf, len);
    buf.extend(value);
    Ok(())
}

/// Encode the signed-data structure: digests, certificates, no attributes.
fn signed_data(algorithm: SignatureAlgorithm, digest: &[u8], certificate: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut digest_entry = Vec::new();
    put_u32(&mut digest_entry, algorithm.v2_id());
    put_length_prefixed(&mut digest_entry, digest)?;

    let mut digests = Vec::new();
    put_length_prefixed(&mut digests, &digest_entry)?;

    let mut certificates = Vec::new();
    put_length_prefixed(&mut certificates, certificate)?;

    let mut data = Vec::new();
    put_length_prefixed(&mut data, &digests)?;
    put_length_prefixed(&mut data, &certificates)?;
    put_length_prefixed(&mut data, &[])?;
    Ok(data)
}

/// Build the APK Signing Block for `layout`.
///
/// The block is meant to be inserted between `layout.entries` and
/// `layout.central_directory`, with the EOCD's central directory offset moved
/// past it.
pub fn signing_block(
    layout: &ZipLayout,
    identity: &SigningIdentity,
    algorithm: SignatureAlgorithm,
) -> Result<Vec<u8>, SigningError> {
    let block_offset = u32::try_from(layout.entries.len())
        .map_err(|_| SigningError::InvalidContainer("Entries section too large".into()))?;
    let eocd = layout.end_of_central_directory_at(block_offset);
    let digest = content_digest(&[&layout.entries, &layout.central_directory, &eocd]);

    let pair = identity.pair();
    let certificate = pair.certificate().to_der()?;
    let public_key = pair.certificate().public_key()?.public_key_to_der()?;

    let signed_data = signed_data(algorithm, &digest, &certificate)?;

    let mut signer = Signer::new(MessageDigest::sha256(), pair.private_key())?;
    signer.update(&signed_data)?;
    let signature = signer.sign_to_vec()?;

    let mut signature_entry = Vec::new();
    put_u32(&mut signature_entry, algorithm.v2_id());
    put_length_prefixed(&mut signature_entry, &signature)?;

    let mut signatures = Vec::new();
    put_length_prefixed(&mut signatures, &signature_entry)?;

    let mut signer_block = Vec::new();
    put_length_prefixed(&mut signer_block, &signed_data)?;
    put_length_prefixed(&mut signer_block, &signatures)?;
    put_length_prefixed(&mut signer_block, &public_key)?;

    let mut signers = Vec::new();
    put_length_prefixed(&mut signers, &signer_block)?;

    let mut scheme_block = Vec::new();
    put_length_prefixed(&mut scheme_block, &signers)?;

    // ID-value pair: u64 length of (id + value), u32 id, value.
    let mut pairs = Vec::new();
    pairs.extend(&((4 + scheme_block.len()) as u64).to_le_bytes());
    put_u32(&mut pairs, APK_SIGNATURE_SCHEME_V2_BLOCK_ID);
    pairs.extend(&scheme_block);

    // Size excludes the leading size field: pairs + trailing size + magic.
    let block_size = (pairs.len() + 8 + APK_SIGNING_BLOCK_MAGIC.len()) as u64;

    let mut block = Vec::with_capacity(block_size as usize + 8);
    block.extend(&block_size.to_le_bytes());
    block.extend(&pairs);
    block.extend(&block_size.to_le_bytes());
    block.extend(APK_SIGNING_BLOCK_MAGIC);

    debug!(
        algorithm = ?algorithm,
        size = block.len(),
        "Built APK Signing Block"
    );

    Ok(block)
}
