//! APK signing.
//!
//! [`ApkSigner`] strips any previous signature from a container and applies
//! JAR signing ([`v1`]) and the APK Signature Scheme v2 ([`v2`]) with one
//! [`SigningIdentity`].
//!
//! # Signing Process
//!
//! 1. Open the input and drop old `META-INF` signature files
//! 2. Add `MANIFEST.MF`, `<NAME>.SF` and the PKCS#7 signature block (v1)
//! 3. Realign and lay out the container
//! 4. Digest the entries, central directory and EOCD, sign, and insert the
//!    APK Signing Block before the central directory (v2)
//! 5. Atomically write the result
//!
//! # Examples
//!
//! ```no_run
//! use apkseal::crypto::PrivateKeyCertificatePair;
//! use apkseal::signing::{ApkSigner, SigningIdentity};
//! use chrono::{Duration, Utc};
//!
//! let pair = PrivateKeyCertificatePair::generate("generated", Utc::now() + Duration::days(365))?;
//! let signer = ApkSigner::new(SigningIdentity::new("generated-signer", pair));
//! let artifact = signer.sign("patched.apk".as_ref(), "signed.apk".as_ref())?;
//! println!("Signed {} with {:?}", artifact.path.display(), artifact.schemes);
//! # Ok::<(), apkseal::Error>(())
//! ```

pub mod v1;
pub mod v2;

use crate::apk::{AlignmentRule, ZipContainer};
use crate::atomic::persist_atomically;
use crate::crypto::PrivateKeyCertificatePair;
use crate::error::{AssemblyError, SigningError};
use openssl::pkey::{Id, PKey, Private};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Smallest RSA modulus accepted for signing.
pub const MIN_RSA_KEY_BITS: u32 = 2048;

/// A signer display name and the key/certificate it signs with.
#[derive(Debug, Clone)]
pub struct SigningIdentity {
    name: String,
    pair: PrivateKeyCertificatePair,
}

impl SigningIdentity {
    /// Create an identity.
    pub fn new(name: impl Into<String>, pair: PrivateKeyCertificatePair) -> Self {
        Self {
            name: name.into(),
            pair,
        }
    }

    /// Signer display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key and certificate.
    pub fn pair(&self) -> &PrivateKeyCertificatePair {
        &self.pair
    }
}

/// Signature schemes applied by [`ApkSigner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// JAR signing.
    V1,
    /// APK Signature Scheme v2.
    V2,
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureScheme::V1 => f.write_str("v1"),
            SignatureScheme::V2 => f.write_str("v2"),
        }
    }
}

/// Result of a signing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedArtifact {
    /// Path of the signed file.
    pub path: PathBuf,
    /// Schemes applied, in application order.
    pub schemes: Vec<SignatureScheme>,
}

/// Signature algorithm selected from the signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RsaPkcs1Sha256,
    /// ECDSA with SHA-256.
    EcdsaSha256,
}

impl SignatureAlgorithm {
    /// Pick the algorithm for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::UnsupportedKey`] for RSA keys below 2048 bits
    /// and for keys that are neither RSA nor EC.
    pub fn for_key(key: &PKey<Private>) -> Result<Self, SigningError> {
        match key.id() {
            Id::RSA if key.bits() >= MIN_RSA_KEY_BITS => Ok(SignatureAlgorithm::RsaPkcs1Sha256),
            Id::RSA => Err(SigningError::UnsupportedKey(format!(
                "RSA key of {} bits, at least {} required",
                key.bits(),
                MIN_RSA_KEY_BITS
            ))),
            Id::EC => Ok(SignatureAlgorithm::EcdsaSha256),
            other => Err(SigningError::UnsupportedKey(format!("Key type {:?}", other))),
        }
    }

    /// Algorithm id in the APK Signing Block.
    pub fn v2_id(self) -> u32 {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha256 => 0x0103,
            SignatureAlgorithm::EcdsaSha256 => 0x0201,
        }
    }

    /// Extension of the JAR signature block file.
    pub fn v1_block_extension(self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha256 => "RSA",
            SignatureAlgorithm::EcdsaSha256 => "EC",
        }
    }
}

/// Signs containers with one identity.
#[derive(Debug, Clone)]
pub struct ApkSigner {
    identity: SigningIdentity,
    v1: bool,
    v2: bool,
}

impl ApkSigner {
    /// Signer applying both v1 and v2.
    pub fn new(identity: SigningIdentity) -> Self {
        Self {
            identity,
            v1: true,
            v2: true,
        }
    }

    /// Enable or disable JAR signing.
    pub fn v1_enabled(mut self, enabled: bool) -> Self {
        self.v1 = enabled;
        self
    }

    /// Enable or disable APK Signature Scheme v2.
    pub fn v2_enabled(mut self, enabled: bool) -> Self {
        self.v2 = enabled;
        self
    }

    /// The identity signatures are made with.
    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Sign `input` into `output`.
    ///
    /// `input` is not modified. `output` is replaced atomically and may be
    /// the same path as `input`.
    ///
    /// # Errors
    ///
    /// - [`SigningError::InvalidContainer`] if `input` is not a readable container
    /// - [`SigningError::UnsupportedKey`] if the key is rejected or no scheme is enabled
    /// - [`SigningError::Crypto`] if a signing primitive fails
    /// - [`SigningError::Io`] if reading or writing fails
    #[instrument(skip(self), fields(signer = %self.identity.name))]
    pub fn sign(&self, input: &Path, output: &Path) -> Result<SignedArtifact, SigningError> {
        if !self.v1 && !self.v2 {
            return Err(SigningError::UnsupportedKey(
                "No signature scheme enabled".into(),
            ));
        }

        let algorithm = SignatureAlgorithm::for_key(self.identity.pair.private_key())?;

        let mut container =
            ZipContainer::open(input, AlignmentRule::apk()).map_err(container_error)?;

        let stripped = container.retain(|e| !v1::is_signature_file(e.name()));
        debug!(stripped, "Removed previous signature files");

        let mut schemes = Vec::new();

        if self.v1 {
            v1::sign(&mut container, &self.identity, algorithm, self.v2)?;
            schemes.push(SignatureScheme::V1);
        }

        container.realign().map_err(container_error)?;
        let layout = container.layout().map_err(container_error)?;

        let signing_block = if self.v2 {
            let block = v2::signing_block(&layout, &self.identity, algorithm)?;
            schemes.push(SignatureScheme::V2);
            Some(block)
        } else {
            None
        };

        persist_atomically(output, |file| match &signing_block {
            Some(block) => {
                let central_directory_offset = u32::try_from(layout.entries.len() + block.len())
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "APK too large"))?;
                file.write_all(&layout.entries)?;
                file.write_all(block)?;
                file.write_all(&layout.central_directory)?;
                file.write_all(&layout.end_of_central_directory_at(central_directory_offset))
            }
            None => layout.write_to(file),
        })?;

        info!(
            output = %output.display(),
            entries = container.len(),
            schemes = ?schemes,
            "Signed APK"
        );

        Ok(SignedArtifact {
            path: output.to_path_buf(),
            schemes,
        })
    }

    /// Sign the container at `path`, replacing it.
    pub fn sign_in_place(&self, path: &Path) -> Result<SignedArtifact, SigningError> {
        self.sign(path, path)
    }
}

fn container_error(e: AssemblyError) -> SigningError {
    match e {
        AssemblyError::Io(e) => SigningError::Io(e),
        other => SigningError::InvalidContainer(other.to_string()),
    }
}
