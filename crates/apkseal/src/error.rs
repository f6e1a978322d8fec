//! Error types for apkseal operations.
//!
//! Each pipeline stage has its own error enum so callers can react to the
//! specific failure:
//!
//! - [`AssemblyError`] - merging blobs and resources into the target container
//! - [`KeyError`] - opening, creating and reading the keystore
//! - [`SigningError`] - applying signature schemes to a container
//!
//! [`enum@Error`] wraps all three for the [`crate::ApkSeal`] pipeline.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using [`enum@Error`]

use thiserror::Error;

/// Error type for the whole pipeline.
///
/// # Examples
///
/// ```no_run
/// use apkseal::{ApkSeal, Error, KeyError};
///
/// let result = ApkSeal::new("release.keystore").sign("patched.apk", "signed.apk");
/// match result {
///     Ok(artifact) => println!("Signed: {}", artifact.path.display()),
///     Err(Error::Key(KeyError::InvalidStorePassword)) => eprintln!("Wrong keystore password"),
///     Err(Error::Key(KeyError::AliasNotFound(alias))) => eprintln!("No key named {alias}"),
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// The container could not be assembled.
    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    /// Signing material could not be loaded or created.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The container could not be signed.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// I/O outside of a specific stage, such as preparing the working copy.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid pipeline configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure while merging blobs and resources into a target container.
///
/// All variants are fatal. The target container is left in an undefined
/// state and must be discarded.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Reading the target, the compiled overlay or the raw overlay tree failed,
    /// or writing the container back failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The container's zip structure is unreadable.
    #[error("Corrupt container: {0}")]
    Corrupt(String),

    /// An entry uses a compression method other than stored or deflate.
    #[error("Unsupported compression method {method} for entry {name}")]
    UnsupportedCompression {
        /// Entry path.
        name: String,
        /// Compression method as reported by the zip reader.
        method: String,
    },

    /// A file entry would shadow a directory entry with the same path.
    #[error("Entry {0} collides with a directory entry")]
    DirectoryCollision(String),

    /// The container needs ZIP64 structures, which are not written.
    #[error("Container too large: {0}")]
    TooLarge(String),
}

/// Failure while loading or creating signing material.
///
/// The password and alias variants are distinct so that a caller can ask the
/// user for the specific credential that was wrong. None of the messages carry
/// key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The keystore could not be decrypted with the supplied store password.
    #[error("Invalid keystore password")]
    InvalidStorePassword,

    /// The keystore does not contain the requested alias.
    #[error("Keystore does not contain alias {0}")]
    AliasNotFound(String),

    /// The entry's private key could not be recovered with the supplied entry password.
    #[error("Invalid password for keystore entry {0}")]
    InvalidEntryPassword(String),

    /// The keystore file is not in the expected format.
    #[error("Malformed keystore: {0}")]
    Malformed(String),

    /// Key generation or certificate construction failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Reading or writing the keystore file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while signing a container.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The input is not a readable container.
    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    /// The signing key is of a type or size the signature schemes do not accept.
    #[error("Unsupported signing key: {0}")]
    UnsupportedKey(String),

    /// The underlying signing primitive failed.
    #[error("Signing failed: {0}")]
    Crypto(String),

    /// Reading the input or writing the signed artifact failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<openssl::error::ErrorStack> for SigningError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        SigningError::Crypto(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for KeyError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        KeyError::Crypto(e.to_string())
    }
}
