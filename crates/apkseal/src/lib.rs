//! Patched-APK assembly and signing.
//!
//! apkseal takes an existing APK, writes new code payloads into it, swaps its
//! compiled resources for a freshly built set, adds or removes loose files,
//! realigns every entry and signs the result with JAR signing and the APK
//! Signature Scheme v2. The signing key lives in a password-protected keystore
//! that is created with a self-signed certificate on first use.
//!
//! The pipeline has three components, each usable on its own:
//!
//! - [`apk`] - container assembly ([`apk::ApkAssembler`])
//! - [`crypto`] - keys, certificates and the keystore ([`crypto::load_or_create`])
//! - [`signing`] - v1 and v2 signatures ([`signing::ApkSigner`])
//!
//! [`ApkSeal`] wires them together.
//!
//! The library only emits [`tracing`] events; installing a subscriber is up
//! to the application.

mod atomic;

pub mod apk;
pub mod builder;
pub mod config;
pub mod crypto;
pub mod error;
pub mod signing;

pub use apk::{ApkAssembler, BinaryBlob, DeletionMatcher, MergePolicy, ResourceChangeset};
pub use builder::ApkSeal;
pub use config::SigningOptions;
pub use crypto::{KeyStore, PrivateKeyCertificatePair};
pub use error::{AssemblyError, Error, KeyError, SigningError};
pub use signing::{ApkSigner, SignatureScheme, SignedArtifact, SigningIdentity};

/// Result type using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
