//! Signing material: key pairs, self-signed certificates and the keystore.

pub mod cert;
pub mod keystore;

pub use cert::PrivateKeyCertificatePair;
pub use keystore::{load_or_create, KeyStore};
