//! Signing configuration.

use secrecy::SecretString;
use std::path::PathBuf;

/// Alias of the generated keystore entry.
pub const DEFAULT_KEY_ALIAS: &str = "generated-key";

/// Password of the generated keystore entry.
pub const DEFAULT_KEY_ENTRY_PASSWORD: &str = "";

/// Signer display name, also the base of the v1 signature file names.
pub const DEFAULT_SIGNER_NAME: &str = "generated-signer";

/// Common name of the generated certificate.
pub const DEFAULT_CERTIFICATE_SUBJECT: &str = "generated";

/// Validity of the generated certificate (eight years).
pub const DEFAULT_CERTIFICATE_VALIDITY_DAYS: u32 = 2920;

/// Where the signing key lives and how to create it when it does not exist yet.
#[derive(Debug, Clone)]
pub struct SigningOptions {
    /// Keystore file, created on first use.
    pub keystore_path: PathBuf,
    /// Store password. `None` is the empty password.
    pub keystore_password: Option<SecretString>,
    /// Alias of the signing entry.
    pub key_alias: String,
    /// Password of the signing entry.
    pub key_entry_password: SecretString,
    /// Signer display name.
    pub signer_name: String,
    /// Common name of a generated certificate.
    pub certificate_subject: String,
    /// Validity of a generated certificate, counted from generation.
    pub certificate_validity_days: u32,
}

impl SigningOptions {
    /// Options with the defaults for everything but the keystore path.
    pub fn new(keystore_path: impl Into<PathBuf>) -> Self {
        Self {
            keystore_path: keystore_path.into(),
            keystore_password: None,
            key_alias: DEFAULT_KEY_ALIAS.to_string(),
            key_entry_password: SecretString::new(DEFAULT_KEY_ENTRY_PASSWORD.to_string()),
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            certificate_subject: DEFAULT_CERTIFICATE_SUBJECT.to_string(),
            certificate_validity_days: DEFAULT_CERTIFICATE_VALIDITY_DAYS,
        }
    }
}
