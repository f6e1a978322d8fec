//! Private key and self-signed certificate generation.
//!
//! A [`PrivateKeyCertificatePair`] bundles an openssl private key with the
//! X.509 certificate for its public key. Pairs are created on demand with
//! [`PrivateKeyCertificatePair::generate`] or loaded from a
//! [`KeyStore`](super::KeyStore), and never change afterwards.
//!
//! # Examples
//!
//! ```no_run
//! use apkseal::crypto::PrivateKeyCertificatePair;
//! use chrono::{Duration, Utc};
//!
//! let pair = PrivateKeyCertificatePair::generate("generated", Utc::now() + Duration::days(365))?;
//! assert_eq!(pair.subject_common_name().as_deref(), Some("generated"));
//! # Ok::<(), apkseal::KeyError>(())
//! ```

use crate::error::KeyError;
use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use tracing::debug;

/// Size of generated RSA keys.
pub const GENERATED_KEY_BITS: u32 = 4096;

/// Random bits in a generated serial number.
///
/// 63 bits keep the serial inside the positive range of a signed 64-bit
/// integer, which is what Java-based tooling expects.
const SERIAL_NUMBER_BITS: i32 = 63;

/// A private key together with the certificate for its public key.
///
/// Cloning is cheap: both halves are reference counted openssl handles.
///
/// # Security
///
/// The private key is sensitive. The [`Debug`](std::fmt::Debug) output only
/// shows the certificate subject.
#[derive(Clone)]
pub struct PrivateKeyCertificatePair {
    private_key: PKey<Private>,
    certificate: X509,
}

impl PrivateKeyCertificatePair {
    /// Pair an existing key with its certificate.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Malformed`] if the certificate's public key is not
    /// the public half of `private_key`.
    pub fn new(private_key: PKey<Private>, certificate: X509) -> Result<Self, KeyError> {
        validate_key_pair(&certificate, &private_key)?;
        Ok(Self {
            private_key,
            certificate,
        })
    }

    /// Generate an RSA 4096-bit key and a self-signed X.509 v3 certificate.
    ///
    /// The certificate's subject and issuer are both `CN=<common_name>`, it is
    /// valid from now until `valid_until`, carries a random serial in
    /// `[1, 2^63)` and is signed with SHA-256 with RSA.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Crypto`] if `valid_until` is not in the future or
    /// key generation or certificate signing fails.
    pub fn generate(common_name: &str, valid_until: DateTime<Utc>) -> Result<Self, KeyError> {
        let now = Utc::now();
        if valid_until <= now {
            return Err(KeyError::Crypto(format!(
                "Certificate validity end {} is not in the future",
                valid_until
            )));
        }

        debug!(common_name, bits = GENERATED_KEY_BITS, "Generating signing key");

        let rsa = Rsa::generate(GENERATED_KEY_BITS)?;
        let private_key = PKey::from_rsa(rsa)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        let name = name.build();

        let serial = random_serial()?;
        let not_before = Asn1Time::from_unix(now.timestamp())?;
        let not_after = Asn1Time::from_unix(valid_until.timestamp())?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&private_key)?;
        builder.sign(&private_key, MessageDigest::sha256())?;

        Ok(Self {
            private_key,
            certificate: builder.build(),
        })
    }

    /// The private key.
    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    /// The certificate.
    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// The certificate serial number.
    pub fn serial_number(&self) -> Result<BigNum, KeyError> {
        Ok(self.certificate.serial_number().to_bn()?)
    }

    /// The first common name in the certificate subject, if any.
    pub fn subject_common_name(&self) -> Option<String> {
        self.certificate
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().to_string().ok())
    }
}

impl std::fmt::Debug for PrivateKeyCertificatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyCertificatePair")
            .field("subject", &self.subject_common_name())
            .finish_non_exhaustive()
    }
}

/// Check that the certificate's public key belongs to `private_key`.
pub(crate) fn validate_key_pair(cert: &X509, private_key: &PKey<Private>) -> Result<(), KeyError> {
    let cert_public_key = cert.public_key().map_err(|e| {
        KeyError::Malformed(format!("Failed to extract public key from certificate: {}", e))
    })?;

    if !private_key.public_eq(&cert_public_key) {
        return Err(KeyError::Malformed(
            "Private key does not match certificate public key".into(),
        ));
    }

    Ok(())
}

/// Draw a serial uniformly from `[1, 2^63)`.
fn random_serial() -> Result<BigNum, KeyError> {
    let mut serial = BigNum::new()?;
    loop {
        serial.rand(SERIAL_NUMBER_BITS, MsbOption::MAYBE_ZERO, false)?;
        if serial.num_bits() > 0 {
            return Ok(serial);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::sign::{Signer, Verifier};
    use std::sync::OnceLock;

    /// One generated RSA 4096 pair shared by the tests of this binary.
    pub(crate) fn test_pair() -> PrivateKeyCertificatePair {
        static PAIR: OnceLock<PrivateKeyCertificatePair> = OnceLock::new();
        PAIR.get_or_init(|| {
            PrivateKeyCertificatePair::generate("test-subject", Utc::now() + Duration::days(30))
                .unwrap()
        })
        .clone()
    }

    #[test]
    fn test_generate_subject_and_issuer() {
        let pair = test_pair();
        let cert = pair.certificate();

        assert_eq!(pair.subject_common_name().as_deref(), Some("test-subject"));
        let issuer_cn = cert
            .issuer_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .to_string()
            .unwrap();
        assert_eq!(issuer_cn, "test-subject");
        assert_eq!(cert.version(), 2);
        assert_eq!(pair.private_key().bits(), GENERATED_KEY_BITS);
    }

    #[test]
    fn test_generate_serial_is_positive() {
        let serial = test_pair().serial_number().unwrap();
        assert!(!serial.is_negative());
        assert!(serial.num_bits() > 0);
        assert!(serial.num_bits() <= 63);
    }

    #[test]
    fn test_random_serial_range() {
        for _ in 0..64 {
            let serial = random_serial().unwrap();
            assert!(!serial.is_negative());
            assert!(serial.num_bits() >= 1 && serial.num_bits() <= 63);
        }
    }

    #[test]
    fn test_generate_validity_window() {
        let pair = test_pair();
        let now = Asn1Time::days_from_now(0).unwrap();
        let in_a_year = Asn1Time::days_from_now(365).unwrap();

        assert!(pair.certificate().not_before() <= now);
        assert!(pair.certificate().not_after() > now);
        assert!(pair.certificate().not_after() < in_a_year);
    }

    #[test]
    fn test_generate_rejects_past_validity() {
        let result = PrivateKeyCertificatePair::generate("x", Utc::now() - Duration::days(1));
        assert!(matches!(result, Err(KeyError::Crypto(_))));
    }

    #[test]
    fn test_key_signs_for_certificate() {
        let pair = test_pair();
        let data = b"signed payload";

        let mut signer = Signer::new(MessageDigest::sha256(), pair.private_key()).unwrap();
        signer.update(data).unwrap();
        let signature = signer.sign_to_vec().unwrap();

        let public_key = pair.certificate().public_key().unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key).unwrap();
        verifier.update(data).unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }

    #[test]
    fn test_new_rejects_mismatched_key() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let other = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let result = PrivateKeyCertificatePair::new(other, test_pair().certificate().clone());
        assert!(matches!(result, Err(KeyError::Malformed(_))));
    }

    #[test]
    fn test_debug_hides_key() {
        let debug = format!("{:?}", test_pair());
        assert!(debug.contains("test-subject"));
        assert!(!debug.contains("PRIVATE"));
    }
}
