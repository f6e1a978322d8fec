//! Password-protected keystore file.
//!
//! A [`KeyStore`] holds any number of entries, each a private key and
//! certificate stored under an alias and guarded by its own entry password.
//! The whole store is additionally sealed under the store password.
//!
//! # File Format
//!
//! All integers are big-endian.
//!
//! ```text
//! "ASKS" | version u32 | iterations u32 | salt [16] | iv [12] | tag [16]
//!        | ciphertext length u32 | ciphertext
//! ```
//!
//! The ciphertext is AES-256-GCM under a PBKDF2-HMAC-SHA256 key derived from
//! the store password, authenticated together with the header up to the salt
//! and iv. The plaintext is a count followed by `alias | PKCS#12 DER` records,
//! each PKCS#12 blob encrypted under that entry's password.

use super::cert::PrivateKeyCertificatePair;
use crate::atomic::persist_atomically;
use crate::error::KeyError;
use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use secrecy::zeroize::Zeroizing;
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

const MAGIC: &[u8; 4] = b"ASKS";
const FORMAT_VERSION: u32 = 1;

/// PBKDF2 iterations for newly written stores.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Stores claiming more iterations than this are rejected as malformed.
const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Magic, version, iterations, salt and iv: the authenticated header.
const AAD_LEN: usize = 4 + 4 + 4 + SALT_LEN + IV_LEN;
const HEADER_LEN: usize = AAD_LEN + TAG_LEN + 4;

/// In-memory keystore.
///
/// Entries stay encrypted under their entry password until
/// [`private_key_certificate_pair`](Self::private_key_certificate_pair) is
/// called.
#[derive(Default)]
pub struct KeyStore {
    /// `(alias, PKCS#12 DER)` in insertion order.
    entries: Vec<(String, Vec<u8>)>,
}

impl KeyStore {
    /// Create an empty keystore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `pair` under `alias`, protected by `entry_password`.
    ///
    /// An existing entry with the same alias is replaced.
    pub fn insert(
        &mut self,
        alias: &str,
        pair: &PrivateKeyCertificatePair,
        entry_password: &SecretString,
    ) -> Result<(), KeyError> {
        let pkcs12 = Pkcs12::builder()
            .name(alias)
            .pkey(pair.private_key())
            .cert(pair.certificate())
            .build2(entry_password.expose_secret())?;
        let der = pkcs12.to_der()?;

        match self.entries.iter_mut().find(|(a, _)| a == alias) {
            Some(entry) => entry.1 = der,
            None => self.entries.push((alias.to_string(), der)),
        }
        Ok(())
    }

    /// Aliases in insertion order.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(alias, _)| alias.as_str())
    }

    /// Whether an entry with this alias exists.
    pub fn contains_alias(&self, alias: &str) -> bool {
        self.entries.iter().any(|(a, _)| a == alias)
    }

    /// Recover the key and certificate stored under `alias`.
    ///
    /// # Errors
    ///
    /// - [`KeyError::AliasNotFound`] if there is no such entry
    /// - [`KeyError::InvalidEntryPassword`] if `entry_password` does not open it
    /// - [`KeyError::Malformed`] if the entry is not a usable PKCS#12 blob
    pub fn private_key_certificate_pair(
        &self,
        alias: &str,
        entry_password: &SecretString,
    ) -> Result<PrivateKeyCertificatePair, KeyError> {
        let der = self
            .entries
            .iter()
            .find(|(a, _)| a == alias)
            .map(|(_, der)| der)
            .ok_or_else(|| KeyError::AliasNotFound(alias.to_string()))?;

        let pkcs12 = Pkcs12::from_der(der)
            .map_err(|e| KeyError::Malformed(format!("Invalid PKCS#12 entry {}: {}", alias, e)))?;

        let parsed = pkcs12
            .parse2(entry_password.expose_secret())
            .map_err(|_| KeyError::InvalidEntryPassword(alias.to_string()))?;

        let certificate = parsed
            .cert
            .ok_or_else(|| KeyError::Malformed(format!("No certificate in entry {}", alias)))?;
        let private_key = parsed
            .pkey
            .ok_or_else(|| KeyError::Malformed(format!("No private key in entry {}", alias)))?;

        PrivateKeyCertificatePair::new(private_key, certificate)
    }

    /// Read a keystore file.
    ///
    /// `None` is the empty store password.
    ///
    /// # Errors
    ///
    /// - [`KeyError::Io`] if the file cannot be read
    /// - [`KeyError::Malformed`] if it is not a keystore
    /// - [`KeyError::InvalidStorePassword`] if the password does not open it
    pub fn read(path: impl AsRef<Path>, store_password: Option<&SecretString>) -> Result<Self, KeyError> {
        let data = fs::read(path.as_ref())?;
        Self::from_bytes(&data, store_password)
    }

    /// Durably write the keystore to `path`, creating parent directories.
    ///
    /// A fresh salt and iv are drawn on every write.
    pub fn write(&self, path: impl AsRef<Path>, store_password: Option<&SecretString>) -> Result<(), KeyError> {
        let path = path.as_ref();
        let bytes = self.to_bytes(store_password)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        persist_atomically(path, |file| file.write_all(&bytes))?;
        Ok(())
    }

    fn to_bytes(&self, store_password: Option<&SecretString>) -> Result<Vec<u8>, KeyError> {
        let mut plaintext = Zeroizing::new(Vec::new());
        plaintext.extend(&len_u32(self.entries.len())?.to_be_bytes());
        for (alias, der) in &self.entries {
            plaintext.extend(&len_u32(alias.len())?.to_be_bytes());
            plaintext.extend(alias.as_bytes());
            plaintext.extend(&len_u32(der.len())?.to_be_bytes());
            plaintext.extend(der);
        }

        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand_bytes(&mut salt)?;
        rand_bytes(&mut iv)?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend(MAGIC);
        header.extend(&FORMAT_VERSION.to_be_bytes());
        header.extend(&PBKDF2_ITERATIONS.to_be_bytes());
        header.extend(&salt);
        header.extend(&iv);

        let key = derive_key(store_password, &salt, PBKDF2_ITERATIONS)?;
        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            key.as_slice(),
            Some(&iv[..]),
            &header,
            &plaintext,
            &mut tag,
        )?;

        let mut out = header;
        out.extend(&tag);
        out.extend(&len_u32(ciphertext.len())?.to_be_bytes());
        out.extend(&ciphertext);
        Ok(out)
    }

    fn from_bytes(data: &[u8], store_password: Option<&SecretString>) -> Result<Self, KeyError> {
        if data.len() < HEADER_LEN || &data[..4] != MAGIC {
            return Err(KeyError::Malformed("Not a keystore file".into()));
        }

        let mut reader = ByteReader::new(&data[4..]);
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(KeyError::Malformed(format!("Unsupported keystore version {}", version)));
        }

        let iterations = reader.u32()?;
        if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS {
            return Err(KeyError::Malformed(format!("Invalid iteration count {}", iterations)));
        }

        let salt = reader.take(SALT_LEN)?;
        let iv = reader.take(IV_LEN)?;
        let tag = reader.take(TAG_LEN)?;
        let ciphertext_len = reader.u32()? as usize;
        let ciphertext = reader.take(ciphertext_len)?;
        if !reader.is_empty() {
            return Err(KeyError::Malformed("Trailing data after ciphertext".into()));
        }

        let key = derive_key(store_password, salt, iterations)?;
        let plaintext = decrypt_aead(
            Cipher::aes_256_gcm(),
            key.as_slice(),
            Some(iv),
            &data[..AAD_LEN],
            ciphertext,
            tag,
        )
        .map(Zeroizing::new)
        .map_err(|_| KeyError::InvalidStorePassword)?;

        let mut reader = ByteReader::new(&plaintext);
        let count = reader.u32()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let alias_len = reader.u32()? as usize;
            let alias = std::str::from_utf8(reader.take(alias_len)?)
                .map_err(|_| KeyError::Malformed("Alias is not UTF-8".into()))?
                .to_string();
            let der_len = reader.u32()? as usize;
            let der = reader.take(der_len)?.to_vec();
            entries.push((alias, der));
        }
        if !reader.is_empty() {
            return Err(KeyError::Malformed("Trailing data after entries".into()));
        }

        Ok(Self { entries })
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("aliases", &self.aliases().collect::<Vec<_>>())
            .finish()
    }
}

/// Load the pair stored under `alias` in the keystore at `store`, creating
/// the keystore with a freshly generated pair if the file does not exist.
///
/// A generated pair is an RSA 4096-bit key with a self-signed certificate for
/// `CN=<subject_common_name>`, valid until `valid_until`. The new keystore is
/// written at `store` (parent directories created) under `store_password`,
/// where `None` is the empty password at both creation and load.
///
/// # Errors
///
/// - [`KeyError::InvalidStorePassword`] if an existing keystore does not open
/// - [`KeyError::AliasNotFound`] if an existing keystore has no such alias
/// - [`KeyError::InvalidEntryPassword`] if the entry does not open
/// - [`KeyError::Malformed`] if the file is not a keystore
/// - [`KeyError::Crypto`] or [`KeyError::Io`] if generation or writing fails
#[instrument(skip(store, entry_password, store_password), fields(store = %store.display()))]
pub fn load_or_create(
    store: &Path,
    alias: &str,
    entry_password: &SecretString,
    store_password: Option<&SecretString>,
    subject_common_name: &str,
    valid_until: DateTime<Utc>,
) -> Result<PrivateKeyCertificatePair, KeyError> {
    if store.exists() {
        debug!("Opening existing keystore");
        let keystore = KeyStore::read(store, store_password)?;
        let pair = keystore.private_key_certificate_pair(alias, entry_password)?;
        if pair.certificate().not_after() < Asn1Time::days_from_now(0)? {
            warn!(alias, not_after = %pair.certificate().not_after(), "Signing certificate has expired");
        }
        return Ok(pair);
    }

    info!(subject = subject_common_name, %valid_until, "Keystore not found, generating signing key");

    let pair = PrivateKeyCertificatePair::generate(subject_common_name, valid_until)?;
    let mut keystore = KeyStore::new();
    keystore.insert(alias, &pair, entry_password)?;
    keystore.write(store, store_password)?;

    info!("Created keystore");
    Ok(pair)
}

fn derive_key(
    store_password: Option<&SecretString>,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
    let password = store_password.map(|s| s.expose_secret().as_str()).unwrap_or("");
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac(
        password.as_bytes(),
        salt,
        iterations as usize,
        MessageDigest::sha256(),
        key.as_mut_slice(),
    )?;
    Ok(key)
}

fn len_u32(len: usize) -> Result<u32, KeyError> {
    u32::try_from(len).map_err(|_| KeyError::Io(io::Error::new(io::ErrorKind::InvalidInput, "Keystore too large")))
}

/// Bounds-checked cursor over keystore bytes.
struct ByteReader<'a> {
    data: &'a [u8],
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], KeyError> {
        if self.data.len() < len {
            return Err(KeyError::Malformed("Unexpected end of keystore".into()));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, KeyError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
