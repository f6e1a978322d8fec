//! ApkSeal builder API
//!
//! Wires the assembler, the keystore and the signer into one pipeline:
//! patch a copy of an APK, load or create the signing key, and sign the copy
//! into the final artifact.

use crate::apk::{AlignmentRule, ApkAssembler, BinaryBlob, MergePolicy, ResourceChangeset};
use crate::config::SigningOptions;
use crate::crypto::load_or_create;
use crate::signing::{ApkSigner, SignedArtifact, SigningIdentity};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// APK patching and signing with builder pattern API.
///
/// # Example
///
/// ```no_run
/// use apkseal::apk::{BinaryBlob, ResourceChangeset};
/// use apkseal::ApkSeal;
///
/// let artifact = ApkSeal::new("release.keystore")
///     .keystore_password("store secret")
///     .signer_name("My Team")
///     .patch(
///         "app.apk",
///         "app-patched.apk",
///         vec![BinaryBlob::from_file("classes.dex", "build/classes.dex")?],
///         Some(ResourceChangeset::new().compiled_overlay("build/resources.apk")),
///     )?;
/// println!("Wrote {}", artifact.path.display());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct ApkSeal {
    options: SigningOptions,
    assembler: ApkAssembler,
}

impl ApkSeal {
    /// Create a builder signing with the keystore at `keystore_path`.
    pub fn new(keystore_path: impl AsRef<Path>) -> Self {
        Self::from_options(SigningOptions::new(keystore_path.as_ref()))
    }

    /// Create a builder from complete signing options.
    pub fn from_options(options: SigningOptions) -> Self {
        Self {
            options,
            assembler: ApkAssembler::new(),
        }
    }

    /// Set the keystore password.
    ///
    /// The password is stored securely and will be zeroized when dropped.
    pub fn keystore_password(mut self, password: impl Into<String>) -> Self {
        self.options.keystore_password = Some(SecretString::new(password.into()));
        self
    }

    /// Set the alias of the signing entry.
    pub fn key_alias(mut self, alias: impl Into<String>) -> Self {
        self.options.key_alias = alias.into();
        self
    }

    /// Set the password of the signing entry.
    pub fn key_entry_password(mut self, password: impl Into<String>) -> Self {
        self.options.key_entry_password = SecretString::new(password.into());
        self
    }

    /// Set the signer display name.
    pub fn signer_name(mut self, name: impl Into<String>) -> Self {
        self.options.signer_name = name.into();
        self
    }

    /// Set the common name used when a certificate is generated.
    pub fn certificate_subject(mut self, subject: impl Into<String>) -> Self {
        self.options.certificate_subject = subject.into();
        self
    }

    /// Set how long a generated certificate is valid.
    pub fn certificate_validity_days(mut self, days: u32) -> Self {
        self.options.certificate_validity_days = days;
        self
    }

    /// Set how overlay/target collisions are resolved during assembly.
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.assembler = self.assembler.merge_policy(policy);
        self
    }

    /// Set the alignment rule used during assembly.
    pub fn alignment_rule(mut self, rule: AlignmentRule) -> Self {
        self.assembler = self.assembler.alignment_rule(rule);
        self
    }

    /// The signing options.
    pub fn options(&self) -> &SigningOptions {
        &self.options
    }

    /// Validate the builder configuration.
    ///
    /// Returns an error if:
    /// - The key alias, signer name or certificate subject is empty
    /// - The certificate validity is zero days or ends beyond the supported date range
    pub fn validate(&self) -> Result<()> {
        if self.options.key_alias.is_empty() {
            return Err(Error::Config("Key alias must not be empty".into()));
        }
        if self.options.signer_name.is_empty() {
            return Err(Error::Config("Signer name must not be empty".into()));
        }
        if self.options.certificate_subject.is_empty() {
            return Err(Error::Config("Certificate subject must not be empty".into()));
        }
        if self.options.certificate_validity_days == 0 {
            return Err(Error::Config("Certificate validity must be at least one day".into()));
        }
        self.certificate_valid_until()?;
        Ok(())
    }

    fn certificate_valid_until(&self) -> Result<DateTime<Utc>> {
        let days = self.options.certificate_validity_days;
        Duration::try_days(i64::from(days))
            .and_then(|validity| Utc::now().checked_add_signed(validity))
            .ok_or_else(|| Error::Config(format!("Certificate validity of {} days is out of range", days)))
    }

    /// Load the signing identity, creating the keystore if it does not exist.
    pub fn load_identity(&self) -> Result<SigningIdentity> {
        self.validate()?;

        let options = &self.options;
        let valid_until = self.certificate_valid_until()?;
        let pair = load_or_create(
            &options.keystore_path,
            &options.key_alias,
            &options.key_entry_password,
            options.keystore_password.as_ref(),
            &options.certificate_subject,
            valid_until,
        )?;

        Ok(SigningIdentity::new(options.signer_name.clone(), pair))
    }

    /// Apply blobs and a resource changeset to `target` in place.
    ///
    /// `target` is mutated destructively; see [`patch`](Self::patch) for a
    /// variant that leaves its input untouched.
    pub fn assemble(
        &self,
        target: impl AsRef<Path>,
        blobs: Vec<BinaryBlob>,
        changeset: Option<ResourceChangeset>,
    ) -> Result<()> {
        self.assembler.assemble(target.as_ref(), blobs, changeset)?;
        Ok(())
    }

    /// Sign `input` into `output`.
    pub fn sign(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<SignedArtifact> {
        let identity = self.load_identity()?;
        Ok(ApkSigner::new(identity).sign(input.as_ref(), output.as_ref())?)
    }

    /// Sign the APK at `path`, replacing it.
    pub fn sign_in_place(&self, path: impl AsRef<Path>) -> Result<SignedArtifact> {
        let identity = self.load_identity()?;
        Ok(ApkSigner::new(identity).sign_in_place(path.as_ref())?)
    }

    /// Patch and sign `input` into `output`.
    ///
    /// The input is copied to a temporary file next to `output`, the copy is
    /// assembled and then signed into `output`. `input` is never modified and
    /// `output` only appears once every step succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Key`] before any work is done if the signing material
    /// cannot be loaded, then [`Error::Assembly`] or [`Error::Signing`] for
    /// failures of the respective stage.
    #[instrument(skip_all, fields(input = %input.as_ref().display(), output = %output.as_ref().display()))]
    pub fn patch(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        blobs: Vec<BinaryBlob>,
        changeset: Option<ResourceChangeset>,
    ) -> Result<SignedArtifact> {
        let input = input.as_ref();
        let output = output.as_ref();

        let identity = self.load_identity()?;

        let work_dir = output_dir(output);
        let working_copy = tempfile::Builder::new()
            .prefix(".apkseal-")
            .suffix(".apk")
            .tempfile_in(&work_dir)?;
        fs::copy(input, working_copy.path())?;

        self.assembler.assemble(working_copy.path(), blobs, changeset)?;
        let artifact = ApkSigner::new(identity).sign(working_copy.path(), output)?;

        info!(schemes = ?artifact.schemes, "Patched APK");
        Ok(artifact)
    }
}

fn output_dir(output: &Path) -> PathBuf {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
