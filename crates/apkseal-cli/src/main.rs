//! Command-line interface for apkseal.
//!
//! Assembles patched APKs and signs them with a keystore that is created on
//! first use.

use apkseal::{
    ApkAssembler, ApkSeal, BinaryBlob, DeletionMatcher, Error, KeyError, MergePolicy, ResourceChangeset,
    SigningOptions,
};
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apkseal")]
#[command(about = "Assemble patched APKs and sign them", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply blobs and resources to an APK in place
    Assemble {
        /// APK to modify
        target: PathBuf,

        #[command(flatten)]
        assembly: AssemblyArgs,
    },

    /// Sign an APK
    Sign {
        /// APK to sign
        input: PathBuf,

        /// Output file (signs in place when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        keystore: KeystoreArgs,
    },

    /// Patch a copy of an APK and sign it
    Patch {
        /// APK to patch, left untouched
        input: PathBuf,

        /// Signed output file
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        assembly: AssemblyArgs,

        #[command(flatten)]
        keystore: KeystoreArgs,
    },
}

#[derive(Args)]
struct AssemblyArgs {
    /// Blob to write, as PATH_IN_APK=FILE
    #[arg(long = "blob", value_parser = parse_blob)]
    blobs: Vec<(String, PathBuf)>,

    /// Compiled resource APK replacing the res/ tree
    #[arg(long)]
    overlay: Option<PathBuf>,

    /// Directory of files added verbatim
    #[arg(long)]
    raw_dir: Option<PathBuf>,

    /// Raw file stored uncompressed (relative path)
    #[arg(long = "no-compress")]
    no_compress: Vec<String>,

    /// Entry to delete
    #[arg(long = "delete")]
    delete: Vec<String>,

    /// Delete every entry under this prefix
    #[arg(long = "delete-prefix")]
    delete_prefix: Vec<String>,

    /// Keep existing entries when the overlay has the same path
    #[arg(long)]
    keep_existing: bool,
}

#[derive(Args)]
struct KeystoreArgs {
    /// Keystore file, created when missing
    #[arg(long)]
    keystore: PathBuf,

    /// Keystore password
    #[arg(long, env = "APKSEAL_KEYSTORE_PASSWORD", hide_env_values = true)]
    keystore_password: Option<String>,

    /// Alias of the signing key
    #[arg(long, default_value = apkseal::config::DEFAULT_KEY_ALIAS)]
    alias: String,

    /// Password of the signing key
    #[arg(long, env = "APKSEAL_KEY_PASSWORD", hide_env_values = true, default_value = "")]
    key_password: String,

    /// Signer name
    #[arg(long, default_value = apkseal::config::DEFAULT_SIGNER_NAME)]
    signer: String,

    /// Common name of a generated certificate
    #[arg(long, default_value = apkseal::config::DEFAULT_CERTIFICATE_SUBJECT)]
    subject: String,

    /// Validity of a generated certificate in days
    #[arg(long, default_value_t = apkseal::config::DEFAULT_CERTIFICATE_VALIDITY_DAYS)]
    validity_days: u32,
}

fn parse_blob(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((path, file)) if !path.is_empty() && !file.is_empty() => {
            Ok((path.to_string(), PathBuf::from(file)))
        }
        _ => Err(format!("expected PATH_IN_APK=FILE, got '{}'", value)),
    }
}

impl AssemblyArgs {
    fn blobs(&self) -> std::io::Result<Vec<BinaryBlob>> {
        self.blobs
            .iter()
            .map(|(path, file)| BinaryBlob::from_file(path.clone(), file))
            .collect()
    }

    fn changeset(&self) -> Option<ResourceChangeset> {
        let has_changes = self.overlay.is_some()
            || self.raw_dir.is_some()
            || !self.delete.is_empty()
            || !self.delete_prefix.is_empty();
        if !has_changes {
            return None;
        }

        let mut changeset = ResourceChangeset::new();
        if let Some(overlay) = &self.overlay {
            changeset = changeset.compiled_overlay(overlay);
        }
        if let Some(raw_dir) = &self.raw_dir {
            changeset = changeset.raw_overlay_root(raw_dir);
        }
        for path in &self.no_compress {
            changeset = changeset.no_compress(path);
        }
        for path in &self.delete {
            changeset = changeset.delete(DeletionMatcher::Exact(path.clone()));
        }
        for prefix in &self.delete_prefix {
            changeset = changeset.delete(DeletionMatcher::Prefix(prefix.clone()));
        }
        Some(changeset)
    }

    fn merge_policy(&self) -> MergePolicy {
        if self.keep_existing {
            MergePolicy::KeepExisting
        } else {
            MergePolicy::TakeOverlay
        }
    }
}

impl KeystoreArgs {
    fn options(self) -> SigningOptions {
        SigningOptions {
            keystore_path: self.keystore,
            keystore_password: self.keystore_password.map(SecretString::new),
            key_alias: self.alias,
            key_entry_password: SecretString::new(self.key_password),
            signer_name: self.signer,
            certificate_subject: self.subject,
            certificate_validity_days: self.validity_days,
        }
    }
}

fn run(command: Command) -> apkseal::Result<()> {
    match command {
        Command::Assemble { target, assembly } => {
            ApkAssembler::new()
                .merge_policy(assembly.merge_policy())
                .assemble(&target, assembly.blobs()?, assembly.changeset())?;
            println!("Assembled: {}", target.display());
        }
        Command::Sign {
            input,
            output,
            keystore,
        } => {
            let seal = ApkSeal::from_options(keystore.options());
            let artifact = match output {
                Some(output) => seal.sign(&input, &output)?,
                None => seal.sign_in_place(&input)?,
            };
            println!("Signed: {}", artifact.path.display());
        }
        Command::Patch {
            input,
            output,
            assembly,
            keystore,
        } => {
            let artifact = ApkSeal::from_options(keystore.options())
                .merge_policy(assembly.merge_policy())
                .patch(&input, &output, assembly.blobs()?, assembly.changeset())?;
            println!("Signed: {}", artifact.path.display());
        }
    }
    Ok(())
}

/// Corrective hint for errors a user can fix by changing the invocation.
fn hint(error: &Error) -> Option<&'static str> {
    match error {
        Error::Key(KeyError::InvalidStorePassword) => {
            Some("check --keystore-password or APKSEAL_KEYSTORE_PASSWORD")
        }
        Error::Key(KeyError::AliasNotFound(_)) => {
            Some("check --alias, or point --keystore at a new file to generate a key")
        }
        Error::Key(KeyError::InvalidEntryPassword(_)) => {
            Some("check --key-password or APKSEAL_KEY_PASSWORD")
        }
        Error::Key(KeyError::Malformed(_)) => Some("--keystore does not point at an apkseal keystore"),
        _ => None,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            if let Some(hint) = hint(&e) {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}
