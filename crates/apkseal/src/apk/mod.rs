//! Container assembly.
//!
//! This module rewrites an APK in place: code blobs are written at fixed
//! paths, the `res/` tree is replaced by a freshly compiled overlay, loose
//! files are added, unwanted entries are deleted and every entry is realigned
//! before the container is durably written back.
//!
//! # Examples
//!
//! ```no_run
//! use apkseal::apk::{ApkAssembler, BinaryBlob, DeletionMatcher, ResourceChangeset};
//! use std::path::Path;
//!
//! let blobs = vec![BinaryBlob::from_file("classes.dex", "build/classes.dex")?];
//! let changeset = ResourceChangeset::new()
//!     .compiled_overlay("build/resources.apk")
//!     .delete(DeletionMatcher::Prefix("lib/x86/".into()));
//!
//! ApkAssembler::new().assemble(Path::new("work/app.apk"), blobs, Some(changeset))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod align;
pub mod archive;
pub mod changeset;

pub use align::AlignmentRule;
pub use archive::{StorageMethod, StoredEntry, ZipContainer, ZipLayout};
pub use changeset::{BinaryBlob, DeletionMatcher, MergePolicy, ResourceChangeset};

use crate::error::AssemblyError;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Prefix of the compiled resource tree inside an APK.
pub const RESOURCE_PREFIX: &str = "res/";

/// Applies blobs and a resource changeset to a target container.
#[derive(Debug, Clone)]
pub struct ApkAssembler {
    alignment: AlignmentRule,
    merge_policy: MergePolicy,
    resource_prefix: String,
}

impl Default for ApkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ApkAssembler {
    /// Assembler with the APK alignment rule, [`MergePolicy::TakeOverlay`] and
    /// the `res/` resource prefix.
    pub fn new() -> Self {
        Self {
            alignment: AlignmentRule::apk(),
            merge_policy: MergePolicy::default(),
            resource_prefix: RESOURCE_PREFIX.to_string(),
        }
    }

    /// Set the alignment rule applied before writing.
    pub fn alignment_rule(mut self, rule: AlignmentRule) -> Self {
        self.alignment = rule;
        self
    }

    /// Set how overlay/target collisions are resolved.
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Set the prefix cleared before the compiled overlay is merged.
    pub fn resource_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resource_prefix = prefix.into();
        self
    }

    /// Apply `blobs` and `changeset` to the container at `target`, in place.
    ///
    /// Steps run in a fixed order, each against the entries left by the
    /// previous one:
    ///
    /// 1. Each blob is written (deflated) at its path.
    /// 2. With a compiled overlay, every entry under the resource prefix is
    ///    removed and the overlay's entries are merged in.
    /// 3. With a raw overlay root, every file below it is added.
    /// 4. Entries selected by a deletion matcher are removed.
    /// 5. All entries are realigned.
    /// 6. The container is written back atomically.
    ///
    /// # Arguments
    ///
    /// * `target` - Container to modify. Use a disposable copy: on failure it
    ///   may be left in an undefined state.
    /// * `blobs` - Code payloads, applied in order.
    /// * `changeset` - Optional resource changes.
    ///
    /// # Errors
    ///
    /// Returns an [`AssemblyError`] if any input cannot be read, a container
    /// is corrupt or uses an unsupported compression method, a blob collides
    /// with a directory entry, or the result needs ZIP64.
    #[instrument(skip_all, fields(target = %target.display(), blobs = blobs.len()))]
    pub fn assemble(
        &self,
        target: &Path,
        blobs: Vec<BinaryBlob>,
        changeset: Option<ResourceChangeset>,
    ) -> Result<(), AssemblyError> {
        let mut container = ZipContainer::open(target, self.alignment.clone())?;

        for blob in blobs {
            let (path, data) = blob.into_parts();
            debug!(path = %path, size = data.len(), "Writing blob");
            container.add(&path, &data, true)?;
        }

        if let Some(changeset) = &changeset {
            if let Some(overlay_path) = changeset.compiled_overlay_path() {
                let overlay = ZipContainer::open(overlay_path, self.alignment.clone())?;

                let prefix = self.resource_prefix.as_str();
                let cleared = container.retain(|e| !e.name().starts_with(prefix));
                let merged =
                    container.merge_from(overlay, |name| self.merge_policy.keeps_existing(name))?;

                debug!(cleared, merged, overlay = %overlay_path.display(), "Merged compiled resources");
            }

            if let Some(root) = changeset.raw_overlay_path() {
                let added =
                    container.add_all_recursively(root, |name| !changeset.is_no_compress(name))?;
                debug!(added, root = %root.display(), "Added raw resources");
            }

            if !changeset.deletion_matchers().is_empty() {
                let deleted = container.retain(|e| !changeset.is_deleted(e.name()));
                debug!(deleted, "Applied deletion matchers");
            }
        }

        container.write()?;

        info!(entries = container.len(), "Assembled container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::{Read, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipArchive, ZipWriter};

    fn create_test_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        for (name, contents) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap();
    }

    fn names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        names
    }

    fn read_entry(path: &Path, name: &str) -> Vec<u8> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut contents = Vec::new();
        archive.by_name(name).unwrap().read_to_end(&mut contents).unwrap();
        contents
    }

    #[test]
    fn test_overlay_replaces_resource_tree() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.apk");
        let overlay = temp_dir.path().join("overlay.apk");
        create_test_zip(&target, &[("res/a.png", b"old"), ("classes.dex", b"dex")]);
        create_test_zip(&overlay, &[("res/b.png", b"new")]);

        ApkAssembler::new()
            .assemble(
                &target,
                vec![BinaryBlob::new("classes2.dex", b"dex2".to_vec())],
                Some(ResourceChangeset::new().compiled_overlay(&overlay)),
            )
            .unwrap();

        assert_eq!(names(&target), vec!["classes.dex", "classes2.dex", "res/b.png"]);
        assert_eq!(read_entry(&target, "res/b.png"), b"new");
    }

    #[test]
    fn test_merge_policy_on_collision() {
        let temp_dir = TempDir::new().unwrap();
        let overlay = temp_dir.path().join("overlay.apk");
        create_test_zip(
            &overlay,
            &[("AndroidManifest.xml", b"overlay"), ("resources.arsc", b"overlay")],
        );

        let run = |policy: MergePolicy| {
            let target = temp_dir.path().join("target.apk");
            create_test_zip(
                &target,
                &[("AndroidManifest.xml", b"target"), ("resources.arsc", b"target")],
            );
            ApkAssembler::new()
                .merge_policy(policy)
                .assemble(
                    &target,
                    Vec::new(),
                    Some(ResourceChangeset::new().compiled_overlay(&overlay)),
                )
                .unwrap();
            (
                read_entry(&target, "AndroidManifest.xml"),
                read_entry(&target, "resources.arsc"),
            )
        };

        assert_eq!(run(MergePolicy::TakeOverlay), (b"overlay".to_vec(), b"overlay".to_vec()));
        assert_eq!(run(MergePolicy::KeepExisting), (b"target".to_vec(), b"target".to_vec()));
        assert_eq!(
            run(MergePolicy::custom(|p| p == "AndroidManifest.xml")),
            (b"target".to_vec(), b"overlay".to_vec())
        );
    }

    #[test]
    fn test_raw_overlay_compression() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.apk");
        create_test_zip(&target, &[("classes.dex", b"dex")]);

        let raw = temp_dir.path().join("raw");
        fs::create_dir_all(raw.join("assets")).unwrap();
        fs::write(raw.join("assets/clip.ogg"), [1u8; 64]).unwrap();
        fs::write(raw.join("assets/notes.txt"), b"notes").unwrap();

        let changeset = ResourceChangeset::new()
            .raw_overlay_root(&raw)
            .no_compress("assets/clip.ogg");
        ApkAssembler::new()
            .assemble(&target, Vec::new(), Some(changeset))
            .unwrap();

        let mut archive = ZipArchive::new(File::open(&target).unwrap()).unwrap();
        assert_eq!(
            archive.by_name("assets/clip.ogg").unwrap().compression(),
            CompressionMethod::Stored
        );
        assert_eq!(
            archive.by_name("assets/notes.txt").unwrap().compression(),
            CompressionMethod::Deflated
        );
    }

    #[test]
    fn test_deletions_run_after_overlays() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.apk");
        let overlay = temp_dir.path().join("overlay.apk");
        create_test_zip(
            &target,
            &[
                ("classes.dex", b"dex"),
                ("lib/x86/libfoo.so", b"elf"),
                ("lib/arm64-v8a/libfoo.so", b"elf"),
            ],
        );
        create_test_zip(&overlay, &[("res/drawable/debug.xml", b"<x/>"), ("res/values.xml", b"<v/>")]);

        let changeset = ResourceChangeset::new()
            .compiled_overlay(&overlay)
            .delete(DeletionMatcher::Prefix("lib/x86/".into()))
            .delete(DeletionMatcher::Exact("res/drawable/debug.xml".into()));
        ApkAssembler::new()
            .assemble(&target, Vec::new(), Some(changeset))
            .unwrap();

        assert_eq!(
            names(&target),
            vec!["classes.dex", "lib/arm64-v8a/libfoo.so", "res/values.xml"]
        );
    }

    #[test]
    fn test_blob_overwrites_existing_entry() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.apk");
        create_test_zip(&target, &[("classes.dex", b"old dex")]);

        ApkAssembler::new()
            .assemble(&target, vec![BinaryBlob::new("classes.dex", b"new dex".to_vec())], None)
            .unwrap();

        assert_eq!(names(&target), vec!["classes.dex"]);
        assert_eq!(read_entry(&target, "classes.dex"), b"new dex");
    }

    #[test]
    fn test_missing_overlay_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.apk");
        create_test_zip(&target, &[("classes.dex", b"dex")]);

        let result = ApkAssembler::new().assemble(
            &target,
            Vec::new(),
            Some(ResourceChangeset::new().compiled_overlay(temp_dir.path().join("missing.apk"))),
        );
        assert!(matches!(result, Err(AssemblyError::Io(_))));
    }

    #[test]
    fn test_corrupt_target() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.apk");
        fs::write(&target, [0x42u8; 256]).unwrap();

        let result = ApkAssembler::new().assemble(&target, Vec::new(), None);
        assert!(matches!(result, Err(AssemblyError::Corrupt(_))));
    }

    #[test]
    fn test_custom_resource_prefix_and_alignment() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target.apk");
        let overlay = temp_dir.path().join("overlay.apk");
        create_test_zip(&target, &[("r/a.bin", b"a"), ("res/kept.xml", b"k")]);
        create_test_zip(&overlay, &[("r/b.bin", b"b")]);

        ApkAssembler::new()
            .resource_prefix("r/")
            .alignment_rule(AlignmentRule::Constant(16))
            .assemble(
                &target,
                Vec::new(),
                Some(ResourceChangeset::new().compiled_overlay(&overlay)),
            )
            .unwrap();

        assert_eq!(names(&target), vec!["r/b.bin", "res/kept.xml"]);

        let container = ZipContainer::open(&target, AlignmentRule::Constant(16)).unwrap();
        for entry in container.entries() {
            assert_eq!(entry.data_offset().unwrap() % 16, 0, "{}", entry.name());
        }
    }
}
