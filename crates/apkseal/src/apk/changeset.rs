//! Inputs to an assembly run: code blobs and the resource changeset.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A named byte stream written to a fixed path inside the container.
///
/// Identity is the path: a blob replaces any existing entry at that path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryBlob {
    path: String,
    data: Vec<u8>,
}

impl BinaryBlob {
    /// Create a blob from bytes already in memory.
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }

    /// Create a blob by draining `reader`.
    pub fn from_reader(path: impl Into<String>, mut reader: impl Read) -> io::Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(Self::new(path, data))
    }

    /// Create a blob from the contents of a file on disk.
    pub fn from_file(path: impl Into<String>, file: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(path, fs::read(file)?))
    }

    /// Destination path inside the container.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Blob contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Split into destination path and contents.
    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.path, self.data)
    }
}

/// Predicate over entry paths selecting entries to delete.
#[derive(Clone)]
pub enum DeletionMatcher {
    /// Exactly this path.
    Exact(String),
    /// Every path starting with this prefix.
    Prefix(String),
    /// Every path ending with this suffix.
    Suffix(String),
    /// Arbitrary predicate.
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl DeletionMatcher {
    /// Matcher from an arbitrary predicate.
    pub fn custom(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        DeletionMatcher::Custom(Arc::new(predicate))
    }

    /// Whether `path` should be deleted.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            DeletionMatcher::Exact(exact) => path == exact,
            DeletionMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            DeletionMatcher::Suffix(suffix) => path.ends_with(suffix.as_str()),
            DeletionMatcher::Custom(predicate) => predicate(path),
        }
    }
}

impl fmt::Debug for DeletionMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionMatcher::Exact(p) => f.debug_tuple("Exact").field(p).finish(),
            DeletionMatcher::Prefix(p) => f.debug_tuple("Prefix").field(p).finish(),
            DeletionMatcher::Suffix(p) => f.debug_tuple("Suffix").field(p).finish(),
            DeletionMatcher::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Decides which entry survives when the compiled overlay and the target
/// both contain the same path.
#[derive(Clone, Default)]
pub enum MergePolicy {
    /// The overlay entry replaces the existing one.
    #[default]
    TakeOverlay,
    /// The existing entry is kept.
    KeepExisting,
    /// `true` keeps the existing entry for that path.
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl MergePolicy {
    /// Policy from an arbitrary predicate returning `true` to keep the existing entry.
    pub fn custom(keep_existing: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        MergePolicy::Custom(Arc::new(keep_existing))
    }

    /// Whether the existing entry at `path` survives a collision.
    pub fn keeps_existing(&self, path: &str) -> bool {
        match self {
            MergePolicy::TakeOverlay => false,
            MergePolicy::KeepExisting => true,
            MergePolicy::Custom(keep_existing) => keep_existing(path),
        }
    }
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::TakeOverlay => f.write_str("TakeOverlay"),
            MergePolicy::KeepExisting => f.write_str("KeepExisting"),
            MergePolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Resource changes applied to the target container.
///
/// # Examples
///
/// ```
/// use apkseal::apk::{DeletionMatcher, ResourceChangeset};
///
/// let changeset = ResourceChangeset::new()
///     .compiled_overlay("build/resources.apk")
///     .raw_overlay_root("build/raw")
///     .no_compress("assets/video.mp4")
///     .delete(DeletionMatcher::Prefix("lib/x86/".into()));
///
/// assert!(changeset.is_no_compress("assets/video.mp4"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResourceChangeset {
    compiled_overlay: Option<PathBuf>,
    raw_overlay_root: Option<PathBuf>,
    no_compress: HashSet<String>,
    deletion_matchers: Vec<DeletionMatcher>,
}

impl ResourceChangeset {
    /// Create an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Container of freshly compiled resources replacing the target's `res/` tree.
    pub fn compiled_overlay(mut self, path: impl Into<PathBuf>) -> Self {
        self.compiled_overlay = Some(path.into());
        self
    }

    /// Directory of loose files added verbatim.
    pub fn raw_overlay_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_overlay_root = Some(path.into());
        self
    }

    /// Store this raw overlay path uncompressed.
    ///
    /// Backslashes are normalized to `/`.
    pub fn no_compress(mut self, path: impl AsRef<str>) -> Self {
        self.no_compress.insert(path.as_ref().replace('\\', "/"));
        self
    }

    /// Delete every entry matching `matcher` after the overlays are applied.
    pub fn delete(mut self, matcher: DeletionMatcher) -> Self {
        self.deletion_matchers.push(matcher);
        self
    }

    /// The compiled overlay container, if any.
    pub fn compiled_overlay_path(&self) -> Option<&Path> {
        self.compiled_overlay.as_deref()
    }

    /// The raw overlay directory, if any.
    pub fn raw_overlay_path(&self) -> Option<&Path> {
        self.raw_overlay_root.as_deref()
    }

    /// Whether `path` is stored uncompressed.
    pub fn is_no_compress(&self, path: &str) -> bool {
        self.no_compress.contains(path)
    }

    /// Deletion matchers in insertion order.
    pub fn deletion_matchers(&self) -> &[DeletionMatcher] {
        &self.deletion_matchers
    }

    /// Whether any deletion matcher selects `path`.
    pub fn is_deleted(&self, path: &str) -> bool {
        self.deletion_matchers.iter().any(|m| m.matches(path))
    }
}
