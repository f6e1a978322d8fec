//! APK (ZIP) container model.
//!
//! [`ZipContainer`] loads every entry of a container into memory, keeping the
//! raw (possibly deflated) payload so untouched entries are written back
//! byte-for-byte. Entries can be added, replaced, removed and merged from
//! another container; [`ZipContainer::write`] lays the entries out again,
//! padding each local header so the entry data lands on the boundary its
//! [`AlignmentRule`] requires, and atomically replaces the file on disk.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Local header 0 + alignment extra     │
//! │ Entry data 0 (aligned)               │
//! ├──────────────────────────────────────┤
//! │ ... more entries                     │
//! ├──────────────────────────────────────┤
//! │ Central directory                    │
//! ├──────────────────────────────────────┤
//! │ End of central directory (22 bytes)  │
//! └──────────────────────────────────────┘
//! ```
//!
//! The signer inserts the APK Signing Block between the entries and the
//! central directory, which is why [`ZipLayout`] keeps the three sections
//! apart.
//!
//! # Normalization
//!
//! Entry timestamps are written as 1981-01-01 00:00:00 and extra fields other
//! than the alignment field are dropped, so identical entries always produce
//! identical bytes.
//!
//! # Examples
//!
//! ```no_run
//! use apkseal::apk::{AlignmentRule, ZipContainer};
//!
//! let mut apk = ZipContainer::open("app.apk", AlignmentRule::apk())?;
//! apk.add("classes2.dex", b"dex\n035\0", true)?;
//! apk.remove("META-INF/MANIFEST.MF");
//! apk.write()?;
//! # Ok::<(), apkseal::AssemblyError>(())
//! ```

use super::align::AlignmentRule;
use crate::atomic::persist_atomically;
use crate::error::AssemblyError;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::{CompressionMethod, ZipArchive};

type Result<T> = std::result::Result<T, AssemblyError>;

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

/// Fixed part of a local file header.
const LOCAL_HEADER_SIZE: u64 = 30;

/// Size of the end of central directory record without comment.
pub const END_OF_CENTRAL_DIRECTORY_SIZE: usize = 22;

/// Offset of the central directory offset field inside the EOCD record.
const EOCD_CENTRAL_DIRECTORY_OFFSET_FIELD: usize = 16;

/// Extra field header id Android tooling uses for alignment padding.
pub const ALIGNMENT_EXTRA_FIELD_ID: u16 = 0xd935;

/// Header id (2) + data size (2) + alignment value (2).
const ALIGNMENT_EXTRA_FIELD_MIN_SIZE: u64 = 6;

/// 1981-01-01 in MS-DOS date format.
const DOS_DATE: u16 = (1 << 9) | (1 << 5) | 1;
const DOS_TIME: u16 = 0;

/// General purpose flag: name is UTF-8.
const FLAG_UTF8: u16 = 1 << 11;

const VERSION_NEEDED_STORED: u16 = 10;
const VERSION_NEEDED_DEFLATED: u16 = 20;

/// Host system Unix (3), ZIP version 2.0.
const VERSION_MADE_BY_UNIX: u16 = (3 << 8) | 20;
/// Host system MS-DOS (0), ZIP version 2.0.
const VERSION_MADE_BY_DOS: u16 = 20;

/// Permissions recorded for entries created here.
const DEFAULT_FILE_MODE: u32 = 0o100644;

/// Upper bound for buffers sized from sizes recorded in headers.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// MS-DOS directory attribute.
const DOS_DIRECTORY_ATTRIBUTE: u32 = 0x10;

/// How an entry's payload is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMethod {
    /// Uncompressed.
    Stored,
    /// Raw deflate stream.
    Deflated,
}

impl StorageMethod {
    fn id(self) -> u16 {
        match self {
            StorageMethod::Stored => 0,
            StorageMethod::Deflated => 8,
        }
    }

    fn version_needed(self) -> u16 {
        match self {
            StorageMethod::Stored => VERSION_NEEDED_STORED,
            StorageMethod::Deflated => VERSION_NEEDED_DEFLATED,
        }
    }
}

/// A single container entry with its raw payload.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    name: String,
    method: StorageMethod,
    crc32: u32,
    uncompressed_size: u64,
    /// Payload exactly as stored in the container.
    data: Vec<u8>,
    unix_mode: Option<u32>,
    /// Offset of the payload in the file this entry was last read from or laid out for.
    data_offset: Option<u64>,
}

impl StoredEntry {
    /// Create an entry from uncompressed contents, deflating them if requested.
    pub fn new(name: impl Into<String>, contents: &[u8], method: StorageMethod) -> io::Result<Self> {
        let mut crc = Crc::new();
        crc.update(contents);

        let data = match method {
            StorageMethod::Stored => contents.to_vec(),
            StorageMethod::Deflated => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(contents)?;
                encoder.finish()?
            }
        };

        Ok(Self {
            name: name.into(),
            method,
            crc32: crc.sum(),
            uncompressed_size: contents.len() as u64,
            data,
            unix_mode: Some(DEFAULT_FILE_MODE),
            data_offset: None,
        })
    }

    /// Path of the entry inside the container.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How the payload is stored.
    pub fn method(&self) -> StorageMethod {
        self.method
    }

    /// Whether this is a directory entry (path ends with `/`).
    pub fn is_directory(&self) -> bool {
        self.name.ends_with('/')
    }

    /// CRC-32 of the uncompressed contents.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Size of the payload as stored.
    pub fn compressed_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Size of the uncompressed contents.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Unix permission bits, if the source recorded them.
    pub fn unix_mode(&self) -> Option<u32> {
        self.unix_mode
    }

    /// Offset of the payload in the file, as last read or realigned.
    ///
    /// `None` for entries added since the last [`ZipContainer::realign`].
    pub fn data_offset(&self) -> Option<u64> {
        self.data_offset
    }

    /// The payload exactly as stored.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// The uncompressed contents, verified against the recorded CRC-32 and size.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Corrupt`] if the payload does not inflate to the
    /// recorded size and checksum.
    pub fn contents(&self) -> Result<Cow<'_, [u8]>> {
        let contents = match self.method {
            StorageMethod::Stored => Cow::Borrowed(self.data.as_slice()),
            StorageMethod::Deflated => {
                let capacity = self.uncompressed_size.min(MAX_PREALLOCATION) as usize;
                let mut out = Vec::with_capacity(capacity);
                DeflateDecoder::new(self.data.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        AssemblyError::Corrupt(format!("Failed to inflate {}: {}", self.name, e))
                    })?;
                Cow::Owned(out)
            }
        };

        let mut crc = Crc::new();
        crc.update(&contents);
        if crc.sum() != self.crc32 || contents.len() as u64 != self.uncompressed_size {
            return Err(AssemblyError::Corrupt(format!(
                "Checksum mismatch in entry {}",
                self.name
            )));
        }

        Ok(contents)
    }
}

/// Placement of one entry in a layout.
#[derive(Debug, Clone, Copy)]
struct Placement {
    header_offset: u64,
    extra_len: u16,
    boundary: u16,
    data_offset: u64,
}

/// A container serialized into its three sections.
///
/// Concatenating `entries`, `central_directory` and `end_of_central_directory`
/// yields the complete file.
#[derive(Debug, Clone)]
pub struct ZipLayout {
    /// Local headers and entry payloads.
    pub entries: Vec<u8>,
    /// Central directory headers.
    pub central_directory: Vec<u8>,
    /// End of central directory record.
    pub end_of_central_directory: Vec<u8>,
}

impl ZipLayout {
    /// The EOCD record with its central directory offset replaced.
    pub fn end_of_central_directory_at(&self, central_directory_offset: u32) -> Vec<u8> {
        let mut eocd = self.end_of_central_directory.clone();
        let field = EOCD_CENTRAL_DIRECTORY_OFFSET_FIELD;
        eocd[field..field + 4].copy_from_slice(&central_directory_offset.to_le_bytes());
        eocd
    }

    /// Total size of the serialized container.
    pub fn len(&self) -> usize {
        self.entries.len() + self.central_directory.len() + self.end_of_central_directory.len()
    }

    /// Whether the layout is empty (never true, the EOCD is always present).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all three sections in order.
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.entries)?;
        writer.write_all(&self.central_directory)?;
        writer.write_all(&self.end_of_central_directory)?;
        Ok(())
    }
}

/// An in-memory, mutable view of a container file.
#[derive(Debug)]
pub struct ZipContainer {
    path: PathBuf,
    entries: Vec<StoredEntry>,
    alignment: AlignmentRule,
}

impl ZipContainer {
    /// Open an existing container for modification.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Io`] if the file cannot be read,
    /// [`AssemblyError::Corrupt`] if it is not a valid zip archive or has
    /// duplicate entries, and [`AssemblyError::UnsupportedCompression`] for
    /// entries that are neither stored nor deflated.
    pub fn open(path: impl AsRef<Path>, alignment: AlignmentRule) -> Result<Self> {
        let path = path.as_ref();
        let entries = read_entries(path)?;

        debug!(path = %path.display(), entries = entries.len(), "Opened container");

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            alignment,
        })
    }

    /// Create an empty container that will be written to `path`.
    pub fn create(path: impl AsRef<Path>, alignment: AlignmentRule) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: Vec::new(),
            alignment,
        }
    }

    /// Path the container is written back to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The alignment rule applied on [`realign`](Self::realign).
    pub fn alignment_rule(&self) -> &AlignmentRule {
        &self.alignment
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the container has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in container order.
    pub fn entries(&self) -> impl Iterator<Item = &StoredEntry> {
        self.entries.iter()
    }

    /// Entry paths in container order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name())
    }

    /// Look up an entry by path.
    pub fn get(&self, name: &str) -> Option<&StoredEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Whether an entry with this path exists.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Add or overwrite a file entry from its uncompressed contents.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::DirectoryCollision`] if `name` is a directory
    /// path or an existing directory entry has the same path.
    pub fn add(&mut self, name: &str, contents: &[u8], compress: bool) -> Result<()> {
        if name.ends_with('/') {
            return Err(AssemblyError::DirectoryCollision(name.to_string()));
        }

        let method = if compress {
            StorageMethod::Deflated
        } else {
            StorageMethod::Stored
        };
        self.insert_entry(StoredEntry::new(name, contents, method)?)?;
        Ok(())
    }

    /// Insert an entry, replacing an existing entry with the same path in place.
    ///
    /// Returns the replaced entry, if any.
    pub fn insert_entry(&mut self, mut entry: StoredEntry) -> Result<Option<StoredEntry>> {
        if entry.name.is_empty() {
            return Err(AssemblyError::Corrupt("Entry with empty name".into()));
        }
        if !entry.is_directory() && self.contains(&format!("{}/", entry.name)) {
            return Err(AssemblyError::DirectoryCollision(entry.name));
        }

        entry.data_offset = None;

        match self.position(&entry.name) {
            Some(index) => Ok(Some(std::mem::replace(&mut self.entries[index], entry))),
            None => {
                self.entries.push(entry);
                Ok(None)
            }
        }
    }

    /// Remove an entry by path.
    pub fn remove(&mut self, name: &str) -> Option<StoredEntry> {
        self.position(name).map(|index| self.entries.remove(index))
    }

    /// Keep only entries for which `keep` returns `true`.
    ///
    /// Returns the number of removed entries.
    pub fn retain(&mut self, mut keep: impl FnMut(&StoredEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| keep(e));
        before - self.entries.len()
    }

    /// Merge every entry of `other` into this container.
    ///
    /// When both containers have an entry with the same path,
    /// `keep_existing(path)` decides whether the entry already present here
    /// survives (`true`) or is replaced by the one from `other` (`false`).
    ///
    /// Returns the number of entries taken from `other`.
    pub fn merge_from(
        &mut self,
        other: ZipContainer,
        keep_existing: impl Fn(&str) -> bool,
    ) -> Result<usize> {
        let mut merged = 0;

        for entry in other.entries {
            if self.contains(&entry.name) && keep_existing(&entry.name) {
                continue;
            }
            self.insert_entry(entry)?;
            merged += 1;
        }

        Ok(merged)
    }

    /// Add every regular file below `root`, named by its path relative to
    /// `root` with `/` separators.
    ///
    /// `should_compress(path)` decides between deflate and stored. Files are
    /// visited in file name order so the result does not depend on the
    /// directory listing order.
    ///
    /// Returns the number of files added.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::Io`] if `root` or any file below it cannot be read.
    pub fn add_all_recursively(
        &mut self,
        root: impl AsRef<Path>,
        should_compress: impl Fn(&str) -> bool,
    ) -> Result<usize> {
        let root = root.as_ref();
        let mut added = 0;

        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(root).map_err(|_| {
                AssemblyError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Failed to compute relative path for {}", entry.path().display()),
                ))
            })?;
            let name = forward_slash_path(relative);

            let contents = fs::read(entry.path())?;
            self.add(&name, &contents, should_compress(&name))?;
            added += 1;
        }

        Ok(added)
    }

    /// Recompute every entry's data offset so it satisfies the alignment rule.
    ///
    /// Only offsets are recomputed; payloads are untouched, so calling this on
    /// an aligned container changes nothing. Returns the number of entries
    /// whose offset changed.
    pub fn realign(&mut self) -> Result<usize> {
        let placements = self.plan()?;
        let mut moved = 0;

        for (entry, placement) in self.entries.iter_mut().zip(placements) {
            if entry.data_offset != Some(placement.data_offset) {
                entry.data_offset = Some(placement.data_offset);
                moved += 1;
            }
        }

        Ok(moved)
    }

    /// Compute header and data offsets for every entry.
    fn plan(&self) -> Result<Vec<Placement>> {
        let mut placements = Vec::with_capacity(self.entries.len());
        let mut offset: u64 = 0;

        for entry in &self.entries {
            let boundary = self.alignment.boundary(&entry.name);
            let natural = offset + LOCAL_HEADER_SIZE + entry.name.len() as u64;

            let extra_len = if natural % boundary == 0 {
                0
            } else {
                let base = natural + ALIGNMENT_EXTRA_FIELD_MIN_SIZE;
                ALIGNMENT_EXTRA_FIELD_MIN_SIZE + (boundary - base % boundary) % boundary
            };

            let too_large = || {
                AssemblyError::TooLarge(format!(
                    "Alignment {} for {} does not fit an extra field",
                    boundary, entry.name
                ))
            };
            let extra_len = u16::try_from(extra_len).map_err(|_| too_large())?;
            let boundary = u16::try_from(boundary).map_err(|_| too_large())?;

            let data_offset = natural + u64::from(extra_len);
            placements.push(Placement {
                header_offset: offset,
                extra_len,
                boundary,
                data_offset,
            });

            offset = data_offset + entry.compressed_size();
        }

        if offset > u64::from(u32::MAX) {
            return Err(AssemblyError::TooLarge(format!(
                "Entries span {} bytes",
                offset
            )));
        }

        Ok(placements)
    }

    /// Serialize the container with every entry aligned.
    ///
    /// # Errors
    ///
    /// Returns [`AssemblyError::TooLarge`] if the container would need ZIP64
    /// structures.
    pub fn layout(&self) -> Result<ZipLayout> {
        let count = u16::try_from(self.entries.len()).map_err(|_| {
            AssemblyError::TooLarge(format!("{} entries", self.entries.len()))
        })?;
        let placements = self.plan()?;

        let mut entries = Vec::new();
        let mut central_directory = Vec::new();

        for (entry, placement) in self.entries.iter().zip(&placements) {
            write_local_header(&mut entries, entry, placement)?;
            entries.extend(&entry.data);
            write_central_header(&mut central_directory, entry, placement)?;
        }

        let central_directory_size = u32::try_from(central_directory.len())
            .map_err(|_| AssemblyError::TooLarge("Central directory".into()))?;
        let central_directory_offset = u32::try_from(entries.len())
            .map_err(|_| AssemblyError::TooLarge("Entries section".into()))?;

        let mut eocd = Vec::with_capacity(END_OF_CENTRAL_DIRECTORY_SIZE);
        eocd.extend(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
        eocd.extend(&0u16.to_le_bytes()); // this disk
        eocd.extend(&0u16.to_le_bytes()); // disk with central directory
        eocd.extend(&count.to_le_bytes());
        eocd.extend(&count.to_le_bytes());
        eocd.extend(&central_directory_size.to_le_bytes());
        eocd.extend(&central_directory_offset.to_le_bytes());
        eocd.extend(&0u16.to_le_bytes()); // comment length

        Ok(ZipLayout {
            entries,
            central_directory,
            end_of_central_directory: eocd,
        })
    }

    /// Realign and durably write the container back to [`path`](Self::path).
    ///
    /// The file is replaced atomically: the new contents go to a temporary
    /// file in the same directory, which is synced and renamed over the
    /// target.
    pub fn write(&mut self) -> Result<()> {
        let moved = self.realign()?;
        let layout = self.layout()?;

        debug!(
            path = %self.path.display(),
            entries = self.entries.len(),
            moved,
            bytes = layout.len(),
            "Writing container"
        );

        persist_atomically(&self.path, |file| layout.write_to(file))?;
        Ok(())
    }
}

/// Read every entry of the container at `path` with its raw payload.
fn read_entries(path: &Path) -> Result<Vec<StoredEntry>> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| zip_error(path, e))?;

    let mut entries = Vec::with_capacity(archive.len());
    let mut seen = HashSet::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut file = archive.by_index_raw(index).map_err(|e| zip_error(path, e))?;
        let name = file.name().to_string();

        let method = match file.compression() {
            CompressionMethod::Stored => StorageMethod::Stored,
            CompressionMethod::Deflated => StorageMethod::Deflated,
            other => {
                return Err(AssemblyError::UnsupportedCompression {
                    name,
                    method: format!("{:?}", other),
                })
            }
        };

        let mut data = Vec::with_capacity(file.compressed_size().min(MAX_PREALLOCATION) as usize);
        file.read_to_end(&mut data)?;
        if data.len() as u64 != file.compressed_size() {
            return Err(AssemblyError::Corrupt(format!(
                "{}: entry {} is truncated",
                path.display(),
                name
            )));
        }

        if !seen.insert(name.clone()) {
            return Err(AssemblyError::Corrupt(format!(
                "{}: duplicate entry {}",
                path.display(),
                name
            )));
        }

        entries.push(StoredEntry {
            method,
            crc32: file.crc32(),
            uncompressed_size: file.size(),
            unix_mode: file.unix_mode(),
            data_offset: Some(file.data_start()),
            data,
            name,
        });
    }

    Ok(entries)
}

fn zip_error(path: &Path, e: ZipError) -> AssemblyError {
    match e {
        ZipError::Io(e) => AssemblyError::Io(e),
        other => AssemblyError::Corrupt(format!("{}: {}", path.display(), other)),
    }
}

fn general_purpose_flags(entry: &StoredEntry) -> u16 {
    if entry.name.is_ascii() {
        0
    } else {
        FLAG_UTF8
    }
}

fn entry_sizes(entry: &StoredEntry) -> Result<(u32, u32)> {
    let too_large = || AssemblyError::TooLarge(format!("Entry {}", entry.name));
    let compressed = u32::try_from(entry.compressed_size()).map_err(|_| too_large())?;
    let uncompressed = u32::try_from(entry.uncompressed_size).map_err(|_| too_large())?;
    Ok((compressed, uncompressed))
}

fn name_len(entry: &StoredEntry) -> Result<u16> {
    u16::try_from(entry.name.len())
        .map_err(|_| AssemblyError::TooLarge(format!("Entry name {}", entry.name)))
}

fn write_local_header(buf: &mut Vec<u8>, entry: &StoredEntry, placement: &Placement) -> Result<()> {
    let (compressed, uncompressed) = entry_sizes(entry)?;

    buf.extend(&LOCAL_HEADER_SIGNATURE.to_le_bytes());
    buf.extend(&entry.method.version_needed().to_le_bytes());
    buf.extend(&general_purpose_flags(entry).to_le_bytes());
    buf.extend(&entry.method.id().to_le_bytes());
    buf.extend(&DOS_TIME.to_le_bytes());
    buf.extend(&DOS_DATE.to_le_bytes());
    buf.extend(&entry.crc32.to_le_bytes());
    buf.extend(&compressed.to_le_bytes());
    buf.extend(&uncompressed.to_le_bytes());
    buf.extend(&name_len(entry)?.to_le_bytes());
    buf.extend(&placement.extra_len.to_le_bytes());
    buf.extend(entry.name.as_bytes());

    if placement.extra_len > 0 {
        let data_size = placement.extra_len - 4;
        buf.extend(&ALIGNMENT_EXTRA_FIELD_ID.to_le_bytes());
        buf.extend(&data_size.to_le_bytes());
        buf.extend(&placement.boundary.to_le_bytes());
        buf.resize(buf.len() + usize::from(placement.extra_len) - 6, 0);
    }

    Ok(())
}

fn write_central_header(buf: &mut Vec<u8>, entry: &StoredEntry, placement: &Placement) -> Result<()> {
    let (compressed, uncompressed) = entry_sizes(entry)?;
    let header_offset = u32::try_from(placement.header_offset)
        .map_err(|_| AssemblyError::TooLarge(format!("Offset of {}", entry.name)))?;

    let (version_made_by, external_attributes) = match entry.unix_mode {
        Some(mode) => (VERSION_MADE_BY_UNIX, mode << 16),
        None if entry.is_directory() => (VERSION_MADE_BY_DOS, DOS_DIRECTORY_ATTRIBUTE),
        None => (VERSION_MADE_BY_DOS, 0),
    };

    buf.extend(&CENTRAL_HEADER_SIGNATURE.to_le_bytes());
    buf.extend(&version_made_by.to_le_bytes());
    buf.extend(&entry.method.version_needed().to_le_bytes());
    buf.extend(&general_purpose_flags(entry).to_le_bytes());
    buf.extend(&entry.method.id().to_le_bytes());
    buf.extend(&DOS_TIME.to_le_bytes());
    buf.extend(&DOS_DATE.to_le_bytes());
    buf.extend(&entry.crc32.to_le_bytes());
    buf.extend(&compressed.to_le_bytes());
    buf.extend(&uncompressed.to_le_bytes());
    buf.extend(&name_len(entry)?.to_le_bytes());
    buf.extend(&0u16.to_le_bytes()); // extra field length
    buf.extend(&0u16.to_le_bytes()); // comment length
    buf.extend(&0u16.to_le_bytes()); // disk number start
    buf.extend(&0u16.to_le_bytes()); // internal attributes
    buf.extend(&external_attributes.to_le_bytes());
    buf.extend(&header_offset.to_le_bytes());
    buf.extend(entry.name.as_bytes());

    Ok(())
}

/// Join the components of a relative path with `/`.
pub(crate) fn forward_slash_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Build a zip with the zip crate, deliberately unaligned.
    fn create_test_zip(path: &Path, files: &[(&str, &[u8], CompressionMethod)]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);

        for (name, contents, method) in files {
            let options = SimpleFileOptions::default().compression_method(*method);
            zip.start_file(*name, options).unwrap();
            zip.write_all(contents).unwrap();
        }

        zip.finish().unwrap();
    }

    fn read_u16(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    /// Walk the central directory of `bytes` and resolve each entry's data offset
    /// from its local header.
    fn data_offsets(bytes: &[u8]) -> Vec<(String, u64)> {
        let eocd = bytes.len() - END_OF_CENTRAL_DIRECTORY_SIZE;
        assert_eq!(read_u32(bytes, eocd), END_OF_CENTRAL_DIRECTORY_SIGNATURE);

        let count = read_u16(bytes, eocd + 10) as usize;
        let mut cursor = read_u32(bytes, eocd + 16) as usize;
        let mut offsets = Vec::with_capacity(count);

        for _ in 0..count {
            assert_eq!(read_u32(bytes, cursor), CENTRAL_HEADER_SIGNATURE);
            let name_len = read_u16(bytes, cursor + 28) as usize;
            let extra_len = read_u16(bytes, cursor + 30) as usize;
            let comment_len = read_u16(bytes, cursor + 32) as usize;
            let local = read_u32(bytes, cursor + 42) as usize;
            let name = String::from_utf8(bytes[cursor + 46..cursor + 46 + name_len].to_vec()).unwrap();

            assert_eq!(read_u32(bytes, local), LOCAL_HEADER_SIGNATURE);
            let local_name_len = read_u16(bytes, local + 26) as usize;
            let local_extra_len = read_u16(bytes, local + 28) as usize;
            offsets.push((name, (local + 30 + local_name_len + local_extra_len) as u64));

            cursor += 46 + name_len + extra_len + comment_len;
        }

        offsets
    }

    #[test]
    fn test_open_reads_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.apk");
        create_test_zip(
            &path,
            &[
                ("AndroidManifest.xml", b"<manifest/>", CompressionMethod::Deflated),
                ("lib/arm64-v8a/libfoo.so", b"\x7fELF", CompressionMethod::Stored),
            ],
        );

        let container = ZipContainer::open(&path, AlignmentRule::apk()).unwrap();
        assert_eq!(container.len(), 2);
        assert_eq!(
            container.names().collect::<Vec<_>>(),
            vec!["AndroidManifest.xml", "lib/arm64-v8a/libfoo.so"]
        );

        let manifest = container.get("AndroidManifest.xml").unwrap();
        assert_eq!(manifest.method(), StorageMethod::Deflated);
        assert_eq!(manifest.contents().unwrap().as_ref(), b"<manifest/>");
        assert!(manifest.data_offset().is_some());
    }

    #[test]
    fn test_open_not_a_zip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.apk");
        fs::write(&path, [0x42u8; 256]).unwrap();

        let result = ZipContainer::open(&path, AlignmentRule::apk());
        assert!(matches!(result, Err(AssemblyError::Corrupt(_))));
    }

    #[test]
    fn test_open_rejects_oversized_entry_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("huge.apk");
        create_test_zip(&path, &[("classes.dex", b"dex", CompressionMethod::Stored)]);

        // Claim a compressed size of almost 4 GiB in both headers.
        let mut bytes = fs::read(&path).unwrap();
        let eocd = bytes.len() - END_OF_CENTRAL_DIRECTORY_SIZE;
        let central = read_u32(&bytes, eocd + 16) as usize;
        let claimed = 0xffff_fff0u32.to_le_bytes();
        bytes[18..22].copy_from_slice(&claimed);
        bytes[central + 20..central + 24].copy_from_slice(&claimed);
        fs::write(&path, &bytes).unwrap();

        let result = ZipContainer::open(&path, AlignmentRule::apk());
        assert!(matches!(
            result,
            Err(AssemblyError::Corrupt(_)) | Err(AssemblyError::Io(_))
        ));
    }

    #[test]
    fn test_open_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let result = ZipContainer::open(temp_dir.path().join("missing.apk"), AlignmentRule::apk());
        assert!(matches!(result, Err(AssemblyError::Io(_))));
    }

    #[test]
    fn test_write_aligns_every_entry() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.apk");
        create_test_zip(
            &path,
            &[
                ("a", b"x", CompressionMethod::Stored),
                ("lib/x86/libone.so", &[1u8; 5000], CompressionMethod::Stored),
                ("odd-name.bin", b"123", CompressionMethod::Stored),
                ("lib/x86/libtwo.so", &[2u8; 17], CompressionMethod::Stored),
                ("classes.dex", &[3u8; 333], CompressionMethod::Deflated),
            ],
        );

        let mut container = ZipContainer::open(&path, AlignmentRule::apk()).unwrap();
        container.write().unwrap();

        let bytes = fs::read(&path).unwrap();
        let rule = AlignmentRule::apk();
        let offsets = data_offsets(&bytes);
        assert_eq!(offsets.len(), 5);
        for (name, offset) in &offsets {
            assert!(rule.is_aligned(name, *offset), "{} at {} is not aligned", name, offset);
        }

        // Offsets recorded by the container match the file.
        for (name, offset) in offsets {
            assert_eq!(container.get(&name).unwrap().data_offset(), Some(offset));
        }
    }

    #[test]
    fn test_write_is_readable_by_zip_crate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.apk");
        create_test_zip(&path, &[("keep.txt", b"keep", CompressionMethod::Deflated)]);

        let mut container = ZipContainer::open(&path, AlignmentRule::apk()).unwrap();
        container.add("new/stored.bin", b"stored bytes", false).unwrap();
        container.add("new/deflated.txt", &[b'z'; 4096], true).unwrap();
        container.write().unwrap();

        let mut archive = ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);

        let mut contents = Vec::new();
        archive.by_name("keep.txt").unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"keep");

        let stored = archive.by_name("new/stored.bin").unwrap();
        assert_eq!(stored.compression(), CompressionMethod::Stored);
        drop(stored);

        contents.clear();
        let mut deflated = archive.by_name("new/deflated.txt").unwrap();
        assert_eq!(deflated.compression(), CompressionMethod::Deflated);
        deflated.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, vec![b'z'; 4096]);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.apk");
        create_test_zip(
            &path,
            &[
                ("res/layout/main.xml", b"<LinearLayout/>", CompressionMethod::Deflated),
                ("lib/armeabi-v7a/libx.so", &[9u8; 100], CompressionMethod::Stored),
                ("resources.arsc", &[7u8; 55], CompressionMethod::Stored),
            ],
        );

        let mut first = ZipContainer::open(&path, AlignmentRule::apk()).unwrap();
        first.write().unwrap();
        let first_bytes = fs::read(&path).unwrap();

        let mut second = ZipContainer::open(&path, AlignmentRule::apk()).unwrap();
        assert_eq!(second.realign().unwrap(), 0, "aligned container must not move");
        second.write().unwrap();
        let second_bytes = fs::read(&path).unwrap();

        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn test_add_overwrites_in_place() {
        let temp_dir = TempDir::new().unwrap();
        let mut container = ZipContainer::create(temp_dir.path().join("new.apk"), AlignmentRule::apk());

        container.add("classes.dex", b"old", true).unwrap();
        container.add("AndroidManifest.xml", b"<manifest/>", true).unwrap();
        container.add("classes.dex", b"new", true).unwrap();

        assert_eq!(container.len(), 2);
        assert_eq!(container.names().next(), Some("classes.dex"));
        assert_eq!(
            container.get("classes.dex").unwrap().contents().unwrap().as_ref(),
            b"new"
        );
    }

    #[test]
    fn test_add_directory_collision() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dirs.apk");
        {
            let file = File::create(&path).unwrap();
            let mut zip = ZipWriter::new(file);
            zip.add_directory("assets/", SimpleFileOptions::default()).unwrap();
            zip.finish().unwrap();
        }

        let mut container = ZipContainer::open(&path, AlignmentRule::apk()).unwrap();
        assert!(matches!(
            container.add("assets", b"x", true),
            Err(AssemblyError::DirectoryCollision(name)) if name == "assets"
        ));
        assert!(matches!(
            container.add("lib/", b"x", true),
            Err(AssemblyError::DirectoryCollision(_))
        ));
    }

    #[test]
    fn test_remove_and_retain() {
        let temp_dir = TempDir::new().unwrap();
        let mut container = ZipContainer::create(temp_dir.path().join("x.apk"), AlignmentRule::apk());
        for name in ["res/a.png", "res/b.png", "classes.dex", "assets/c.txt"] {
            container.add(name, name.as_bytes(), true).unwrap();
        }

        assert!(container.remove("assets/c.txt").is_some());
        assert!(container.remove("assets/c.txt").is_none());

        let removed = container.retain(|e| !e.name().starts_with("res/"));
        assert_eq!(removed, 2);
        assert_eq!(container.names().collect::<Vec<_>>(), vec!["classes.dex"]);
    }

    #[test]
    fn test_merge_from_respects_keep_existing() {
        let temp_dir = TempDir::new().unwrap();
        let mut target = ZipContainer::create(temp_dir.path().join("t.apk"), AlignmentRule::apk());
        target.add("AndroidManifest.xml", b"target", true).unwrap();
        target.add("resources.arsc", b"target", false).unwrap();

        let mut overlay = ZipContainer::create(temp_dir.path().join("o.apk"), AlignmentRule::apk());
        overlay.add("AndroidManifest.xml", b"overlay", true).unwrap();
        overlay.add("resources.arsc", b"overlay", false).unwrap();
        overlay.add("res/b.png", b"overlay", false).unwrap();

        let merged = target
            .merge_from(overlay, |name| name == "AndroidManifest.xml")
            .unwrap();
        assert_eq!(merged, 2);

        let contents = |name: &str| target.get(name).unwrap().contents().unwrap().into_owned();
        assert_eq!(contents("AndroidManifest.xml"), b"target");
        assert_eq!(contents("resources.arsc"), b"overlay");
        assert_eq!(contents("res/b.png"), b"overlay");
    }

    #[test]
    fn test_add_all_recursively() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("raw");
        fs::create_dir_all(root.join("assets/fonts")).unwrap();
        fs::write(root.join("assets/fonts/a.ttf"), b"font").unwrap();
        fs::write(root.join("assets/readme.txt"), b"text").unwrap();

        let mut container = ZipContainer::create(temp_dir.path().join("x.apk"), AlignmentRule::apk());
        let added = container
            .add_all_recursively(&root, |name| name != "assets/fonts/a.ttf")
            .unwrap();

        assert_eq!(added, 2);
        assert_eq!(
            container.get("assets/fonts/a.ttf").unwrap().method(),
            StorageMethod::Stored
        );
        assert_eq!(
            container.get("assets/readme.txt").unwrap().method(),
            StorageMethod::Deflated
        );
    }

    #[test]
    fn test_add_all_recursively_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let mut container = ZipContainer::create(temp_dir.path().join("x.apk"), AlignmentRule::apk());
        let result = container.add_all_recursively(temp_dir.path().join("nope"), |_| true);
        assert!(matches!(result, Err(AssemblyError::Io(_))));
    }

    #[test]
    fn test_contents_detects_corruption() {
        let mut entry = StoredEntry::new("classes.dex", b"dex bytes", StorageMethod::Stored).unwrap();
        entry.crc32 ^= 1;
        assert!(matches!(entry.contents(), Err(AssemblyError::Corrupt(_))));
    }

    #[test]
    fn test_layout_eocd_offset_patch() {
        let temp_dir = TempDir::new().unwrap();
        let mut container = ZipContainer::create(temp_dir.path().join("x.apk"), AlignmentRule::apk());
        container.add("classes.dex", b"dex", true).unwrap();

        let layout = container.layout().unwrap();
        let original = read_u32(&layout.end_of_central_directory, 16);
        assert_eq!(original as usize, layout.entries.len());

        let patched = layout.end_of_central_directory_at(0x1234_5678);
        assert_eq!(read_u32(&patched, 16), 0x1234_5678);
        assert_eq!(patched.len(), END_OF_CENTRAL_DIRECTORY_SIZE);
    }

    #[test]
    fn test_forward_slash_path() {
        let path: PathBuf = ["res", "raw", "file.bin"].iter().collect();
        assert_eq!(forward_slash_path(&path), "res/raw/file.bin");
    }
}
