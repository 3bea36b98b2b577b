//! Stageable content.
//!
//! A [`Content`] expands into [`ContainerEntry`] values: a container-relative
//! path, a size, an optional mode and a lazy byte source. Nothing is read
//! from disk until the streaming engine opens an entry's source while it is
//! writing the archive, so large application trees are never buffered ahead
//! of the upload.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Default mode for regular files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default mode for directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

// =============================================================================
// Entry Sources
// =============================================================================

/// Lazily opened bytes behind an entry.
pub trait EntrySource: Send + Sync + fmt::Debug {
    /// Opens a fresh reader. `Ok(None)` means the source produced no stream.
    fn open(&self) -> io::Result<Option<Box<dyn Read + Send>>>;
}

/// In-memory bytes.
#[derive(Debug, Clone)]
pub struct BytesSource(Arc<[u8]>);

impl EntrySource for BytesSource {
    fn open(&self) -> io::Result<Option<Box<dyn Read + Send>>> {
        Ok(Some(Box::new(io::Cursor::new(self.0.clone()))))
    }
}

/// A file on the host.
#[derive(Debug, Clone)]
pub struct FileSource(PathBuf);

impl EntrySource for FileSource {
    fn open(&self) -> io::Result<Option<Box<dyn Read + Send>>> {
        Ok(Some(Box::new(File::open(&self.0)?)))
    }
}

// =============================================================================
// Container Entries
// =============================================================================

/// What an entry materializes as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One stageable unit.
#[derive(Debug, Clone)]
pub struct ContainerEntry {
    path: String,
    kind: EntryKind,
    size: Option<u64>,
    mode: Option<u32>,
    source: Option<Arc<dyn EntrySource>>,
}

impl ContainerEntry {
    /// A regular file with explicit size and source.
    pub fn new(
        path: impl Into<String>,
        size: Option<u64>,
        mode: Option<u32>,
        source: Option<Arc<dyn EntrySource>>,
    ) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            mode,
            source,
        }
    }

    /// A regular file holding `bytes`.
    pub fn from_bytes(path: impl Into<String>, bytes: impl Into<Vec<u8>>, mode: Option<u32>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let bytes: Arc<[u8]> = bytes.into();
        Self::new(
            path,
            Some(bytes.len() as u64),
            mode,
            Some(Arc::new(BytesSource(bytes))),
        )
    }

    /// A regular file copied from the host. The size is read now; the
    /// content only when the archive is written.
    pub fn from_file(path: impl Into<String>, host_path: impl Into<PathBuf>, mode: Option<u32>) -> Self {
        let host_path = host_path.into();
        let size = std::fs::metadata(&host_path).ok().map(|m| m.len());
        let mode = mode.or_else(|| file_mode(&host_path));
        Self::new(path, size, mode, Some(Arc::new(FileSource(host_path))))
    }

    /// An empty directory.
    pub fn directory(path: impl Into<String>, mode: Option<u32>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            size: Some(0),
            mode,
            source: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    /// Opens the entry's bytes, failing if there is no usable stream.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        let source = self.source.as_ref().ok_or_else(|| self.invalid("missing byte source"))?;
        source
            .open()
            .map_err(|e| self.invalid(&format!("failed to open: {}", e)))?
            .ok_or_else(|| self.invalid("byte source yielded no stream"))
    }

    /// Checks everything that can be checked without opening the source.
    pub fn validate(&self) -> Result<()> {
        if self.path.trim_matches('/').is_empty() {
            return Err(self.invalid("empty path"));
        }
        if self.kind == EntryKind::File {
            if self.size.is_none() {
                return Err(self.invalid("size cannot be determined"));
            }
            if self.source.is_none() {
                return Err(self.invalid("missing byte source"));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::InvalidEntry {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

// =============================================================================
// Content
// =============================================================================

/// A source of one or more container entries.
pub trait Content: Send + Sync + fmt::Debug {
    fn entries(&self) -> Result<Vec<ContainerEntry>>;
}

/// A single in-memory string.
#[derive(Debug, Clone)]
pub struct StringContent {
    path: String,
    contents: String,
    mode: Option<u32>,
}

impl StringContent {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

impl Content for StringContent {
    fn entries(&self) -> Result<Vec<ContainerEntry>> {
        Ok(vec![ContainerEntry::from_bytes(
            self.path.clone(),
            self.contents.as_bytes().to_vec(),
            self.mode,
        )])
    }
}

/// A single host file placed at `path`.
#[derive(Debug, Clone)]
pub struct FileContent {
    path: String,
    host_path: PathBuf,
}

impl FileContent {
    pub fn new(path: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            host_path: host_path.into(),
        }
    }
}

impl Content for FileContent {
    fn entries(&self) -> Result<Vec<ContainerEntry>> {
        Ok(vec![ContainerEntry::from_file(
            self.path.clone(),
            self.host_path.clone(),
            None,
        )])
    }
}

/// Every regular file under a host directory, placed at the staging root.
#[derive(Debug, Clone)]
pub struct DirectoryContent {
    root: PathBuf,
}

impl DirectoryContent {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Content for DirectoryContent {
    fn entries(&self) -> Result<Vec<ContainerEntry>> {
        if !self.root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "application path {} is not a directory",
                self.root.display()
            )));
        }

        let mut entries = Vec::new();
        for item in WalkDir::new(&self.root).follow_links(true).sort_by_file_name() {
            let item = item.map_err(|e| Error::Io(e.into()))?;
            let relative = match item.path().strip_prefix(&self.root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if item.file_type().is_dir() {
                // Directories with children get synthesized; only empty
                // ones need an explicit entry.
                let is_empty = std::fs::read_dir(item.path())?.next().is_none();
                if is_empty {
                    entries.push(ContainerEntry::directory(path, file_mode(item.path())));
                }
            } else if item.file_type().is_file() {
                entries.push(ContainerEntry::from_file(path, item.path(), None));
            }
        }
        Ok(entries)
    }
}

/// Joins two container path fragments with a single `/`.
pub fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, _) => path.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, path),
    }
}
