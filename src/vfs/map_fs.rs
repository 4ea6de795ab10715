//! An in-memory filesystem service.
//!
//! `MapFS` keeps the whole volume in a `BTreeMap` keyed by absolute volume paths. It is
//! used for dry runs (what would be packed, and would it fit) and as the test double for
//! the ingestion engine: its byte capacity produces short writes exactly like a full
//! FAT volume, and it counts open file handles.
//!
//! ### Invariants
//! 1. **Root existence**: after `format`, `/` is always present and is a directory.
//! 2. **Parent consistency**: for any entry `/a/b/c` there is a directory `/a/b`.
//! 3. **Capacity**: the sum of all file lengths never exceeds `capacity`.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::FsFormat;
use crate::core::{FsFile, FsResult, FsService};
use crate::disk::IMAGE_DRIVE;
use crate::error::FsError;
use crate::vfs::EntryType;

#[derive(Debug, Clone, PartialEq)]
struct Node {
    entry_type: EntryType,
    content: Vec<u8>,
}

impl Node {
    fn dir() -> Self {
        Node {
            entry_type: EntryType::Directory,
            content: Vec::new(),
        }
    }

    fn file(content: Vec<u8>) -> Self {
        Node {
            entry_type: EntryType::File,
            content,
        }
    }

    fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}

/// In-memory `FsService` with a fixed byte capacity.
#[derive(Debug)]
pub struct MapFS {
    capacity: u64,
    format: Option<FsFormat>,
    mounted: bool,
    entries: BTreeMap<String, Node>,
    open_handles: usize,
}

impl MapFS {
    /// Creates an unformatted volume able to hold `capacity` bytes of file data.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            format: None,
            mounted: false,
            entries: BTreeMap::new(),
            open_handles: 0,
        }
    }

    /// Creates a formatted and mounted volume, ready for `mkdir`/`create`.
    pub fn mounted(capacity: u64) -> Self {
        let mut fs = Self::new(capacity);
        fs.format = Some(FsFormat::Fat);
        fs.entries.insert("/".to_string(), Node::dir());
        fs.mounted = true;
        fs
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes of file data currently stored.
    pub fn used(&self) -> u64 {
        self.entries.values().map(|n| n.content.len() as u64).sum()
    }

    pub fn format_type(&self) -> Option<FsFormat> {
        self.format
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Number of files created and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open_handles
    }

    pub fn exists(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.entries.get(&normalize(path)).is_some_and(Node::is_dir)
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.entries
            .get(&normalize(path))
            .is_some_and(|n| n.entry_type == EntryType::File)
    }

    /// Content of the file at `path`.
    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.entries
            .get(&normalize(path))
            .filter(|n| !n.is_dir())
            .map(|n| n.content.as_slice())
    }

    /// All entries except the root, in path order.
    pub fn tree(&self) -> impl Iterator<Item = (&str, EntryType)> {
        self.entries
            .iter()
            .filter(|(path, _)| path.as_str() != "/")
            .map(|(path, node)| (path.as_str(), node.entry_type))
    }

    /// Places a file directly, bypassing capacity checks. The parent must exist.
    pub fn insert_file(&mut self, path: &str, content: &[u8]) -> FsResult<()> {
        let path = normalize(path);
        self.check_parent(&path)?;
        self.entries.insert(path, Node::file(content.to_vec()));
        Ok(())
    }

    fn check_mounted(&self) -> FsResult<()> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        Ok(())
    }

    fn check_parent(&self, path: &str) -> FsResult<()> {
        let parent = parent_of(path);
        match self.entries.get(parent) {
            Some(node) if node.is_dir() => Ok(()),
            Some(_) => Err(FsError::NotADirectory(parent.to_string())),
            None => Err(FsError::NotFound(parent.to_string())),
        }
    }
}

impl FsService for MapFS {
    type File<'a> = MapFile<'a>;

    fn format(&mut self, drive: u8, format: FsFormat) -> FsResult<()> {
        if drive != IMAGE_DRIVE {
            return Err(FsError::NotFound(format!("drive {drive}")));
        }
        if self.mounted {
            return Err(FsError::AlreadyMounted);
        }
        self.entries.clear();
        self.entries.insert("/".to_string(), Node::dir());
        self.format = Some(format);
        debug!(%format, capacity = self.capacity, "formatted in-memory volume");
        Ok(())
    }

    fn mount(&mut self, drive: u8) -> FsResult<()> {
        if drive != IMAGE_DRIVE {
            return Err(FsError::NotFound(format!("drive {drive}")));
        }
        if self.format.is_none() {
            return Err(FsError::Unsupported("volume is not formatted".into()));
        }
        if self.mounted {
            return Err(FsError::AlreadyMounted);
        }
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self, _drive: u8) -> FsResult<()> {
        self.check_mounted()?;
        self.mounted = false;
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> FsResult<()> {
        self.check_mounted()?;
        let path = normalize(path);
        if let Some(node) = self.entries.get(&path) {
            return if node.is_dir() {
                Err(FsError::Exists(path))
            } else {
                Err(FsError::NotADirectory(path))
            };
        }
        self.check_parent(&path)?;
        self.entries.insert(path, Node::dir());
        Ok(())
    }

    fn create(&mut self, path: &str) -> FsResult<MapFile<'_>> {
        self.check_mounted()?;
        let path = normalize(path);
        if path == "/" || self.is_dir(&path) {
            return Err(FsError::Exists(path));
        }
        self.check_parent(&path)?;
        self.entries.insert(path.clone(), Node::file(Vec::new()));
        self.open_handles += 1;
        Ok(MapFile { fs: self, path })
    }
}

/// Open file of a [`MapFS`]. Writes append.
#[derive(Debug)]
pub struct MapFile<'a> {
    fs: &'a mut MapFS,
    path: String,
}

impl FsFile for MapFile<'_> {
    fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let free = self.fs.capacity.saturating_sub(self.fs.used());
        let n = buf.len().min(usize::try_from(free).unwrap_or(usize::MAX));
        let node = self
            .fs
            .entries
            .get_mut(&self.path)
            .ok_or_else(|| FsError::NotFound(self.path.clone()))?;
        node.content.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(self) -> FsResult<()> {
        Ok(())
    }
}

impl Drop for MapFile<'_> {
    fn drop(&mut self) {
        self.fs.open_handles -= 1;
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}
