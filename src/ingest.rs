//! Tree ingestion: replays a host directory tree into a mounted filesystem.
//!
//! ### Order
//! Within every host directory, subdirectories are visited first and files after them,
//! each group in lexical byte order of the names, whatever order the host returned them
//! in. The walk is depth-first: a directory is created, then its whole subtree is packed,
//! then its next sibling.
//!
//! ### Failure
//! The first unrecoverable error aborts the entire walk. Nothing is rolled back; a file
//! that failed mid-copy is left closed and partial in the image. An already existing
//! destination directory is not an error.
//!
//! Two checks run on the host side before anything of a level is created:
//! - FAT and exFAT compare names without case, so two entries of one host directory
//!   whose names differ only in case (`A.txt`, `a.txt`) are rejected.
//! - A directory whose canonical path is already on the walk (a link back to an
//!   ancestor) is rejected instead of being followed forever.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::vec;

use tracing::{debug, info, warn};

use crate::core::{FsFile, FsService, HostTree, Result, utils};
use crate::error::{FsError, PackError};
use crate::vfs::{EntryType, HostEntry};

/// Size of the buffer every file copy streams through.
pub const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Totals of one ingestion pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub directories: u64,
    pub files: u64,
    pub bytes: u64,
    /// Host entries that were neither files nor directories.
    pub skipped: u64,
}

/// One directory level of the walk.
struct WalkFrame {
    host_dir: PathBuf,
    /// `host_dir` with links resolved.
    canonical: PathBuf,
    dest_dir: String,
    entries: vec::IntoIter<HostEntry>,
}

/// Copies host trees into a mounted [`FsService`] through one reusable buffer.
pub struct Ingestor<'a, S: FsService, H: HostTree> {
    fs: &'a mut S,
    host: &'a H,
    buffer: Box<[u8; COPY_BUFFER_SIZE]>,
    stats: IngestStats,
}

impl<'a, S: FsService, H: HostTree> Ingestor<'a, S, H> {
    pub fn new(fs: &'a mut S, host: &'a H) -> Self {
        Self {
            fs,
            host,
            buffer: Box::new([0u8; COPY_BUFFER_SIZE]),
            stats: IngestStats::default(),
        }
    }

    /// Totals accumulated so far, including a walk that failed midway.
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Mirrors the contents of `host_root` below `dest_root` (`""` or `"/"` for the
    /// volume root).
    ///
    /// # Returns
    /// * `Ok(IngestStats)` - every entry was created and every file copied.
    /// * `Err(PackError)` - the first failure, naming the host or volume path:
    ///   - `HostAccess` when a host directory cannot be listed or a file cannot be read,
    ///     when two names of one directory differ only in case, or when a directory
    ///     links back to one of its ancestors;
    ///   - `Create` when a directory or file cannot be created in the volume;
    ///   - `Write` when the volume refuses data or accepts fewer bytes than offered.
    pub fn ingest(&mut self, host_root: &Path, dest_root: &str) -> Result<IngestStats> {
        let canonical = self.canonical(host_root)?;
        let root = self.open_frame(host_root.to_path_buf(), canonical, dest_root.to_string())?;
        let mut stack = vec![root];

        while let Some(frame) = stack.last_mut() {
            let Some(entry) = frame.entries.next() else {
                stack.pop();
                continue;
            };

            let name = entry_name(&frame.host_dir, &entry)?;
            let host_child = frame.host_dir.join(name);
            let dest_child = utils::join_dest(&frame.dest_dir, name);

            match entry.entry_type() {
                EntryType::Directory => {
                    let canonical = self.canonical(&host_child)?;
                    if let Some(ancestor) = stack.iter().find(|f| f.canonical == canonical) {
                        let looped = io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("directory loops back to {}", ancestor.host_dir.display()),
                        );
                        return Err(PackError::host(host_child, looped));
                    }
                    self.make_dir(&dest_child)?;
                    let child = self.open_frame(host_child, canonical, dest_child)?;
                    stack.push(child);
                }
                EntryType::File => {
                    self.copy_file(&host_child, &dest_child)?;
                }
                EntryType::Other => {
                    warn!(
                        path = %host_child.display(),
                        "skipping entry that is neither file nor directory"
                    );
                    self.stats.skipped += 1;
                }
            }
        }

        Ok(self.stats)
    }

    fn canonical(&self, dir: &Path) -> Result<PathBuf> {
        self.host
            .canonical(dir)
            .map_err(|e| PackError::host(dir, e))
    }

    fn open_frame(
        &self,
        host_dir: PathBuf,
        canonical: PathBuf,
        dest_dir: String,
    ) -> Result<WalkFrame> {
        let mut entries = self
            .host
            .list(&host_dir)
            .map_err(|e| PackError::host(&host_dir, e))?;
        entries.retain(|e| !e.name().to_str().is_some_and(utils::is_dot_entry));
        entries.sort_by(|a, b| {
            b.is_dir()
                .cmp(&a.is_dir())
                .then_with(|| a.name().cmp(b.name()))
        });
        check_case_collisions(&host_dir, &entries)?;
        debug!(dir = %host_dir.display(), entries = entries.len(), "listed host directory");

        Ok(WalkFrame {
            host_dir,
            canonical,
            dest_dir,
            entries: entries.into_iter(),
        })
    }

    fn make_dir(&mut self, dest: &str) -> Result<()> {
        info!(path = dest, "creating directory");
        match self.fs.mkdir(dest) {
            Ok(()) => {}
            Err(FsError::Exists(_)) => debug!(path = dest, "directory already exists"),
            Err(source) => {
                return Err(PackError::Create {
                    path: dest.to_string(),
                    source,
                });
            }
        }
        self.stats.directories += 1;
        Ok(())
    }

    /// Streams one host file into a freshly created (or truncated) volume file.
    ///
    /// Both handles are released on every path out of this function.
    pub fn copy_file(&mut self, host_path: &Path, dest_path: &str) -> Result<u64> {
        let mut source = self
            .host
            .open(host_path)
            .map_err(|e| PackError::host(host_path, e))?;

        let Self { fs, buffer, .. } = self;
        let mut dest = fs.create(dest_path).map_err(|source| PackError::Create {
            path: dest_path.to_string(),
            source,
        })?;
        info!(from = %host_path.display(), to = dest_path, "copying file");

        let write_error = |source| PackError::Write {
            path: dest_path.to_string(),
            source,
        };
        let mut copied = 0u64;
        loop {
            let n = match source.read(&mut buffer[..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PackError::host(host_path, e)),
            };
            let written = dest.write(&buffer[..n]).map_err(write_error)?;
            if written < n {
                return Err(write_error(FsError::NoSpace));
            }
            copied += n as u64;
        }
        dest.close().map_err(write_error)?;

        debug!(path = dest_path, bytes = copied, "file copied");
        self.stats.files += 1;
        self.stats.bytes += copied;
        Ok(copied)
    }
}

/// Fails on the second of two names that only differ in case.
fn check_case_collisions(host_dir: &Path, entries: &[HostEntry]) -> Result<()> {
    let mut folded: HashMap<String, &OsStr> = HashMap::with_capacity(entries.len());
    for entry in entries {
        let Some(name) = entry.name().to_str() else {
            continue;
        };
        if let Some(first) = folded.insert(name.to_uppercase(), entry.name()) {
            let clash = io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!(
                    "{} has the same name on a case-insensitive volume",
                    host_dir.join(first).display()
                ),
            );
            return Err(PackError::host(host_dir.join(entry.name()), clash));
        }
    }
    Ok(())
}

fn entry_name<'e>(host_dir: &Path, entry: &'e HostEntry) -> Result<&'e str> {
    entry.name().to_str().ok_or_else(|| {
        PackError::host(
            host_dir.join(entry.name()),
            io::Error::new(io::ErrorKind::InvalidData, "file name is not valid UTF-8"),
        )
    })
}
