//! Host directory access through `std::fs`.
//!
//! ### Notes
//! - Symbolic links are followed: a link to a file is listed as a file, a link to a
//!   directory as a directory. The link itself is never recorded.
//! - Dangling links and special files (FIFOs, sockets, devices) are listed as
//!   `EntryType::Other`.
//! - `read_dir` never yields `.` or `..`; the ingestion engine filters them anyway.
//! - `canonical` resolves every link, so a link back to an ancestor directory is seen
//!   for what it is.

use std::fs::{self, File, FileType};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::HostTree;
use crate::vfs::{EntryType, HostEntry};

/// `HostTree` over the real host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFS;

impl HostFS {
    pub fn new() -> Self {
        HostFS
    }

    fn classify(file_type: FileType) -> EntryType {
        if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_file() {
            EntryType::File
        } else {
            EntryType::Other
        }
    }
}

impl HostTree for HostFS {
    type Reader = File;

    fn list(&self, dir: &Path) -> io::Result<Vec<HostEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let entry_type = if file_type.is_symlink() {
                match fs::metadata(entry.path()) {
                    Ok(target) => Self::classify(target.file_type()),
                    Err(e) => {
                        debug!(path = %entry.path().display(), error = %e, "dangling link");
                        EntryType::Other
                    }
                }
            } else {
                Self::classify(file_type)
            };
            entries.push(HostEntry::new(entry.file_name(), entry_type));
        }
        Ok(entries)
    }

    fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn canonical(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(dir)
    }
}
