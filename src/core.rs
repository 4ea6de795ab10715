use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::config::FsFormat;
use crate::error::{FsError, PackError};
use crate::vfs::HostEntry;

pub type Result<T> = std::result::Result<T, PackError>;

/// Result of a filesystem-service call.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// The filesystem a tree is packed into.
///
/// Paths are absolute inside the volume, `/`-separated (`/assets/logo.bin`).
/// Implementations only need to support one drive, [`crate::disk::IMAGE_DRIVE`].
pub trait FsService {
    /// An open, writable file. Dropping it closes it.
    type File<'a>: FsFile
    where
        Self: 'a;

    /// Lays down an empty filesystem of the requested flavour on `drive`.
    fn format(&mut self, drive: u8, format: FsFormat) -> FsResult<()>;

    fn mount(&mut self, drive: u8) -> FsResult<()>;

    /// Flushes and releases the volume.
    fn unmount(&mut self, drive: u8) -> FsResult<()>;

    /// Creates a directory. An existing directory at `path` is reported as
    /// `FsError::Exists`, which callers may ignore.
    fn mkdir(&mut self, path: &str) -> FsResult<()>;

    /// Opens `path` for writing, creating it or truncating an existing file.
    fn create(&mut self, path: &str) -> FsResult<Self::File<'_>>;
}

pub trait FsFile {
    /// Writes from `buf`, returning how many bytes were stored. Fewer than
    /// `buf.len()` means the volume is full.
    fn write(&mut self, buf: &[u8]) -> FsResult<usize>;

    /// Flushes and closes the file.
    fn close(self) -> FsResult<()>
    where
        Self: Sized;
}

/// Read access to the host directory tree being packed.
pub trait HostTree {
    type Reader: Read;

    /// Immediate entries of `dir`, in no particular order.
    fn list(&self, dir: &Path) -> io::Result<Vec<HostEntry>>;

    /// Opens a regular file for reading.
    fn open(&self, path: &Path) -> io::Result<Self::Reader>;

    /// The path that identifies `dir` itself, with links resolved. Two directories with
    /// the same canonical path are the same directory.
    fn canonical(&self, dir: &Path) -> io::Result<PathBuf> {
        Ok(dir.to_path_buf())
    }
}

pub mod utils {
    /// Joins a volume directory path and an entry name: `("", "a") -> "/a"`,
    /// `("/a", "b") -> "/a/b"`.
    pub fn join_dest(dir: &str, name: &str) -> String {
        let dir = dir.trim_end_matches('/');
        format!("{dir}/{name}")
    }

    /// Volume path without its leading separators, as the FAT engine expects it.
    pub fn relative(path: &str) -> &str {
        path.trim_start_matches('/')
    }

    /// `.` and `..` are never packed.
    pub fn is_dot_entry(name: &str) -> bool {
        name == "." || name == ".."
    }

}
