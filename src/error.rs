//! Error types for the packer.
//!
//! Three layers, innermost first:
//!
//! | Type | Raised by | Meaning |
//! |------|-----------|---------|
//! | `DiskError` | `ImageDisk` | sector-level result of the virtual block device |
//! | `FsError` | `FsService` implementations | result of format, mount, mkdir, create, write |
//! | `PackError` | ingestion and orchestration | user-facing error naming the stage or path |

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result of a block-device request that did not succeed.
#[derive(Debug, Error)]
pub enum DiskError {
    /// The device is not initialized, or the request targets another drive.
    #[error("device not ready")]
    NotReady,

    /// The request itself is malformed (bad buffer length, zero-sized geometry).
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// The sector range lies (partly) beyond the end of the image.
    #[error("{count} sector(s) from sector {sector} are out of range")]
    OutOfRange { sector: u64, count: u32 },

    /// The backing file failed (seek, short read/write, flush).
    #[error("image I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<DiskError> for io::Error {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::Io(e) => e,
            DiskError::NotReady => io::Error::new(io::ErrorKind::NotConnected, err),
            DiskError::Parameter(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            DiskError::OutOfRange { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, err),
        }
    }
}

/// Failure reported by a filesystem service.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("filesystem is not mounted")]
    NotMounted,

    #[error("filesystem is already mounted")]
    AlreadyMounted,

    /// The path already exists. For directories, callers treat this as success.
    #[error("{0} already exists")]
    Exists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("no space left on volume")]
    NoSpace,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("filesystem I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Unified error type for packing an image.
#[derive(Debug, Error)]
pub enum PackError {
    /// Rejected before any I/O: bad size, bad drive, bad format name.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("block device is not ready")]
    DeviceNotReady,

    #[error("image I/O error: {0}")]
    Io(#[from] io::Error),

    /// A host file or directory could not be opened, listed or read.
    #[error("cannot access host path {}: {source}", .path.display())]
    HostAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("format failed: {0}")]
    Format(#[source] FsError),

    #[error("mount failed: {0}")]
    Mount(#[source] FsError),

    #[error("cannot create {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: FsError,
    },

    #[error("write to {path} failed: {source}")]
    Write {
        path: String,
        #[source]
        source: FsError,
    },

    #[error("unmount failed: {0}")]
    Unmount(#[source] FsError),
}

impl PackError {
    pub(crate) fn host<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        PackError::HostAccess {
            path: path.into(),
            source,
        }
    }
}

impl From<DiskError> for PackError {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::NotReady => PackError::DeviceNotReady,
            DiskError::Parameter(msg) => PackError::Configuration(msg),
            other => PackError::Io(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_error_to_io_kind() {
        let err: io::Error = DiskError::NotReady.into();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let err: io::Error = DiskError::OutOfRange { sector: 10, count: 2 }.into();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().contains("from sector 10"));
    }

    #[test]
    fn test_disk_error_to_pack_error() {
        assert!(matches!(
            PackError::from(DiskError::NotReady),
            PackError::DeviceNotReady
        ));
        assert!(matches!(
            PackError::from(DiskError::Parameter("bad".into())),
            PackError::Configuration(_)
        ));
        assert!(matches!(
            PackError::from(DiskError::OutOfRange { sector: 0, count: 1 }),
            PackError::Io(_)
        ));
    }

    #[test]
    fn test_messages_name_the_path() {
        let err = PackError::Create {
            path: "/a/b".into(),
            source: FsError::NoSpace,
        };
        assert_eq!(err.to_string(), "cannot create /a/b: no space left on volume");

        let err = PackError::host("/src/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("cannot access host path /src/x"));
    }
}
