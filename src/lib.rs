//! Packs a host directory tree into a FAT, FAT32 or exFAT filesystem image.
//!
//! ### Overview
//!
//! A fixed-size host file is presented as a 512-byte-sector block device
//! ([`ImageDisk`]), formatted and mounted through a filesystem service ([`FatFS`]), and
//! filled with a depth-first copy of a source folder ([`Ingestor`]). The result is a
//! raw image that can be flashed or mounted as-is.
//!
//! ```no_run
//! use fatpack::config::{FsFormat, ImageDescriptor, PackConfig};
//!
//! let image = ImageDescriptor::new("fatfs.img", 32 * 1024 * 1024)?;
//! let config = PackConfig::new(image, "assets_to_pack", FsFormat::Fat);
//! let report = fatpack::pack(&config)?;
//! println!("{} files packed", report.stats.files);
//! # Ok::<(), fatpack::PackError>(())
//! ```
//!
//! **Key ideas**:
//! - **Seams**: the filesystem ([`FsService`]) and the host tree ([`HostTree`]) are traits,
//!   so the whole pipeline runs against [`MapFS`] in tests and dry runs.
//! - **Fail fast**: the first unrecoverable error stops the run; the volume is still
//!   unmounted so the image stays consistent.
//! - **Reproducible**: entries are packed in a fixed order on every platform.

pub mod config;
mod core;
pub mod disk;
pub mod error;
mod exfat;
mod ingest;
mod packer;
mod vfs;

pub use crate::core::{FsFile, FsResult, FsService, HostTree, Result};
pub use disk::{DiskStatus, ImageDisk, SectorStream};
pub use error::{DiskError, FsError, PackError};
pub use ingest::{COPY_BUFFER_SIZE, IngestStats, Ingestor};
pub use packer::{PackReport, Packer, Stage, dry_run, pack};
pub use vfs::{EntryType, FatFS, FatFile, HostEntry, HostFS, MapFS, MapFile};
