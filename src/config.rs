//! Immutable run configuration.
//!
//! Everything a run needs is collected once into a `PackConfig` and handed to the
//! orchestrator by reference. Nothing here is mutable after construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::Result;
use crate::disk::SECTOR_SIZE;
use crate::error::PackError;

/// Default image file name.
pub const DEFAULT_IMAGE_PATH: &str = "fatfs.img";
/// Default image size: 32 MiB.
pub const DEFAULT_IMAGE_SIZE: u64 = 32 * 1024 * 1024;
/// Default source folder.
pub const DEFAULT_SOURCE: &str = "assets_to_pack";

/// Identifies the backing store of the virtual disk: host path, total size in bytes.
///
/// ### Invariants
/// - `size` is a positive multiple of [`SECTOR_SIZE`];
/// - the sector count fits into 32 bits (the widest sector field FAT has).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescriptor {
    path: PathBuf,
    size: u64,
}

impl ImageDescriptor {
    /// Validates `size` and builds the descriptor. No I/O is performed.
    pub fn new<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(PackError::Configuration("image path is empty".into()));
        }
        if size == 0 {
            return Err(PackError::Configuration("image size must be positive".into()));
        }
        if size % SECTOR_SIZE as u64 != 0 {
            return Err(PackError::Configuration(format!(
                "image size {size} is not a multiple of the {SECTOR_SIZE}-byte sector"
            )));
        }
        if size / SECTOR_SIZE as u64 > u64::from(u32::MAX) {
            return Err(PackError::Configuration(format!(
                "image size {size} exceeds {} sectors",
                u32::MAX
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn size_mib(&self) -> f64 {
        self.size as f64 / (1024.0 * 1024.0)
    }

    pub fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    pub fn sector_count(&self) -> u64 {
        self.size / SECTOR_SIZE as u64
    }
}

/// Filesystem flavour to format the image with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FsFormat {
    /// FAT12 or FAT16, picked by volume size.
    Fat,
    Fat32,
    #[default]
    ExFat,
}

impl FsFormat {
    pub const ALL: [FsFormat; 3] = [FsFormat::Fat, FsFormat::Fat32, FsFormat::ExFat];
}

impl fmt::Display for FsFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsFormat::Fat => "FAT",
            FsFormat::Fat32 => "FAT32",
            FsFormat::ExFat => "exFAT",
        };
        f.write_str(name)
    }
}

impl FromStr for FsFormat {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fat" => Ok(FsFormat::Fat),
            "fat32" => Ok(FsFormat::Fat32),
            "exfat" => Ok(FsFormat::ExFat),
            _ => Err(PackError::Configuration(format!(
                "unknown filesystem format {s:?} (expected fat, fat32 or exfat)"
            ))),
        }
    }
}

/// Everything one packing run needs.
#[derive(Debug, Clone)]
pub struct PackConfig {
    pub image: ImageDescriptor,
    /// Host directory whose contents become the root of the image.
    pub source: PathBuf,
    pub format: FsFormat,
    /// Create `source` when it does not exist instead of failing.
    pub create_source: bool,
}

impl PackConfig {
    pub fn new<P: AsRef<Path>>(image: ImageDescriptor, source: P, format: FsFormat) -> Self {
        Self {
            image,
            source: source.as_ref().to_path_buf(),
            format,
            create_source: false,
        }
    }

    pub fn with_create_source(mut self, create: bool) -> Self {
        self.create_source = create;
        self
    }
}

/// Parses a size such as `33554432`, `64K`, `32M`, `1G` (binary multiples).
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_ascii_uppercase();
    let (digits, mult) = if let Some(n) = s.strip_suffix("GB").or_else(|| s.strip_suffix('G')) {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB").or_else(|| s.strip_suffix('M')) {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("KB").or_else(|| s.strip_suffix('K')) {
        (n, 1024)
    } else {
        (s.as_str(), 1)
    };

    let invalid = || PackError::Configuration(format!("invalid size {s:?}"));
    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    let size = value.checked_mul(mult).ok_or_else(invalid)?;
    if size == 0 {
        return Err(PackError::Configuration("size must be positive".into()));
    }
    Ok(size)
}
