//! `FsService` for FAT and exFAT images, living on an [`ImageDisk`].
//!
//! The engines see the disk through a [`SectorStream`]; every byte they move ends up as
//! whole-sector requests on drive 0. FAT12, FAT16 and FAT32 go through the `fatfs`
//! engine, exFAT through the crate's own writer.
//!
//! ### Formats
//! - `Fat`: FAT12 below 16 MiB, FAT16 from 16 MiB on.
//! - `Fat32`: at least 65525 clusters, roughly 33 MiB of image.
//! - `ExFat`: at least 1 MiB of image.
//!
//! A size the requested flavour cannot hold is rejected before any I/O, and `mount`
//! refuses a volume whose flavour differs from the one last formatted.
//!
//! ### Lifecycle
//! `format` and `mount` initialize the device first (a no-op once it is ready).
//! `unmount` flushes the volume and syncs the device; the image can be mounted again.

use std::cell::RefCell;
use std::io::{self, Read, Seek, Write};
use std::rc::Rc;
use std::time::SystemTime;

use fatfs::{FatType, FileSystem, FormatVolumeOptions, FsOptions};
use tracing::{debug, info};

use crate::config::{FsFormat, ImageDescriptor};
use crate::core::{FsFile, FsResult, FsService, utils};
use crate::disk::{IMAGE_DRIVE, ImageDisk, IoctlCommand, SECTOR_SIZE, SectorStream, SharedDisk};
use crate::error::{DiskError, FsError};
use crate::exfat::{self, ExFatFile, ExFatVolume, Geometry};

/// Below this size `FsFormat::Fat` means FAT12.
const FAT16_MIN_BYTES: u64 = 16 * 1024 * 1024;

/// Fewest clusters of a FAT16 and of a FAT32 volume.
const FAT16_MIN_CLUSTERS: u64 = 4085;
const FAT32_MIN_CLUSTERS: u64 = 65525;

enum Engine {
    Fat(FileSystem<SectorStream>),
    ExFat(ExFatVolume<SectorStream>),
}

/// FAT filesystem service over a single image file.
pub struct FatFS {
    descriptor: ImageDescriptor,
    disk: SharedDisk,
    /// Flavour of the last successful `format`.
    formatted: Option<FsFormat>,
    engine: Option<Engine>,
}

impl FatFS {
    pub fn new(disk: ImageDisk) -> Self {
        Self {
            descriptor: disk.descriptor().clone(),
            disk: Rc::new(RefCell::new(disk)),
            formatted: None,
            engine: None,
        }
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    pub fn disk(&self) -> &SharedDisk {
        &self.disk
    }

    pub fn is_mounted(&self) -> bool {
        self.engine.is_some()
    }

    /// Brings the device up and opens a stream over it.
    fn open_stream(&mut self, drive: u8) -> FsResult<SectorStream> {
        if self.engine.is_some() {
            return Err(FsError::AlreadyMounted);
        }
        if !self.disk.borrow_mut().initialize(drive).is_ready() {
            return Err(DiskError::NotReady.into());
        }
        Ok(SectorStream::new(Rc::clone(&self.disk))?)
    }
}

impl FsService for FatFS {
    type File<'a> = FatFile<'a>;

    fn format(&mut self, drive: u8, format: FsFormat) -> FsResult<()> {
        if self.engine.is_some() {
            return Err(FsError::AlreadyMounted);
        }
        let sectors = self.descriptor.sector_count();
        let options = match format {
            FsFormat::ExFat => {
                Geometry::new(sectors, 0)?;
                None
            }
            _ => Some(format_options(format, &self.descriptor)?),
        };

        let mut stream = self.open_stream(drive)?;
        match options {
            Some(options) => fatfs::format_volume(&mut stream, options)?,
            None => {
                exfat::format(&mut stream, sectors, volume_serial())?;
            }
        }
        self.formatted = Some(format);
        info!(%format, sectors, "format successful");
        Ok(())
    }

    fn mount(&mut self, drive: u8) -> FsResult<()> {
        let mut stream = self.open_stream(drive)?;
        let mut boot_sector = [0u8; SECTOR_SIZE];
        stream.read_exact(&mut boot_sector)?;
        stream.rewind()?;

        let (engine, found) = if exfat::is_exfat(&boot_sector) {
            (Engine::ExFat(ExFatVolume::open(stream)?), FsFormat::ExFat)
        } else {
            let fs = FileSystem::new(stream, FsOptions::new())?;
            debug!(fat_type = ?fs.fat_type(), "volume opened");
            let found = match fs.fat_type() {
                FatType::Fat32 => FsFormat::Fat32,
                FatType::Fat12 | FatType::Fat16 => FsFormat::Fat,
            };
            (Engine::Fat(fs), found)
        };
        if let Some(requested) = self.formatted {
            if requested != found {
                return Err(FsError::Unsupported(format!(
                    "the image was formatted as {requested} but holds a {found} volume"
                )));
            }
        }

        self.engine = Some(engine);
        info!(format = %found, "mount successful");
        Ok(())
    }

    fn unmount(&mut self, drive: u8) -> FsResult<()> {
        if drive != IMAGE_DRIVE {
            return Err(DiskError::NotReady.into());
        }
        match self.engine.take() {
            Some(Engine::Fat(fs)) => fs.unmount()?,
            Some(Engine::ExFat(volume)) => {
                volume.unmount()?;
            }
            None => return Err(FsError::NotMounted),
        }
        self.disk.borrow_mut().control(drive, IoctlCommand::Sync)?;
        info!("unmounted the disk image");
        Ok(())
    }

    /// An existing directory is `Exists`, a file in the way is `NotADirectory`.
    fn mkdir(&mut self, path: &str) -> FsResult<()> {
        match self.engine.as_mut() {
            Some(Engine::Fat(fs)) => {
                let root = fs.root_dir();
                let rel = utils::relative(path);
                if root.open_dir(rel).is_ok() {
                    return Err(FsError::Exists(path.to_string()));
                }
                // the engine hands back an existing entry instead of failing
                if root.open_file(rel).is_ok() {
                    return Err(FsError::NotADirectory(path.to_string()));
                }
                root.create_dir(rel).map_err(|e| fs_error(path, e))?;
                Ok(())
            }
            Some(Engine::ExFat(volume)) => volume.mkdir(path),
            None => Err(FsError::NotMounted),
        }
    }

    fn create(&mut self, path: &str) -> FsResult<FatFile<'_>> {
        let handle = match self.engine.as_mut() {
            Some(Engine::Fat(fs)) => {
                let mut file = fs
                    .root_dir()
                    .create_file(utils::relative(path))
                    .map_err(|e| fs_error(path, e))?;
                file.truncate()?;
                Handle::Fat(file)
            }
            Some(Engine::ExFat(volume)) => Handle::ExFat(volume.create(path)?),
            None => return Err(FsError::NotMounted),
        };
        Ok(FatFile { handle })
    }
}

enum Handle<'a> {
    Fat(fatfs::File<'a, SectorStream>),
    ExFat(ExFatFile<'a, SectorStream>),
}

/// Open file on a mounted [`FatFS`].
pub struct FatFile<'a> {
    handle: Handle<'a>,
}

impl FsFile for FatFile<'_> {
    /// `fatfs` stops every write at a cluster boundary, so keep going until `buf` is
    /// stored or the volume refuses more. A refusal after some progress is a short count.
    fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let file = match &mut self.handle {
            Handle::Fat(file) => file,
            Handle::ExFat(file) => return file.write(buf),
        };
        let mut written = 0;
        while written < buf.len() {
            match file.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if written > 0 => {
                    debug!(written, error = %e, "write stopped early");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(written)
    }

    fn close(self) -> FsResult<()> {
        match self.handle {
            Handle::Fat(mut file) => file.flush()?,
            Handle::ExFat(file) => file.close()?,
        }
        Ok(())
    }
}

fn format_options(
    format: FsFormat,
    descriptor: &ImageDescriptor,
) -> FsResult<FormatVolumeOptions> {
    let sectors = descriptor.sector_count();
    let fat_type = match format {
        FsFormat::Fat if descriptor.size() < FAT16_MIN_BYTES => FatType::Fat12,
        FsFormat::Fat => FatType::Fat16,
        FsFormat::Fat32 => FatType::Fat32,
        FsFormat::ExFat => {
            return Err(FsError::Unsupported("exFAT has no FAT format options".into()));
        }
    };

    let clusters = predicted_clusters(fat_type, sectors);
    let fits = match fat_type {
        FatType::Fat32 => clusters >= FAT32_MIN_CLUSTERS,
        FatType::Fat12 | FatType::Fat16 => clusters < FAT32_MIN_CLUSTERS,
    };
    if !fits {
        return Err(FsError::Unsupported(format!(
            "{} bytes give {clusters} clusters, which is not a {format} volume",
            descriptor.size()
        )));
    }
    if fat_type == FatType::Fat16 && clusters < FAT16_MIN_CLUSTERS {
        debug!(clusters, "volume will be FAT12");
    }

    let total_sectors = u32::try_from(sectors)
        .map_err(|_| FsError::Unsupported(format!("{sectors} sectors")))?;
    Ok(FormatVolumeOptions::new()
        .bytes_per_sector(SECTOR_SIZE as u16)
        .total_sectors(total_sectors)
        .fat_type(fat_type))
}

/// Data clusters `fatfs` lays out on `sectors` sectors when asked for `fat_type`. The
/// cluster count alone decides which FAT variant the volume is.
fn predicted_clusters(fat_type: FatType, sectors: u64) -> u64 {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const SECTOR: u64 = SECTOR_SIZE as u64;

    let bytes = sectors * SECTOR;
    let cluster_bytes = match fat_type {
        FatType::Fat12 => bytes.next_power_of_two() / MB * 512,
        FatType::Fat16 if bytes <= 16 * MB => KB,
        FatType::Fat16 if bytes <= 128 * MB => 2 * KB,
        FatType::Fat16 => bytes.next_power_of_two() / (64 * MB) * KB,
        FatType::Fat32 if bytes <= 260 * MB => 512,
        FatType::Fat32 if bytes <= 8 * GB => 4 * KB,
        FatType::Fat32 => bytes.next_power_of_two() / (2 * GB) * KB,
    }
    .clamp(512, 32 * KB);
    let per_cluster = cluster_bytes / SECTOR;

    let (reserved, root_dir, bits) = match fat_type {
        FatType::Fat12 => (1, 32, 12),
        FatType::Fat16 => (1, 32, 16),
        FatType::Fat32 => (8, 0, 32),
    };
    let fats = 2;
    let Some(data_and_fats) = sectors.checked_sub(reserved + root_dir) else {
        return 0;
    };
    let per_fat = (data_and_fats + 2 * per_cluster)
        .div_ceil(per_cluster * SECTOR * 8 / bits + fats);
    data_and_fats.saturating_sub(per_fat * fats) / per_cluster
}

fn volume_serial() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| (d.as_secs() as u32) ^ d.subsec_nanos())
        .unwrap_or(0)
}

fn fs_error(path: &str, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        _ => FsError::Io(e),
    }
}
