//! The virtual block device: a fixed-size host file presented as an array of
//! 512-byte sectors.
//!
//! ### Lifecycle
//! `ImageDisk::new()` only records the descriptor; the device starts `NOINIT`.
//! `initialize()` deletes any previous image at the path, creates a fresh file and
//! extends it to exactly the configured size. From then on the device stays ready
//! until it is dropped.
//!
//! ### Guards
//! Every sector and control request checks the drive id and the ready state before
//! the file is touched. Only drive [`IMAGE_DRIVE`] is serviced.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};

use bitflags::bitflags;
use tracing::{debug, info, warn};

use crate::config::ImageDescriptor;
use crate::error::DiskError;

/// Bytes per sector. All addressing is in whole sectors.
pub const SECTOR_SIZE: usize = 512;

/// The only drive this device answers to.
pub const IMAGE_DRIVE: u8 = 0;

bitflags! {
    /// Drive status flags. An empty set means ready.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        /// The backing file has not been created and sized yet.
        const NOINIT = 0x01;
        /// No medium: the request addressed a drive that does not exist.
        const NODISK = 0x02;
    }
}

impl DiskStatus {
    pub fn is_ready(self) -> bool {
        !self.intersects(DiskStatus::NOINIT | DiskStatus::NODISK)
    }
}

/// Control requests understood by [`ImageDisk::control`]. The set is closed: a request
/// the device cannot serve has no variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlCommand {
    /// Complete pending writes.
    Sync,
    /// Number of sectors on the device.
    GetSectorCount,
    /// Bytes per sector.
    GetSectorSize,
    /// Erase block size, in sectors.
    GetBlockSize,
}

/// Answer to a control request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoctlValue {
    Done,
    SectorCount(u64),
    SectorSize(u16),
    BlockSize(u32),
}

/// A host file serving as a single sector-addressed drive.
#[derive(Debug)]
pub struct ImageDisk {
    descriptor: ImageDescriptor,
    file: Option<File>,
    status: DiskStatus,
    syncs: u64,
}

impl ImageDisk {
    /// Creates an uninitialized device for `descriptor`. No I/O is performed.
    pub fn new(descriptor: ImageDescriptor) -> Self {
        Self {
            descriptor,
            file: None,
            status: DiskStatus::NOINIT,
            syncs: 0,
        }
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    /// `Sync` requests served so far.
    pub fn syncs(&self) -> u64 {
        self.syncs
    }

    /// Current status of `drive`. Any drive other than [`IMAGE_DRIVE`] reports `NODISK`.
    pub fn status(&self, drive: u8) -> DiskStatus {
        if drive != IMAGE_DRIVE {
            return DiskStatus::NODISK;
        }
        self.status
    }

    /// Brings the drive up.
    ///
    /// # Behavior
    /// - **Idempotent**: if the drive is already ready, returns the current status untouched.
    /// - **Rebuild from scratch**: an existing file at the image path is deleted first.
    /// - **Exact geometry**: the new file is extended to the configured size by writing a
    ///   single byte at `size - 1`.
    /// - **Failure**: the handle is released and the status stays `NOINIT`.
    pub fn initialize(&mut self, drive: u8) -> DiskStatus {
        if drive != IMAGE_DRIVE {
            return DiskStatus::NODISK;
        }
        if self.status.is_ready() {
            return self.status;
        }

        match self.create_backing_file() {
            Ok(file) => {
                self.file = Some(file);
                self.status.remove(DiskStatus::NOINIT);
                info!(
                    path = %self.descriptor.path().display(),
                    size = self.descriptor.size(),
                    mib = self.descriptor.size_mib(),
                    "created disk image"
                );
            }
            Err(e) => {
                self.file = None;
                warn!(
                    path = %self.descriptor.path().display(),
                    error = %e,
                    "cannot create disk image"
                );
            }
        }
        self.status
    }

    fn create_backing_file(&self) -> io::Result<File> {
        let path = self.descriptor.path();
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed previous image"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.seek(SeekFrom::Start(self.descriptor.size() - 1))?;
        file.write_all(&[0])?;
        file.rewind()?;
        Ok(file)
    }

    /// Reads `count` sectors starting at `sector` into `buf`.
    ///
    /// `buf` must be exactly `count * SECTOR_SIZE` bytes long. A range reaching past the
    /// end of the image is an error; nothing is zero-padded.
    pub fn read(
        &mut self,
        drive: u8,
        buf: &mut [u8],
        sector: u64,
        count: u32,
    ) -> Result<(), DiskError> {
        let offset = self.check_range(drive, buf.len(), sector, count)?;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Writes `count` sectors from `buf` starting at `sector`.
    ///
    /// The same rules as [`ImageDisk::read`] apply; writes never grow the image.
    pub fn write(
        &mut self,
        drive: u8,
        buf: &[u8],
        sector: u64,
        count: u32,
    ) -> Result<(), DiskError> {
        let offset = self.check_range(drive, buf.len(), sector, count)?;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Serves a control request.
    pub fn control(&mut self, drive: u8, command: IoctlCommand) -> Result<IoctlValue, DiskError> {
        self.check_ready(drive)?;
        match command {
            IoctlCommand::Sync => {
                self.file_mut()?.flush()?;
                self.syncs += 1;
                Ok(IoctlValue::Done)
            }
            IoctlCommand::GetSectorCount => match self.descriptor.sector_count() {
                0 => Err(DiskError::Parameter("image size is zero".into())),
                n => Ok(IoctlValue::SectorCount(n)),
            },
            IoctlCommand::GetSectorSize => Ok(IoctlValue::SectorSize(SECTOR_SIZE as u16)),
            IoctlCommand::GetBlockSize => Ok(IoctlValue::BlockSize(1)),
        }
    }

    fn check_ready(&self, drive: u8) -> Result<(), DiskError> {
        if drive != IMAGE_DRIVE || !self.status.is_ready() {
            return Err(DiskError::NotReady);
        }
        Ok(())
    }

    /// Validates a sector request and returns its byte offset.
    fn check_range(
        &self,
        drive: u8,
        len: usize,
        sector: u64,
        count: u32,
    ) -> Result<u64, DiskError> {
        self.check_ready(drive)?;
        let bytes = count as usize * SECTOR_SIZE;
        if len != bytes {
            return Err(DiskError::Parameter(format!(
                "buffer of {len} bytes for {count} sector(s)"
            )));
        }
        let end = sector
            .checked_add(u64::from(count))
            .ok_or(DiskError::OutOfRange { sector, count })?;
        if end > self.descriptor.sector_count() {
            return Err(DiskError::OutOfRange { sector, count });
        }
        Ok(sector * SECTOR_SIZE as u64)
    }

    fn file_mut(&mut self) -> Result<&mut File, DiskError> {
        self.file.as_mut().ok_or(DiskError::NotReady)
    }
}
