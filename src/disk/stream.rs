//! Byte-stream view of an [`ImageDisk`].
//!
//! The filesystem engine reads and writes at arbitrary byte offsets; the device only
//! accepts whole sectors. `SectorStream` bridges the two: aligned runs go straight to
//! the device, partial sectors pass through a one-sector scratch buffer
//! (read-modify-write on the way out).
//!
//! The device is shared: the filesystem service keeps its own handle so it can still
//! issue control requests after the engine that owns the stream is gone.

use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use tracing::trace;

use crate::disk::image::{IMAGE_DRIVE, ImageDisk, IoctlCommand, IoctlValue, SECTOR_SIZE};
use crate::error::DiskError;

const SECTOR: u64 = SECTOR_SIZE as u64;

/// An [`ImageDisk`] handle shared by a filesystem service and its streams.
pub type SharedDisk = Rc<RefCell<ImageDisk>>;

/// `Read + Write + Seek` over one drive of an [`ImageDisk`].
#[derive(Debug)]
pub struct SectorStream {
    disk: SharedDisk,
    drive: u8,
    pos: u64,
    len: u64,
    scratch: Box<[u8; SECTOR_SIZE]>,
}

impl SectorStream {
    /// Wraps a ready device. The stream length is taken from the device geometry.
    pub fn new(disk: SharedDisk) -> Result<Self, DiskError> {
        let drive = IMAGE_DRIVE;
        let (sectors, sector_size) = {
            let mut device = disk.borrow_mut();
            let sectors = match device.control(drive, IoctlCommand::GetSectorCount)? {
                IoctlValue::SectorCount(n) => n,
                other => return Err(DiskError::Parameter(format!("unexpected reply {other:?}"))),
            };
            let sector_size = match device.control(drive, IoctlCommand::GetSectorSize)? {
                IoctlValue::SectorSize(n) => u64::from(n),
                other => return Err(DiskError::Parameter(format!("unexpected reply {other:?}"))),
            };
            (sectors, sector_size)
        };
        if sector_size != SECTOR {
            return Err(DiskError::Parameter(format!(
                "sector size {sector_size} is not supported"
            )));
        }

        Ok(Self {
            disk,
            drive,
            pos: 0,
            len: sectors * sector_size,
            scratch: Box::new([0u8; SECTOR_SIZE]),
        })
    }

    /// Stream length in bytes (the image size).
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn disk(&self) -> &SharedDisk {
        &self.disk
    }

    fn load_scratch(&mut self, sector: u64) -> Result<(), DiskError> {
        self.disk
            .borrow_mut()
            .read(self.drive, &mut self.scratch[..], sector, 1)
    }
}

impl Read for SectorStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.len - self.pos) as usize);
        let sector = self.pos / SECTOR;
        let offset = (self.pos % SECTOR) as usize;

        let n = if offset == 0 && want >= SECTOR_SIZE {
            let count = (want / SECTOR_SIZE).min(u32::MAX as usize);
            let n = count * SECTOR_SIZE;
            self.disk
                .borrow_mut()
                .read(self.drive, &mut buf[..n], sector, count as u32)?;
            n
        } else {
            let n = want.min(SECTOR_SIZE - offset);
            self.load_scratch(sector)?;
            buf[..n].copy_from_slice(&self.scratch[offset..offset + n]);
            n
        };

        trace!(pos = self.pos, bytes = n, "stream read");
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for SectorStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.len {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("write at byte {} is past the end of the image", self.pos),
            ));
        }
        let want = buf.len().min((self.len - self.pos) as usize);
        let sector = self.pos / SECTOR;
        let offset = (self.pos % SECTOR) as usize;

        let n = if offset == 0 && want >= SECTOR_SIZE {
            let count = (want / SECTOR_SIZE).min(u32::MAX as usize);
            let n = count * SECTOR_SIZE;
            self.disk
                .borrow_mut()
                .write(self.drive, &buf[..n], sector, count as u32)?;
            n
        } else {
            let n = want.min(SECTOR_SIZE - offset);
            self.load_scratch(sector)?;
            self.scratch[offset..offset + n].copy_from_slice(&buf[..n]);
            self.disk
                .borrow_mut()
                .write(self.drive, &self.scratch[..], sector, 1)?;
            n
        };

        trace!(pos = self.pos, bytes = n, "stream write");
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.disk.borrow_mut().control(self.drive, IoctlCommand::Sync)?;
        Ok(())
    }
}

impl Seek for SectorStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageDescriptor;
    use tempdir::TempDir;

    const SIZE: u64 = 16 * SECTOR;

    fn setup_stream() -> (TempDir, SectorStream) {
        let temp_dir = TempDir::new("sector_stream_test").unwrap();
        let descriptor = ImageDescriptor::new(temp_dir.path().join("disk.img"), SIZE).unwrap();
        let mut disk = ImageDisk::new(descriptor);
        assert!(disk.initialize(IMAGE_DRIVE).is_ready());
        let stream = SectorStream::new(Rc::new(RefCell::new(disk))).unwrap();
        (temp_dir, stream)
    }

    #[test]
    fn test_new_requires_ready_disk() {
        let temp_dir = TempDir::new("sector_stream_test").unwrap();
        let descriptor = ImageDescriptor::new(temp_dir.path().join("disk.img"), SIZE).unwrap();
        let result = SectorStream::new(Rc::new(RefCell::new(ImageDisk::new(descriptor))));
        assert!(matches!(result, Err(DiskError::NotReady)));
    }

    #[test]
    fn test_len_matches_image() {
        let (_temp_dir, mut stream) = setup_stream();
        assert_eq!(stream.len(), SIZE);
        assert_eq!(stream.seek(SeekFrom::End(0)).unwrap(), SIZE);
    }

    #[test]
    fn test_unaligned_write_read() {
        let (_temp_dir, mut stream) = setup_stream();
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();

        stream.seek(SeekFrom::Start(300)).unwrap();
        stream.write_all(&data).unwrap();

        let mut back = vec![0u8; data.len()];
        stream.seek(SeekFrom::Start(300)).unwrap();
        stream.read_exact(&mut back).unwrap();
        assert_eq!(back, data);

        // neighbours are untouched
        let mut head = vec![0xFFu8; 300];
        stream.seek(SeekFrom::Start(0)).unwrap();
        stream.read_exact(&mut head).unwrap();
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aligned_write_goes_through_device() {
        let (_temp_dir, mut stream) = setup_stream();
        let data = vec![0x5Au8; 4 * SECTOR_SIZE];
        stream.seek(SeekFrom::Start(2 * SECTOR)).unwrap();
        assert_eq!(stream.write(&data).unwrap(), data.len());

        let mut sector = vec![0u8; SECTOR_SIZE];
        stream
            .disk()
            .borrow_mut()
            .read(IMAGE_DRIVE, &mut sector, 5, 1)
            .unwrap();
        assert!(sector.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_read_at_end_returns_zero() {
        let (_temp_dir, mut stream) = setup_stream();
        stream.seek(SeekFrom::End(0)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);

        stream.seek(SeekFrom::End(-4)).unwrap();
        assert_eq!(stream.read(&mut buf).unwrap(), 4);
    }

    #[test]
    fn test_write_past_end_fails() {
        let (_temp_dir, mut stream) = setup_stream();
        stream.seek(SeekFrom::Start(SIZE - 2)).unwrap();
        assert!(stream.write_all(b"abcd").is_err());

        stream.seek(SeekFrom::Start(SIZE + 10)).unwrap();
        assert!(stream.write(b"x").is_err());
    }

    #[test]
    fn test_negative_seek_fails() {
        let (_temp_dir, mut stream) = setup_stream();
        assert!(stream.seek(SeekFrom::Current(-1)).is_err());
        assert!(stream.seek(SeekFrom::End(-(SIZE as i64) - 1)).is_err());
        assert_eq!(stream.seek(SeekFrom::Current(10)).unwrap(), 10);
    }

    #[test]
    fn test_flush_syncs_device() {
        let (_temp_dir, mut stream) = setup_stream();
        stream.write_all(b"hello").unwrap();
        stream.flush().unwrap();
        let raw = std::fs::read(stream.disk().borrow().descriptor().path()).unwrap();
        assert_eq!(&raw[..5], b"hello");
    }
}
