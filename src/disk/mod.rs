mod image;
mod stream;

pub use image::{DiskStatus, IMAGE_DRIVE, ImageDisk, IoctlCommand, IoctlValue, SECTOR_SIZE};
pub use stream::{SectorStream, SharedDisk};
