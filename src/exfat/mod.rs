//! A small exFAT writer: format an empty volume, then create directories and append
//! files to it.
//!
//! Supports what packing needs and nothing more: no deletion, no rename, no TexFAT,
//! no contiguous (`NoFatChain`) allocation. Only 512-byte sectors.

/// Boot region: main and backup copies, 12 sectors each
pub(crate) mod boot;

/// Directory entry sets
pub(crate) mod entry;

/// FAT region and the allocation bitmap
pub(crate) mod fat;

/// Up-case table used for name comparison
pub(crate) mod upcase;

mod volume;

pub use boot::{Geometry, is_exfat};
pub use volume::{ExFatFile, ExFatVolume, format};
