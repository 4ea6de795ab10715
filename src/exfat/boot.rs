//! Boot region: the main and backup copies of the volume parameters.
//!
//! Each copy is 12 sectors: the boot sector, eight extended boot sectors, the OEM
//! parameters, a reserved sector and the checksum sector.

use crate::core::FsResult;
use crate::disk::SECTOR_SIZE;
use crate::error::FsError;

const SECTOR: u64 = SECTOR_SIZE as u64;

/// Sectors in one copy of the boot region.
pub const BOOT_REGION_SECTORS: u64 = 12;

/// Smallest image formatted as exFAT.
pub const MIN_VOLUME_BYTES: u64 = 1024 * 1024;

/// Cluster number of the first cluster in the heap.
pub const FIRST_CLUSTER: u32 = 2;

/// The FAT follows both boot region copies.
const FAT_OFFSET: u32 = 32;

const SIGNATURE: &[u8; 8] = b"EXFAT   ";
const BYTES_PER_SECTOR_SHIFT: u8 = 9;
const REVISION: u16 = 0x0100;

/// Where everything lives on the volume. All offsets and lengths are in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub volume_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub sectors_per_cluster_shift: u8,
    pub root_cluster: u32,
    pub serial: u32,
}

impl Geometry {
    /// Lays out a volume of `sectors` sectors. The root cluster is left at the first
    /// heap cluster; the formatter moves it behind the system files.
    pub fn new(sectors: u64, serial: u32) -> FsResult<Self> {
        let bytes = sectors * SECTOR;
        if bytes < MIN_VOLUME_BYTES {
            return Err(FsError::Unsupported(format!(
                "exFAT needs at least {MIN_VOLUME_BYTES} bytes, the image has {bytes}"
            )));
        }
        let shift = cluster_shift(bytes);
        let per_cluster = 1u64 << shift;

        // size the FAT for the most clusters the volume could hold, then fit the heap
        let upper_bound = (sectors - u64::from(FAT_OFFSET)) / per_cluster;
        let fat_length = ((upper_bound + 2) * 4).div_ceil(SECTOR);
        let heap = (u64::from(FAT_OFFSET) + fat_length).next_multiple_of(per_cluster);
        let cluster_count = (sectors - heap) / per_cluster;

        let too_large = |_| FsError::Unsupported(format!("{sectors} sectors for exFAT"));
        Ok(Self {
            volume_length: sectors,
            fat_offset: FAT_OFFSET,
            fat_length: u32::try_from(fat_length).map_err(too_large)?,
            cluster_heap_offset: u32::try_from(heap).map_err(too_large)?,
            cluster_count: u32::try_from(cluster_count).map_err(too_large)?,
            sectors_per_cluster_shift: shift,
            root_cluster: FIRST_CLUSTER,
            serial,
        })
    }

    pub fn cluster_bytes(&self) -> u64 {
        SECTOR << self.sectors_per_cluster_shift
    }

    /// Byte offset of `cluster` on the volume.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        let sector = u64::from(self.cluster_heap_offset)
            + (u64::from(cluster - FIRST_CLUSTER) << self.sectors_per_cluster_shift);
        sector * SECTOR
    }

    pub fn fat_offset_bytes(&self) -> u64 {
        u64::from(self.fat_offset) * SECTOR
    }

    pub fn fat_length_bytes(&self) -> u64 {
        u64::from(self.fat_length) * SECTOR
    }

    /// Cluster numbers `FIRST_CLUSTER..end` are valid.
    pub fn end_cluster(&self) -> u32 {
        self.cluster_count.saturating_add(FIRST_CLUSTER)
    }

    /// One full copy of the boot region, checksum sector included.
    pub fn boot_region(&self) -> Vec<u8> {
        let sector = SECTOR_SIZE;
        let mut region = vec![0u8; BOOT_REGION_SECTORS as usize * sector];
        region[..sector].copy_from_slice(&self.boot_sector());
        for extended in 1..=8 {
            let end = (extended + 1) * sector;
            region[end - 4..end].copy_from_slice(&[0x00, 0x00, 0x55, 0xAA]);
        }

        let checksum = boot_checksum(&region[..11 * sector]);
        for chunk in region[11 * sector..].chunks_exact_mut(4) {
            chunk.copy_from_slice(&checksum.to_le_bytes());
        }
        region
    }

    fn boot_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut s = [0u8; SECTOR_SIZE];
        s[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
        s[3..11].copy_from_slice(SIGNATURE);
        s[64..72].copy_from_slice(&0u64.to_le_bytes());
        s[72..80].copy_from_slice(&self.volume_length.to_le_bytes());
        s[80..84].copy_from_slice(&self.fat_offset.to_le_bytes());
        s[84..88].copy_from_slice(&self.fat_length.to_le_bytes());
        s[88..92].copy_from_slice(&self.cluster_heap_offset.to_le_bytes());
        s[92..96].copy_from_slice(&self.cluster_count.to_le_bytes());
        s[96..100].copy_from_slice(&self.root_cluster.to_le_bytes());
        s[100..104].copy_from_slice(&self.serial.to_le_bytes());
        s[104..106].copy_from_slice(&REVISION.to_le_bytes());
        s[108] = BYTES_PER_SECTOR_SHIFT;
        s[109] = self.sectors_per_cluster_shift;
        s[110] = 1; // number of FATs
        s[111] = 0x80; // drive select
        s[112] = 0xFF; // percent in use: unknown
        s[120..510].fill(0xF4); // hlt
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    /// Reads the parameters back from a boot region, checking signatures and checksum.
    pub fn parse(region: &[u8]) -> FsResult<Self> {
        let sector = SECTOR_SIZE;
        if region.len() < BOOT_REGION_SECTORS as usize * sector || !is_exfat(region) {
            return Err(not_exfat("missing exFAT signature"));
        }
        if region[510..512] != [0x55, 0xAA] {
            return Err(not_exfat("missing boot signature"));
        }
        let stored = u32_at(region, 11 * sector);
        let computed = boot_checksum(&region[..11 * sector]);
        if stored != computed {
            return Err(not_exfat("boot region checksum mismatch"));
        }
        if region[108] != BYTES_PER_SECTOR_SHIFT {
            return Err(FsError::Unsupported(format!(
                "exFAT sector shift {} (only 512-byte sectors)",
                region[108]
            )));
        }
        if region[110] == 0 {
            return Err(not_exfat("no FAT"));
        }

        let geometry = Self {
            volume_length: u64_at(region, 72),
            fat_offset: u32_at(region, 80),
            fat_length: u32_at(region, 84),
            cluster_heap_offset: u32_at(region, 88),
            cluster_count: u32_at(region, 92),
            sectors_per_cluster_shift: region[109],
            root_cluster: u32_at(region, 96),
            serial: u32_at(region, 100),
        };
        if geometry.sectors_per_cluster_shift > 25
            || geometry.root_cluster < FIRST_CLUSTER
            || geometry.root_cluster >= geometry.end_cluster()
        {
            return Err(not_exfat("volume parameters out of range"));
        }
        Ok(geometry)
    }
}

/// True when `boot_sector` carries the exFAT file system name.
pub fn is_exfat(boot_sector: &[u8]) -> bool {
    boot_sector.get(3..11) == Some(&SIGNATURE[..])
}

/// 4 KiB clusters up to 256 MiB, 32 KiB up to 32 GiB, 128 KiB above.
fn cluster_shift(volume_bytes: u64) -> u8 {
    const MIB: u64 = 1024 * 1024;
    if volume_bytes <= 256 * MIB {
        3
    } else if volume_bytes <= 32 * 1024 * MIB {
        6
    } else {
        8
    }
}

/// Checksum over the first 11 sectors. `VolumeFlags` and `PercentInUse` are left out
/// so they can change without rewriting the checksum sector.
fn boot_checksum(sectors: &[u8]) -> u32 {
    sectors
        .iter()
        .enumerate()
        .filter(|(i, _)| !matches!(i, 106 | 107 | 112))
        .fold(0u32, |sum, (_, &b)| sum.rotate_right(1).wrapping_add(u32::from(b)))
}

fn not_exfat(reason: &str) -> FsError {
    FsError::Unsupported(format!("not an exFAT volume: {reason}"))
}

pub(crate) fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_layout_small_volume() {
        let geometry = Geometry::new(32 * MIB / SECTOR, 7).unwrap();
        assert_eq!(geometry.sectors_per_cluster_shift, 3);
        assert_eq!(geometry.cluster_bytes(), 4096);
        assert!(geometry.fat_offset >= 2 * BOOT_REGION_SECTORS as u32);
        assert_eq!(geometry.cluster_heap_offset % 8, 0);

        // the FAT covers every cluster and the heap fits in the volume
        assert!(geometry.fat_length_bytes() >= (u64::from(geometry.cluster_count) + 2) * 4);
        let heap_end = u64::from(geometry.cluster_heap_offset)
            + u64::from(geometry.cluster_count) * 8;
        assert!(heap_end <= geometry.volume_length);
        assert!(geometry.volume_length - heap_end < 8);
    }

    #[test]
    fn test_cluster_size_grows_with_volume() {
        let geometry = Geometry::new(512 * MIB / SECTOR, 0).unwrap();
        assert_eq!(geometry.cluster_bytes(), 32 * 1024);
    }

    #[test]
    fn test_too_small_is_unsupported() {
        assert!(matches!(
            Geometry::new(MIB / SECTOR - 1, 0),
            Err(FsError::Unsupported(_))
        ));
        assert!(Geometry::new(MIB / SECTOR, 0).is_ok());
    }

    #[test]
    fn test_boot_region_parses_back() {
        let mut geometry = Geometry::new(8 * MIB / SECTOR, 0xDEAD_BEEF).unwrap();
        geometry.root_cluster = 4;
        let region = geometry.boot_region();

        assert_eq!(region.len(), 12 * SECTOR_SIZE);
        assert_eq!(&region[3..11], b"EXFAT   ");
        assert_eq!(&region[510..512], &[0x55, 0xAA]);
        assert_eq!(&region[2 * SECTOR_SIZE - 4..2 * SECTOR_SIZE], &[0, 0, 0x55, 0xAA]);
        assert_eq!(Geometry::parse(&region).unwrap(), geometry);
    }

    #[test]
    fn test_checksum_ignores_volatile_fields() {
        let geometry = Geometry::new(8 * MIB / SECTOR, 1).unwrap();
        let mut region = geometry.boot_region();
        region[106] = 0x02; // volume dirty
        region[112] = 42; // percent in use
        assert!(Geometry::parse(&region).is_ok());

        region[100] ^= 0xFF; // serial
        assert!(matches!(Geometry::parse(&region), Err(FsError::Unsupported(_))));
    }

    #[test]
    fn test_fat_boot_sector_is_not_exfat() {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[3..11].copy_from_slice(b"MSWIN4.1");
        assert!(!is_exfat(&sector));
        assert!(Geometry::parse(&vec![0u8; 12 * SECTOR_SIZE]).is_err());
    }
}
