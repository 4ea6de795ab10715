//! Directory entries.
//!
//! A file or directory is stored as an entry set of 32-byte entries: a file entry
//! (attributes, timestamps), a stream extension (first cluster, length, name hash) and
//! one name entry per 15 UTF-16 code units of the name. The file entry carries a
//! checksum over the whole set.

use std::time::{Duration, SystemTime};

use crate::core::FsResult;
use crate::error::FsError;
use crate::exfat::boot::{u32_at, u64_at};
use crate::exfat::upcase::UpcaseTable;

pub const ENTRY_SIZE: usize = 32;

pub const END_OF_DIRECTORY: u8 = 0x00;
pub const ALLOCATION_BITMAP: u8 = 0x81;
pub const UPCASE_TABLE: u8 = 0x82;
pub const FILE: u8 = 0x85;
const STREAM_EXTENSION: u8 = 0xC0;
const FILE_NAME: u8 = 0xC1;

pub const ATTR_DIRECTORY: u16 = 0x10;
pub const ATTR_ARCHIVE: u16 = 0x20;

const ALLOCATION_POSSIBLE: u8 = 0x01;
const NAME_UNITS_PER_ENTRY: usize = 15;
const MAX_NAME_UNITS: usize = 255;

/// Timestamps are stored in UTC; this marks the zero offset as valid.
const UTC: u8 = 0x80;

/// Seconds between the Unix epoch and 1980-01-01, the earliest exFAT date.
const EPOCH_1980: u64 = 315_532_800;

/// A packed exFAT date and time plus its 10 ms refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    packed: u32,
    increment: u8,
}

impl Timestamp {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_unix(since_epoch.as_secs(), since_epoch.subsec_nanos())
    }

    /// Dates before 1980 are clamped to 1980-01-01 00:00:00, dates after 2107 to 2107.
    pub fn from_unix(secs: u64, nanos: u32) -> Self {
        let secs = secs.max(EPOCH_1980);
        let (year, month, day) = civil_from_days(secs / 86_400);
        let of_day = secs % 86_400;
        let (hour, minute, second) = (of_day / 3600, of_day % 3600 / 60, of_day % 60);

        let year = year.saturating_sub(1980).min(127);
        let packed = (year as u32) << 25
            | month << 21
            | day << 16
            | (hour as u32) << 11
            | (minute as u32) << 5
            | (second / 2) as u32;
        let increment = ((second % 2) * 100) as u8 + (nanos / 10_000_000) as u8;
        Self { packed, increment }
    }

    fn from_raw(packed: u32, increment: u8) -> Self {
        Self { packed, increment }
    }
}

/// Proleptic Gregorian date of the day `days` after 1970-01-01.
fn civil_from_days(days: u64) -> (u64, u32, u32) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

/// One file or directory as recorded in its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySet {
    units: Vec<u16>,
    pub attributes: u16,
    pub first_cluster: u32,
    pub data_length: u64,
    pub created: Timestamp,
    pub modified: Timestamp,
}

impl EntrySet {
    /// An empty entry named `name`. Fails with `InvalidName` for names exFAT cannot
    /// store.
    pub fn new(name: &str, attributes: u16, now: Timestamp) -> FsResult<Self> {
        Ok(Self {
            units: validate_name(name)?,
            attributes,
            first_cluster: 0,
            data_length: 0,
            created: now,
            modified: now,
        })
    }

    pub fn name(&self) -> String {
        String::from_utf16_lossy(&self.units)
    }

    pub fn is_dir(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    /// The name as compared on this volume: every code unit upper-cased.
    pub fn key(&self, upcase: &UpcaseTable) -> Vec<u16> {
        self.units.iter().map(|&u| upcase.upcase(u)).collect()
    }

    /// Number of 32-byte entries in the encoded set.
    pub fn entry_count(&self) -> usize {
        2 + self.units.len().div_ceil(NAME_UNITS_PER_ENTRY)
    }

    pub fn encode(&self, upcase: &UpcaseTable) -> Vec<u8> {
        let count = self.entry_count();
        let mut bytes = vec![0u8; count * ENTRY_SIZE];

        let file = &mut bytes[..ENTRY_SIZE];
        file[0] = FILE;
        file[1] = (count - 1) as u8;
        file[4..6].copy_from_slice(&self.attributes.to_le_bytes());
        file[8..12].copy_from_slice(&self.created.packed.to_le_bytes());
        file[12..16].copy_from_slice(&self.modified.packed.to_le_bytes());
        file[16..20].copy_from_slice(&self.modified.packed.to_le_bytes());
        file[20] = self.created.increment;
        file[21] = self.modified.increment;
        file[22..25].copy_from_slice(&[UTC; 3]);

        let stream = &mut bytes[ENTRY_SIZE..2 * ENTRY_SIZE];
        stream[0] = STREAM_EXTENSION;
        stream[1] = ALLOCATION_POSSIBLE;
        stream[3] = self.units.len() as u8;
        stream[4..6].copy_from_slice(&name_hash(&self.key(upcase)).to_le_bytes());
        stream[8..16].copy_from_slice(&self.data_length.to_le_bytes());
        stream[20..24].copy_from_slice(&self.first_cluster.to_le_bytes());
        stream[24..32].copy_from_slice(&self.data_length.to_le_bytes());

        for (i, chunk) in self.units.chunks(NAME_UNITS_PER_ENTRY).enumerate() {
            let entry = &mut bytes[(2 + i) * ENTRY_SIZE..(3 + i) * ENTRY_SIZE];
            entry[0] = FILE_NAME;
            for (j, unit) in chunk.iter().enumerate() {
                entry[2 + 2 * j..4 + 2 * j].copy_from_slice(&unit.to_le_bytes());
            }
        }

        let checksum = set_checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Parses a set starting at a file entry. `None` when the set is malformed or its
    /// checksum does not match.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 * ENTRY_SIZE || bytes[0] != FILE {
            return None;
        }
        let count = usize::from(bytes[1]) + 1;
        let bytes = bytes.get(..count * ENTRY_SIZE)?;
        if u16::from_le_bytes([bytes[2], bytes[3]]) != set_checksum(bytes) {
            return None;
        }

        let stream = &bytes[ENTRY_SIZE..2 * ENTRY_SIZE];
        if stream[0] != STREAM_EXTENSION {
            return None;
        }
        let name_len = usize::from(stream[3]);
        let units: Vec<u16> = bytes[2 * ENTRY_SIZE..]
            .chunks_exact(ENTRY_SIZE)
            .filter(|entry| entry[0] == FILE_NAME)
            .flat_map(|entry| entry[2..].chunks_exact(2))
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take(name_len)
            .collect();
        if units.len() != name_len {
            return None;
        }

        Some(Self {
            units,
            attributes: u16::from_le_bytes([bytes[4], bytes[5]]),
            first_cluster: u32_at(stream, 20),
            data_length: u64_at(stream, 24),
            created: Timestamp::from_raw(u32_at(bytes, 8), bytes[20]),
            modified: Timestamp::from_raw(u32_at(bytes, 12), bytes[21]),
        })
    }
}

/// Checks `name` against what an exFAT directory can hold and returns its UTF-16 form.
pub fn validate_name(name: &str) -> FsResult<Vec<u16>> {
    let invalid = || FsError::InvalidName(name.to_string());
    if name.is_empty() || name == "." || name == ".." {
        return Err(invalid());
    }
    if name
        .chars()
        .any(|c| c < ' ' || matches!(c, '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|'))
    {
        return Err(invalid());
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > MAX_NAME_UNITS {
        return Err(invalid());
    }
    Ok(units)
}

/// Allocation bitmap entry of the root directory.
pub fn bitmap_entry(first_cluster: u32, length: u64) -> [u8; ENTRY_SIZE] {
    let mut entry = [0u8; ENTRY_SIZE];
    entry[0] = ALLOCATION_BITMAP;
    entry[20..24].copy_from_slice(&first_cluster.to_le_bytes());
    entry[24..32].copy_from_slice(&length.to_le_bytes());
    entry
}

/// Up-case table entry of the root directory.
pub fn upcase_entry(checksum: u32, first_cluster: u32, length: u64) -> [u8; ENTRY_SIZE] {
    let mut entry = [0u8; ENTRY_SIZE];
    entry[0] = UPCASE_TABLE;
    entry[4..8].copy_from_slice(&checksum.to_le_bytes());
    entry[20..24].copy_from_slice(&first_cluster.to_le_bytes());
    entry[24..32].copy_from_slice(&length.to_le_bytes());
    entry
}

/// First cluster and length recorded in a bitmap or up-case table entry.
pub fn system_entry_extent(entry: &[u8]) -> (u32, u64) {
    (u32_at(entry, 20), u64_at(entry, 24))
}

/// Checksum over an entry set, skipping its own field in the file entry.
fn set_checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| !matches!(i, 2 | 3))
        .fold(0u16, |sum, (_, &b)| sum.rotate_right(1).wrapping_add(u16::from(b)))
}

/// Hash of an up-cased name, low byte of each code unit first.
fn name_hash(key: &[u16]) -> u16 {
    key.iter()
        .flat_map(|u| u.to_le_bytes())
        .fold(0u16, |hash, b| hash.rotate_right(1).wrapping_add(u16::from(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod timestamps {
        use super::*;

        #[test]
        fn test_epoch_of_1980() {
            let ts = Timestamp::from_unix(EPOCH_1980, 0);
            assert_eq!(ts.packed, 1 << 21 | 1 << 16);
            assert_eq!(ts.increment, 0);
        }

        #[test]
        fn test_known_date() {
            // 2024-02-29 13:45:51.250 UTC
            let ts = Timestamp::from_unix(1_709_214_351, 250_000_000);
            let expected = 44 << 25 | 2 << 21 | 29 << 16 | 13 << 11 | 45 << 5 | 25;
            assert_eq!(ts.packed, expected);
            assert_eq!(ts.increment, 125);
        }

        #[test]
        fn test_before_1980_is_clamped() {
            assert_eq!(Timestamp::from_unix(0, 0), Timestamp::from_unix(EPOCH_1980, 0));
        }

        #[test]
        fn test_civil_from_days() {
            assert_eq!(civil_from_days(0), (1970, 1, 1));
            assert_eq!(civil_from_days(11_016), (2000, 2, 29));
            assert_eq!(civil_from_days(11_017), (2000, 3, 1));
        }
    }

    mod sets {
        use super::*;

        fn ts() -> Timestamp {
            Timestamp::from_unix(EPOCH_1980, 0)
        }

        #[test]
        fn test_entry_count_follows_name_length() {
            assert_eq!(EntrySet::new("a", ATTR_ARCHIVE, ts()).unwrap().entry_count(), 3);
            let name = "n".repeat(15);
            assert_eq!(EntrySet::new(&name, ATTR_ARCHIVE, ts()).unwrap().entry_count(), 3);
            let name = "n".repeat(16);
            assert_eq!(EntrySet::new(&name, ATTR_ARCHIVE, ts()).unwrap().entry_count(), 4);
        }

        #[test]
        fn test_encoded_layout() {
            let upcase = UpcaseTable::latin1();
            let mut set = EntrySet::new("readme.txt", ATTR_ARCHIVE, ts()).unwrap();
            set.first_cluster = 9;
            set.data_length = 1234;
            let bytes = set.encode(&upcase);

            assert_eq!(bytes.len(), 3 * ENTRY_SIZE);
            assert_eq!(bytes[0], FILE);
            assert_eq!(bytes[1], 2);
            assert_eq!(bytes[32], STREAM_EXTENSION);
            assert_eq!(bytes[32 + 3], 10);
            assert_eq!(u32_at(&bytes, 32 + 20), 9);
            assert_eq!(u64_at(&bytes, 32 + 8), 1234);
            assert_eq!(bytes[64], FILE_NAME);
            assert_eq!(&bytes[66..70], &[b'r', 0, b'e', 0]);
        }

        #[test]
        fn test_decode_reads_back_and_checks_sum() {
            let upcase = UpcaseTable::latin1();
            let name = "a rather long file name.with-two-entries";
            let mut set = EntrySet::new(name, ATTR_DIRECTORY, ts()).unwrap();
            set.first_cluster = 5;
            set.data_length = 4096;
            let mut bytes = set.encode(&upcase);

            let back = EntrySet::decode(&bytes).unwrap();
            assert_eq!(back, set);
            assert_eq!(back.name(), name);
            assert!(back.is_dir());

            bytes[70] ^= 1;
            assert!(EntrySet::decode(&bytes).is_none());
        }

        #[test]
        fn test_key_and_hash_ignore_case() {
            let upcase = UpcaseTable::latin1();
            let lower = EntrySet::new("café.txt", ATTR_ARCHIVE, ts()).unwrap();
            let upper = EntrySet::new("CAFÉ.TXT", ATTR_ARCHIVE, ts()).unwrap();
            assert_eq!(lower.key(&upcase), upper.key(&upcase));
            assert_eq!(
                name_hash(&lower.key(&upcase)),
                name_hash(&upper.key(&upcase))
            );
        }

        #[test]
        fn test_invalid_names() {
            for name in ["", ".", "..", "a/b", "what?", "tab\there", "pipe|"] {
                assert!(
                    matches!(validate_name(name), Err(FsError::InvalidName(_))),
                    "{name:?}"
                );
            }
            assert!(validate_name(&"x".repeat(256)).is_err());
            assert!(validate_name(&"x".repeat(255)).is_ok());
            assert!(validate_name("ünïcödé name.bin").is_ok());
        }
    }
}
