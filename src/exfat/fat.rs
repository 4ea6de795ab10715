//! Allocation state: the FAT links clusters into chains, the allocation bitmap says
//! which clusters are taken. Both stay in memory while the volume is mounted.

use std::io;

use crate::core::FsResult;
use crate::error::FsError;
use crate::exfat::boot::FIRST_CLUSTER;

/// Last cluster of a chain.
pub const END_OF_CHAIN: u32 = 0xFFFF_FFFF;
const MEDIA_DESCRIPTOR: u32 = 0xFFFF_FFF8;

/// The File Allocation Table, one `u32` per cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Fat {
    entries: Vec<u32>,
}

impl Fat {
    /// An empty table: every cluster free.
    pub fn new(cluster_count: u32) -> Self {
        let mut entries = vec![0u32; cluster_count as usize + FIRST_CLUSTER as usize];
        entries[0] = MEDIA_DESCRIPTOR;
        entries[1] = END_OF_CHAIN;
        Self { entries }
    }

    pub fn from_bytes(bytes: &[u8], cluster_count: u32) -> FsResult<Self> {
        let len = cluster_count as usize + FIRST_CLUSTER as usize;
        if bytes.len() < len * 4 {
            return Err(FsError::Unsupported(format!(
                "FAT of {} bytes cannot map {cluster_count} clusters",
                bytes.len()
            )));
        }
        let entries = bytes
            .chunks_exact(4)
            .take(len)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { entries })
    }

    /// The table padded with zeros to `len` bytes.
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.entries.iter().flat_map(|e| e.to_le_bytes()).collect();
        bytes.resize(len.max(bytes.len()), 0);
        bytes
    }

    pub fn set(&mut self, cluster: u32, next: u32) {
        self.entries[cluster as usize] = next;
    }

    /// Clusters of the chain starting at `first`, in order.
    pub fn chain(&self, first: u32) -> FsResult<Vec<u32>> {
        let mut chain = Vec::new();
        let mut cluster = first;
        loop {
            if !self.is_valid(cluster) || chain.len() >= self.entries.len() {
                return Err(broken_chain(first));
            }
            chain.push(cluster);
            match self.entries[cluster as usize] {
                END_OF_CHAIN => return Ok(chain),
                next => cluster = next,
            }
        }
    }

    fn is_valid(&self, cluster: u32) -> bool {
        cluster >= FIRST_CLUSTER && (cluster as usize) < self.entries.len()
    }
}

/// Allocation bitmap: bit `n` covers cluster `n + 2`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    bits: Vec<u8>,
    cluster_count: u32,
    hint: u32,
}

impl Bitmap {
    pub fn new(cluster_count: u32) -> Self {
        Self {
            bits: vec![0u8; Self::byte_len(cluster_count)],
            cluster_count,
            hint: FIRST_CLUSTER,
        }
    }

    pub fn from_bytes(bytes: &[u8], cluster_count: u32) -> FsResult<Self> {
        let len = Self::byte_len(cluster_count);
        if bytes.len() < len {
            return Err(FsError::Unsupported(format!(
                "allocation bitmap of {} bytes cannot map {cluster_count} clusters",
                bytes.len()
            )));
        }
        Ok(Self {
            bits: bytes[..len].to_vec(),
            cluster_count,
            hint: FIRST_CLUSTER,
        })
    }

    /// Bytes needed for `cluster_count` bits.
    pub fn byte_len(cluster_count: u32) -> usize {
        (cluster_count as usize).div_ceil(8)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn is_used(&self, cluster: u32) -> bool {
        let bit = (cluster - FIRST_CLUSTER) as usize;
        self.bits[bit / 8] & (1 << (bit % 8)) != 0
    }

    pub fn set_used(&mut self, cluster: u32, used: bool) {
        let bit = (cluster - FIRST_CLUSTER) as usize;
        if used {
            self.bits[bit / 8] |= 1 << (bit % 8);
        } else {
            self.bits[bit / 8] &= !(1 << (bit % 8));
            self.hint = self.hint.min(cluster);
        }
    }

    /// Lowest free cluster, or `None` when the heap is full.
    pub fn find_free(&mut self) -> Option<u32> {
        let end = self.cluster_count + FIRST_CLUSTER;
        let found = (self.hint..end).find(|&c| !self.is_used(c))?;
        self.hint = found;
        Some(found)
    }

    pub fn free_count(&self) -> u32 {
        let used: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        self.cluster_count - used
    }
}

fn broken_chain(first: u32) -> FsError {
    FsError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("cluster chain starting at {first} is broken"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod table {
        use super::*;

        #[test]
        fn test_new_table_reserves_two_entries() {
            let bytes = Fat::new(4).to_bytes(512);
            assert_eq!(bytes.len(), 512);
            assert_eq!(&bytes[..8], &[0xF8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
            assert!(bytes[8..].iter().all(|&b| b == 0));
        }

        #[test]
        fn test_chain_follows_links() {
            let mut fat = Fat::new(10);
            fat.set(3, 7);
            fat.set(7, 4);
            fat.set(4, END_OF_CHAIN);
            assert_eq!(fat.chain(3).unwrap(), vec![3, 7, 4]);

            let back = Fat::from_bytes(&fat.to_bytes(64), 10).unwrap();
            assert_eq!(back, fat);
        }

        #[test]
        fn test_broken_chains_are_errors() {
            let mut fat = Fat::new(10);
            fat.set(3, 0); // free cluster inside a chain
            assert!(fat.chain(3).is_err());

            fat.set(3, 5);
            fat.set(5, 3); // loop
            assert!(fat.chain(3).is_err());
            assert!(fat.chain(1).is_err());
        }

        #[test]
        fn test_short_table_is_rejected() {
            assert!(Fat::from_bytes(&[0u8; 16], 10).is_err());
        }
    }

    mod bitmap {
        use super::*;

        #[test]
        fn test_find_free_is_lowest_first() {
            let mut bitmap = Bitmap::new(20);
            assert_eq!(bitmap.as_bytes().len(), 3);
            bitmap.set_used(2, true);
            bitmap.set_used(3, true);
            assert_eq!(bitmap.find_free(), Some(4));
            bitmap.set_used(4, true);
            assert_eq!(bitmap.find_free(), Some(5));

            bitmap.set_used(3, false);
            assert_eq!(bitmap.find_free(), Some(3));
            assert_eq!(bitmap.free_count(), 18);
        }

        #[test]
        fn test_full_bitmap_has_no_free_cluster() {
            let mut bitmap = Bitmap::new(9);
            for cluster in 2..11 {
                bitmap.set_used(cluster, true);
            }
            assert_eq!(bitmap.find_free(), None);
            assert_eq!(bitmap.free_count(), 0);
            assert_eq!(bitmap.as_bytes(), &[0xFF, 0x01]);
        }
    }
}
