//! Formatting and writing an exFAT volume.
//!
//! The FAT and the allocation bitmap are held in memory while mounted and written back
//! by [`ExFatVolume::flush`]. Directory entry sets are written as soon as they change.
//! Directories are read lazily the first time a path goes through them.
//!
//! Every cluster chain, including directories and the system files, is linked in the
//! FAT; the `NoFatChain` shortcut is never used.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::{debug, error, warn};

use crate::core::{FsResult, utils};
use crate::error::FsError;
use crate::exfat::boot::{BOOT_REGION_SECTORS, FIRST_CLUSTER, Geometry};
use crate::exfat::entry::{
    ALLOCATION_BITMAP, ATTR_ARCHIVE, ATTR_DIRECTORY, END_OF_DIRECTORY, ENTRY_SIZE, EntrySet,
    FILE, Timestamp, UPCASE_TABLE, bitmap_entry, system_entry_extent, upcase_entry,
};
use crate::exfat::fat::{Bitmap, END_OF_CHAIN, Fat};
use crate::exfat::upcase::UpcaseTable;

const SECTOR: u64 = crate::disk::SECTOR_SIZE as u64;

/// Lays down an empty exFAT volume of `sectors` sectors on `disk`.
///
/// The heap starts with the allocation bitmap, then the up-case table, then the root
/// directory.
pub fn format<D: Write + Seek>(disk: &mut D, sectors: u64, serial: u32) -> FsResult<Geometry> {
    let mut geometry = Geometry::new(sectors, serial)?;
    let cluster_bytes = geometry.cluster_bytes();
    let clusters_for = |bytes: u64| bytes.div_ceil(cluster_bytes).max(1) as u32;

    let upcase = UpcaseTable::latin1();
    let upcase_bytes = upcase.to_bytes();
    let bitmap_len = Bitmap::byte_len(geometry.cluster_count) as u64;

    let bitmap_first = FIRST_CLUSTER;
    let upcase_first = bitmap_first + clusters_for(bitmap_len);
    let root = upcase_first + clusters_for(upcase_bytes.len() as u64);
    if root >= geometry.end_cluster() {
        return Err(FsError::Unsupported(format!(
            "{sectors} sectors leave no room for the exFAT root directory"
        )));
    }
    geometry.root_cluster = root;

    let mut fat = Fat::new(geometry.cluster_count);
    let mut bitmap = Bitmap::new(geometry.cluster_count);
    for (first, end) in [(bitmap_first, upcase_first), (upcase_first, root), (root, root + 1)] {
        for cluster in first..end {
            let next = if cluster + 1 == end { END_OF_CHAIN } else { cluster + 1 };
            fat.set(cluster, next);
            bitmap.set_used(cluster, true);
        }
    }

    let region = geometry.boot_region();
    write_at(disk, 0, &region)?;
    write_at(disk, BOOT_REGION_SECTORS * SECTOR, &region)?;
    let fat_bytes = fat.to_bytes(geometry.fat_length_bytes() as usize);
    write_at(disk, geometry.fat_offset_bytes(), &fat_bytes)?;
    write_at(disk, geometry.cluster_offset(bitmap_first), bitmap.as_bytes())?;
    write_at(disk, geometry.cluster_offset(upcase_first), &upcase_bytes)?;

    let mut root_dir = vec![0u8; cluster_bytes as usize];
    root_dir[..ENTRY_SIZE].copy_from_slice(&bitmap_entry(bitmap_first, bitmap_len));
    root_dir[ENTRY_SIZE..2 * ENTRY_SIZE].copy_from_slice(&upcase_entry(
        UpcaseTable::checksum(&upcase_bytes),
        upcase_first,
        upcase_bytes.len() as u64,
    ));
    write_at(disk, geometry.cluster_offset(root), &root_dir)?;
    disk.flush()?;

    debug!(
        clusters = geometry.cluster_count,
        cluster_bytes,
        root_cluster = root,
        "exFAT volume laid out"
    );
    Ok(geometry)
}

/// Where a directory's own entry set lives.
#[derive(Debug, Clone, Copy)]
struct Owner {
    parent: u32,
    index: usize,
}

#[derive(Debug)]
struct Child {
    set: EntrySet,
    key: Vec<u16>,
    /// Byte offset of the entry set inside the parent directory.
    position: u64,
}

#[derive(Debug)]
struct Directory {
    chain: Vec<u32>,
    /// Byte offset of the first unused entry.
    end: u64,
    children: Vec<Child>,
    owner: Option<Owner>,
}

/// A mounted exFAT volume on `D`.
pub struct ExFatVolume<D: Read + Write + Seek> {
    disk: D,
    geometry: Geometry,
    fat: Fat,
    bitmap: Bitmap,
    bitmap_chain: Vec<u32>,
    upcase: UpcaseTable,
    /// Directories read so far, by first cluster.
    dirs: HashMap<u32, Directory>,
}

impl<D: Read + Write + Seek> ExFatVolume<D> {
    /// Reads the boot region, the FAT, the allocation bitmap and the up-case table.
    pub fn open(mut disk: D) -> FsResult<Self> {
        let mut region = vec![0u8; (BOOT_REGION_SECTORS * SECTOR) as usize];
        read_at(&mut disk, 0, &mut region)?;
        let geometry = Geometry::parse(&region)?;

        let mut raw_fat = vec![0u8; geometry.fat_length_bytes() as usize];
        read_at(&mut disk, geometry.fat_offset_bytes(), &mut raw_fat)?;
        let fat = Fat::from_bytes(&raw_fat, geometry.cluster_count)?;

        let mut volume = Self {
            disk,
            geometry,
            fat,
            bitmap: Bitmap::new(geometry.cluster_count),
            bitmap_chain: Vec::new(),
            upcase: UpcaseTable::latin1(),
            dirs: HashMap::new(),
        };

        let root_chain = volume.fat.chain(geometry.root_cluster)?;
        let root_bytes = volume.read_chain(&root_chain)?;
        let mut bitmap_extent = None;
        let mut upcase_extent = None;
        for entry in root_bytes.chunks_exact(ENTRY_SIZE) {
            match entry[0] {
                END_OF_DIRECTORY => break,
                // the second bitmap of a TexFAT volume sets bit 0 of the flags
                ALLOCATION_BITMAP if entry[1] & 1 == 0 => {
                    bitmap_extent = Some(system_entry_extent(entry))
                }
                UPCASE_TABLE => upcase_extent = Some(system_entry_extent(entry)),
                _ => {}
            }
        }
        let missing = |what: &str| FsError::Unsupported(format!("exFAT root has no {what}"));
        let (bitmap_first, bitmap_len) =
            bitmap_extent.ok_or_else(|| missing("allocation bitmap"))?;
        let (upcase_first, upcase_len) = upcase_extent.ok_or_else(|| missing("up-case table"))?;

        let bitmap_chain = volume.fat.chain(bitmap_first)?;
        let raw_bitmap = volume.read_extent(&bitmap_chain, bitmap_len)?;
        volume.bitmap = Bitmap::from_bytes(&raw_bitmap, geometry.cluster_count)?;
        volume.bitmap_chain = bitmap_chain;

        let upcase_chain = volume.fat.chain(upcase_first)?;
        volume.upcase = UpcaseTable::from_bytes(&volume.read_extent(&upcase_chain, upcase_len)?);

        volume.load_dir(geometry.root_cluster, None)?;
        debug!(
            clusters = geometry.cluster_count,
            free = volume.bitmap.free_count(),
            "exFAT volume opened"
        );
        Ok(volume)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn free_clusters(&self) -> u32 {
        self.bitmap.free_count()
    }

    /// Creates a directory. `Exists` if one is already there, `NotADirectory` if a file
    /// is.
    pub fn mkdir(&mut self, path: &str) -> FsResult<()> {
        let (parents, name) = split(path)?;
        let dir = self.lookup_dir(&parents)?;
        let mut set = EntrySet::new(name, ATTR_DIRECTORY, Timestamp::now())?;
        let key = set.key(&self.upcase);
        if let Some((_, child)) = self.find(dir, &key) {
            return Err(if child.set.is_dir() {
                FsError::Exists(path.to_string())
            } else {
                FsError::NotADirectory(path.to_string())
            });
        }

        let cluster = self.allocate(None).ok_or(FsError::NoSpace)?;
        self.zero_cluster(cluster)?;
        set.first_cluster = cluster;
        set.data_length = self.geometry.cluster_bytes();
        let index = match self.insert(dir, set, key) {
            Ok(index) => index,
            Err(e) => {
                self.release(cluster);
                return Err(e);
            }
        };
        self.dirs.insert(
            cluster,
            Directory {
                chain: vec![cluster],
                end: 0,
                children: Vec::new(),
                owner: Some(Owner { parent: dir, index }),
            },
        );
        Ok(())
    }

    /// Opens `path` for writing, creating it or truncating an existing file.
    pub fn create(&mut self, path: &str) -> FsResult<ExFatFile<'_, D>> {
        let (parents, name) = split(path)?;
        let dir = self.lookup_dir(&parents)?;
        let now = Timestamp::now();
        let set = EntrySet::new(name, ATTR_ARCHIVE, now)?;
        let key = set.key(&self.upcase);

        let index = match self.find(dir, &key) {
            Some((_, child)) if child.set.is_dir() => {
                return Err(FsError::Exists(path.to_string()));
            }
            Some((index, child)) => {
                let first = child.set.first_cluster;
                if first != 0 {
                    for cluster in self.fat.chain(first)? {
                        self.release(cluster);
                    }
                }
                let child = self.child_mut(dir, index)?;
                child.set.first_cluster = 0;
                child.set.data_length = 0;
                child.set.modified = now;
                self.rewrite_child(dir, index)?;
                index
            }
            None => self.insert(dir, set, key)?,
        };

        Ok(ExFatFile {
            volume: self,
            dir,
            index,
            first_cluster: 0,
            last_cluster: None,
            length: 0,
            closed: false,
        })
    }

    /// Writes the FAT and the allocation bitmap back and flushes the device.
    pub fn flush(&mut self) -> FsResult<()> {
        let fat = self.fat.to_bytes(self.geometry.fat_length_bytes() as usize);
        write_at(&mut self.disk, self.geometry.fat_offset_bytes(), &fat)?;

        let cluster_bytes = self.geometry.cluster_bytes() as usize;
        let chain = self.bitmap_chain.clone();
        for (cluster, chunk) in chain.iter().zip(self.bitmap.as_bytes().chunks(cluster_bytes)) {
            let offset = self.geometry.cluster_offset(*cluster);
            write_at(&mut self.disk, offset, chunk)?;
        }
        self.disk.flush()?;
        Ok(())
    }

    /// Flushes and hands the device back.
    pub fn unmount(mut self) -> FsResult<D> {
        self.flush()?;
        Ok(self.disk)
    }

    /// Follows `components` from the root, reading directories on the way.
    fn lookup_dir(&mut self, components: &[&str]) -> FsResult<u32> {
        let mut dir = self.geometry.root_cluster;
        for (depth, name) in components.iter().enumerate() {
            let walked = || format!("/{}", components[..=depth].join("/"));
            let key: Vec<u16> = name.encode_utf16().map(|u| self.upcase.upcase(u)).collect();
            let (index, child) = self
                .find(dir, &key)
                .ok_or_else(|| FsError::NotFound(walked()))?;
            if !child.set.is_dir() {
                return Err(FsError::NotADirectory(walked()));
            }
            let next = child.set.first_cluster;
            self.load_dir(next, Some(Owner { parent: dir, index }))?;
            dir = next;
        }
        Ok(dir)
    }

    fn load_dir(&mut self, first: u32, owner: Option<Owner>) -> FsResult<()> {
        if self.dirs.contains_key(&first) {
            return Ok(());
        }
        let chain = self.fat.chain(first)?;
        let bytes = self.read_chain(&chain)?;

        let mut children = Vec::new();
        let mut pos = 0;
        while pos + ENTRY_SIZE <= bytes.len() {
            match bytes[pos] {
                END_OF_DIRECTORY => break,
                FILE => {
                    let len = (usize::from(bytes[pos + 1]) + 1) * ENTRY_SIZE;
                    match EntrySet::decode(&bytes[pos..]) {
                        Some(set) => children.push(Child {
                            key: set.key(&self.upcase),
                            set,
                            position: pos as u64,
                        }),
                        None => warn!(cluster = first, offset = pos, "skipping damaged entry set"),
                    }
                    pos += len;
                }
                _ => pos += ENTRY_SIZE,
            }
        }

        self.dirs.insert(
            first,
            Directory {
                chain,
                end: pos.min(bytes.len()) as u64,
                children,
                owner,
            },
        );
        Ok(())
    }

    fn find(&self, dir: u32, key: &[u16]) -> Option<(usize, &Child)> {
        self.dirs
            .get(&dir)?
            .children
            .iter()
            .enumerate()
            .find(|(_, child)| child.key == key)
    }

    fn dir(&self, dir: u32) -> FsResult<&Directory> {
        self.dirs.get(&dir).ok_or_else(|| not_loaded(dir))
    }

    fn dir_mut(&mut self, dir: u32) -> FsResult<&mut Directory> {
        self.dirs.get_mut(&dir).ok_or_else(|| not_loaded(dir))
    }

    fn child_mut(&mut self, dir: u32, index: usize) -> FsResult<&mut Child> {
        self.dir_mut(dir)?
            .children
            .get_mut(index)
            .ok_or_else(|| not_loaded(dir))
    }

    /// Appends an entry set to `dir`, growing it when full. Returns the child index.
    fn insert(&mut self, dir: u32, set: EntrySet, key: Vec<u16>) -> FsResult<usize> {
        let bytes = set.encode(&self.upcase);
        let needed = bytes.len() as u64;
        loop {
            let d = self.dir(dir)?;
            if d.end + needed <= d.chain.len() as u64 * self.geometry.cluster_bytes() {
                break;
            }
            self.grow_dir(dir)?;
        }

        let position = self.dir(dir)?.end;
        self.write_dir(dir, position, &bytes)?;
        let d = self.dir_mut(dir)?;
        d.end += needed;
        d.children.push(Child { set, key, position });
        Ok(d.children.len() - 1)
    }

    /// Adds one zeroed cluster to `dir` and records the new size in its entry set.
    fn grow_dir(&mut self, dir: u32) -> FsResult<()> {
        let last = self.dir(dir)?.chain.last().copied();
        let cluster = self.allocate(last).ok_or(FsError::NoSpace)?;
        self.zero_cluster(cluster)?;

        let cluster_bytes = self.geometry.cluster_bytes();
        let d = self.dir_mut(dir)?;
        d.chain.push(cluster);
        let size = d.chain.len() as u64 * cluster_bytes;
        if let Some(Owner { parent, index }) = d.owner {
            self.child_mut(parent, index)?.set.data_length = size;
            self.rewrite_child(parent, index)?;
        }
        debug!(dir, clusters = size / cluster_bytes, "directory grown");
        Ok(())
    }

    fn rewrite_child(&mut self, dir: u32, index: usize) -> FsResult<()> {
        let child = self.dir(dir)?.children.get(index).ok_or_else(|| not_loaded(dir))?;
        let bytes = child.set.encode(&self.upcase);
        let position = child.position;
        self.write_dir(dir, position, &bytes)
    }

    /// Writes `bytes` at `position` inside directory `dir`, across clusters if needed.
    fn write_dir(&mut self, dir: u32, position: u64, bytes: &[u8]) -> FsResult<()> {
        let cluster_bytes = self.geometry.cluster_bytes();
        let mut done = 0;
        while done < bytes.len() {
            let at = position + done as u64;
            let cluster = self
                .dir(dir)?
                .chain
                .get((at / cluster_bytes) as usize)
                .copied()
                .ok_or_else(|| not_loaded(dir))?;
            let within = at % cluster_bytes;
            let n = ((cluster_bytes - within) as usize).min(bytes.len() - done);
            let offset = self.geometry.cluster_offset(cluster) + within;
            write_at(&mut self.disk, offset, &bytes[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Takes the lowest free cluster and links it after `prev`.
    fn allocate(&mut self, prev: Option<u32>) -> Option<u32> {
        let cluster = self.bitmap.find_free()?;
        self.bitmap.set_used(cluster, true);
        self.fat.set(cluster, END_OF_CHAIN);
        if let Some(prev) = prev {
            self.fat.set(prev, cluster);
        }
        Some(cluster)
    }

    fn release(&mut self, cluster: u32) {
        self.bitmap.set_used(cluster, false);
        self.fat.set(cluster, 0);
    }

    fn zero_cluster(&mut self, cluster: u32) -> FsResult<()> {
        let zeros = vec![0u8; self.geometry.cluster_bytes() as usize];
        write_at(&mut self.disk, self.geometry.cluster_offset(cluster), &zeros)
    }

    fn read_chain(&mut self, chain: &[u32]) -> FsResult<Vec<u8>> {
        let cluster_bytes = self.geometry.cluster_bytes() as usize;
        let mut bytes = vec![0u8; chain.len() * cluster_bytes];
        for (cluster, chunk) in chain.iter().zip(bytes.chunks_exact_mut(cluster_bytes)) {
            read_at(&mut self.disk, self.geometry.cluster_offset(*cluster), chunk)?;
        }
        Ok(bytes)
    }

    /// The first `len` bytes stored in `chain`.
    fn read_extent(&mut self, chain: &[u32], len: u64) -> FsResult<Vec<u8>> {
        let mut bytes = self.read_chain(chain)?;
        if (bytes.len() as u64) < len {
            return Err(FsError::Unsupported(format!(
                "{len} bytes recorded in a chain of {} clusters",
                chain.len()
            )));
        }
        bytes.truncate(len as usize);
        Ok(bytes)
    }
}

/// Read access for checking what landed on a volume.
#[cfg(test)]
impl<D: Read + Write + Seek> ExFatVolume<D> {
    pub(crate) fn read_file(&mut self, path: &str) -> FsResult<Vec<u8>> {
        let (parents, name) = split(path)?;
        let dir = self.lookup_dir(&parents)?;
        let key: Vec<u16> = name.encode_utf16().map(|u| self.upcase.upcase(u)).collect();
        let (_, child) = self
            .find(dir, &key)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if child.set.is_dir() {
            return Err(FsError::Exists(path.to_string()));
        }
        let (first, len) = (child.set.first_cluster, child.set.data_length);
        if first == 0 {
            return Ok(Vec::new());
        }
        let chain = self.fat.chain(first)?;
        self.read_extent(&chain, len)
    }

    /// Names in the directory at `path`, with `true` for subdirectories.
    pub(crate) fn list(&mut self, path: &str) -> FsResult<Vec<(String, bool)>> {
        let components: Vec<&str> = utils::relative(path)
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();
        let dir = self.lookup_dir(&components)?;
        Ok(self
            .dir(dir)?
            .children
            .iter()
            .map(|c| (c.set.name(), c.set.is_dir()))
            .collect())
    }
}

/// Open file on an [`ExFatVolume`]. Data is appended cluster by cluster; the entry set
/// is rewritten on close.
pub struct ExFatFile<'a, D: Read + Write + Seek> {
    volume: &'a mut ExFatVolume<D>,
    dir: u32,
    index: usize,
    first_cluster: u32,
    last_cluster: Option<u32>,
    length: u64,
    closed: bool,
}

impl<D: Read + Write + Seek> ExFatFile<'_, D> {
    /// Appends from `buf`. Stops early, returning the short count, when the heap is full.
    pub fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let cluster_bytes = self.volume.geometry.cluster_bytes();
        let mut written = 0;
        while written < buf.len() {
            let used = self.length % cluster_bytes;
            let cluster = match self.last_cluster {
                Some(cluster) if used != 0 => cluster,
                prev => {
                    let Some(cluster) = self.volume.allocate(prev) else {
                        debug!(written, "volume full");
                        break;
                    };
                    if prev.is_none() {
                        self.first_cluster = cluster;
                    }
                    self.last_cluster = Some(cluster);
                    cluster
                }
            };

            let n = ((cluster_bytes - used) as usize).min(buf.len() - written);
            let offset = self.volume.geometry.cluster_offset(cluster) + used;
            write_at(&mut self.volume.disk, offset, &buf[written..written + n])?;
            written += n;
            self.length += n as u64;
        }
        Ok(written)
    }

    /// Records the length and first cluster in the entry set.
    pub fn close(mut self) -> FsResult<()> {
        self.closed = true;
        self.commit()
    }

    fn commit(&mut self) -> FsResult<()> {
        let child = self.volume.child_mut(self.dir, self.index)?;
        child.set.first_cluster = self.first_cluster;
        child.set.data_length = self.length;
        child.set.modified = Timestamp::now();
        self.volume.rewrite_child(self.dir, self.index)
    }
}

impl<D: Read + Write + Seek> Drop for ExFatFile<'_, D> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.commit() {
                error!(error = %e, "closing exFAT file failed");
            }
        }
    }
}

/// Parent components and leaf name of an absolute volume path.
fn split(path: &str) -> FsResult<(Vec<&str>, &str)> {
    let mut components: Vec<&str> = utils::relative(path)
        .split('/')
        .filter(|c| !c.is_empty())
        .collect();
    let name = components.pop().ok_or_else(|| FsError::Exists(path.to_string()))?;
    Ok((components, name))
}

fn not_loaded(dir: u32) -> FsError {
    FsError::Io(io::Error::other(format!(
        "directory at cluster {dir} is not loaded"
    )))
}

fn read_at<D: Read + Seek>(disk: &mut D, offset: u64, buf: &mut [u8]) -> FsResult<()> {
    disk.seek(SeekFrom::Start(offset))?;
    disk.read_exact(buf)?;
    Ok(())
}

fn write_at<D: Write + Seek>(disk: &mut D, offset: u64, buf: &[u8]) -> FsResult<()> {
    disk.seek(SeekFrom::Start(offset))?;
    disk.write_all(buf)?;
    Ok(())
}
