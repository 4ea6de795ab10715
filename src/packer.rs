//! The packing pipeline: format, mount, ingest, unmount.

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{error, info, warn};

use crate::config::{FsFormat, PackConfig};
use crate::core::{FsService, HostTree, Result};
use crate::disk::{IMAGE_DRIVE, ImageDisk};
use crate::error::{FsError, PackError};
use crate::ingest::{IngestStats, Ingestor};
use crate::vfs::{FatFS, HostFS, MapFS};

/// How far a run got. Each stage is only entered after the previous one succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Unformatted,
    Formatted,
    Mounted,
    Ingested,
    Unmounted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Unformatted => "unformatted",
            Stage::Formatted => "formatted",
            Stage::Mounted => "mounted",
            Stage::Ingested => "ingested",
            Stage::Unmounted => "unmounted",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackReport {
    pub stage: Stage,
    pub stats: IngestStats,
}

/// Drives one filesystem service through a complete packing run.
///
/// # Notes
/// - A failure in `format` or `mount` ends the run at once. A device that cannot be
///   brought up is reported as `DeviceNotReady` whatever stage hit it.
/// - A failure while ingesting still unmounts the volume. A failing unmount at that
///   point is only logged; the ingestion error is the one returned.
pub struct Packer<S: FsService, H: HostTree> {
    fs: S,
    host: H,
    stage: Stage,
}

impl<S: FsService, H: HostTree> Packer<S, H> {
    pub fn new(fs: S, host: H) -> Self {
        Self {
            fs,
            host,
            stage: Stage::Unformatted,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn fs(&self) -> &S {
        &self.fs
    }

    pub fn into_fs(self) -> S {
        self.fs
    }

    /// Formats the volume as `format` and fills its root with the contents of `source`.
    pub fn run(&mut self, source: &Path, format: FsFormat) -> Result<PackReport> {
        self.fs
            .format(IMAGE_DRIVE, format)
            .map_err(stage_error(PackError::Format))?;
        self.stage = Stage::Formatted;

        self.fs
            .mount(IMAGE_DRIVE)
            .map_err(stage_error(PackError::Mount))?;
        self.stage = Stage::Mounted;

        info!(source = %source.display(), "copying source folder to the image root");
        let ingested = Ingestor::new(&mut self.fs, &self.host).ingest(source, "/");
        let stats = match ingested {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "ingestion failed");
                match self.fs.unmount(IMAGE_DRIVE) {
                    Ok(()) => self.stage = Stage::Unmounted,
                    Err(unmount) => {
                        warn!(error = %unmount, "unmount after failed ingestion also failed")
                    }
                }
                return Err(e);
            }
        };
        self.stage = Stage::Ingested;
        info!(
            directories = stats.directories,
            files = stats.files,
            bytes = stats.bytes,
            "all files copied"
        );

        self.fs
            .unmount(IMAGE_DRIVE)
            .map_err(stage_error(PackError::Unmount))?;
        self.stage = Stage::Unmounted;

        Ok(PackReport {
            stage: self.stage,
            stats,
        })
    }
}

/// Packs `config.source` into a fresh image at `config.image`.
///
/// An existing image file is replaced. With `create_source` a missing source folder is
/// created first and the result is an empty, formatted image.
pub fn pack(config: &PackConfig) -> Result<PackReport> {
    prepare_source(config)?;
    let disk = ImageDisk::new(config.image.clone());
    let mut packer = Packer::new(FatFS::new(disk), HostFS::new());
    let report = packer.run(&config.source, config.format)?;
    info!(
        image = %config.image.path().display(),
        mib = config.image.size_mib(),
        "image ready"
    );
    Ok(report)
}

/// Runs the same pipeline against an in-memory volume as large as the image.
///
/// Nothing is written to the image path. The capacity ignores FAT metadata, so a tree
/// that barely fits here can still overflow the real image.
pub fn dry_run(config: &PackConfig) -> Result<PackReport> {
    prepare_source(config)?;
    let mut packer = Packer::new(MapFS::new(config.image.size()), HostFS::new());
    let report = packer.run(&config.source, config.format)?;
    info!(
        used = packer.fs().used(),
        capacity = packer.fs().capacity(),
        "dry run complete, image not written"
    );
    Ok(report)
}

/// Wraps a service error in its stage, except device failures which keep their own
/// variant.
fn stage_error(stage: fn(FsError) -> PackError) -> impl Fn(FsError) -> PackError {
    move |e| match e {
        FsError::Disk(disk) => PackError::from(disk),
        other => stage(other),
    }
}

fn prepare_source(config: &PackConfig) -> Result<()> {
    if config.create_source && !config.source.exists() {
        fs::create_dir_all(&config.source).map_err(|e| PackError::host(&config.source, e))?;
        info!(path = %config.source.display(), "created source folder");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageDescriptor;
    use crate::core::FsResult;
    use crate::exfat::ExFatVolume;
    use crate::vfs::MapFile;
    use fatfs::{FileSystem, FsOptions};
    use std::fs::File;
    use std::io::Read;
    use std::path::PathBuf;
    use tempdir::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn setup_test_env() -> TempDir {
        TempDir::new("packer_test").unwrap()
    }

    fn sample_source(temp_dir: &TempDir) -> PathBuf {
        let root = temp_dir.path().join("assets_to_pack");
        fs::create_dir_all(root.join("fonts/latin")).unwrap();
        fs::write(root.join("readme.txt"), b"packed by fatpack").unwrap();
        fs::write(root.join("fonts/latin/glyphs.bin"), vec![0x5Au8; 50_000]).unwrap();
        root
    }

    fn config(temp_dir: &TempDir, source: &Path, size: u64, format: FsFormat) -> PackConfig {
        let image = ImageDescriptor::new(temp_dir.path().join("fatfs.img"), size).unwrap();
        PackConfig::new(image, source, format)
    }

    fn read_from_image(image: &Path, path: &str) -> Vec<u8> {
        let file = File::options().read(true).write(true).open(image).unwrap();
        let fs = FileSystem::new(file, FsOptions::new()).unwrap();
        let mut content = Vec::new();
        fs.root_dir()
            .open_file(path)
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        content
    }

    /// `MapFS` whose mount and unmount can be made to fail.
    #[derive(Default)]
    struct FaultyFs {
        inner: Option<MapFS>,
        fail_mount: bool,
        fail_unmount: bool,
        unmount_calls: usize,
    }

    impl FaultyFs {
        fn new() -> Self {
            Self {
                inner: Some(MapFS::new(MIB)),
                ..Default::default()
            }
        }

        fn map(&self) -> &MapFS {
            self.inner.as_ref().unwrap()
        }

        fn map_mut(&mut self) -> &mut MapFS {
            self.inner.as_mut().unwrap()
        }
    }

    impl FsService for FaultyFs {
        type File<'a> = MapFile<'a>;

        fn format(&mut self, drive: u8, format: FsFormat) -> FsResult<()> {
            self.map_mut().format(drive, format)
        }

        fn mount(&mut self, drive: u8) -> FsResult<()> {
            if self.fail_mount {
                return Err(FsError::Unsupported("no valid volume".into()));
            }
            self.map_mut().mount(drive)
        }

        fn unmount(&mut self, drive: u8) -> FsResult<()> {
            self.unmount_calls += 1;
            if self.fail_unmount {
                return Err(FsError::Io(std::io::Error::other("flush failed")));
            }
            self.map_mut().unmount(drive)
        }

        fn mkdir(&mut self, path: &str) -> FsResult<()> {
            self.map_mut().mkdir(path)
        }

        fn create(&mut self, path: &str) -> FsResult<MapFile<'_>> {
            self.map_mut().create(path)
        }
    }

    mod stages {
        use super::*;

        #[test]
        fn test_successful_run_reaches_unmounted() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let mut packer = Packer::new(MapFS::new(MIB), HostFS::new());

            let report = packer.run(&source, FsFormat::Fat).unwrap();
            assert_eq!(report.stage, Stage::Unmounted);
            assert_eq!(report.stats.files, 2);
            assert_eq!(report.stats.directories, 2);
            assert_eq!(packer.stage(), Stage::Unmounted);

            let fs = packer.into_fs();
            assert!(!fs.is_mounted());
            assert_eq!(fs.format_type(), Some(FsFormat::Fat));
            assert_eq!(fs.read("/readme.txt").unwrap(), b"packed by fatpack");
        }

        #[test]
        fn test_format_failure_stops_everything() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            // a mounted volume refuses to be formatted
            let mut packer = Packer::new(MapFS::mounted(MIB), HostFS::new());

            let err = packer.run(&source, FsFormat::Fat).unwrap_err();
            assert!(matches!(err, PackError::Format(FsError::AlreadyMounted)));
            assert_eq!(packer.stage(), Stage::Unformatted);
            assert!(!packer.fs().exists("/readme.txt"));
        }

        #[test]
        fn test_mount_failure_skips_ingest_and_unmount() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let fs = FaultyFs {
                fail_mount: true,
                ..FaultyFs::new()
            };
            let mut packer = Packer::new(fs, HostFS::new());

            let err = packer.run(&source, FsFormat::Fat).unwrap_err();
            assert!(matches!(err, PackError::Mount(_)));
            assert_eq!(packer.stage(), Stage::Formatted);
            assert_eq!(packer.fs().unmount_calls, 0);
            assert_eq!(packer.fs().map().tree().count(), 0);
        }

        #[test]
        fn test_ingest_failure_still_unmounts() {
            let temp_dir = setup_test_env();
            let missing = temp_dir.path().join("missing");
            let mut packer = Packer::new(FaultyFs::new(), HostFS::new());

            let err = packer.run(&missing, FsFormat::Fat).unwrap_err();
            assert!(matches!(err, PackError::HostAccess { .. }));
            assert_eq!(packer.fs().unmount_calls, 1);
            assert!(!packer.fs().map().is_mounted());
            assert_eq!(packer.stage(), Stage::Unmounted);
        }

        #[test]
        fn test_unmount_failure_does_not_mask_ingest_error() {
            let temp_dir = setup_test_env();
            let missing = temp_dir.path().join("missing");
            let fs = FaultyFs {
                fail_unmount: true,
                ..FaultyFs::new()
            };
            let mut packer = Packer::new(fs, HostFS::new());

            let err = packer.run(&missing, FsFormat::Fat).unwrap_err();
            assert!(matches!(err, PackError::HostAccess { .. }));
            assert_eq!(packer.fs().unmount_calls, 1);
            assert_eq!(packer.stage(), Stage::Mounted);
        }

        #[test]
        fn test_unmount_failure_after_ingest_is_reported() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let fs = FaultyFs {
                fail_unmount: true,
                ..FaultyFs::new()
            };
            let mut packer = Packer::new(fs, HostFS::new());

            let err = packer.run(&source, FsFormat::Fat).unwrap_err();
            assert!(matches!(err, PackError::Unmount(_)));
            assert_eq!(packer.stage(), Stage::Ingested);
        }

        #[test]
        fn test_stage_order() {
            assert!(Stage::Unformatted < Stage::Formatted);
            assert!(Stage::Mounted < Stage::Ingested);
            assert_eq!(Stage::Unmounted.to_string(), "unmounted");
        }
    }

    mod images {
        use super::*;

        #[test]
        fn test_pack_produces_readable_image() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let config = config(&temp_dir, &source, 4 * MIB, FsFormat::Fat);

            let report = pack(&config).unwrap();
            assert_eq!(report.stage, Stage::Unmounted);
            assert_eq!(report.stats.bytes, 17 + 50_000);

            let image = config.image.path();
            assert_eq!(fs::metadata(image).unwrap().len(), 4 * MIB);
            assert_eq!(read_from_image(image, "readme.txt"), b"packed by fatpack");
            assert_eq!(
                read_from_image(image, "fonts/latin/glyphs.bin"),
                vec![0x5Au8; 50_000]
            );
        }

        #[test]
        fn test_pack_replaces_previous_image() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let config = config(&temp_dir, &source, 4 * MIB, FsFormat::Fat);
            fs::write(config.image.path(), b"stale image bytes").unwrap();

            pack(&config).unwrap();
            assert_eq!(fs::metadata(config.image.path()).unwrap().len(), 4 * MIB);
            assert_eq!(
                read_from_image(config.image.path(), "readme.txt"),
                b"packed by fatpack"
            );
        }

        #[test]
        fn test_pack_exfat_produces_readable_image() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let config = config(&temp_dir, &source, 4 * MIB, FsFormat::ExFat);

            let report = pack(&config).unwrap();
            assert_eq!(report.stage, Stage::Unmounted);
            assert_eq!(report.stats.files, 2);

            let image = File::options()
                .read(true)
                .write(true)
                .open(config.image.path())
                .unwrap();
            let mut volume = ExFatVolume::open(image).unwrap();
            assert_eq!(volume.read_file("/readme.txt").unwrap(), b"packed by fatpack");
            assert_eq!(
                volume.read_file("/fonts/latin/glyphs.bin").unwrap(),
                vec![0x5Au8; 50_000]
            );
        }

        #[test]
        fn test_pack_fat32_too_small_is_format_error() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let config = config(&temp_dir, &source, 4 * MIB, FsFormat::Fat32);

            let err = pack(&config).unwrap_err();
            assert!(matches!(err, PackError::Format(FsError::Unsupported(_))));
            assert!(!config.image.path().exists());
        }

        #[test]
        fn test_pack_into_missing_directory_is_device_not_ready() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let image =
                ImageDescriptor::new(temp_dir.path().join("no/such/dir/fatfs.img"), 4 * MIB)
                    .unwrap();
            let config = PackConfig::new(image, &source, FsFormat::Fat);

            let err = pack(&config).unwrap_err();
            assert!(matches!(err, PackError::DeviceNotReady));
        }

        // case-sensitive host filesystem needed to hold both names
        #[cfg(target_os = "linux")]
        #[test]
        fn test_pack_names_differing_in_case_fails() {
            let temp_dir = setup_test_env();
            let source = temp_dir.path().join("clash");
            fs::create_dir(&source).unwrap();
            fs::write(source.join("A.txt"), b"upper").unwrap();
            fs::write(source.join("a.txt"), b"lower").unwrap();

            for format in [FsFormat::Fat, FsFormat::ExFat] {
                let config = config(&temp_dir, &source, 4 * MIB, format);
                let err = pack(&config).unwrap_err();
                match err {
                    PackError::HostAccess { path, source: cause } => {
                        assert_eq!(path, source.join("a.txt"));
                        assert!(cause.to_string().contains("A.txt"));
                    }
                    other => panic!("unexpected error: {other}"),
                }
            }
        }

        #[test]
        fn test_pack_missing_source_fails() {
            let temp_dir = setup_test_env();
            let missing = temp_dir.path().join("missing");
            let config = config(&temp_dir, &missing, 4 * MIB, FsFormat::Fat);

            let err = pack(&config).unwrap_err();
            assert!(matches!(err, PackError::HostAccess { .. }));
            assert!(!missing.exists());
        }

        #[test]
        fn test_pack_creates_missing_source() {
            let temp_dir = setup_test_env();
            let missing = temp_dir.path().join("assets_to_pack");
            let config =
                config(&temp_dir, &missing, 4 * MIB, FsFormat::Fat).with_create_source(true);

            let report = pack(&config).unwrap();
            assert!(missing.is_dir());
            assert_eq!(report.stats, IngestStats::default());

            let file = File::options()
                .read(true)
                .write(true)
                .open(config.image.path())
                .unwrap();
            let fs = FileSystem::new(file, FsOptions::new()).unwrap();
            assert!(fs.root_dir().open_file("readme.txt").is_err());
        }

        #[test]
        fn test_pack_overflowing_tree_fails_with_write_error() {
            let temp_dir = setup_test_env();
            let source = temp_dir.path().join("big");
            fs::create_dir(&source).unwrap();
            fs::write(source.join("huge.bin"), vec![1u8; (2 * MIB) as usize]).unwrap();
            let config = config(&temp_dir, &source, MIB, FsFormat::Fat);

            let err = pack(&config).unwrap_err();
            match err {
                PackError::Write { path, .. } => assert_eq!(path, "/huge.bin"),
                other => panic!("unexpected error: {other}"),
            }
            // the volume was still unmounted and stays readable
            let file = File::options()
                .read(true)
                .write(true)
                .open(config.image.path())
                .unwrap();
            assert!(FileSystem::new(file, FsOptions::new()).is_ok());
        }
    }

    mod dry_runs {
        use super::*;

        #[test]
        fn test_dry_run_leaves_image_alone() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let config = config(&temp_dir, &source, 4 * MIB, FsFormat::Fat);

            let report = dry_run(&config).unwrap();
            assert_eq!(report.stats.files, 2);
            assert!(!config.image.path().exists());
        }

        #[test]
        fn test_dry_run_detects_overflow() {
            let temp_dir = setup_test_env();
            let source = sample_source(&temp_dir);
            let config = config(&temp_dir, &source, 32 * 1024, FsFormat::Fat);

            let err = dry_run(&config).unwrap_err();
            assert!(matches!(
                err,
                PackError::Write {
                    source: FsError::NoSpace,
                    ..
                }
            ));
        }
    }
}
