use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fatpack::config::{self, FsFormat, ImageDescriptor, PackConfig};

/// Pack a host directory tree into a FAT filesystem image.
#[derive(Parser, Debug)]
#[command(name = "fatpack", version, about)]
struct Args {
    /// Image file to (re)create
    #[arg(default_value = config::DEFAULT_IMAGE_PATH)]
    image: PathBuf,

    /// Image size in bytes; K, M and G suffixes are accepted
    #[arg(default_value = "32M", value_parser = config::parse_size)]
    size: u64,

    /// Folder whose contents become the root of the image
    #[arg(default_value = config::DEFAULT_SOURCE)]
    source: PathBuf,

    /// Filesystem flavour: fat, fat32 or exfat
    #[arg(short, long, default_value = "exfat")]
    format: FsFormat,

    /// Create the source folder if it does not exist
    #[arg(long)]
    create_source: bool,

    /// Walk the source and check it fits without writing the image
    #[arg(long)]
    dry_run: bool,

    /// Log every directory and file
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();
    init_tracing(&args);

    if let Err(error) = run(args) {
        eprintln!("error: {error:#}");
        process::exit(1);
    }
}

fn init_tracing(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: Args) -> Result<()> {
    let image = ImageDescriptor::new(&args.image, args.size).context("invalid image settings")?;
    if args.source.exists() && !args.source.is_dir() {
        bail!("source {} is not a directory", args.source.display());
    }
    let config =
        PackConfig::new(image, &args.source, args.format).with_create_source(args.create_source);

    info!(
        image = %config.image.path().display(),
        size = config.image.size(),
        mib = config.image.size_mib(),
        sectors = config.image.sector_count(),
        sector_size = config.image.sector_size(),
        format = %config.format,
        source = %config.source.display(),
        "configuration"
    );

    let report = if args.dry_run {
        fatpack::dry_run(&config)
    } else {
        fatpack::pack(&config)
    }
    .with_context(|| {
        format!(
            "cannot pack {} into {}",
            config.source.display(),
            config.image.path().display()
        )
    })?;

    info!(
        stage = %report.stage,
        directories = report.stats.directories,
        files = report.stats.files,
        bytes = report.stats.bytes,
        skipped = report.stats.skipped,
        "done"
    );
    Ok(())
}
