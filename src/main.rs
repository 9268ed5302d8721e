//! Collection Scanner CLI
//!
//! Keeps a SQLite catalog in sync with the collection locations on disk.

use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{error, info};
use std::path::{Path, PathBuf};

use collection_scanner::{
    CollectionScanner, FileScanMode, ProgressReporter, Result, ScanConfig, ScanStats, SqliteStore,
    SqliteThumbnailIndex, StaticLocations,
};

const ABOUT: &str = r#"
Collection Scanner - keeps a media catalog in sync with the disk

Examples:
  collection_scanner locations add /media/photos     register a collection location
  collection_scanner scan                            scan every location
  collection_scanner scan --update-hash --json       refresh hashes, print JSON stats
  collection_scanner partial /media/photos/2020      scan one album and its sub-albums
  collection_scanner file /media/photos/a.jpg -m rescan
"#;

/// Incremental collection scanner
#[derive(Parser)]
#[command(name = "collection_scanner")]
#[command(author, version, about = ABOUT, long_about = None)]
#[command(help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct Cli {
    /// Catalog database file
    #[arg(short = 'd', long, global = true, default_value = "collection.db")]
    db: PathBuf,

    /// Thumbnail database whose hash keys follow edited files
    #[arg(long, global = true)]
    thumbnails: Option<PathBuf>,

    /// Write JSON progress lines to stderr
    #[arg(short = 'p', long, global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage collection locations
    Locations {
        #[command(subcommand)]
        action: LocationCommands,
    },

    /// Scan every available location
    Scan {
        /// Refresh unique hashes of unchanged files
        #[arg(long)]
        update_hash: bool,

        /// Fully rescan modified files instead of a light update
        #[arg(long)]
        rescan_modified: bool,

        /// Print the statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Scan one album directory and its sub-albums
    Partial {
        path: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Scan a single file
    File {
        path: PathBuf,

        #[arg(short = 'm', long, value_enum, default_value_t = ModeArg::Normal)]
        mode: ModeArg,
    },
}

#[derive(Subcommand)]
enum LocationCommands {
    /// Register a directory as a collection location
    Add { path: PathBuf },
    /// List registered locations
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Normal,
    Modified,
    Rescan,
}

impl From<ModeArg> for FileScanMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Normal => FileScanMode::Normal,
            ModeArg::Modified => FileScanMode::ModifiedScan,
            ModeArg::Rescan => FileScanMode::Rescan,
        }
    }
}

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let Some(command) = cli.command else {
        println!("{}", ABOUT);
        println!("Use 'collection_scanner --help' for all options");
        return Ok(());
    };

    match command {
        Commands::Locations { action } => {
            let mut store = SqliteStore::open(&cli.db)?;
            match action {
                LocationCommands::Add { path } => {
                    let root = std::fs::canonicalize(&path).map_err(|e| {
                        collection_scanner::ScanError::from(e).with_path(&path)
                    })?;
                    let id = store.add_location(&root)?;
                    println!("Location {}: {}", id, root.display());
                }
                LocationCommands::List => {
                    for location in store.locations()? {
                        println!("{}\t{}", location.id, location.root_path.display());
                    }
                }
            }
        }
        Commands::Scan {
            update_hash,
            rescan_modified,
            json,
        } => {
            let config = ScanConfig::builder()
                .update_hash(update_hash)
                .rescan_if_modified(rescan_modified)
                .signals(cli.progress, cli.progress)
                .build();
            let mut scanner = open_scanner(&cli.db, cli.thumbnails.as_deref(), config, cli.progress)?;
            info!("Starting complete scan");
            let outcome = scanner.complete_scan()?;
            if outcome.is_cancelled() {
                info!("Scan was cancelled");
            }
            print_stats(outcome.stats(), json)?;
        }
        Commands::Partial { path, json } => {
            let path = std::fs::canonicalize(&path)
                .map_err(|e| collection_scanner::ScanError::from(e).with_path(&path))?;
            let config = ScanConfig::builder()
                .signals(cli.progress, cli.progress)
                .build();
            let mut scanner = open_scanner(&cli.db, cli.thumbnails.as_deref(), config, cli.progress)?;
            info!("Starting partial scan of {}", path.display());
            let outcome = scanner.partial_scan_path(&path)?;
            print_stats(outcome.stats(), json)?;
        }
        Commands::File { path, mode } => {
            let path = std::fs::canonicalize(&path)
                .map_err(|e| collection_scanner::ScanError::from(e).with_path(&path))?;
            let mut scanner =
                open_scanner(&cli.db, cli.thumbnails.as_deref(), ScanConfig::default(), false)?;
            match scanner.scan_file_path(&path, mode.into())? {
                Some(id) => println!("Item {}: {}", id, path.display()),
                None => println!("Not scanned: {}", path.display()),
            }
        }
    }
    Ok(())
}

fn open_scanner(
    db: &Path,
    thumbnails: Option<&Path>,
    config: ScanConfig,
    progress: bool,
) -> Result<CollectionScanner<SqliteStore, StaticLocations>> {
    let store = SqliteStore::open(db)?;
    let locations = StaticLocations::new(store.locations()?);
    let mut scanner = CollectionScanner::new(store, locations)
        .with_config(config)
        .with_notifier(Box::new(ProgressReporter::new(progress, 500)));
    if let Some(path) = thumbnails {
        scanner = scanner.with_thumbnail_index(Box::new(SqliteThumbnailIndex::open(path)?));
    }
    Ok(scanner)
}

fn print_stats(stats: &ScanStats, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
    } else {
        println!("Scan completed:");
        println!("  New items: {}", stats.new_items);
        println!("  Copied items: {}", stats.copied_items);
        println!("  Moved items: {}", stats.moved_items);
        println!("  Modified items: {}", stats.modified_items + stats.rescanned_items);
        println!("  Removed items: {}", stats.removed_items);
        println!("  Albums scanned: {}", stats.albums_scanned);
        println!("  Stale albums: {}", stats.stale_albums_removed);
        println!("  Errors: {}", stats.error_count());
        println!("  Duration: {}ms", stats.duration_ms);
    }
    Ok(())
}
