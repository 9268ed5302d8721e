//! Incremental collection scanner
//!
//! Keeps a catalog of media items in sync with the directories of one or
//! more collection locations. Items are matched by name within their album,
//! changed files are detected by size and modification date, and files that
//! disappear are trashed before they are eventually made obsolete.

pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod grace;
pub mod hints;
pub mod history;
pub mod item;
pub mod locations;
pub mod models;
pub mod progress;
mod reconcile;
pub mod scanner;
mod stale;
pub mod store;

pub use config::{GracePolicy, ScanConfig};
pub use db::{SqliteStore, SqliteThumbnailIndex};
pub use error::{Result, ScanError, ScanErrorKind};
pub use hints::{
    AdjustmentPhase, AlbumMoveHint, ChangeKind, HintContainer, ItemChangeHint, ItemMoveHint,
    MetadataAdjustmentHint,
};
pub use item::{MetadataReader, NoMetadata};
pub use locations::{LocationProvider, StaticLocations};
pub use models::{
    Category, CollectionLocation, FileScanMode, ItemMetadata, ItemStatus, ScanOutcome, ScanStats,
};
pub use progress::{CancelFlag, NoopNotifier, ProgressReporter, ScanNotifier, ScanObserver};
pub use scanner::CollectionScanner;
pub use store::{ItemStore, ThumbnailIndex};
