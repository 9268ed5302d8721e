//! Core data models for the collection scanner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config;
use crate::error::ScanError;

/// Row id of an album
pub type AlbumId = i64;
/// Row id of an item
pub type ItemId = i64;
/// Row id of a collection location (album root)
pub type LocationId = i64;
/// Row id of a tag
pub type TagId = i64;

/// Item category, derived from the filter set an extension belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Image,
    Video,
    Audio,
    #[default]
    Other,
}

impl Category {
    pub fn as_i64(&self) -> i64 {
        match self {
            Category::Image => 1,
            Category::Video => 2,
            Category::Audio => 3,
            Category::Other => 0,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Category::Image,
            2 => Category::Video,
            3 => Category::Audio,
            _ => Category::Other,
        }
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Image => "image",
            Category::Video => "video",
            Category::Audio => "audio",
            Category::Other => "other",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of an item record
///
/// `Trashed` items are detached from their album but kept, so that a later
/// scan can revive them. `Obsolete` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Normal,
    Trashed,
    Obsolete,
}

impl ItemStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            ItemStatus::Normal => 1,
            ItemStatus::Trashed => 3,
            ItemStatus::Obsolete => 4,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            3 => ItemStatus::Trashed,
            4 => ItemStatus::Obsolete,
            _ => ItemStatus::Normal,
        }
    }

    /// Ordering used when picking among identical files: normal items first
    fn identity_rank(&self) -> u8 {
        match self {
            ItemStatus::Normal => 0,
            ItemStatus::Trashed => 1,
            ItemStatus::Obsolete => 2,
        }
    }
}

/// Whether the volume behind a location is currently reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LocationAvailability {
    #[default]
    Available,
    Unavailable,
    Hidden,
}

/// A filesystem root registered as a media source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionLocation {
    pub id: LocationId,
    pub root_path: PathBuf,
    pub availability: LocationAvailability,
}

impl CollectionLocation {
    pub fn new(id: LocationId, root_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root_path: root_path.into(),
            availability: LocationAvailability::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.availability == LocationAvailability::Available
    }

    /// Absolute directory of an album path such as `/` or `/2020/trip`
    pub fn album_dir(&self, album: &str) -> PathBuf {
        let relative = album.trim_start_matches('/');
        if relative.is_empty() {
            self.root_path.clone()
        } else {
            self.root_path.join(relative)
        }
    }

    /// Root path as a string, for notifications
    pub fn root_str(&self) -> String {
        self.root_path.to_string_lossy().to_string()
    }
}

/// Short album listing used by the stale album sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumShortInfo {
    pub id: AlbumId,
    pub location_id: LocationId,
    pub relative_path: String,
}

/// The part of an item record the scanner compares against the disk
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemScanInfo {
    pub id: ItemId,
    pub album_id: Option<AlbumId>,
    pub name: String,
    pub status: ItemStatus,
    pub category: Category,
    /// `None` marks an item that was never fully scanned
    pub modification_date: Option<DateTime<Utc>>,
    pub file_size: u64,
    pub unique_hash: Option<String>,
}

/// Location of an item record, resolved through its album
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemShortInfo {
    pub id: ItemId,
    pub name: String,
    pub album_id: Option<AlbumId>,
    pub location_id: Option<LocationId>,
    pub album_path: Option<String>,
}

/// Sort candidates for identity: normal before trashed, then newest first
pub fn sort_for_identity(candidates: &mut [ItemScanInfo]) {
    candidates.sort_by(|a, b| {
        a.status
            .identity_rank()
            .cmp(&b.status.identity_rank())
            .then_with(|| b.modification_date.cmp(&a.modification_date))
    });
}

/// Geographic position of an item
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

/// Reference from an edited file to a version it was derived from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Metadata read from a file during a full scan
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemMetadata {
    pub rating: Option<i32>,
    pub creation_date: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub tags: Vec<String>,
    pub position: Option<GpsPosition>,
    pub uuid: Option<String>,
    pub history: Vec<HistoryReference>,
}

/// Kind of relation between two items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationType {
    /// subject was derived from object
    DerivedFrom,
    Grouped,
}

impl RelationType {
    pub fn as_i64(&self) -> i64 {
        match self {
            RelationType::DerivedFrom => 1,
            RelationType::Grouped => 2,
        }
    }
}

/// How a single file scan treats an already known item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileScanMode {
    /// The classifier decides
    #[default]
    Normal,
    /// Force a lightweight update
    ModifiedScan,
    /// Force a complete rescan
    Rescan,
}

/// Name filters and ignored directories, loaded once per scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilters {
    pub image: HashSet<String>,
    pub video: HashSet<String>,
    pub audio: HashSet<String>,
    pub ignore_directories: HashSet<String>,
}

impl Default for NameFilters {
    fn default() -> Self {
        Self {
            image: config::default_image_extensions(),
            video: config::default_video_extensions(),
            audio: config::default_audio_extensions(),
            ignore_directories: config::default_ignore_dirs(),
        }
    }
}

impl NameFilters {
    /// Lowercase suffix after the last dot
    pub fn suffix(name: &str) -> Option<String> {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
    }

    /// Whether a file name passes the media type filter
    pub fn accepts(&self, name: &str) -> bool {
        match Self::suffix(name) {
            Some(ext) => {
                self.image.contains(&ext) || self.video.contains(&ext) || self.audio.contains(&ext)
            }
            None => false,
        }
    }

    pub fn category(&self, name: &str) -> Category {
        let Some(ext) = Self::suffix(name) else {
            return Category::Other;
        };
        if self.image.contains(&ext) {
            Category::Image
        } else if self.audio.contains(&ext) {
            Category::Audio
        } else if self.video.contains(&ext) {
            Category::Video
        } else {
            Category::Other
        }
    }

    pub fn is_ignored_dir(&self, name: &str) -> bool {
        self.ignore_directories.contains(name)
    }

    /// Whether any component of an album path is an ignored directory
    pub fn album_is_ignored(&self, album: &str) -> bool {
        album
            .split('/')
            .filter(|c| !c.is_empty())
            .any(|c| self.is_ignored_dir(c))
    }
}

/// Counters collected over one scan invocation
#[derive(Debug, Default, Serialize)]
pub struct ScanStats {
    pub new_items: u64,
    pub copied_items: u64,
    pub moved_items: u64,
    pub modified_items: u64,
    pub rescanned_items: u64,
    pub hash_updated_items: u64,
    pub unchanged_items: u64,
    pub postponed_items: u64,
    pub removed_items: u64,
    pub deferred_items: u64,
    pub albums_scanned: u64,
    pub stale_albums_removed: u64,
    pub stale_albums_renamed: u64,
    pub obsoleted_items: u64,
    /// Directories that could not be read and were skipped
    #[serde(skip)]
    pub errors: Vec<ScanError>,
    pub duration_ms: u64,
}

impl ScanStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of errors
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Number of item rows written in any way
    pub fn mutations(&self) -> u64 {
        self.new_items
            + self.copied_items
            + self.moved_items
            + self.modified_items
            + self.rescanned_items
            + self.hash_updated_items
            + self.removed_items
            + self.stale_albums_removed
            + self.stale_albums_renamed
            + self.obsoleted_items
    }
}

/// How a scan entry point ended
#[derive(Debug)]
pub enum ScanOutcome {
    Completed(ScanStats),
    /// The observer asked to stop; only work already committed persists
    Cancelled(ScanStats),
}

impl ScanOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanOutcome::Cancelled(_))
    }

    pub fn stats(&self) -> &ScanStats {
        match self {
            ScanOutcome::Completed(stats) | ScanOutcome::Cancelled(stats) => stats,
        }
    }

    pub fn into_stats(self) -> ScanStats {
        match self {
            ScanOutcome::Completed(stats) | ScanOutcome::Cancelled(stats) => stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_category_from_filters() {
        let filters = NameFilters::default();
        assert_eq!(filters.category("a.JPG"), Category::Image);
        assert_eq!(filters.category("clip.mkv"), Category::Video);
        assert_eq!(filters.category("song.flac"), Category::Audio);
        assert_eq!(filters.category("notes.txt"), Category::Other);
        assert_eq!(filters.category("README"), Category::Other);
    }

    #[test]
    fn test_filters_accept() {
        let filters = NameFilters::default();
        assert!(filters.accepts("x.jpg"));
        assert!(filters.accepts("x.PNG"));
        assert!(!filters.accepts("x.txt"));
        assert!(!filters.accepts("jpg"));
    }

    #[test]
    fn test_album_is_ignored() {
        let filters = NameFilters::default();
        assert!(filters.album_is_ignored("/photos/@eaDir/thumbs"));
        assert!(!filters.album_is_ignored("/photos/2020"));
        assert!(!filters.album_is_ignored("/"));
    }

    #[test]
    fn test_status_round_trip_values() {
        for status in [ItemStatus::Normal, ItemStatus::Trashed, ItemStatus::Obsolete] {
            assert_eq!(ItemStatus::from_i64(status.as_i64()), status);
        }
        for category in [Category::Image, Category::Video, Category::Audio, Category::Other] {
            assert_eq!(Category::from_i64(category.as_i64()), category);
        }
    }

    #[test]
    fn test_album_dir() {
        let location = CollectionLocation::new(1, "/media/photos");
        assert_eq!(location.album_dir("/"), PathBuf::from("/media/photos"));
        assert_eq!(location.album_dir("/a/b"), PathBuf::from("/media/photos/a/b"));
    }

    #[test]
    fn test_sort_for_identity() {
        let older = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let mut candidates = vec![
            ItemScanInfo {
                id: 1,
                status: ItemStatus::Trashed,
                modification_date: Some(newer),
                ..Default::default()
            },
            ItemScanInfo {
                id: 2,
                status: ItemStatus::Normal,
                modification_date: Some(older),
                ..Default::default()
            },
            ItemScanInfo {
                id: 3,
                status: ItemStatus::Normal,
                modification_date: Some(newer),
                ..Default::default()
            },
        ];
        sort_for_identity(&mut candidates);
        let ids: Vec<_> = candidates.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_stats_mutations() {
        let mut stats = ScanStats::new();
        assert_eq!(stats.mutations(), 0);
        stats.unchanged_items = 10;
        stats.albums_scanned = 2;
        assert_eq!(stats.mutations(), 0);
        stats.removed_items = 1;
        assert_eq!(stats.mutations(), 1);
    }
}
