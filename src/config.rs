//! Configuration for the collection scanner

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default marker contained in the suffix of temporary files we write ourselves
pub const DEFAULT_TEMP_FILE_MARKER: &str = "scannertempfile.";

/// Default sidecar extension
pub const DEFAULT_SIDECAR_EXTENSION: &str = "xmp";

/// Default lifetime of an "about to edit" metadata hint (seconds)
pub const DEFAULT_HINT_EXPIRY_SECS: u64 = 600;

/// Thresholds deciding when trashed items become obsolete
///
/// All comparisons are strict. The defaults are the historical values; they
/// are not derived from any measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GracePolicy {
    /// Days that must pass between two deletion sweeps
    pub min_days_between_sweeps: i64,
    pub short_wait_days: i64,
    pub short_wait_scans: i64,
    pub long_wait_days: i64,
    pub long_wait_scans: i64,
    /// Complete scans after which removal happens regardless of elapsed time
    pub max_scans: i64,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self {
            min_days_between_sweeps: 7,
            short_wait_days: 7,
            short_wait_scans: 2,
            long_wait_days: 30,
            long_wait_scans: 0,
            max_scans: 30,
        }
    }
}

/// Configuration for the scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Refresh hashes of files whose size and date did not change
    pub update_hash: bool,

    /// Changed files get a full rescan instead of a lightweight update
    pub rescan_if_modified: bool,

    /// Consider the sidecar modification date when detecting changes
    pub use_sidecar_for_reading: bool,

    /// Extension appended to a file name to find its sidecar
    pub sidecar_extension: String,

    /// Drop stored metadata before a full rescan re-reads it
    pub clear_metadata_if_rescan: bool,

    /// Skip per-file work and only collect the directories that need it
    pub deferred_file_scanning: bool,

    /// Emit notifications to the notifier
    pub want_signals: bool,

    /// Count files up front for progress totals (requires `want_signals`)
    pub need_total_files: bool,

    /// Files whose suffix contains this marker are ignored
    pub temp_file_marker: String,

    /// Seconds an "about to edit" hint stays valid
    pub hint_expiry_secs: u64,

    /// Trashed-to-obsolete thresholds
    pub grace: GracePolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            update_hash: false,
            rescan_if_modified: false,
            use_sidecar_for_reading: false,
            sidecar_extension: DEFAULT_SIDECAR_EXTENSION.to_string(),
            clear_metadata_if_rescan: false,
            deferred_file_scanning: false,
            want_signals: false,
            need_total_files: false,
            temp_file_marker: DEFAULT_TEMP_FILE_MARKER.to_string(),
            hint_expiry_secs: DEFAULT_HINT_EXPIRY_SECS,
            grace: GracePolicy::default(),
        }
    }
}

impl ScanConfig {
    /// Create a config builder
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::new()
    }

    /// Whether a file name carries our temp-file marker in its complete suffix
    pub fn is_temp_file(&self, name: &str) -> bool {
        match name.split_once('.') {
            Some((_, complete_suffix)) => complete_suffix.contains(&self.temp_file_marker),
            None => false,
        }
    }
}

/// Get the default video extensions
pub fn default_video_extensions() -> HashSet<String> {
    [
        "mp4", "mkv", "avi", "wmv", "flv", "mov", "webm", "m4v", "ts", "mts", "3gp", "mpg",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Get the default image extensions
pub fn default_image_extensions() -> HashSet<String> {
    [
        "jpg", "jpeg", "jpe", "png", "gif", "webp", "bmp", "tiff", "tif", "heic", "heif", "dng",
        "nef", "cr2", "cr3", "arw", "orf", "raf", "rw2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Get the default audio extensions
pub fn default_audio_extensions() -> HashSet<String> {
    ["mp3", "flac", "wav", "aac", "ogg", "wma", "m4a"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Get the default directories to ignore
pub fn default_ignore_dirs() -> HashSet<String> {
    [
        "$RECYCLE.BIN",
        "System Volume Information",
        "@eaDir",
        "lost+found",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Builder for ScanConfig
#[derive(Debug, Default)]
pub struct ScanConfigBuilder {
    config: ScanConfig,
}

impl ScanConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_hash(mut self, enabled: bool) -> Self {
        self.config.update_hash = enabled;
        self
    }

    pub fn rescan_if_modified(mut self, enabled: bool) -> Self {
        self.config.rescan_if_modified = enabled;
        self
    }

    pub fn use_sidecar_for_reading(mut self, enabled: bool) -> Self {
        self.config.use_sidecar_for_reading = enabled;
        self
    }

    pub fn sidecar_extension(mut self, extension: impl Into<String>) -> Self {
        self.config.sidecar_extension = extension.into();
        self
    }

    pub fn clear_metadata_if_rescan(mut self, enabled: bool) -> Self {
        self.config.clear_metadata_if_rescan = enabled;
        self
    }

    pub fn deferred_file_scanning(mut self, enabled: bool) -> Self {
        self.config.deferred_file_scanning = enabled;
        self
    }

    /// Enable notifications; `need_total_files` additionally counts files up front
    pub fn signals(mut self, enabled: bool, need_total_files: bool) -> Self {
        self.config.want_signals = enabled;
        self.config.need_total_files = need_total_files;
        self
    }

    pub fn temp_file_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.temp_file_marker = marker.into();
        self
    }

    pub fn hint_expiry_secs(mut self, secs: u64) -> Self {
        self.config.hint_expiry_secs = secs;
        self
    }

    pub fn grace(mut self, grace: GracePolicy) -> Self {
        self.config.grace = grace;
        self
    }

    /// Build the config
    pub fn build(self) -> ScanConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScanConfig::default();
        assert!(!config.update_hash);
        assert!(!config.deferred_file_scanning);
        assert_eq!(config.temp_file_marker, DEFAULT_TEMP_FILE_MARKER);
        assert_eq!(config.grace, GracePolicy::default());
    }

    #[test]
    fn test_default_extensions() {
        let images = default_image_extensions();
        assert!(images.contains("jpg"));
        assert!(!images.contains("mp4"));
        assert!(default_video_extensions().contains("mp4"));
        assert!(default_audio_extensions().contains("mp3"));
    }

    #[test]
    fn test_is_temp_file() {
        let config = ScanConfig::default();
        assert!(config.is_temp_file("photo.scannertempfile.tmp"));
        assert!(config.is_temp_file("photo.jpg.scannertempfile.jpg"));
        assert!(!config.is_temp_file("photo.jpg"));
        assert!(!config.is_temp_file("scannertempfile"));
    }

    #[test]
    fn test_config_builder() {
        let grace = GracePolicy {
            max_scans: 5,
            ..GracePolicy::default()
        };
        let config = ScanConfig::builder()
            .update_hash(true)
            .rescan_if_modified(true)
            .signals(true, true)
            .grace(grace.clone())
            .build();

        assert!(config.update_hash);
        assert!(config.rescan_if_modified);
        assert!(config.want_signals);
        assert!(config.need_total_files);
        assert_eq!(config.grace, grace);
    }
}
