//! Progress reporting module for scan operations
//!
//! The scanner talks to two collaborators here. A [`ScanNotifier`] receives
//! lifecycle and progress notifications, and a [`ScanObserver`] is polled at
//! checkpoints to decide whether the scan continues. [`ProgressReporter`]
//! is the stock notifier: it writes one JSON object per line to stderr.

use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::ScanError;
use crate::models::ScanStats;

/// Receives scan notifications; every method defaults to doing nothing
pub trait ScanNotifier {
    fn start_complete_scan(&self) {}
    fn finished_complete_scan(&self) {}
    fn total_files_to_scan(&self, _count: u64) {}
    fn start_scanning_album_roots(&self) {}
    fn finished_scanning_album_roots(&self) {}
    fn start_scanning_album_root(&self, _root: &str) {}
    fn finished_scanning_album_root(&self, _root: &str) {}
    fn start_scanning_for_stale_albums(&self) {}
    fn finished_scanning_for_stale_albums(&self) {}
    fn start_scanning_album(&self, _root: &str, _album: &str, _file_count: usize) {}
    fn finished_scanning_album(&self, _root: &str, _album: &str, _file_count: usize) {}
    fn scanned_files(&self, _count: u64) {}
    fn scan_error(&self, _error: &ScanError) {}
    fn cancelled(&self) {}
    fn scan_finished(&self, _stats: &ScanStats) {}
}

/// Notifier that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ScanNotifier for NoopNotifier {}

/// Polled between units of work; returning false stops the scan
pub trait ScanObserver {
    fn continue_scan(&self) -> bool;
}

/// Cancellation flag shared between the host and a running scan
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl ScanObserver for CancelFlag {
    fn continue_scan(&self) -> bool {
        !self.is_cancelled()
    }
}

/// Lifecycle event names used in [`EventMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanEvent {
    StartCompleteScan,
    FinishedCompleteScan,
    StartAlbumRoots,
    FinishedAlbumRoots,
    StartAlbumRoot,
    FinishedAlbumRoot,
    StartStaleAlbums,
    FinishedStaleAlbums,
    Cancelled,
}

impl ScanEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanEvent::StartCompleteScan => "start_complete_scan",
            ScanEvent::FinishedCompleteScan => "finished_complete_scan",
            ScanEvent::StartAlbumRoots => "start_album_roots",
            ScanEvent::FinishedAlbumRoots => "finished_album_roots",
            ScanEvent::StartAlbumRoot => "start_album_root",
            ScanEvent::FinishedAlbumRoot => "finished_album_root",
            ScanEvent::StartStaleAlbums => "start_stale_albums",
            ScanEvent::FinishedStaleAlbums => "finished_stale_albums",
            ScanEvent::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle message
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    /// Message type identifier ("ev" for event)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    pub event: ScanEvent,
    /// Album root the event refers to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl EventMessage {
    pub fn new(seq: u64, ts: u64, event: ScanEvent, root: Option<String>) -> Self {
        Self {
            msg_type: "ev",
            seq,
            ts,
            event,
            root,
        }
    }
}

/// Total message sent once the files to scan have been counted
#[derive(Debug, Clone, Serialize)]
pub struct TotalMessage {
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    pub total: u64,
}

impl TotalMessage {
    pub fn new(seq: u64, ts: u64, total: u64) -> Self {
        Self {
            msg_type: "total",
            seq,
            ts,
            total,
        }
    }
}

/// Progress message sent during scan
#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    /// Message type identifier ("p" for progress)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    /// Number of files scanned
    #[serde(rename = "f")]
    pub files: u64,
    /// Number of albums entered
    #[serde(rename = "d")]
    pub albums: u64,
    /// Album currently being scanned
    pub album: String,
    /// Elapsed time in milliseconds
    pub ms: u64,
    /// Estimated remaining time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
}

impl ProgressMessage {
    pub fn new(seq: u64, ts: u64, files: u64, albums: u64, album: String, ms: u64, eta_ms: Option<u64>) -> Self {
        Self {
            msg_type: "p",
            seq,
            ts,
            files,
            albums,
            album,
            ms,
            eta_ms,
        }
    }
}

/// Error message sent when a directory could not be scanned
#[derive(Debug, Clone, Serialize)]
pub struct ErrorProgressMessage {
    /// Message type identifier ("err" for error)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ErrorProgressMessage {
    pub fn new(seq: u64, ts: u64, error_type: String, message: String, path: Option<String>) -> Self {
        Self {
            msg_type: "err",
            seq,
            ts,
            error_type,
            message,
            path,
        }
    }
}

/// Done message sent when an entry point returns
#[derive(Debug, Clone, Serialize)]
pub struct DoneMessage {
    /// Message type identifier ("done" for completion)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    pub seq: u64,
    pub ts: u64,
    /// Number of new items, copies included
    #[serde(rename = "ni")]
    pub new_items: u64,
    /// Number of modified or rescanned items
    #[serde(rename = "mi")]
    pub modified_items: u64,
    #[serde(rename = "mv")]
    pub moved_items: u64,
    /// Number of items marked removed
    #[serde(rename = "ri")]
    pub removed_items: u64,
    #[serde(rename = "sa")]
    pub stale_albums: u64,
    #[serde(rename = "ec")]
    pub error_count: usize,
    pub ms: u64,
}

impl DoneMessage {
    pub fn from_stats(seq: u64, ts: u64, stats: &ScanStats) -> Self {
        Self {
            msg_type: "done",
            seq,
            ts,
            new_items: stats.new_items + stats.copied_items,
            modified_items: stats.modified_items + stats.rescanned_items + stats.hash_updated_items,
            moved_items: stats.moved_items,
            removed_items: stats.removed_items,
            stale_albums: stats.stale_albums_removed + stats.stale_albums_renamed,
            error_count: stats.error_count(),
            ms: stats.duration_ms,
        }
    }
}

/// Progress reporter for outputting scan progress to stderr
///
/// Lifecycle, total, error and done messages are written immediately;
/// progress messages respect the reporting interval.
pub struct ProgressReporter {
    enabled: bool,
    /// Minimum interval between progress messages in milliseconds
    interval_ms: u64,
    last_report: Cell<Instant>,
    seq: AtomicU64,
    start_time: Instant,
    files: Cell<u64>,
    albums: Cell<u64>,
    total: Cell<Option<u64>>,
    current_album: RefCell<String>,
}

impl ProgressReporter {
    pub fn new(enabled: bool, interval_ms: u64) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            interval_ms,
            last_report: Cell::new(now),
            seq: AtomicU64::new(0),
            start_time: now,
            files: Cell::new(0),
            albums: Cell::new(0),
            total: Cell::new(None),
            current_album: RefCell::new(String::new()),
        }
    }

    /// Check if enough time has passed since the last report
    pub fn should_report(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let elapsed = self.last_report.get().elapsed().as_millis() as u64;
        elapsed >= self.interval_ms
    }

    /// Get the next sequence number (monotonically increasing)
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Milliseconds since reporter creation
    pub fn current_timestamp(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Files reported as scanned so far
    pub fn files_scanned(&self) -> u64 {
        self.files.get()
    }

    /// Output a serializable message to stderr as JSON
    pub fn output_to_stderr<T: Serialize>(&self, msg: &T) {
        if let Ok(json) = serde_json::to_string(msg) {
            eprintln!("{}", json);
            std::io::stderr().flush().ok();
        }
    }

    fn event(&self, event: ScanEvent, root: Option<&str>) {
        if !self.enabled {
            return;
        }
        let msg = EventMessage::new(
            self.next_seq(),
            self.current_timestamp(),
            event,
            root.map(str::to_string),
        );
        self.output_to_stderr(&msg);
    }

    /// Remaining time extrapolated from the rate so far
    pub fn eta_ms(&self) -> Option<u64> {
        let total = self.total.get()?;
        let files = self.files.get();
        if files == 0 || files >= total {
            return None;
        }
        let elapsed = self.current_timestamp();
        Some(elapsed * (total - files) / files)
    }

    /// Write a progress line if the interval allows; returns whether one was written
    pub fn report_progress(&self) -> bool {
        if !self.should_report() {
            return false;
        }
        let msg = ProgressMessage::new(
            self.next_seq(),
            self.current_timestamp(),
            self.files.get(),
            self.albums.get(),
            self.current_album.borrow().clone(),
            self.current_timestamp(),
            self.eta_ms(),
        );
        self.output_to_stderr(&msg);
        self.last_report.set(Instant::now());
        true
    }
}

impl ScanNotifier for ProgressReporter {
    fn start_complete_scan(&self) {
        self.event(ScanEvent::StartCompleteScan, None);
    }

    fn finished_complete_scan(&self) {
        self.event(ScanEvent::FinishedCompleteScan, None);
    }

    fn total_files_to_scan(&self, count: u64) {
        self.total.set(Some(count));
        if !self.enabled {
            return;
        }
        let msg = TotalMessage::new(self.next_seq(), self.current_timestamp(), count);
        self.output_to_stderr(&msg);
    }

    fn start_scanning_album_roots(&self) {
        self.event(ScanEvent::StartAlbumRoots, None);
    }

    fn finished_scanning_album_roots(&self) {
        self.event(ScanEvent::FinishedAlbumRoots, None);
    }

    fn start_scanning_album_root(&self, root: &str) {
        self.event(ScanEvent::StartAlbumRoot, Some(root));
    }

    fn finished_scanning_album_root(&self, root: &str) {
        self.event(ScanEvent::FinishedAlbumRoot, Some(root));
    }

    fn start_scanning_for_stale_albums(&self) {
        self.event(ScanEvent::StartStaleAlbums, None);
    }

    fn finished_scanning_for_stale_albums(&self) {
        self.event(ScanEvent::FinishedStaleAlbums, None);
    }

    fn start_scanning_album(&self, _root: &str, album: &str, _file_count: usize) {
        self.albums.set(self.albums.get() + 1);
        *self.current_album.borrow_mut() = album.to_string();
    }

    fn scanned_files(&self, count: u64) {
        self.files.set(self.files.get() + count);
        self.report_progress();
    }

    fn scan_error(&self, error: &ScanError) {
        if !self.enabled {
            return;
        }
        let msg = ErrorProgressMessage::new(
            self.next_seq(),
            self.current_timestamp(),
            format!("{:?}", error.kind),
            error.message.clone(),
            error.path.as_ref().map(|p| p.to_string_lossy().to_string()),
        );
        self.output_to_stderr(&msg);
    }

    fn cancelled(&self) {
        self.event(ScanEvent::Cancelled, None);
    }

    fn scan_finished(&self, stats: &ScanStats) {
        if !self.enabled {
            return;
        }
        let msg = DoneMessage::from_stats(self.next_seq(), self.current_timestamp(), stats);
        self.output_to_stderr(&msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_event_serialization() {
        assert_eq!(
            serde_json::to_string(&ScanEvent::StartCompleteScan).unwrap(),
            "\"start_complete_scan\""
        );
        assert_eq!(
            serde_json::to_string(&ScanEvent::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(ScanEvent::StartStaleAlbums.as_str(), "start_stale_albums");
    }

    #[test]
    fn test_event_message_serialization() {
        let msg = EventMessage::new(1, 100, ScanEvent::StartAlbumRoot, Some("/media".to_string()));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["_t"], "ev");
        assert_eq!(parsed["seq"], 1);
        assert_eq!(parsed["ts"], 100);
        assert_eq!(parsed["event"], "start_album_root");
        assert_eq!(parsed["root"], "/media");

        let msg = EventMessage::new(2, 100, ScanEvent::Cancelled, None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"root\""));
    }

    #[test]
    fn test_progress_message_serialization() {
        let msg = ProgressMessage::new(2, 200, 100, 10, "/2020".to_string(), 1500, Some(3000));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["_t"], "p");
        assert_eq!(parsed["seq"], 2);
        assert_eq!(parsed["f"], 100);
        assert_eq!(parsed["d"], 10);
        assert_eq!(parsed["album"], "/2020");
        assert_eq!(parsed["ms"], 1500);
        assert_eq!(parsed["eta_ms"], 3000);
    }

    #[test]
    fn test_progress_message_without_eta() {
        let msg = ProgressMessage::new(1, 100, 10, 5, "/".to_string(), 500, None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("eta_ms"));
    }

    #[test]
    fn test_error_message_serialization() {
        let msg = ErrorProgressMessage::new(
            3,
            300,
            "PermissionDenied".to_string(),
            "Access denied".to_string(),
            Some("/media/private".to_string()),
        );
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["_t"], "err");
        assert_eq!(parsed["error_type"], "PermissionDenied");
        assert_eq!(parsed["path"], "/media/private");
    }

    #[test]
    fn test_done_message_from_stats() {
        let stats = ScanStats {
            new_items: 5,
            copied_items: 2,
            modified_items: 1,
            rescanned_items: 1,
            moved_items: 3,
            removed_items: 4,
            stale_albums_removed: 1,
            stale_albums_renamed: 1,
            duration_ms: 4500,
            ..Default::default()
        };
        let msg = DoneMessage::from_stats(10, 5000, &stats);
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["_t"], "done");
        assert_eq!(parsed["ni"], 7);
        assert_eq!(parsed["mi"], 2);
        assert_eq!(parsed["mv"], 3);
        assert_eq!(parsed["ri"], 4);
        assert_eq!(parsed["sa"], 2);
        assert_eq!(parsed["ec"], 0);
        assert_eq!(parsed["ms"], 4500);
    }

    #[test]
    fn test_progress_reporter_sequence_numbers() {
        let reporter = ProgressReporter::new(true, 200);
        assert_eq!(reporter.next_seq(), 0);
        assert_eq!(reporter.next_seq(), 1);
        assert_eq!(reporter.next_seq(), 2);
    }

    #[test]
    fn test_progress_reporter_should_report_timing() {
        let reporter = ProgressReporter::new(true, 10);
        reporter.last_report.set(Instant::now());
        assert!(!reporter.should_report());

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(reporter.should_report());
    }

    #[test]
    fn test_disabled_reporter_stays_silent() {
        let reporter = ProgressReporter::new(false, 0);
        assert!(!reporter.is_enabled());
        reporter.start_complete_scan();
        reporter.total_files_to_scan(10);
        reporter.scanned_files(3);
        reporter.cancelled();
        reporter.scan_finished(&ScanStats::default());

        // counters still track, but no sequence numbers were spent
        assert_eq!(reporter.files_scanned(), 3);
        assert_eq!(reporter.next_seq(), 0);
    }

    #[test]
    fn test_eta_needs_total() {
        let reporter = ProgressReporter::new(false, 200);
        reporter.scanned_files(5);
        assert_eq!(reporter.eta_ms(), None);
        reporter.total_files_to_scan(5);
        assert_eq!(reporter.eta_ms(), None);
        reporter.total_files_to_scan(10);
        assert!(reporter.eta_ms().is_some());
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let observer: Box<dyn ScanObserver> = Box::new(flag.clone());
        assert!(observer.continue_scan());
        flag.cancel();
        assert!(!observer.continue_scan());
        assert!(flag.is_cancelled());
    }
}
