//! Scan driver: entry points, session state and the end-of-scan cleanup

use chrono::Utc;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::grace;
use crate::hints::HintContainer;
use crate::history;
use crate::item::{DiskEntry, MetadataReader, NoMetadata};
use crate::locations::{album_path_under, prune_nested_paths, LocationProvider};
use crate::models::{
    AlbumId, CollectionLocation, FileScanMode, ItemId, ItemStatus, LocationId, NameFilters,
    ScanOutcome, ScanStats,
};
use crate::progress::{NoopNotifier, ScanNotifier, ScanObserver};
use crate::store::{internal_tags, with_transaction, ItemStore, ThumbnailIndex};

/// Whether a scan step ran to the end or was stopped by the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Cancelled,
}

/// State that lives for one entry point invocation
#[derive(Debug, Default)]
pub(crate) struct ScanSession {
    pub scanned_albums: HashSet<AlbumId>,
    /// new album -> album it was copied from
    pub established_source_albums: HashMap<AlbumId, AlbumId>,
    pub removed_items_time: Option<chrono::DateTime<Utc>>,
    pub need_resolve_history: BTreeSet<ItemId>,
    pub need_tagging_history: BTreeSet<ItemId>,
    /// Incremental scans queue history work in memory instead of tags
    pub record_history_ids: bool,
    pub deferred_albums: BTreeSet<PathBuf>,
    pub stats: ScanStats,
}

/// Keeps the catalog in sync with the collection locations on disk
///
/// One instance performs one scan at a time; it is not reentrant.
pub struct CollectionScanner<S: ItemStore, L: LocationProvider> {
    pub(crate) store: S,
    pub(crate) locations: L,
    pub(crate) config: ScanConfig,
    pub(crate) hints: Option<Arc<HintContainer>>,
    pub(crate) thumbnails: Option<Box<dyn ThumbnailIndex>>,
    pub(crate) metadata: Box<dyn MetadataReader>,
    pub(crate) notifier: Box<dyn ScanNotifier>,
    pub(crate) observer: Option<Box<dyn ScanObserver>>,
    pub(crate) filters: NameFilters,
    filters_loaded: bool,
    pub(crate) session: ScanSession,
}

impl<S: ItemStore, L: LocationProvider> CollectionScanner<S, L> {
    pub fn new(store: S, locations: L) -> Self {
        Self {
            store,
            locations,
            config: ScanConfig::default(),
            hints: None,
            thumbnails: None,
            metadata: Box::new(NoMetadata),
            notifier: Box::new(NoopNotifier),
            observer: None,
            filters: NameFilters::default(),
            filters_loaded: false,
            session: ScanSession::default(),
        }
    }

    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hints(mut self, hints: Arc<HintContainer>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_thumbnail_index(mut self, thumbnails: Box<dyn ThumbnailIndex>) -> Self {
        self.thumbnails = Some(thumbnails);
        self
    }

    pub fn with_metadata_reader(mut self, reader: Box<dyn MetadataReader>) -> Self {
        self.metadata = reader;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn ScanNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn ScanObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ScanConfig) {
        self.config = config;
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn hints(&self) -> Option<&Arc<HintContainer>> {
        self.hints.as_ref()
    }

    /// Statistics of the running or most recent single-file scan
    pub fn stats(&self) -> &ScanStats {
        &self.session.stats
    }

    /// Directories whose file work was skipped by deferred scanning
    pub fn deferred_album_paths(&self) -> Vec<PathBuf> {
        self.session.deferred_albums.iter().cloned().collect()
    }

    /// Albums finished (or condemned as stale) in the current session
    pub fn scanned_albums(&self) -> &HashSet<AlbumId> {
        &self.session.scanned_albums
    }

    pub fn database_initial_scan_done(&self) -> Result<bool> {
        grace::database_initial_scan_done(&self.store)
    }

    /// Scan every available location
    pub fn complete_scan(&mut self) -> Result<ScanOutcome> {
        let started = Instant::now();
        self.notifier.start_complete_scan();
        self.main_entry_point(true)?;

        let locations = self.locations.all_available_locations();
        if self.config.want_signals && self.config.need_total_files {
            let roots: Vec<PathBuf> = locations.iter().map(|l| l.root_path.clone()).collect();
            self.notifier.total_files_to_scan(count_entries(&roots));
        }

        if !self.check_observer() {
            return Ok(self.finish(started, Flow::Cancelled));
        }

        if !self.has_album_hints() {
            self.store.delete_stale_albums()?;
        }

        let location_ids: HashSet<LocationId> = locations.iter().map(|l| l.id).collect();
        self.scan_for_stale_albums(&location_ids)?;

        if !self.check_observer() {
            return Ok(self.finish(started, Flow::Cancelled));
        }

        if self.config.want_signals {
            self.notifier.start_scanning_album_roots();
        }
        for location in &locations {
            if !self.check_observer() || self.scan_album_root(location)? == Flow::Cancelled {
                return Ok(self.finish(started, Flow::Cancelled));
            }
        }
        if self.config.want_signals {
            self.notifier.finished_scanning_album_roots();
        }

        // cleanup only after a scan that saw everything
        if !self.check_observer() {
            return Ok(self.finish(started, Flow::Cancelled));
        }

        if self.config.deferred_file_scanning {
            debug!(
                "Complete scan with deferred file scanning took {} ms, {} directories deferred",
                started.elapsed().as_millis(),
                self.session.deferred_albums.len()
            );
            self.notifier.finished_complete_scan();
            return Ok(self.finish(started, Flow::Continue));
        }

        let flow = self.complete_scan_cleanup_part()?;
        Ok(self.finish(started, flow))
    }

    /// Finish a complete scan whose file work was deferred
    ///
    /// Paths nested under another listed path are scanned with their parent.
    pub fn finish_complete_scan(&mut self, album_paths: &[PathBuf]) -> Result<ScanOutcome> {
        let started = Instant::now();
        self.notifier.start_complete_scan();
        self.main_entry_point(true)?;

        if !self.check_observer() {
            return Ok(self.finish(started, Flow::Cancelled));
        }

        if self.config.want_signals {
            self.notifier.start_scanning_album_roots();
        }

        let paths = prune_nested_paths(album_paths.to_vec());
        if self.config.want_signals && self.config.need_total_files {
            self.notifier.total_files_to_scan(count_entries(&paths));
        }

        for path in &paths {
            if !self.check_observer() {
                return Ok(self.finish(started, Flow::Cancelled));
            }
            let Some(location) = self.locations.location_for_path(path) else {
                warn!("No collection location contains {}", path.display());
                continue;
            };
            let Some(album) = album_path_under(&location.root_path, path) else {
                continue;
            };
            let flow = if album == "/" {
                self.scan_album_root(&location)?
            } else {
                self.scan_album(&location, &album)?
            };
            if flow == Flow::Cancelled {
                return Ok(self.finish(started, Flow::Cancelled));
            }
        }

        if self.config.want_signals {
            self.notifier.finished_scanning_album_roots();
        }

        if !self.check_observer() {
            return Ok(self.finish(started, Flow::Cancelled));
        }

        let flow = self.complete_scan_cleanup_part()?;
        Ok(self.finish(started, flow))
    }

    /// Scan the album containing `path`
    pub fn partial_scan_path(&mut self, path: &Path) -> Result<ScanOutcome> {
        let Some(location) = self.locations.location_for_path(path) else {
            warn!("No collection location contains {}", path.display());
            return Ok(ScanOutcome::Completed(ScanStats::new()));
        };
        let album = album_path_under(&location.root_path, path).unwrap_or_default();
        self.partial_scan(&location.root_path, &album)
    }

    /// Scan one album and its sub-albums; pass `/` for the location root
    pub fn partial_scan(&mut self, album_root: &Path, album: &str) -> Result<ScanOutcome> {
        if album_root.as_os_str().is_empty() || album.is_empty() {
            warn!("Partial scan called with an empty album root or album path");
            return Ok(ScanOutcome::Completed(ScanStats::new()));
        }

        let started = Instant::now();
        self.main_entry_point(false)?;

        let Some(location) = self.locations.location_for_album_root_path(album_root) else {
            warn!(
                "Did not find a collection location for album root {}",
                album_root.display()
            );
            return Ok(self.finish(started, Flow::Continue));
        };

        if self.config.want_signals && self.config.need_total_files {
            let dir = location.album_dir(album);
            self.notifier.total_files_to_scan(count_entries(&[dir]));
        }

        if !self.has_album_hints() {
            self.store.delete_stale_albums()?;
        }

        // album hints from other locations into this one make those stale too
        let mut location_ids = HashSet::from([location.id]);
        if let Some(hints) = &self.hints {
            location_ids.extend(hints.source_locations_for(location.id));
        }
        self.scan_for_stale_albums(&location_ids)?;

        if !self.check_observer() {
            return Ok(self.finish(started, Flow::Cancelled));
        }

        let flow = if album == "/" {
            self.scan_album_root(&location)?
        } else {
            self.scan_album(&location, album)?
        };
        if flow == Flow::Cancelled {
            return Ok(self.finish(started, Flow::Cancelled));
        }

        if self.finish_history_scanning()? == Flow::Cancelled || !self.check_observer() {
            return Ok(self.finish(started, Flow::Cancelled));
        }

        self.update_removed_items_time()?;
        Ok(self.finish(started, Flow::Continue))
    }

    /// Scan one file by absolute path; `None` if it could not be scanned
    pub fn scan_file_path(&mut self, path: &Path, mode: FileScanMode) -> Result<Option<ItemId>> {
        let dir = path.parent().unwrap_or(path);
        let Some(location) = self.locations.location_for_path(dir) else {
            warn!("No collection location contains {}", path.display());
            return Ok(None);
        };
        let album = album_path_under(&location.root_path, dir).unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.scan_file(&location.root_path, &album, &name, mode)
    }

    /// Scan one file given its album root, album path and name
    pub fn scan_file(
        &mut self,
        album_root: &Path,
        album: &str,
        name: &str,
        mode: FileScanMode,
    ) -> Result<Option<ItemId>> {
        if album.is_empty() || name.is_empty() {
            warn!("File scan called with an empty album or file name");
            return Ok(None);
        }
        let Some(location) = self.locations.location_for_album_root_path(album_root) else {
            warn!(
                "Did not find a collection location for album root {}",
                album_root.display()
            );
            return Ok(None);
        };
        let path = location.album_dir(album).join(name);
        if !path.is_file() {
            warn!("File given to scan does not exist: {}", path.display());
            return Ok(None);
        }

        self.main_entry_point(false)?;
        let album_id = self.check_album(&location, album)?;
        let item_id = self.store.item_id(album_id, name)?;
        let id = self.scan_file_in_album(&path, album_id, item_id, mode)?;
        self.finish_history_scanning()?;
        Ok(id)
    }

    /// Scan the file behind an already known item
    pub fn scan_item(&mut self, id: ItemId, mode: FileScanMode) -> Result<Option<ItemId>> {
        let Some(info) = self.store.item_short_info(id)? else {
            warn!("Item {} to scan does not exist", id);
            return Ok(None);
        };
        let (Some(album_id), Some(location_id), Some(album_path)) =
            (info.album_id, info.location_id, info.album_path.as_deref())
        else {
            warn!("Item {} is not in any album", id);
            return Ok(None);
        };
        let Some(location) = self.locations.location_for_id(location_id) else {
            warn!("Did not find collection location {} of item {}", location_id, id);
            return Ok(None);
        };
        let path = location.album_dir(album_path).join(&info.name);

        self.main_entry_point(false)?;
        let scanned = self.scan_file_in_album(&path, album_id, Some(id), mode)?;
        self.finish_history_scanning()?;
        Ok(scanned)
    }

    fn scan_file_in_album(
        &mut self,
        path: &Path,
        album_id: AlbumId,
        item_id: Option<ItemId>,
        mode: FileScanMode,
    ) -> Result<Option<ItemId>> {
        let record = match item_id {
            Some(id) => self.store.item_scan_info(id)?,
            None => None,
        };
        let Some(record) = record else {
            return match mode {
                FileScanMode::Normal | FileScanMode::ModifiedScan => self.scan_new_file(path, album_id),
                FileScanMode::Rescan => self.scan_new_file_full_scan(path, album_id),
            };
        };

        let Some(entry) = self.read_entry(path) else {
            return Ok(None);
        };
        match mode {
            FileScanMode::Normal => self.scan_file_normal(&entry, &record)?,
            FileScanMode::ModifiedScan => self.scan_modified_file(&entry, &record)?,
            FileScanMode::Rescan => self.rescan_file(&entry, &record)?,
        }
        Ok(Some(record.id))
    }

    /// Reset the session and load name filters once per scanner
    fn main_entry_point(&mut self, complete: bool) -> Result<()> {
        if !self.filters_loaded {
            self.filters = self.store.name_filters()?;
            self.filters_loaded = true;
        }
        self.session = ScanSession {
            record_history_ids: !complete,
            ..ScanSession::default()
        };
        Ok(())
    }

    fn complete_scan_cleanup_part(&mut self) -> Result<Flow> {
        if self.complete_history_scanning()? == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }

        self.update_removed_items_time()?;

        let now = Utc::now();
        if grace::check_delete_removed(&self.store, &self.config.grace, now)? {
            let obsoleted = with_transaction(&mut self.store, |store| {
                let trashed = store.item_ids_with_status(ItemStatus::Trashed)?;
                for id in &trashed {
                    store.set_item_status(*id, ItemStatus::Obsolete)?;
                }
                grace::reset_delete_removed_settings(store, now)?;
                Ok(trashed.len())
            })?;
            info!("Marked {} removed items as obsolete", obsoleted);
            self.session.stats.obsoleted_items += obsoleted as u64;
        } else {
            grace::increment_complete_scan_count(&mut self.store)?;
        }

        grace::mark_database_as_scanned(&mut self.store, now)?;
        self.notifier.finished_complete_scan();
        Ok(Flow::Continue)
    }

    /// History work persisted as internal tags
    fn complete_history_scanning(&mut self) -> Result<Flow> {
        let resolving = self
            .store
            .get_or_create_internal_tag(internal_tags::NEED_RESOLVING_HISTORY)?;
        let tagging = self
            .store
            .get_or_create_internal_tag(internal_tags::NEED_TAGGING_HISTORY_GRAPH)?;

        let observer = self.observer.as_deref();
        let ids = self.store.item_ids_in_tag(resolving)?;
        if history::run_stage2(&mut self.store, &ids, None, || keep_going(observer))? == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }

        let ids = self.store.item_ids_in_tag(tagging)?;
        debug!("Items needing history graph tagging: {:?}", ids);
        history::run_stage3(&mut self.store, &ids, || keep_going(observer))
    }

    /// History work queued in memory during an incremental scan
    pub(crate) fn finish_history_scanning(&mut self) -> Result<Flow> {
        let observer = self.observer.as_deref();

        let ids: Vec<ItemId> = std::mem::take(&mut self.session.need_resolve_history)
            .into_iter()
            .collect();
        let flow = history::run_stage2(
            &mut self.store,
            &ids,
            Some(&mut self.session.need_tagging_history),
            || keep_going(observer),
        )?;
        if flow == Flow::Cancelled || !keep_going(observer) {
            return Ok(Flow::Cancelled);
        }

        let ids: Vec<ItemId> = std::mem::take(&mut self.session.need_tagging_history)
            .into_iter()
            .collect();
        history::run_stage3(&mut self.store, &ids, || keep_going(observer))
    }

    fn update_removed_items_time(&mut self) -> Result<()> {
        if let Some(time) = self.session.removed_items_time.take() {
            grace::update_removed_items_time(&mut self.store, time)?;
        }
        Ok(())
    }

    fn finish(&mut self, started: Instant, flow: Flow) -> ScanOutcome {
        let mut stats = std::mem::take(&mut self.session.stats);
        stats.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Scan finished in {} ms: {} new, {} modified, {} removed",
            stats.duration_ms,
            stats.new_items + stats.copied_items,
            stats.modified_items + stats.rescanned_items,
            stats.removed_items
        );
        if flow == Flow::Cancelled {
            info!("Scan cancelled after {} ms", stats.duration_ms);
            self.notifier.cancelled();
        }
        if self.config.want_signals {
            self.notifier.scan_finished(&stats);
        }
        match flow {
            Flow::Continue => ScanOutcome::Completed(stats),
            Flow::Cancelled => ScanOutcome::Cancelled(stats),
        }
    }

    pub(crate) fn check_observer(&self) -> bool {
        keep_going(self.observer.as_deref())
    }

    pub(crate) fn has_album_hints(&self) -> bool {
        self.hints.as_ref().is_some_and(|h| h.has_album_hints())
    }

    /// Stat a file, recording the failure if it cannot be read
    pub(crate) fn read_entry(&mut self, path: &Path) -> Option<DiskEntry> {
        let sidecar = self
            .config
            .use_sidecar_for_reading
            .then_some(self.config.sidecar_extension.as_str());
        match DiskEntry::read(path, sidecar) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Cannot read {}: {}", path.display(), err);
                self.record_error(err);
                None
            }
        }
    }

    pub(crate) fn record_error(&mut self, err: ScanError) {
        if self.config.want_signals {
            self.notifier.scan_error(&err);
        }
        self.session.stats.errors.push(err);
    }

    pub(crate) fn location_for_id(&self, id: LocationId) -> Option<CollectionLocation> {
        self.locations.location_for_id(id)
    }
}

fn keep_going(observer: Option<&dyn ScanObserver>) -> bool {
    observer.map_or(true, |o| o.continue_scan())
}

/// Count entries below each directory, for progress totals
pub fn count_entries(dirs: &[PathBuf]) -> u64 {
    dirs.par_iter()
        .map(|dir| {
            WalkDir::new(dir)
                .min_depth(1)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .count() as u64
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::locations::StaticLocations;
    use std::fs;
    use tempfile::TempDir;

    fn scanner_for(dir: &TempDir) -> CollectionScanner<SqliteStore, StaticLocations> {
        let mut store = SqliteStore::open_memory().unwrap();
        let id = store.add_location(dir.path()).unwrap();
        let locations = StaticLocations::new(vec![CollectionLocation::new(id, dir.path())]);
        CollectionScanner::new(store, locations)
    }

    #[test]
    fn test_count_entries() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/x.jpg"), b"x").unwrap();
        fs::write(dir.path().join("a/b/y.jpg"), b"y").unwrap();
        // a, a/b, a/x.jpg, a/b/y.jpg
        assert_eq!(count_entries(&[dir.path().to_path_buf()]), 4);
        assert_eq!(count_entries(&[]), 0);
    }

    #[test]
    fn test_invalid_entry_point_input_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut scanner = scanner_for(&dir);

        let outcome = scanner.partial_scan(Path::new(""), "/").unwrap();
        assert!(!outcome.is_cancelled());
        assert_eq!(outcome.stats().mutations(), 0);

        let outcome = scanner.partial_scan(Path::new("/not/a/location"), "/").unwrap();
        assert_eq!(outcome.stats().albums_scanned, 0);

        assert_eq!(
            scanner
                .scan_file(dir.path(), "", "x.jpg", FileScanMode::Normal)
                .unwrap(),
            None
        );
        assert_eq!(
            scanner
                .scan_file(dir.path(), "/", "missing.jpg", FileScanMode::Normal)
                .unwrap(),
            None
        );
        assert_eq!(
            scanner
                .scan_file_path(Path::new("/elsewhere/x.jpg"), FileScanMode::Normal)
                .unwrap(),
            None
        );
        assert_eq!(scanner.scan_item(12345, FileScanMode::Normal).unwrap(), None);
    }

    #[test]
    fn test_initial_scan_done_after_complete_scan() {
        let dir = TempDir::new().unwrap();
        let mut scanner = scanner_for(&dir);
        assert!(!scanner.database_initial_scan_done().unwrap());
        scanner.complete_scan().unwrap();
        assert!(scanner.database_initial_scan_done().unwrap());
    }
}
