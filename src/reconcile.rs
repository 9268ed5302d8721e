//! Reconciles one album directory with its records
//!
//! Entries are visited files first, then sub-directories, each group sorted
//! by name. Files are matched to records by name; records whose file was not
//! seen are trashed once the directory has been fully walked.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::classifier::{classify, ClassifierPolicy, FileAction};
use crate::error::{Result, ScanError, ScanErrorKind};
use crate::item::{DiskEntry, ItemChange, ItemScanner, ScannedItem};
use crate::locations::{sub_album_path, LocationProvider};
use crate::models::{AlbumId, CollectionLocation, ItemId, ItemScanInfo, RelationType};
use crate::scanner::{CollectionScanner, Flow};
use crate::store::{internal_tags, with_transaction, ItemStore};

/// Emit a progress signal after this many directory entries
const SIGNAL_EVERY_ENTRIES: u64 = 100;
/// New files are expensive; signal more often while adding them
const SIGNAL_EVERY_NEW_FILES: u64 = 2;

impl<S: ItemStore, L: LocationProvider> CollectionScanner<S, L> {
    pub(crate) fn scan_album_root(&mut self, location: &CollectionLocation) -> Result<Flow> {
        let root = location.root_str();
        if self.config.want_signals {
            self.notifier.start_scanning_album_root(&root);
        }

        let flow = self.scan_album(location, "/")?;

        if self.config.want_signals && flow == Flow::Continue {
            self.notifier.finished_scanning_album_root(&root);
        }
        Ok(flow)
    }

    /// Scan `album` and its sub-albums, adding the album record if needed
    pub(crate) fn scan_album(&mut self, location: &CollectionLocation, album: &str) -> Result<Flow> {
        if self.filters.album_is_ignored(album) {
            debug!("Skipping ignored album {}", album);
            return Ok(Flow::Continue);
        }

        let dir = location.album_dir(album);
        let Some(entries) = self.list_directory(&dir) else {
            return Ok(Flow::Continue);
        };

        let root = location.root_str();
        if self.config.want_signals {
            self.notifier.start_scanning_album(&root, album, entries.len());
        }

        let album_id = self.check_album(location, album)?;
        let records = self.store.item_scan_infos(album_id)?;
        let by_name: HashMap<&str, &ItemScanInfo> =
            records.iter().map(|r| (r.name.as_str(), r)).collect();
        let mut unseen: HashSet<ItemId> = records.iter().map(|r| r.id).collect();

        let mut pending: u64 = 0;
        for entry in &entries {
            if !self.check_observer() {
                // leave the unseen set alone; a partial walk proves nothing
                return Ok(Flow::Cancelled);
            }

            if self.config.want_signals && pending >= SIGNAL_EVERY_ENTRIES {
                self.notifier.scanned_files(pending);
                pending = 0;
            }
            pending += 1;

            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }

            if entry.file_type().is_dir() {
                if self.filters.is_ignored_dir(&name) {
                    continue;
                }
                let sub_album = sub_album_path(album, &name);
                if self.scan_album(location, &sub_album)? == Flow::Cancelled {
                    return Ok(Flow::Cancelled);
                }
                continue;
            }

            if !entry.file_type().is_file() || !self.filters.accepts(&name) {
                continue;
            }

            if let Some(record) = by_name.get(name.as_str()) {
                unseen.remove(&record.id);
                if let Some(disk) = self.read_entry(entry.path()) {
                    self.scan_file_normal(&disk, record)?;
                }
            } else if self.config.is_temp_file(&name) {
                continue;
            } else {
                // a hinted rename within this album keeps the source record
                if let Some(id) = self.scan_new_file(entry.path(), album_id)? {
                    unseen.remove(&id);
                }
                if self.config.want_signals && pending % SIGNAL_EVERY_NEW_FILES == 0 {
                    self.notifier.scanned_files(pending);
                    pending = 0;
                }
            }
        }

        if self.config.want_signals && pending > 0 {
            self.notifier.scanned_files(pending);
        }

        if !unseen.is_empty() {
            let mut ids: Vec<ItemId> = unseen.into_iter().collect();
            ids.sort_unstable();
            debug!("{} items of album {} are gone from disk", ids.len(), album);
            with_transaction(&mut self.store, |store| store.remove_items_from_album(album_id, &ids))?;
            self.session.stats.removed_items += ids.len() as u64;
            self.items_were_removed(&ids)?;
        }

        self.session.scanned_albums.insert(album_id);
        self.session.stats.albums_scanned += 1;

        if self.config.want_signals {
            self.notifier.finished_scanning_album(&root, album, entries.len());
        }
        Ok(Flow::Continue)
    }

    /// Direct children of `dir`, files first; `None` if it cannot be listed
    fn list_directory(&mut self, dir: &Path) -> Option<Vec<walkdir::DirEntry>> {
        if !dir.is_dir() {
            warn!("Folder does not exist or is not a directory: {}", dir.display());
            self.record_error(ScanError::not_found(dir.to_path_buf()));
            return None;
        }
        if let Err(err) = fs::read_dir(dir) {
            warn!("Folder is not readable: {}: {}", dir.display(), err);
            self.record_error(ScanError::from(err).with_path(dir));
            return None;
        }

        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by(|a, b| {
                a.file_type()
                    .is_dir()
                    .cmp(&b.file_type().is_dir())
                    .then_with(|| a.file_name().cmp(b.file_name()))
            });

        let mut entries = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf);
                    warn!("Cannot access entry in {}: {}", dir.display(), err);
                    let mut scan_err = ScanError::from(err);
                    if let Some(path) = path {
                        scan_err = scan_err.with_path(path);
                    }
                    self.record_error(scan_err);
                }
            }
        }
        Some(entries)
    }

    /// Id of the album record, adding it when the directory is new
    ///
    /// A new album that is the target of an album hint inherits the source
    /// album's properties, and its files are matched against the source.
    pub(crate) fn check_album(&mut self, location: &CollectionLocation, album: &str) -> Result<AlbumId> {
        if let Some(id) = self.store.album_for_path(location.id, album)? {
            self.session.established_source_albums.remove(&id);
            return Ok(id);
        }

        let dir = location.album_dir(album);
        let date = fs::metadata(&dir)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let id = self.store.add_album(location.id, album, date)?;
        debug!("Added album {} as {}", album, id);

        let hint = self
            .hints
            .as_ref()
            .and_then(|hints| hints.take_album_hint(location.id, album));
        if let Some(hint) = hint {
            debug!("Album {} is a copy of album {}", album, hint.src_album_id);
            self.store.copy_album_properties(hint.src_album_id, id)?;
            self.session
                .established_source_albums
                .insert(id, hint.src_album_id);
        }
        Ok(id)
    }

    pub(crate) fn scan_file_normal(&mut self, entry: &DiskEntry, record: &ItemScanInfo) -> Result<()> {
        if record.modification_date.is_none() {
            // never fully scanned; other pending hints stay for the next pass
            if let Some(hints) = self.hints.as_ref() {
                hints.take_rescan_hint(record.id);
            }
            return self.rescan_file(entry, record);
        }

        let hint = self
            .hints
            .as_ref()
            .and_then(|hints| hints.take_item_hint(record.id));
        let policy = ClassifierPolicy::from(&self.config);

        match classify(entry, record, hint, &policy) {
            FileAction::Unchanged => self.session.stats.unchanged_items += 1,
            FileAction::Postpone => {
                debug!("Postponing {}, an edit is in progress", entry.path.display());
                self.session.stats.postponed_items += 1;
            }
            FileAction::Modified => self.scan_modified_file(entry, record)?,
            FileAction::FullRescan => self.rescan_file(entry, record)?,
            FileAction::UpdateHash { file_was_edited } => {
                self.update_hash_reuse_thumbnail(entry, record, file_was_edited)?
            }
        }
        Ok(())
    }

    /// Add a record for a file without one; `None` if deferred or unreadable
    pub(crate) fn scan_new_file(&mut self, path: &Path, album_id: AlbumId) -> Result<Option<ItemId>> {
        if self.check_deferred(path) {
            return Ok(None);
        }
        let Some(entry) = self.read_entry(path) else {
            return Ok(None);
        };
        let category = self.filters.category(&entry.name);

        let hinted_source = self
            .hints
            .as_ref()
            .and_then(|hints| hints.take_item_move_hint(album_id, &entry.name));
        let moved = match hinted_source {
            Some(src_id) => !self.source_file_exists(src_id)?,
            None => false,
        };
        let copied_from = match hinted_source {
            Some(src_id) => Some(src_id),
            None => match self.session.established_source_albums.get(&album_id) {
                Some(src_album) => self.store.item_id(*src_album, &entry.name)?,
                None => None,
            },
        };

        let scanner = ItemScanner::new(&entry, category, self.metadata.as_ref());
        let result = match copied_from {
            Some(src_id) if moved => scanner.moved_from(&mut self.store, album_id, src_id),
            Some(src_id) => scanner.copied_from(&mut self.store, album_id, src_id),
            None => scanner.new_file(&mut self.store, album_id),
        };

        let Some(scanned) = self.tolerate(result, &entry.path)? else {
            return Ok(None);
        };
        self.finish_scanner(&scanned);
        Ok(Some(scanned.id()))
    }

    /// Add a record for a new file, always reading its metadata
    pub(crate) fn scan_new_file_full_scan(&mut self, path: &Path, album_id: AlbumId) -> Result<Option<ItemId>> {
        if self.check_deferred(path) {
            return Ok(None);
        }
        let Some(entry) = self.read_entry(path) else {
            return Ok(None);
        };
        let category = self.filters.category(&entry.name);

        let scanner = ItemScanner::new(&entry, category, self.metadata.as_ref());
        let result = scanner.new_file_full_scan(&mut self.store, album_id);

        let Some(scanned) = self.tolerate(result, &entry.path)? else {
            return Ok(None);
        };
        self.finish_scanner(&scanned);
        Ok(Some(scanned.id()))
    }

    pub(crate) fn scan_modified_file(&mut self, entry: &DiskEntry, record: &ItemScanInfo) -> Result<()> {
        if self.check_deferred(&entry.path) {
            return Ok(());
        }
        let category = self.filters.category(&entry.name);
        let scanner = ItemScanner::new(entry, category, self.metadata.as_ref());
        let result = scanner.file_modified(&mut self.store, record);
        if let Some(scanned) = self.tolerate(result, &entry.path)? {
            self.finish_scanner(&scanned);
        }
        Ok(())
    }

    pub(crate) fn rescan_file(&mut self, entry: &DiskEntry, record: &ItemScanInfo) -> Result<()> {
        if self.check_deferred(&entry.path) {
            return Ok(());
        }
        let category = self.filters.category(&entry.name);
        let scanner = ItemScanner::new(entry, category, self.metadata.as_ref())
            .clear_metadata_if_rescan(self.config.clear_metadata_if_rescan);
        let result = scanner.rescan(&mut self.store, record);
        if let Some(scanned) = self.tolerate(result, &entry.path)? {
            self.finish_scanner(&scanned);
        }
        Ok(())
    }

    /// Refresh the hash of a file whose pixels did not change
    ///
    /// After a metadata-only edit the old thumbnail is linked to the new
    /// key; otherwise the thumbnail key is replaced outright.
    fn update_hash_reuse_thumbnail(
        &mut self,
        entry: &DiskEntry,
        record: &ItemScanInfo,
        file_was_edited: bool,
    ) -> Result<()> {
        let category = self.filters.category(&entry.name);
        let scanner = ItemScanner::new(entry, category, self.metadata.as_ref());
        let result = scanner.file_modified(&mut self.store, record);
        let Some(scanned) = self.tolerate(result, &entry.path)? else {
            return Ok(());
        };

        let old_hash = record.unique_hash.as_deref();
        let new_hash = scanned.info.unique_hash.as_deref();
        if let (Some(thumbnails), Some(old_hash), Some(new_hash)) =
            (self.thumbnails.as_mut(), old_hash, new_hash)
        {
            let new_size = scanned.info.file_size;
            if file_was_edited {
                if let Some(thumbnail_id) = thumbnails.find_by_hash(old_hash, record.file_size)? {
                    thumbnails.insert_unique_hash(new_hash, new_size, thumbnail_id)?;
                    if let Some(date) = scanned.info.modification_date {
                        thumbnails.update_modification_date(thumbnail_id, date)?;
                    }
                }
            } else {
                thumbnails.replace_unique_hash(old_hash, record.file_size, new_hash, new_size)?;
            }
        }

        self.session.stats.hash_updated_items += 1;
        self.queue_history(&scanned);
        Ok(())
    }

    /// Record bookkeeping for removed items and queue their relatives
    /// for history graph tagging
    pub(crate) fn items_were_removed(&mut self, ids: &[ItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.session.removed_items_time = Some(Utc::now());

        let related = self.store.one_related_image_each(ids, RelationType::DerivedFrom)?;
        debug!("Removed items: {:?} related items: {:?}", ids, related);

        let queue: Vec<ItemId> = related.into_iter().chain(ids.iter().copied()).collect();
        if self.session.record_history_ids {
            self.session.need_tagging_history.extend(queue);
        } else {
            let tag = self
                .store
                .get_or_create_internal_tag(internal_tags::NEED_TAGGING_HISTORY_GRAPH)?;
            self.store.add_tags_to_items(&queue, &[tag])?;
        }
        Ok(())
    }

    /// In deferred mode, remember the directory instead of scanning the file
    fn check_deferred(&mut self, path: &Path) -> bool {
        if !self.config.deferred_file_scanning {
            return false;
        }
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        self.session.deferred_albums.insert(dir);
        self.session.stats.deferred_items += 1;
        true
    }

    fn finish_scanner(&mut self, item: &ScannedItem) {
        let stats = &mut self.session.stats;
        match item.change {
            ItemChange::Added | ItemChange::Revived => stats.new_items += 1,
            ItemChange::Copied => stats.copied_items += 1,
            ItemChange::Moved => stats.moved_items += 1,
            ItemChange::Modified => stats.modified_items += 1,
            ItemChange::Rescanned => stats.rescanned_items += 1,
        }
        self.queue_history(item);
    }

    fn queue_history(&mut self, item: &ScannedItem) {
        if self.session.record_history_ids && item.has_history_to_resolve {
            self.session.need_resolve_history.insert(item.id());
        }
    }

    /// Whether the file behind a hinted source item is still on disk
    fn source_file_exists(&self, id: ItemId) -> Result<bool> {
        Ok(self.item_path(id)?.is_some_and(|path| path.is_file()))
    }

    fn item_path(&self, id: ItemId) -> Result<Option<PathBuf>> {
        let Some(info) = self.store.item_short_info(id)? else {
            return Ok(None);
        };
        let (Some(location_id), Some(album_path)) = (info.location_id, info.album_path.as_deref()) else {
            return Ok(None);
        };
        Ok(self
            .location_for_id(location_id)
            .map(|location| location.album_dir(album_path).join(&info.name)))
    }

    /// Per-file failures are recorded and skipped; store failures abort
    fn tolerate<T>(&mut self, result: Result<T>, path: &Path) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind == ScanErrorKind::DatabaseError => Err(err),
            Err(err) => {
                info!("Skipping {}: {}", path.display(), err);
                self.record_error(err.with_path(path));
                Ok(None)
            }
        }
    }
}
