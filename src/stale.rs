//! Finds albums whose directory is gone before any file is scanned
//!
//! Renames announced by album hints are applied here, because once an
//! album's items are detached their former album can no longer be told.

use log::info;
use std::collections::HashSet;
use std::path::Path;

use crate::error::Result;
use crate::locations::LocationProvider;
use crate::models::{AlbumId, LocationId, NameFilters};
use crate::scanner::CollectionScanner;
use crate::store::{with_transaction, ItemStore};

/// A directory that can no longer back an album
fn is_stale_dir(filters: &NameFilters, dir: &Path) -> bool {
    !dir.is_dir() || is_ignored(filters, dir)
}

fn is_ignored(filters: &NameFilters, dir: &Path) -> bool {
    dir.file_name()
        .is_some_and(|name| filters.is_ignored_dir(&name.to_string_lossy()))
}

impl<S: ItemStore, L: LocationProvider> CollectionScanner<S, L> {
    /// Detach albums of `location_ids` whose directory disappeared
    pub(crate) fn scan_for_stale_albums(&mut self, location_ids: &HashSet<LocationId>) -> Result<()> {
        if self.config.want_signals {
            self.notifier.start_scanning_for_stale_albums();
        }

        let albums = self.store.album_short_infos()?;
        let mut to_delete: Vec<AlbumId> = Vec::new();

        for album in &albums {
            if !location_ids.contains(&album.location_id) {
                continue;
            }
            let Some(location) = self.locations.location_for_id(album.location_id) else {
                continue;
            };
            // albums on unplugged volumes are kept as they are
            if !location.is_available() {
                continue;
            }
            if is_stale_dir(&self.filters, &location.album_dir(&album.relative_path)) {
                to_delete.push(album.id);
                self.session.scanned_albums.insert(album.id);
            }
        }

        if !to_delete.is_empty() {
            if let Some(hints) = self.hints.clone() {
                for hint in hints.album_hints() {
                    let Some(index) = to_delete.iter().position(|id| *id == hint.src_album_id) else {
                        continue;
                    };
                    let target_known = albums.iter().any(|a| {
                        a.location_id == hint.dst_location_id && a.relative_path == hint.dst_path
                    });
                    if target_known {
                        continue;
                    }
                    let Some(target) = self.locations.location_for_id(hint.dst_location_id) else {
                        continue;
                    };
                    if !target.is_available() {
                        continue;
                    }
                    let target_dir = target.album_dir(&hint.dst_path);
                    if is_stale_dir(&self.filters, &target_dir) {
                        continue;
                    }
                    if hints
                        .take_album_hint(hint.dst_location_id, &hint.dst_path)
                        .is_none()
                    {
                        continue;
                    }

                    info!(
                        "Album {} was renamed to {}",
                        hint.src_path,
                        target_dir.display()
                    );
                    self.store
                        .rename_album(hint.src_album_id, hint.dst_location_id, &hint.dst_path)?;
                    to_delete.remove(index);
                    self.session.stats.stale_albums_renamed += 1;
                }
            }
        }

        self.safely_remove_albums(&to_delete)?;
        self.session.stats.stale_albums_removed += to_delete.len() as u64;

        if self.config.want_signals {
            self.notifier.finished_scanning_for_stale_albums();
        }
        Ok(())
    }

    /// Trash the items of each album and make the albums stale, atomically
    pub(crate) fn safely_remove_albums(&mut self, album_ids: &[AlbumId]) -> Result<()> {
        if album_ids.is_empty() {
            return Ok(());
        }
        let removed = with_transaction(&mut self.store, |store| {
            let mut removed = Vec::new();
            for album_id in album_ids {
                let ids = store.item_ids_in_album(*album_id)?;
                store.remove_items_from_album(*album_id, &ids)?;
                store.make_stale_album(*album_id)?;
                removed.extend(ids);
            }
            Ok(removed)
        })?;
        self.session.stats.removed_items += removed.len() as u64;
        self.items_were_removed(&removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::hints::{AlbumMoveHint, HintContainer};
    use crate::locations::StaticLocations;
    use crate::models::{CollectionLocation, ItemStatus, LocationAvailability};
    use crate::store::internal_tags;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestScanner = CollectionScanner<SqliteStore, StaticLocations>;

    fn setup() -> (TempDir, TestScanner, CollectionLocation) {
        let dir = TempDir::new().unwrap();
        let mut store = SqliteStore::open_memory().unwrap();
        let id = store.add_location(dir.path()).unwrap();
        let location = CollectionLocation::new(id, dir.path());
        let scanner = CollectionScanner::new(store, StaticLocations::new(vec![location.clone()]));
        (dir, scanner, location)
    }

    fn write(dir: &TempDir, relative: &str) {
        let path = dir.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, relative.as_bytes()).unwrap();
    }

    #[test]
    fn test_vanished_album_is_made_stale() {
        let (dir, mut scanner, location) = setup();
        write(&dir, "gone/a.jpg");
        write(&dir, "gone/b.jpg");
        write(&dir, "kept/c.jpg");
        scanner.complete_scan().unwrap();
        let gone = scanner.store().album_for_path(location.id, "/gone").unwrap().unwrap();
        let items = scanner.store().item_ids_in_album(gone).unwrap();
        assert_eq!(items.len(), 2);

        fs::remove_dir_all(dir.path().join("gone")).unwrap();
        let stats = scanner.complete_scan().unwrap().into_stats();

        assert_eq!(stats.stale_albums_removed, 1);
        assert_eq!(stats.removed_items, 2);
        assert!(scanner.store().album_for_path(location.id, "/gone").unwrap().is_none());
        let tag = scanner
            .store_mut()
            .get_or_create_internal_tag(internal_tags::NEED_TAGGING_HISTORY_GRAPH)
            .unwrap();
        let queued = scanner.store().item_ids_in_tag(tag).unwrap();
        for id in items {
            let info = scanner.store().item_scan_info(id).unwrap().unwrap();
            assert_eq!(info.status, ItemStatus::Trashed);
            assert_eq!(info.album_id, None);
            assert!(queued.contains(&id));
        }
    }

    #[test]
    fn test_hinted_rename_keeps_album_and_items() {
        let (dir, mut scanner, location) = setup();
        write(&dir, "old/a.jpg");
        write(&dir, "old/b.jpg");
        scanner.complete_scan().unwrap();
        let album = scanner.store().album_for_path(location.id, "/old").unwrap().unwrap();
        let mut items = scanner.store().item_ids_in_album(album).unwrap();
        items.sort_unstable();

        fs::rename(dir.path().join("old"), dir.path().join("new")).unwrap();
        let hints = Arc::new(HintContainer::new());
        hints.record_album_hints([AlbumMoveHint {
            src_album_id: album,
            src_location_id: location.id,
            src_path: "/old".to_string(),
            dst_location_id: location.id,
            dst_path: "/new".to_string(),
        }]);
        scanner = scanner.with_hints(hints.clone());

        let stats = scanner.complete_scan().unwrap().into_stats();
        assert_eq!(stats.stale_albums_renamed, 1);
        assert_eq!(stats.stale_albums_removed, 0);
        assert_eq!(stats.removed_items, 0);
        assert_eq!(stats.new_items, 0);
        assert!(!hints.has_album_hints());

        assert_eq!(
            scanner.store().album_for_path(location.id, "/new").unwrap(),
            Some(album)
        );
        let mut after = scanner.store().item_ids_in_album(album).unwrap();
        after.sort_unstable();
        assert_eq!(after, items);
    }

    #[test]
    fn test_rename_into_ignored_dir_is_not_applied() {
        let (dir, mut scanner, location) = setup();
        write(&dir, "old/a.jpg");
        scanner.complete_scan().unwrap();
        let album = scanner.store().album_for_path(location.id, "/old").unwrap().unwrap();

        fs::rename(dir.path().join("old"), dir.path().join("@eaDir")).unwrap();
        let hints = Arc::new(HintContainer::new());
        hints.record_album_hints([AlbumMoveHint {
            src_album_id: album,
            src_location_id: location.id,
            src_path: "/old".to_string(),
            dst_location_id: location.id,
            dst_path: "/@eaDir".to_string(),
        }]);
        scanner = scanner.with_hints(hints);

        let stats = scanner.complete_scan().unwrap().into_stats();
        assert_eq!(stats.stale_albums_renamed, 0);
        assert_eq!(stats.stale_albums_removed, 1);
        assert!(scanner.store().album_for_path(location.id, "/@eaDir").unwrap().is_none());
    }

    #[test]
    fn test_copied_album_inherits_source() {
        let (dir, mut scanner, location) = setup();
        write(&dir, "src/a.jpg");
        scanner.complete_scan().unwrap();
        let src = scanner.store().album_for_path(location.id, "/src").unwrap().unwrap();

        fs::create_dir_all(dir.path().join("dup")).unwrap();
        fs::copy(dir.path().join("src/a.jpg"), dir.path().join("dup/a.jpg")).unwrap();
        let hints = Arc::new(HintContainer::new());
        hints.record_album_hints([AlbumMoveHint {
            src_album_id: src,
            src_location_id: location.id,
            src_path: "/src".to_string(),
            dst_location_id: location.id,
            dst_path: "/dup".to_string(),
        }]);
        scanner = scanner.with_hints(hints);

        let stats = scanner.partial_scan(dir.path(), "/dup").unwrap().into_stats();
        assert_eq!(stats.copied_items, 1);
        assert_eq!(stats.stale_albums_renamed, 0);
        assert!(scanner.store().album_for_path(location.id, "/src").unwrap().is_some());
    }

    #[test]
    fn test_unavailable_location_is_left_alone() {
        let (dir, mut scanner, location) = setup();
        write(&dir, "a/x.jpg");
        scanner.complete_scan().unwrap();
        fs::remove_dir_all(dir.path().join("a")).unwrap();

        let mut offline = location.clone();
        offline.availability = LocationAvailability::Unavailable;
        let store = std::mem::replace(scanner.store_mut(), SqliteStore::open_memory().unwrap());
        let mut scanner = CollectionScanner::new(store, StaticLocations::new(vec![offline]));

        scanner
            .scan_for_stale_albums(&HashSet::from([location.id]))
            .unwrap();
        assert!(scanner.store().album_for_path(location.id, "/a").unwrap().is_some());
    }
}
