//! Persistence interfaces consumed by the scanner
//!
//! The scanner never owns a global database handle. The host passes an
//! [`ItemStore`] in, and optionally a [`ThumbnailIndex`].

use chrono::{DateTime, Utc};
use log::warn;

use crate::error::Result;
use crate::models::{
    AlbumId, AlbumShortInfo, ItemId, ItemMetadata, ItemScanInfo, ItemShortInfo, ItemStatus,
    HistoryReference, LocationId, NameFilters, RelationType, TagId,
};

/// Setting holding the time the initial scan completed
pub const SETTING_SCANNED: &str = "Scanned";
/// Setting holding the last time items were marked removed
pub const SETTING_REMOVED_ITEMS_TIME: &str = "RemovedItemsTime";
/// Setting holding the last time trashed items were made obsolete
pub const SETTING_DELETE_REMOVED_TIME: &str = "DeleteRemovedTime";
/// Setting counting complete scans since the last deletion sweep
pub const SETTING_DELETE_REMOVED_COMPLETE_SCAN_COUNT: &str = "DeleteRemovedCompleteScanCount";

/// Internal tags used as a persistent todo list
pub mod internal_tags {
    pub const NEED_RESOLVING_HISTORY: &str = "_Scanner_Internal_NeedResolvingHistory_";
    pub const NEED_TAGGING_HISTORY_GRAPH: &str = "_Scanner_Internal_NeedTaggingHistoryGraph_";
    pub const ORIGINAL_VERSION: &str = "_Scanner_Internal_OriginalVersion_";
    pub const CURRENT_VERSION: &str = "_Scanner_Internal_CurrentVersion_";
    pub const INTERMEDIATE_VERSION: &str = "_Scanner_Internal_IntermediateVersion_";
}

/// Catalog operations the scanner needs
///
/// Transactions nest: every `begin_transaction` is matched by exactly one
/// `commit_transaction` or `rollback_transaction`.
pub trait ItemStore {
    // Transactions
    fn begin_transaction(&mut self) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
    fn rollback_transaction(&mut self) -> Result<()>;

    // Configuration
    fn name_filters(&self) -> Result<NameFilters>;
    fn setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&mut self, key: &str, value: Option<&str>) -> Result<()>;

    // Albums
    fn album_short_infos(&self) -> Result<Vec<AlbumShortInfo>>;
    fn album_for_path(&self, location_id: LocationId, relative_path: &str) -> Result<Option<AlbumId>>;
    fn add_album(
        &mut self,
        location_id: LocationId,
        relative_path: &str,
        date: Option<DateTime<Utc>>,
    ) -> Result<AlbumId>;
    fn copy_album_properties(&mut self, src: AlbumId, dst: AlbumId) -> Result<()>;
    fn rename_album(&mut self, id: AlbumId, location_id: LocationId, relative_path: &str) -> Result<()>;
    /// Detach an album from its location; its row stays until `delete_stale_albums`
    fn make_stale_album(&mut self, id: AlbumId) -> Result<()>;
    fn delete_stale_albums(&mut self) -> Result<usize>;

    // Items
    fn item_scan_infos(&self, album_id: AlbumId) -> Result<Vec<ItemScanInfo>>;
    fn item_scan_info(&self, id: ItemId) -> Result<Option<ItemScanInfo>>;
    fn item_short_info(&self, id: ItemId) -> Result<Option<ItemShortInfo>>;
    fn item_id(&self, album_id: AlbumId, name: &str) -> Result<Option<ItemId>>;
    fn item_ids_in_album(&self, album_id: AlbumId) -> Result<Vec<ItemId>>;
    fn item_ids_with_status(&self, status: ItemStatus) -> Result<Vec<ItemId>>;
    /// Insert a record; `info.id` is ignored
    fn add_item(&mut self, info: &ItemScanInfo) -> Result<ItemId>;
    fn update_item(&mut self, info: &ItemScanInfo) -> Result<()>;
    /// Re-file an existing record under a new album and name
    fn move_item(&mut self, id: ItemId, album_id: AlbumId, name: &str) -> Result<()>;
    fn set_item_status(&mut self, id: ItemId, status: ItemStatus) -> Result<()>;
    /// Detach items from `album_id` and mark them trashed
    fn remove_items_from_album(&mut self, album_id: AlbumId, ids: &[ItemId]) -> Result<()>;
    /// A trashed, album-less record with the same identity, if any
    fn find_trashed_identical(&self, info: &ItemScanInfo) -> Result<Option<ItemId>>;
    /// Non-obsolete records sharing hash and size, excluding `exclude`
    fn identical_items(&self, hash: &str, size: u64, exclude: Option<ItemId>) -> Result<Vec<ItemScanInfo>>;
    /// Copy user-visible attributes (rating, labels, public tags, position, comments)
    fn copy_item_attributes(&mut self, src: ItemId, dst: ItemId) -> Result<()>;
    fn clear_item_metadata(&mut self, id: ItemId) -> Result<()>;
    fn apply_item_metadata(&mut self, id: ItemId, metadata: &ItemMetadata) -> Result<()>;

    // History and relations
    fn set_image_history(&mut self, id: ItemId, history: &[HistoryReference]) -> Result<()>;
    fn image_history(&self, id: ItemId) -> Result<Vec<HistoryReference>>;
    fn item_ids_by_uuid(&self, uuid: &str) -> Result<Vec<ItemId>>;
    fn add_image_relation(&mut self, subject: ItemId, object: ItemId, kind: RelationType) -> Result<()>;
    /// Every (subject, object) pair of `kind` touching `id`
    fn image_relations(&self, id: ItemId, kind: RelationType) -> Result<Vec<(ItemId, ItemId)>>;
    /// For each id, one item related to it in either direction, if any
    fn one_related_image_each(&self, ids: &[ItemId], kind: RelationType) -> Result<Vec<ItemId>>;

    // Internal tags
    fn get_or_create_internal_tag(&mut self, name: &str) -> Result<TagId>;
    fn item_ids_in_tag(&self, tag: TagId) -> Result<Vec<ItemId>>;
    fn add_tags_to_items(&mut self, ids: &[ItemId], tags: &[TagId]) -> Result<()>;
    fn remove_tags_from_items(&mut self, ids: &[ItemId], tags: &[TagId]) -> Result<()>;
}

/// Thumbnail cache keyed by (unique hash, file size)
pub trait ThumbnailIndex {
    fn find_by_hash(&self, hash: &str, size: u64) -> Result<Option<i64>>;
    fn insert_unique_hash(&mut self, hash: &str, size: u64, thumbnail_id: i64) -> Result<()>;
    fn update_modification_date(&mut self, thumbnail_id: i64, date: DateTime<Utc>) -> Result<()>;
    fn replace_unique_hash(&mut self, old_hash: &str, old_size: u64, new_hash: &str, new_size: u64) -> Result<()>;
}

/// Run `f` inside a store transaction, rolling back if it fails
pub fn with_transaction<S, T, F>(store: &mut S, f: F) -> Result<T>
where
    S: ItemStore + ?Sized,
    F: FnOnce(&mut S) -> Result<T>,
{
    store.begin_transaction()?;
    match f(store) {
        Ok(value) => {
            store.commit_transaction()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = store.rollback_transaction() {
                warn!("Rollback failed after {}: {}", err, rollback_err);
            }
            Err(err)
        }
    }
}
