//! Expectation hints submitted by file operations before the scanner runs
//!
//! Operations that already know what happened to a file (copy, move, edit)
//! record a hint here so the scanner can skip re-deriving it. The container
//! is the one structure shared between threads: operation threads record,
//! the scan thread consumes. Every hint is consumed at most once, and a
//! consumed hint is removed under the write lock in the same critical section
//! that found it.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::classifier::modification_date_equals;
use crate::config::{ScanConfig, DEFAULT_HINT_EXPIRY_SECS};
use crate::models::{AlbumId, ItemId, ItemScanInfo, LocationId};

/// An album directory was copied or moved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumMoveHint {
    pub src_album_id: AlbumId,
    pub src_location_id: LocationId,
    pub src_path: String,
    pub dst_location_id: LocationId,
    pub dst_path: String,
}

/// Items were copied or moved into an album, possibly under new names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMoveHint {
    pub src_ids: Vec<ItemId>,
    pub dst_album_id: AlbumId,
    pub dst_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Contents changed; a lightweight update suffices
    Modified,
    /// Needs a complete rescan
    RescanNeeded,
}

/// Items were changed by an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChangeHint {
    pub ids: Vec<ItemId>,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentPhase {
    AboutToEdit,
    Finished,
    Aborted,
}

/// A metadata-only edit of a file, reported before and after writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataAdjustmentHint {
    pub id: ItemId,
    pub phase: AdjustmentPhase,
    /// For `AboutToEdit` the date before the edit, for `Finished` after it
    pub modification_date: DateTime<Utc>,
    pub file_size: u64,
}

/// Hint pending for an already known item, in precedence order
///
/// Variants declared earlier win: a destructive hint always beats an
/// optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemHint {
    Rescan,
    Modified,
    /// An edit is in progress; the item must be left alone this pass
    MetadataAboutToAdjust,
    /// An edit finished; the file should now have this date and size
    MetadataAdjusted {
        modification_date: DateTime<Utc>,
        file_size: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingAdjustment {
    modification_date: DateTime<Utc>,
    file_size: u64,
    recorded: Instant,
}

#[derive(Debug, Default)]
struct HintState {
    /// keyed by destination (location, album path)
    album_hints: HashMap<(LocationId, String), AlbumMoveHint>,
    /// keyed by destination (album, file name), value is the source item
    item_hints: HashMap<(AlbumId, String), ItemId>,
    modified_items: HashSet<ItemId>,
    rescan_items: HashSet<ItemId>,
    about_to_adjust: HashMap<ItemId, PendingAdjustment>,
    adjusted: HashMap<ItemId, (DateTime<Utc>, u64)>,
}

/// Thread-safe store of expectation hints
#[derive(Debug)]
pub struct HintContainer {
    state: RwLock<HintState>,
    expiry: Duration,
}

impl Default for HintContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl HintContainer {
    pub fn new() -> Self {
        Self::with_expiry(Duration::from_secs(DEFAULT_HINT_EXPIRY_SECS))
    }

    /// Create a container whose "about to edit" hints expire after `expiry`
    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            state: RwLock::new(HintState::default()),
            expiry,
        }
    }

    /// Create a container using the hint lifetime configured for scans
    pub fn for_config(config: &ScanConfig) -> Self {
        Self::with_expiry(Duration::from_secs(config.hint_expiry_secs))
    }

    pub fn record_album_hints(&self, hints: impl IntoIterator<Item = AlbumMoveHint>) {
        let mut state = self.state.write();
        for hint in hints {
            let key = (hint.dst_location_id, hint.dst_path.clone());
            if let Some(previous) = state.album_hints.get(&key) {
                if previous.src_album_id != hint.src_album_id {
                    // More than one source for one destination; the last one recorded wins.
                    warn!(
                        "Album hint for {}:{} replaces source album {} with {}",
                        hint.dst_location_id, hint.dst_path, previous.src_album_id, hint.src_album_id
                    );
                }
            }
            state.album_hints.insert(key, hint);
        }
    }

    pub fn record_item_hints(&self, hints: impl IntoIterator<Item = ItemMoveHint>) {
        let mut state = self.state.write();
        for hint in hints {
            if hint.src_ids.len() != hint.dst_names.len() {
                warn!(
                    "Dropping item hint for album {}: {} source ids but {} names",
                    hint.dst_album_id,
                    hint.src_ids.len(),
                    hint.dst_names.len()
                );
                continue;
            }
            for (src_id, name) in hint.src_ids.iter().zip(hint.dst_names) {
                state.item_hints.insert((hint.dst_album_id, name), *src_id);
            }
        }
    }

    pub fn record_change_hints(&self, hints: impl IntoIterator<Item = ItemChangeHint>) {
        let mut state = self.state.write();
        for hint in hints {
            let target = match hint.kind {
                ChangeKind::Modified => &mut state.modified_items,
                ChangeKind::RescanNeeded => &mut state.rescan_items,
            };
            target.extend(hint.ids);
        }
    }

    /// Record one phase of a metadata edit. Returns whether the hint was kept.
    ///
    /// `live` is the item as currently stored. An `AboutToEdit` hint is only
    /// accepted when it matches the stored date and size; otherwise a rescan
    /// is already due and the hint would hide it. `Finished` is only accepted
    /// while a matching unexpired `AboutToEdit` is pending.
    pub fn record_metadata_hint(
        &self,
        hint: &MetadataAdjustmentHint,
        live: Option<&ItemScanInfo>,
    ) -> bool {
        match hint.phase {
            AdjustmentPhase::AboutToEdit => {
                let matches_live = live.is_some_and(|info| {
                    info.file_size == hint.file_size
                        && info
                            .modification_date
                            .is_some_and(|date| modification_date_equals(date, hint.modification_date))
                });
                if !matches_live {
                    debug!("Refusing metadata hint for item {}: stored state differs", hint.id);
                    return false;
                }
                let mut state = self.state.write();
                state.about_to_adjust.insert(
                    hint.id,
                    PendingAdjustment {
                        modification_date: hint.modification_date,
                        file_size: hint.file_size,
                        recorded: Instant::now(),
                    },
                );
                true
            }
            AdjustmentPhase::Finished => {
                let mut state = self.state.write();
                match state.about_to_adjust.remove(&hint.id) {
                    Some(pending) if pending.recorded.elapsed() <= self.expiry => {
                        state
                            .adjusted
                            .insert(hint.id, (hint.modification_date, hint.file_size));
                        true
                    }
                    Some(_) => {
                        warn!("Dropping finished metadata hint for item {}: edit hint expired", hint.id);
                        false
                    }
                    None => {
                        debug!("Dropping finished metadata hint for item {}: no edit pending", hint.id);
                        false
                    }
                }
            }
            AdjustmentPhase::Aborted => {
                self.state.write().about_to_adjust.remove(&hint.id);
                true
            }
        }
    }

    pub fn clear(&self) {
        *self.state.write() = HintState::default();
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.read();
        state.album_hints.is_empty()
            && state.item_hints.is_empty()
            && state.modified_items.is_empty()
            && state.rescan_items.is_empty()
            && state.about_to_adjust.is_empty()
            && state.adjusted.is_empty()
    }

    pub fn has_album_hints(&self) -> bool {
        !self.state.read().album_hints.is_empty()
    }

    pub fn has_rescan_hint(&self, id: ItemId) -> bool {
        self.state.read().rescan_items.contains(&id)
    }

    pub fn has_modification_hint(&self, id: ItemId) -> bool {
        self.state.read().modified_items.contains(&id)
    }

    pub fn has_metadata_about_to_adjust_hint(&self, id: ItemId) -> bool {
        self.state
            .read()
            .about_to_adjust
            .get(&id)
            .is_some_and(|pending| pending.recorded.elapsed() <= self.expiry)
    }

    pub fn has_metadata_adjusted_hint(&self, id: ItemId) -> bool {
        self.state.read().adjusted.contains_key(&id)
    }

    pub fn has_item_move_hint(&self, album_id: AlbumId, name: &str) -> bool {
        self.state
            .read()
            .item_hints
            .contains_key(&(album_id, name.to_string()))
    }

    /// Copy of all pending album hints
    pub fn album_hints(&self) -> Vec<AlbumMoveHint> {
        self.state.read().album_hints.values().cloned().collect()
    }

    /// Source locations of album hints that end in `location_id`
    pub fn source_locations_for(&self, location_id: LocationId) -> HashSet<LocationId> {
        self.state
            .read()
            .album_hints
            .values()
            .filter(|hint| hint.dst_location_id == location_id)
            .map(|hint| hint.src_location_id)
            .collect()
    }

    /// Remove and return the album hint ending in the given destination
    pub fn take_album_hint(&self, location_id: LocationId, path: &str) -> Option<AlbumMoveHint> {
        self.state
            .write()
            .album_hints
            .remove(&(location_id, path.to_string()))
    }

    /// Remove and return the source item hinted for a newly appeared file
    pub fn take_item_move_hint(&self, album_id: AlbumId, name: &str) -> Option<ItemId> {
        self.state
            .write()
            .item_hints
            .remove(&(album_id, name.to_string()))
    }

    /// Drop a pending rescan hint for `id`, returning whether there was one
    pub fn take_rescan_hint(&self, id: ItemId) -> bool {
        self.state.write().rescan_items.remove(&id)
    }

    /// Resolve the hint that governs `id`, consuming it unless it postpones
    ///
    /// Expired "about to edit" entries are purged on the way.
    pub fn take_item_hint(&self, id: ItemId) -> Option<ItemHint> {
        let mut state = self.state.write();
        if state.rescan_items.remove(&id) {
            return Some(ItemHint::Rescan);
        }
        if state.modified_items.remove(&id) {
            return Some(ItemHint::Modified);
        }
        if let Some(pending) = state.about_to_adjust.get(&id).copied() {
            if pending.recorded.elapsed() <= self.expiry {
                return Some(ItemHint::MetadataAboutToAdjust);
            }
            debug!(
                "Metadata edit hint for item {} expired ({} bytes at {})",
                id, pending.file_size, pending.modification_date
            );
            state.about_to_adjust.remove(&id);
        }
        state
            .adjusted
            .remove(&id)
            .map(|(modification_date, file_size)| ItemHint::MetadataAdjusted {
                modification_date,
                file_size,
            })
    }
}
