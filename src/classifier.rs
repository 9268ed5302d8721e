//! Decides what to do with a file that matches a known item record

use chrono::{DateTime, Utc};
use log::debug;

use crate::config::ScanConfig;
use crate::hints::ItemHint;
use crate::item::DiskEntry;
use crate::models::ItemScanInfo;

/// Compare modification dates allowing a one second window.
///
/// FAT stores modification dates in 2-second resolution.
pub fn modification_date_equals(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a.timestamp() - b.timestamp()).abs() <= 1
}

/// What the scanner does with a matched file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Unchanged,
    /// An edit is in flight; look again on a later pass
    Postpone,
    /// Refresh size, date, hash and category only
    Modified,
    /// Re-read everything, including metadata
    FullRescan,
    /// Refresh the hash and carry the thumbnail over to the new key
    UpdateHash { file_was_edited: bool },
}

/// Settings the decision depends on
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierPolicy {
    pub update_hash: bool,
    pub rescan_if_modified: bool,
    pub use_sidecar: bool,
}

impl From<&ScanConfig> for ClassifierPolicy {
    fn from(config: &ScanConfig) -> Self {
        Self {
            update_hash: config.update_hash,
            rescan_if_modified: config.rescan_if_modified,
            use_sidecar: config.use_sidecar_for_reading,
        }
    }
}

/// Classify one file against its stored record.
///
/// `hint` must already be taken from the hint container. A stored date of
/// `None` means the item was never fully scanned and always wins.
pub fn classify(
    entry: &DiskEntry,
    record: &ItemScanInfo,
    hint: Option<ItemHint>,
    policy: &ClassifierPolicy,
) -> FileAction {
    let Some(stored_date) = record.modification_date else {
        return FileAction::FullRescan;
    };

    match hint {
        Some(ItemHint::Rescan) => return FileAction::FullRescan,
        Some(ItemHint::Modified) => return FileAction::Modified,
        Some(ItemHint::MetadataAboutToAdjust) => return FileAction::Postpone,
        Some(ItemHint::MetadataAdjusted {
            modification_date,
            file_size,
        }) => {
            if modification_date_equals(entry.modified, modification_date) && entry.size == file_size {
                return FileAction::UpdateHash {
                    file_was_edited: true,
                };
            }
            debug!(
                "Metadata hint for {} does not match the file on disk, checking normally",
                entry.path.display()
            );
        }
        None => {}
    }

    let same_as_stored =
        |date: DateTime<Utc>| modification_date_equals(date, stored_date) && entry.size == record.file_size;

    if policy.update_hash && same_as_stored(entry.modified) {
        return FileAction::UpdateHash {
            file_was_edited: false,
        };
    }

    if same_as_stored(entry.effective_modified(policy.use_sidecar)) {
        FileAction::Unchanged
    } else if policy.rescan_if_modified {
        FileAction::FullRescan
    } else {
        FileAction::Modified
    }
}
