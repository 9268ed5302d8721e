//! Per-file work: reading a file's disk state, fingerprinting it, and
//! writing the resulting item record

use chrono::{DateTime, Utc};
use log::debug;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{Result, ScanError};
use crate::models::{
    sort_for_identity, AlbumId, Category, ItemId, ItemMetadata, ItemScanInfo, ItemStatus,
};
use crate::store::{internal_tags, with_transaction, ItemStore};

/// Bytes hashed from each end of a file
pub const HASH_CHUNK_SIZE: u64 = 100 * 1024;

/// Reads embedded metadata from a file during full scans
pub trait MetadataReader {
    fn read(&self, path: &Path, category: Category) -> Option<ItemMetadata>;
}

/// Reader for hosts without metadata support
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

impl MetadataReader for NoMetadata {
    fn read(&self, _path: &Path, _category: Category) -> Option<ItemMetadata> {
        None
    }
}

/// A file as currently found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub sidecar_modified: Option<DateTime<Utc>>,
}

fn to_utc_seconds(time: SystemTime) -> DateTime<Utc> {
    let secs = DateTime::<Utc>::from(time).timestamp();
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

impl DiskEntry {
    /// Stat `path`; with a sidecar extension, also stat `<path>.<ext>`
    pub fn read(path: &Path, sidecar_extension: Option<&str>) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| ScanError::from(e).with_path(path))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ScanError::new(
                    crate::error::ScanErrorKind::InvalidPath,
                    Some(path.to_path_buf()),
                    "file name is not valid UTF-8",
                )
            })?
            .to_string();
        let modified = metadata
            .modified()
            .map(to_utc_seconds)
            .map_err(|e| ScanError::from(e).with_path(path))?;

        let sidecar_modified = sidecar_extension.and_then(|ext| {
            let mut sidecar = path.as_os_str().to_owned();
            sidecar.push(".");
            sidecar.push(ext);
            std::fs::metadata(PathBuf::from(sidecar))
                .and_then(|m| m.modified())
                .ok()
                .map(to_utc_seconds)
        });

        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
            modified,
            sidecar_modified,
        })
    }

    /// Modification date, taking a newer sidecar into account when asked
    pub fn effective_modified(&self, use_sidecar: bool) -> DateTime<Utc> {
        match self.sidecar_modified {
            Some(sidecar) if use_sidecar && sidecar > self.modified => sidecar,
            _ => self.modified,
        }
    }

    /// The directory containing this file
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

/// Content fingerprint: MD5 over the first and last chunk plus the size
///
/// Files no longer than two chunks are hashed completely.
pub fn unique_hash(path: &Path) -> Result<String> {
    let hash_err = |e: std::io::Error| ScanError::hash_error(path.to_path_buf(), e.to_string());

    let mut file = File::open(path).map_err(hash_err)?;
    let file_size = file.metadata().map_err(hash_err)?.len();
    let mut hasher = Md5::new();

    if file_size <= 2 * HASH_CHUNK_SIZE {
        let mut buffer = Vec::with_capacity(file_size as usize);
        file.read_to_end(&mut buffer).map_err(hash_err)?;
        hasher.update(&buffer);
    } else {
        let mut buffer = vec![0u8; HASH_CHUNK_SIZE as usize];
        file.read_exact(&mut buffer).map_err(hash_err)?;
        hasher.update(&buffer);

        file.seek(SeekFrom::End(-(HASH_CHUNK_SIZE as i64)))
            .map_err(hash_err)?;
        file.read_exact(&mut buffer).map_err(hash_err)?;
        hasher.update(&buffer);
    }
    hasher.update(file_size.to_string().as_bytes());

    Ok(format!("{:x}", hasher.finalize()))
}

/// How an item record was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemChange {
    Added,
    /// A trashed record with the same identity was brought back
    Revived,
    Copied,
    Moved,
    Modified,
    Rescanned,
}

/// Result of writing one item
#[derive(Debug, Clone)]
pub struct ScannedItem {
    pub info: ItemScanInfo,
    pub change: ItemChange,
    /// The file carries history references that still need resolving
    pub has_history_to_resolve: bool,
}

impl ScannedItem {
    pub fn id(&self) -> ItemId {
        self.info.id
    }
}

/// Where attributes of a new item come from
enum AttributeSource {
    Item(ItemId),
    Metadata,
}

/// Writes the record for one on-disk file
pub struct ItemScanner<'a> {
    entry: &'a DiskEntry,
    category: Category,
    metadata: &'a dyn MetadataReader,
    clear_metadata_if_rescan: bool,
}

impl<'a> ItemScanner<'a> {
    pub fn new(entry: &'a DiskEntry, category: Category, metadata: &'a dyn MetadataReader) -> Self {
        Self {
            entry,
            category,
            metadata,
            clear_metadata_if_rescan: false,
        }
    }

    pub fn clear_metadata_if_rescan(mut self, enabled: bool) -> Self {
        self.clear_metadata_if_rescan = enabled;
        self
    }

    /// Fresh scan info from disk, keeping identity fields from `base`
    fn load_from_disk(&self, base: ItemScanInfo) -> Result<ItemScanInfo> {
        Ok(ItemScanInfo {
            name: self.entry.name.clone(),
            category: self.category,
            modification_date: Some(self.entry.modified),
            file_size: self.entry.size,
            unique_hash: Some(unique_hash(&self.entry.path)?),
            ..base
        })
    }

    /// New file: reuse an identical item's attributes if one exists, else read metadata
    pub fn new_file<S: ItemStore + ?Sized>(&self, store: &mut S, album_id: AlbumId) -> Result<ScannedItem> {
        let info = self.prepare_add(album_id)?;
        let source = match self.identical_source(store, &info)? {
            Some(id) => AttributeSource::Item(id),
            None => AttributeSource::Metadata,
        };
        self.commit_add(store, info, source, ItemChange::Added)
    }

    /// New file, always reading full metadata
    pub fn new_file_full_scan<S: ItemStore + ?Sized>(
        &self,
        store: &mut S,
        album_id: AlbumId,
    ) -> Result<ScannedItem> {
        let info = self.prepare_add(album_id)?;
        self.commit_add(store, info, AttributeSource::Metadata, ItemChange::Added)
    }

    /// New file known to be a copy of `src_id`
    pub fn copied_from<S: ItemStore + ?Sized>(
        &self,
        store: &mut S,
        album_id: AlbumId,
        src_id: ItemId,
    ) -> Result<ScannedItem> {
        let info = self.prepare_add(album_id)?;
        if store.item_scan_info(src_id)?.is_some() {
            debug!("Recognized {} as copied from {}", self.entry.path.display(), src_id);
            return self.commit_add(store, info, AttributeSource::Item(src_id), ItemChange::Copied);
        }
        let source = match self.identical_source(store, &info)? {
            Some(id) => AttributeSource::Item(id),
            None => AttributeSource::Metadata,
        };
        self.commit_add(store, info, source, ItemChange::Added)
    }

    /// New file that is `src_id` moved here; the record keeps its id
    pub fn moved_from<S: ItemStore + ?Sized>(
        &self,
        store: &mut S,
        album_id: AlbumId,
        src_id: ItemId,
    ) -> Result<ScannedItem> {
        let Some(src) = store.item_scan_info(src_id)? else {
            return self.copied_from(store, album_id, src_id);
        };
        let info = self.load_from_disk(ItemScanInfo {
            album_id: Some(album_id),
            status: ItemStatus::Normal,
            ..src
        })?;
        debug!("Recognized {} as moved item {}", self.entry.path.display(), src_id);

        with_transaction(store, |store| {
            store.move_item(src_id, album_id, &info.name)?;
            store.set_item_status(src_id, ItemStatus::Normal)?;
            store.update_item(&info)
        })?;

        Ok(ScannedItem {
            info,
            change: ItemChange::Moved,
            has_history_to_resolve: false,
        })
    }

    /// Lightweight update of a known item whose file changed
    pub fn file_modified<S: ItemStore + ?Sized>(
        &self,
        store: &mut S,
        current: &ItemScanInfo,
    ) -> Result<ScannedItem> {
        let info = self.load_from_disk(current.clone())?;
        with_transaction(store, |store| store.update_item(&info))?;
        Ok(ScannedItem {
            info,
            change: ItemChange::Modified,
            has_history_to_resolve: false,
        })
    }

    /// Complete rescan of a known item
    pub fn rescan<S: ItemStore + ?Sized>(&self, store: &mut S, current: &ItemScanInfo) -> Result<ScannedItem> {
        let info = self.load_from_disk(current.clone())?;
        let metadata = self.metadata.read(&self.entry.path, self.category);

        let has_history_to_resolve = with_transaction(store, |store| {
            store.update_item(&info)?;
            if self.clear_metadata_if_rescan {
                store.clear_item_metadata(info.id)?;
            }
            apply_metadata(store, info.id, metadata.as_ref())
        })?;

        Ok(ScannedItem {
            info,
            change: ItemChange::Rescanned,
            has_history_to_resolve,
        })
    }

    fn prepare_add(&self, album_id: AlbumId) -> Result<ItemScanInfo> {
        debug!("Adding new item {}", self.entry.path.display());
        self.load_from_disk(ItemScanInfo {
            album_id: Some(album_id),
            status: ItemStatus::Normal,
            ..Default::default()
        })
    }

    /// Best existing item with the same content, if any
    fn identical_source<S: ItemStore + ?Sized>(&self, store: &S, info: &ItemScanInfo) -> Result<Option<ItemId>> {
        let Some(hash) = info.unique_hash.as_deref() else {
            return Ok(None);
        };
        let mut candidates = store.identical_items(hash, info.file_size, None)?;
        sort_for_identity(&mut candidates);
        let found = candidates.first().map(|c| c.id);
        if let Some(id) = found {
            debug!("Recognized {} as identical to item {}", self.entry.path.display(), id);
        }
        Ok(found)
    }

    fn commit_add<S: ItemStore + ?Sized>(
        &self,
        store: &mut S,
        mut info: ItemScanInfo,
        source: AttributeSource,
        change: ItemChange,
    ) -> Result<ScannedItem> {
        let metadata = match source {
            AttributeSource::Metadata => self.metadata.read(&self.entry.path, self.category),
            AttributeSource::Item(_) => None,
        };

        let (change, has_history_to_resolve) = with_transaction(store, |store| {
            let change = match store.find_trashed_identical(&info)? {
                Some(id) => {
                    debug!(
                        "Reusing removed item {} for {}",
                        id,
                        self.entry.path.display()
                    );
                    info.id = id;
                    let album_id = info.album_id.unwrap_or_default();
                    store.move_item(id, album_id, &info.name)?;
                    store.set_item_status(id, ItemStatus::Normal)?;
                    store.update_item(&info)?;
                    ItemChange::Revived
                }
                None => {
                    info.id = store.add_item(&info)?;
                    change
                }
            };

            let has_history = match source {
                AttributeSource::Item(src_id) if src_id != info.id => {
                    store.copy_item_attributes(src_id, info.id)?;
                    false
                }
                AttributeSource::Item(_) => false,
                AttributeSource::Metadata => apply_metadata(store, info.id, metadata.as_ref())?,
            };
            Ok((change, has_history))
        })?;

        Ok(ScannedItem {
            info,
            change,
            has_history_to_resolve,
        })
    }
}

/// Store read metadata; returns whether history references were recorded
fn apply_metadata<S: ItemStore + ?Sized>(
    store: &mut S,
    id: ItemId,
    metadata: Option<&ItemMetadata>,
) -> Result<bool> {
    let Some(metadata) = metadata else {
        return Ok(false);
    };
    store.apply_item_metadata(id, metadata)?;
    if metadata.history.is_empty() {
        return Ok(false);
    }
    store.set_image_history(id, &metadata.history)?;
    // Resolution depends on other files being present, so it is deferred
    let tag = store.get_or_create_internal_tag(internal_tags::NEED_RESOLVING_HISTORY)?;
    store.add_tags_to_items(&[id], &[tag])?;
    Ok(true)
}
