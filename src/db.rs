//! SQLite implementations of the persistence traits

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Result, ScanError};
use crate::models::{
    AlbumId, AlbumShortInfo, CollectionLocation, GpsPosition, HistoryReference, ItemId,
    ItemMetadata, ItemScanInfo, ItemShortInfo, ItemStatus, LocationId, NameFilters,
    RelationType, TagId,
};
use crate::store::{ItemStore, ThumbnailIndex};

/// Settings keys overriding the default name filters, space separated
pub const SETTING_IMAGE_FILTER: &str = "imageFilter";
pub const SETTING_VIDEO_FILTER: &str = "videoFilter";
pub const SETTING_AUDIO_FILTER: &str = "audioFilter";
pub const SETTING_IGNORE_DIRECTORIES: &str = "ignoreDirectories";

const ITEM_COLUMNS: &str =
    "id, album, name, status, category, modification_date, file_size, unique_hash";

fn to_secs(date: Option<DateTime<Utc>>) -> Option<i64> {
    date.map(|d| d.timestamp())
}

fn from_secs(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ItemScanInfo> {
    Ok(ItemScanInfo {
        id: row.get(0)?,
        album_id: row.get(1)?,
        name: row.get(2)?,
        status: ItemStatus::from_i64(row.get(3)?),
        category: crate::models::Category::from_i64(row.get(4)?),
        modification_date: from_secs(row.get(5)?),
        file_size: row.get::<_, i64>(6)? as u64,
        unique_hash: row.get(7)?,
    })
}

fn split_filter(value: &str) -> HashSet<String> {
    value
        .split_whitespace()
        .map(|s| s.trim_start_matches("*.").to_lowercase())
        .collect()
}

/// Catalog database
pub struct SqliteStore {
    conn: Connection,
    depth: usize,
}

impl SqliteStore {
    /// Open or create database
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| ScanError::from(e).with_path(path))?;
        let store = Self { conn, depth: 0 };
        store.init_schema()?;
        Ok(store)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, depth: 0 };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS album_roots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root_path TEXT NOT NULL UNIQUE,
                status INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS albums (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                album_root INTEGER,
                relative_path TEXT NOT NULL,
                date TEXT,
                caption TEXT,
                icon INTEGER,
                UNIQUE(album_root, relative_path)
            );

            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                album INTEGER,
                name TEXT NOT NULL,
                status INTEGER NOT NULL,
                category INTEGER NOT NULL,
                modification_date INTEGER,
                file_size INTEGER NOT NULL,
                unique_hash TEXT,
                UNIQUE(album, name)
            );
            CREATE INDEX IF NOT EXISTS idx_items_album ON items(album);
            CREATE INDEX IF NOT EXISTS idx_items_hash ON items(unique_hash, file_size);
            CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);

            CREATE TABLE IF NOT EXISTS item_information (
                item_id INTEGER PRIMARY KEY,
                rating INTEGER,
                creation_date INTEGER,
                color_label INTEGER,
                pick_label INTEGER,
                uuid TEXT,
                history TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_item_information_uuid ON item_information(uuid);

            CREATE TABLE IF NOT EXISTS item_positions (
                item_id INTEGER PRIMARY KEY,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                altitude REAL
            );

            CREATE TABLE IF NOT EXISTS item_comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL,
                comment TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_item_comments_item ON item_comments(item_id);

            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                internal INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS item_tags (
                item_id INTEGER NOT NULL,
                tag_id INTEGER NOT NULL,
                PRIMARY KEY (item_id, tag_id)
            );
            CREATE INDEX IF NOT EXISTS idx_item_tags_tag ON item_tags(tag_id);

            CREATE TABLE IF NOT EXISTS item_relations (
                subject INTEGER NOT NULL,
                object INTEGER NOT NULL,
                type INTEGER NOT NULL,
                UNIQUE(subject, object, type)
            );
            CREATE INDEX IF NOT EXISTS idx_item_relations_object ON item_relations(object);

            CREATE TABLE IF NOT EXISTS settings (
                keyword TEXT PRIMARY KEY,
                value TEXT
            );
            ",
        )?;
        Ok(())
    }

    /// Register a collection root, returning its id
    pub fn add_location(&mut self, root: &Path) -> Result<LocationId> {
        let root_str = root.to_string_lossy().to_string();
        self.conn.execute(
            "INSERT OR IGNORE INTO album_roots (root_path) VALUES (?1)",
            params![root_str],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM album_roots WHERE root_path = ?1",
            params![root_str],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// All registered collection roots
    pub fn locations(&self) -> Result<Vec<CollectionLocation>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, root_path FROM album_roots ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(CollectionLocation::new(row.get(0)?, row.get::<_, String>(1)?))
        })?;
        let mut locations = Vec::new();
        for row in rows {
            locations.push(row?);
        }
        Ok(locations)
    }

    /// Get item count per status
    pub fn status_counts(&self) -> Result<Vec<(ItemStatus, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM items GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((ItemStatus::from_i64(row.get(0)?), row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    pub fn item_rating(&self, id: ItemId) -> Result<Option<i32>> {
        let rating = self
            .conn
            .query_row(
                "SELECT rating FROM item_information WHERE item_id = ?1",
                params![id],
                |row| row.get::<_, Option<i32>>(0),
            )
            .optional()?;
        Ok(rating.flatten())
    }

    pub fn set_item_labels(&mut self, id: ItemId, color: Option<i32>, pick: Option<i32>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO item_information (item_id, color_label, pick_label) VALUES (?1, ?2, ?3)
             ON CONFLICT(item_id) DO UPDATE SET color_label = excluded.color_label,
                                                pick_label = excluded.pick_label",
            params![id, color, pick],
        )?;
        Ok(())
    }

    pub fn item_labels(&self, id: ItemId) -> Result<(Option<i32>, Option<i32>)> {
        let labels = self
            .conn
            .query_row(
                "SELECT color_label, pick_label FROM item_information WHERE item_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(labels.unwrap_or((None, None)))
    }

    /// Public tag names attached to an item, sorted
    pub fn item_tag_names(&self, id: ItemId) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT tags.name FROM item_tags JOIN tags ON tags.id = item_tags.tag_id
             WHERE item_tags.item_id = ?1 AND tags.internal = 0 ORDER BY tags.name",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    pub fn item_position(&self, id: ItemId) -> Result<Option<GpsPosition>> {
        let position = self
            .conn
            .query_row(
                "SELECT latitude, longitude, altitude FROM item_positions WHERE item_id = ?1",
                params![id],
                |row| {
                    Ok(GpsPosition {
                        latitude: row.get(0)?,
                        longitude: row.get(1)?,
                        altitude: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(position)
    }

    pub fn item_comments(&self, id: ItemId) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT comment FROM item_comments WHERE item_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        let mut comments = Vec::new();
        for row in rows {
            comments.push(row?);
        }
        Ok(comments)
    }

    fn query_items(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ItemScanInfo>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn query_ids(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn public_tag(&mut self, name: &str) -> Result<TagId> {
        self.conn.execute(
            "INSERT OR IGNORE INTO tags (name, internal) VALUES (?1, 0)",
            params![name],
        )?;
        let id = self
            .conn
            .query_row("SELECT id FROM tags WHERE name = ?1", params![name], |row| row.get(0))?;
        Ok(id)
    }
}

impl ItemStore for SqliteStore {
    fn begin_transaction(&mut self) -> Result<()> {
        self.depth += 1;
        if let Err(err) = self
            .conn
            .execute_batch(&format!("SAVEPOINT scan_{}", self.depth))
        {
            self.depth -= 1;
            return Err(err.into());
        }
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(ScanError::database_error("commit without an open transaction"));
        }
        self.conn
            .execute_batch(&format!("RELEASE scan_{}", self.depth))?;
        self.depth -= 1;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(ScanError::database_error("rollback without an open transaction"));
        }
        let depth = self.depth;
        self.depth -= 1;
        self.conn.execute_batch(&format!(
            "ROLLBACK TO scan_{depth}; RELEASE scan_{depth};"
        ))?;
        Ok(())
    }

    fn name_filters(&self) -> Result<NameFilters> {
        let mut filters = NameFilters::default();
        if let Some(value) = self.setting(SETTING_IMAGE_FILTER)? {
            filters.image = split_filter(&value);
        }
        if let Some(value) = self.setting(SETTING_VIDEO_FILTER)? {
            filters.video = split_filter(&value);
        }
        if let Some(value) = self.setting(SETTING_AUDIO_FILTER)? {
            filters.audio = split_filter(&value);
        }
        if let Some(value) = self.setting(SETTING_IGNORE_DIRECTORIES)? {
            filters.ignore_directories = value.split_whitespace().map(str::to_string).collect();
        }
        Ok(filters)
    }

    fn setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE keyword = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn set_setting(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (keyword, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn album_short_infos(&self) -> Result<Vec<AlbumShortInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, album_root, relative_path FROM albums
             WHERE album_root IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AlbumShortInfo {
                id: row.get(0)?,
                location_id: row.get(1)?,
                relative_path: row.get(2)?,
            })
        })?;
        let mut albums = Vec::new();
        for row in rows {
            albums.push(row?);
        }
        Ok(albums)
    }

    fn album_for_path(&self, location_id: LocationId, relative_path: &str) -> Result<Option<AlbumId>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM albums WHERE album_root = ?1 AND relative_path = ?2",
                params![location_id, relative_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn add_album(
        &mut self,
        location_id: LocationId,
        relative_path: &str,
        date: Option<DateTime<Utc>>,
    ) -> Result<AlbumId> {
        if let Some(id) = self.album_for_path(location_id, relative_path)? {
            return Ok(id);
        }
        self.conn.execute(
            "INSERT INTO albums (album_root, relative_path, date) VALUES (?1, ?2, ?3)",
            params![location_id, relative_path, date.map(|d| d.to_rfc3339())],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("Added album {} at {}:{}", id, location_id, relative_path);
        Ok(id)
    }

    fn copy_album_properties(&mut self, src: AlbumId, dst: AlbumId) -> Result<()> {
        self.conn.execute(
            "UPDATE albums SET (date, caption, icon) =
                 (SELECT date, caption, icon FROM albums WHERE id = ?1)
             WHERE id = ?2",
            params![src, dst],
        )?;
        Ok(())
    }

    fn rename_album(&mut self, id: AlbumId, location_id: LocationId, relative_path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE albums SET album_root = ?1, relative_path = ?2 WHERE id = ?3",
            params![location_id, relative_path, id],
        )?;
        Ok(())
    }

    fn make_stale_album(&mut self, id: AlbumId) -> Result<()> {
        self.conn
            .execute("UPDATE albums SET album_root = NULL WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn delete_stale_albums(&mut self) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM albums WHERE album_root IS NULL", [])?;
        Ok(deleted)
    }

    fn item_scan_infos(&self, album_id: AlbumId) -> Result<Vec<ItemScanInfo>> {
        self.query_items(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE album = ?1"),
            params![album_id],
        )
    }

    fn item_scan_info(&self, id: ItemId) -> Result<Option<ItemScanInfo>> {
        Ok(self
            .query_items(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                params![id],
            )?
            .into_iter()
            .next())
    }

    fn item_short_info(&self, id: ItemId) -> Result<Option<ItemShortInfo>> {
        let info = self
            .conn
            .query_row(
                "SELECT items.id, items.name, items.album, albums.album_root, albums.relative_path
                 FROM items LEFT JOIN albums ON albums.id = items.album
                 WHERE items.id = ?1",
                params![id],
                |row| {
                    Ok(ItemShortInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        album_id: row.get(2)?,
                        location_id: row.get(3)?,
                        album_path: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    fn item_id(&self, album_id: AlbumId, name: &str) -> Result<Option<ItemId>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM items WHERE album = ?1 AND name = ?2",
                params![album_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn item_ids_in_album(&self, album_id: AlbumId) -> Result<Vec<ItemId>> {
        self.query_ids("SELECT id FROM items WHERE album = ?1", params![album_id])
    }

    fn item_ids_with_status(&self, status: ItemStatus) -> Result<Vec<ItemId>> {
        self.query_ids(
            "SELECT id FROM items WHERE status = ?1 ORDER BY id",
            params![status.as_i64()],
        )
    }

    fn add_item(&mut self, info: &ItemScanInfo) -> Result<ItemId> {
        self.conn.execute(
            "INSERT INTO items (album, name, status, category, modification_date, file_size, unique_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                info.album_id,
                info.name,
                info.status.as_i64(),
                info.category.as_i64(),
                to_secs(info.modification_date),
                info.file_size as i64,
                info.unique_hash,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_item(&mut self, info: &ItemScanInfo) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET name = ?1, status = ?2, category = ?3, modification_date = ?4,
                              file_size = ?5, unique_hash = ?6
             WHERE id = ?7",
            params![
                info.name,
                info.status.as_i64(),
                info.category.as_i64(),
                to_secs(info.modification_date),
                info.file_size as i64,
                info.unique_hash,
                info.id,
            ],
        )?;
        Ok(())
    }

    fn move_item(&mut self, id: ItemId, album_id: AlbumId, name: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET album = ?1, name = ?2 WHERE id = ?3",
            params![album_id, name, id],
        )?;
        Ok(())
    }

    fn set_item_status(&mut self, id: ItemId, status: ItemStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET status = ?1 WHERE id = ?2",
            params![status.as_i64(), id],
        )?;
        Ok(())
    }

    fn remove_items_from_album(&mut self, album_id: AlbumId, ids: &[ItemId]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "UPDATE items SET album = NULL, status = ?1 WHERE id = ?2 AND album = ?3",
        )?;
        for id in ids {
            stmt.execute(params![ItemStatus::Trashed.as_i64(), id, album_id])?;
        }
        Ok(())
    }

    fn find_trashed_identical(&self, info: &ItemScanInfo) -> Result<Option<ItemId>> {
        let (Some(hash), Some(date)) = (info.unique_hash.as_deref(), to_secs(info.modification_date)) else {
            return Ok(None);
        };
        let id = self
            .conn
            .query_row(
                "SELECT id FROM items
                 WHERE status = ?1 AND album IS NULL AND name = ?2 AND file_size = ?3
                   AND modification_date = ?4 AND unique_hash = ?5
                 ORDER BY id DESC LIMIT 1",
                params![
                    ItemStatus::Trashed.as_i64(),
                    info.name,
                    info.file_size as i64,
                    date,
                    hash
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn identical_items(&self, hash: &str, size: u64, exclude: Option<ItemId>) -> Result<Vec<ItemScanInfo>> {
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM items
                 WHERE unique_hash = ?1 AND file_size = ?2 AND status != ?3 AND id != ?4"
            ),
            params![
                hash,
                size as i64,
                ItemStatus::Obsolete.as_i64(),
                exclude.unwrap_or(-1)
            ],
        )
    }

    fn copy_item_attributes(&mut self, src: ItemId, dst: ItemId) -> Result<()> {
        self.conn.execute(
            "INSERT INTO item_information (item_id, rating, creation_date, color_label, pick_label)
             SELECT ?2, rating, creation_date, color_label, pick_label
             FROM item_information WHERE item_id = ?1
             ON CONFLICT(item_id) DO UPDATE SET rating = excluded.rating,
                                                creation_date = excluded.creation_date,
                                                color_label = excluded.color_label,
                                                pick_label = excluded.pick_label",
            params![src, dst],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO item_tags (item_id, tag_id)
             SELECT ?2, item_tags.tag_id FROM item_tags JOIN tags ON tags.id = item_tags.tag_id
             WHERE item_tags.item_id = ?1 AND tags.internal = 0",
            params![src, dst],
        )?;
        self.conn.execute(
            "INSERT OR REPLACE INTO item_positions (item_id, latitude, longitude, altitude)
             SELECT ?2, latitude, longitude, altitude FROM item_positions WHERE item_id = ?1",
            params![src, dst],
        )?;
        self.conn.execute(
            "INSERT INTO item_comments (item_id, comment)
             SELECT ?2, comment FROM item_comments WHERE item_id = ?1
               AND comment NOT IN (SELECT comment FROM item_comments WHERE item_id = ?2)",
            params![src, dst],
        )?;
        Ok(())
    }

    fn clear_item_metadata(&mut self, id: ItemId) -> Result<()> {
        self.conn.execute(
            "UPDATE item_information SET rating = NULL, creation_date = NULL, color_label = NULL,
                                         pick_label = NULL, history = NULL
             WHERE item_id = ?1",
            params![id],
        )?;
        self.conn
            .execute("DELETE FROM item_positions WHERE item_id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM item_comments WHERE item_id = ?1", params![id])?;
        self.conn.execute(
            "DELETE FROM item_tags WHERE item_id = ?1
               AND tag_id IN (SELECT id FROM tags WHERE internal = 0)",
            params![id],
        )?;
        Ok(())
    }

    fn apply_item_metadata(&mut self, id: ItemId, metadata: &ItemMetadata) -> Result<()> {
        self.conn.execute(
            "INSERT INTO item_information (item_id, rating, creation_date, uuid) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id) DO UPDATE SET
                 rating = COALESCE(excluded.rating, rating),
                 creation_date = COALESCE(excluded.creation_date, creation_date),
                 uuid = COALESCE(excluded.uuid, uuid)",
            params![
                id,
                metadata.rating,
                to_secs(metadata.creation_date),
                metadata.uuid
            ],
        )?;
        if let Some(comment) = &metadata.comment {
            self.conn.execute(
                "INSERT INTO item_comments (item_id, comment)
                 SELECT ?1, ?2 WHERE NOT EXISTS
                     (SELECT 1 FROM item_comments WHERE item_id = ?1 AND comment = ?2)",
                params![id, comment],
            )?;
        }
        for name in &metadata.tags {
            let tag = self.public_tag(name)?;
            self.conn.execute(
                "INSERT OR IGNORE INTO item_tags (item_id, tag_id) VALUES (?1, ?2)",
                params![id, tag],
            )?;
        }
        if let Some(position) = &metadata.position {
            self.conn.execute(
                "INSERT OR REPLACE INTO item_positions (item_id, latitude, longitude, altitude)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, position.latitude, position.longitude, position.altitude],
            )?;
        }
        Ok(())
    }

    fn set_image_history(&mut self, id: ItemId, history: &[HistoryReference]) -> Result<()> {
        let encoded = serde_json::to_string(history)?;
        self.conn.execute(
            "INSERT INTO item_information (item_id, history) VALUES (?1, ?2)
             ON CONFLICT(item_id) DO UPDATE SET history = excluded.history",
            params![id, encoded],
        )?;
        Ok(())
    }

    fn image_history(&self, id: ItemId) -> Result<Vec<HistoryReference>> {
        let encoded = self
            .conn
            .query_row(
                "SELECT history FROM item_information WHERE item_id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        match encoded {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(Vec::new()),
        }
    }

    fn item_ids_by_uuid(&self, uuid: &str) -> Result<Vec<ItemId>> {
        self.query_ids(
            "SELECT items.id FROM item_information JOIN items ON items.id = item_information.item_id
             WHERE item_information.uuid = ?1 AND items.status != ?2 ORDER BY items.id",
            params![uuid, ItemStatus::Obsolete.as_i64()],
        )
    }

    fn add_image_relation(&mut self, subject: ItemId, object: ItemId, kind: RelationType) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO item_relations (subject, object, type) VALUES (?1, ?2, ?3)",
            params![subject, object, kind.as_i64()],
        )?;
        Ok(())
    }

    fn image_relations(&self, id: ItemId, kind: RelationType) -> Result<Vec<(ItemId, ItemId)>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject, object FROM item_relations
             WHERE type = ?1 AND (subject = ?2 OR object = ?2)",
        )?;
        let rows = stmt.query_map(params![kind.as_i64(), id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    fn one_related_image_each(&self, ids: &[ItemId], kind: RelationType) -> Result<Vec<ItemId>> {
        let mut stmt = self.conn.prepare(
            "SELECT CASE WHEN subject = ?1 THEN object ELSE subject END FROM item_relations
             WHERE type = ?2 AND (subject = ?1 OR object = ?1) LIMIT 1",
        )?;
        let mut related = Vec::new();
        for id in ids {
            if let Some(other) = stmt
                .query_row(params![id, kind.as_i64()], |row| row.get(0))
                .optional()?
            {
                related.push(other);
            }
        }
        Ok(related)
    }

    fn get_or_create_internal_tag(&mut self, name: &str) -> Result<TagId> {
        self.conn.execute(
            "INSERT OR IGNORE INTO tags (name, internal) VALUES (?1, 1)",
            params![name],
        )?;
        let id = self
            .conn
            .query_row("SELECT id FROM tags WHERE name = ?1", params![name], |row| row.get(0))?;
        Ok(id)
    }

    fn item_ids_in_tag(&self, tag: TagId) -> Result<Vec<ItemId>> {
        self.query_ids(
            "SELECT item_id FROM item_tags WHERE tag_id = ?1 ORDER BY item_id",
            params![tag],
        )
    }

    fn add_tags_to_items(&mut self, ids: &[ItemId], tags: &[TagId]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("INSERT OR IGNORE INTO item_tags (item_id, tag_id) VALUES (?1, ?2)")?;
        for id in ids {
            for tag in tags {
                stmt.execute(params![id, tag])?;
            }
        }
        Ok(())
    }

    fn remove_tags_from_items(&mut self, ids: &[ItemId], tags: &[TagId]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("DELETE FROM item_tags WHERE item_id = ?1 AND tag_id = ?2")?;
        for id in ids {
            for tag in tags {
                stmt.execute(params![id, tag])?;
            }
        }
        Ok(())
    }
}

/// Thumbnail database keyed by content fingerprint
pub struct SqliteThumbnailIndex {
    conn: Connection,
}

impl SqliteThumbnailIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| ScanError::from(e).with_path(path))?;
        let index = Self { conn };
        index.init_schema()?;
        Ok(index)
    }

    pub fn open_memory() -> Result<Self> {
        let index = Self {
            conn: Connection::open_in_memory()?,
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS thumbnails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                modification_date INTEGER,
                data BLOB
            );

            CREATE TABLE IF NOT EXISTS unique_hashes (
                unique_hash TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                thumb_id INTEGER NOT NULL,
                UNIQUE(unique_hash, file_size)
            );
            ",
        )?;
        Ok(())
    }

    /// Store a rendered thumbnail, returning its id
    pub fn insert_thumbnail(&mut self, modification_date: DateTime<Utc>, data: &[u8]) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO thumbnails (modification_date, data) VALUES (?1, ?2)",
            params![modification_date.timestamp(), data],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn thumbnail_modification_date(&self, thumbnail_id: i64) -> Result<Option<DateTime<Utc>>> {
        let secs = self
            .conn
            .query_row(
                "SELECT modification_date FROM thumbnails WHERE id = ?1",
                params![thumbnail_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(from_secs(secs))
    }
}

impl ThumbnailIndex for SqliteThumbnailIndex {
    fn find_by_hash(&self, hash: &str, size: u64) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT thumb_id FROM unique_hashes WHERE unique_hash = ?1 AND file_size = ?2",
                params![hash, size as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn insert_unique_hash(&mut self, hash: &str, size: u64, thumbnail_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO unique_hashes (unique_hash, file_size, thumb_id) VALUES (?1, ?2, ?3)",
            params![hash, size as i64, thumbnail_id],
        )?;
        Ok(())
    }

    fn update_modification_date(&mut self, thumbnail_id: i64, date: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE thumbnails SET modification_date = ?1 WHERE id = ?2",
            params![date.timestamp(), thumbnail_id],
        )?;
        Ok(())
    }

    fn replace_unique_hash(&mut self, old_hash: &str, old_size: u64, new_hash: &str, new_size: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE OR REPLACE unique_hashes SET unique_hash = ?1, file_size = ?2
             WHERE unique_hash = ?3 AND file_size = ?4",
            params![new_hash, new_size as i64, old_hash, old_size as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use crate::store::{internal_tags, with_transaction};
    use chrono::TimeZone;

    fn item(album: AlbumId, name: &str, hash: &str) -> ItemScanInfo {
        ItemScanInfo {
            album_id: Some(album),
            name: name.to_string(),
            category: Category::Image,
            modification_date: Some(Utc.with_ymd_and_hms(2021, 5, 1, 12, 0, 0).unwrap()),
            file_size: 100,
            unique_hash: Some(hash.to_string()),
            ..Default::default()
        }
    }

    fn store_with_album() -> (SqliteStore, AlbumId) {
        let mut store = SqliteStore::open_memory().unwrap();
        let location = store.add_location(Path::new("/collection")).unwrap();
        let album = store.add_album(location, "/a", None).unwrap();
        (store, album)
    }

    #[test]
    fn test_open_memory() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.locations().unwrap().is_empty());
        assert!(store.album_short_infos().unwrap().is_empty());
    }

    #[test]
    fn test_add_location_is_idempotent() {
        let mut store = SqliteStore::open_memory().unwrap();
        let a = store.add_location(Path::new("/c")).unwrap();
        let b = store.add_location(Path::new("/c")).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.locations().unwrap().len(), 1);
    }

    #[test]
    fn test_nested_transactions() {
        let (mut store, album) = store_with_album();

        store.begin_transaction().unwrap();
        let kept = store.add_item(&item(album, "kept.jpg", "h1")).unwrap();
        let result: Result<()> = with_transaction(&mut store, |store| {
            store.add_item(&item(album, "dropped.jpg", "h2"))?;
            Err(ScanError::database_error("fail inner"))
        });
        assert!(result.is_err());
        store.commit_transaction().unwrap();

        assert!(store.item_scan_info(kept).unwrap().is_some());
        assert_eq!(store.item_id(album, "dropped.jpg").unwrap(), None);
        assert!(store.commit_transaction().is_err());
    }

    #[test]
    fn test_remove_and_find_trashed_identical() {
        let (mut store, album) = store_with_album();
        let info = item(album, "z.jpg", "h1");
        let id = store.add_item(&info).unwrap();

        assert_eq!(store.find_trashed_identical(&info).unwrap(), None);
        store.remove_items_from_album(album, &[id]).unwrap();

        let removed = store.item_scan_info(id).unwrap().unwrap();
        assert_eq!(removed.status, ItemStatus::Trashed);
        assert_eq!(removed.album_id, None);
        assert_eq!(store.find_trashed_identical(&info).unwrap(), Some(id));

        let renamed = ItemScanInfo {
            name: "other.jpg".to_string(),
            ..info
        };
        assert_eq!(store.find_trashed_identical(&renamed).unwrap(), None);
    }

    #[test]
    fn test_identical_items_skip_obsolete() {
        let (mut store, album) = store_with_album();
        let a = store.add_item(&item(album, "a.jpg", "same")).unwrap();
        let b = store.add_item(&item(album, "b.jpg", "same")).unwrap();
        store.add_item(&item(album, "c.jpg", "different")).unwrap();
        store.set_item_status(b, ItemStatus::Obsolete).unwrap();

        let found: Vec<_> = store
            .identical_items("same", 100, None)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(found, vec![a]);
        assert!(store.identical_items("same", 100, Some(a)).unwrap().is_empty());
    }

    #[test]
    fn test_copy_item_attributes_skips_internal_tags() {
        let (mut store, album) = store_with_album();
        let src = store.add_item(&item(album, "a.jpg", "h")).unwrap();
        let dst = store.add_item(&item(album, "b.jpg", "h")).unwrap();
        store
            .apply_item_metadata(
                src,
                &ItemMetadata {
                    rating: Some(5),
                    comment: Some("sunset".to_string()),
                    tags: vec!["beach".to_string()],
                    position: Some(GpsPosition {
                        latitude: 43.1,
                        longitude: 5.9,
                        altitude: None,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        store.set_item_labels(src, Some(2), Some(1)).unwrap();
        let internal = store
            .get_or_create_internal_tag(internal_tags::NEED_TAGGING_HISTORY_GRAPH)
            .unwrap();
        store.add_tags_to_items(&[src], &[internal]).unwrap();

        store.copy_item_attributes(src, dst).unwrap();

        assert_eq!(store.item_rating(dst).unwrap(), Some(5));
        assert_eq!(store.item_labels(dst).unwrap(), (Some(2), Some(1)));
        assert_eq!(store.item_tag_names(dst).unwrap(), vec!["beach".to_string()]);
        assert_eq!(store.item_comments(dst).unwrap(), vec!["sunset".to_string()]);
        assert!(store.item_position(dst).unwrap().is_some());
        assert_eq!(store.item_ids_in_tag(internal).unwrap(), vec![src]);
    }

    #[test]
    fn test_clear_item_metadata_keeps_internal_tags() {
        let (mut store, album) = store_with_album();
        let id = store.add_item(&item(album, "a.jpg", "h")).unwrap();
        store
            .apply_item_metadata(
                id,
                &ItemMetadata {
                    rating: Some(3),
                    tags: vec!["x".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        let internal = store
            .get_or_create_internal_tag(internal_tags::NEED_RESOLVING_HISTORY)
            .unwrap();
        store.add_tags_to_items(&[id], &[internal]).unwrap();

        store.clear_item_metadata(id).unwrap();
        assert_eq!(store.item_rating(id).unwrap(), None);
        assert!(store.item_tag_names(id).unwrap().is_empty());
        assert_eq!(store.item_ids_in_tag(internal).unwrap(), vec![id]);
    }

    #[test]
    fn test_stale_album_lifecycle() {
        let (mut store, album) = store_with_album();
        store.make_stale_album(album).unwrap();
        assert!(store.album_short_infos().unwrap().is_empty());
        // path can be reused by a new album while the stale row lingers
        let location = store.locations().unwrap()[0].id;
        let fresh = store.add_album(location, "/a", None).unwrap();
        assert_ne!(fresh, album);
        assert_eq!(store.delete_stale_albums().unwrap(), 1);
        assert_eq!(store.delete_stale_albums().unwrap(), 0);
    }

    #[test]
    fn test_rename_album_and_copy_properties() {
        let (mut store, album) = store_with_album();
        let location = store.locations().unwrap()[0].id;
        let date = Utc.with_ymd_and_hms(2019, 8, 1, 0, 0, 0).unwrap();
        let src = store.add_album(location, "/src", Some(date)).unwrap();
        store.copy_album_properties(src, album).unwrap();
        store.rename_album(album, location, "/b").unwrap();

        assert_eq!(store.album_for_path(location, "/b").unwrap(), Some(album));
        assert_eq!(store.album_for_path(location, "/a").unwrap(), None);
    }

    #[test]
    fn test_settings() {
        let mut store = SqliteStore::open_memory().unwrap();
        assert_eq!(store.setting("Scanned").unwrap(), None);
        store.set_setting("Scanned", Some("2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(
            store.setting("Scanned").unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        store.set_setting("Scanned", None).unwrap();
        assert_eq!(store.setting("Scanned").unwrap(), None);
    }

    #[test]
    fn test_name_filter_overrides() {
        let mut store = SqliteStore::open_memory().unwrap();
        store.set_setting(SETTING_IMAGE_FILTER, Some("*.JPG png")).unwrap();
        store.set_setting(SETTING_IGNORE_DIRECTORIES, Some("tmp cache")).unwrap();
        let filters = store.name_filters().unwrap();
        assert!(filters.accepts("a.jpg"));
        assert!(!filters.accepts("a.gif"));
        assert!(filters.accepts("a.mp4"));
        assert!(filters.is_ignored_dir("cache"));
        assert!(!filters.is_ignored_dir("@eaDir"));
    }

    #[test]
    fn test_relations() {
        let (mut store, album) = store_with_album();
        let original = store.add_item(&item(album, "a.jpg", "1")).unwrap();
        let edited = store.add_item(&item(album, "b.jpg", "2")).unwrap();
        let lonely = store.add_item(&item(album, "c.jpg", "3")).unwrap();
        store
            .add_image_relation(edited, original, RelationType::DerivedFrom)
            .unwrap();
        store
            .add_image_relation(edited, original, RelationType::DerivedFrom)
            .unwrap();

        assert_eq!(
            store.image_relations(original, RelationType::DerivedFrom).unwrap(),
            vec![(edited, original)]
        );
        assert!(store.image_relations(original, RelationType::Grouped).unwrap().is_empty());
        assert_eq!(
            store
                .one_related_image_each(&[original, lonely], RelationType::DerivedFrom)
                .unwrap(),
            vec![edited]
        );
    }

    #[test]
    fn test_history_and_uuid_lookup() {
        let (mut store, album) = store_with_album();
        let id = store.add_item(&item(album, "a.jpg", "1")).unwrap();
        let history = vec![HistoryReference {
            uuid: Some("u-1".to_string()),
            ..Default::default()
        }];
        store.set_image_history(id, &history).unwrap();
        store
            .apply_item_metadata(
                id,
                &ItemMetadata {
                    uuid: Some("self".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(store.image_history(id).unwrap(), history);
        assert_eq!(store.item_ids_by_uuid("self").unwrap(), vec![id]);
        assert!(store.item_ids_by_uuid("u-1").unwrap().is_empty());
    }

    #[test]
    fn test_thumbnail_index_relink() {
        let mut thumbs = SqliteThumbnailIndex::open_memory().unwrap();
        let date = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let thumb = thumbs.insert_thumbnail(date, b"jpeg").unwrap();
        thumbs.insert_unique_hash("old", 10, thumb).unwrap();

        thumbs.replace_unique_hash("old", 10, "new", 12).unwrap();
        let later = Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap();
        thumbs.update_modification_date(thumb, later).unwrap();

        assert_eq!(thumbs.find_by_hash("old", 10).unwrap(), None);
        assert_eq!(thumbs.find_by_hash("new", 12).unwrap(), Some(thumb));
        assert_eq!(thumbs.thumbnail_modification_date(thumb).unwrap(), Some(later));
    }
}
