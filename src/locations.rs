//! Mapping between absolute paths and collection locations

use std::path::{Path, PathBuf};

use crate::models::{CollectionLocation, LocationId};

/// Resolves paths to the collection locations that contain them
pub trait LocationProvider {
    /// Every location the scanner may walk right now
    fn all_available_locations(&self) -> Vec<CollectionLocation>;

    fn location_for_id(&self, id: LocationId) -> Option<CollectionLocation>;

    /// The location whose root is exactly `root`
    fn location_for_album_root_path(&self, root: &Path) -> Option<CollectionLocation>;

    /// The location containing `path`, preferring the deepest root
    fn location_for_path(&self, path: &Path) -> Option<CollectionLocation>;

    /// Album path of a directory, `/` for the root itself
    fn album_path(&self, dir: &Path) -> Option<String> {
        let location = self.location_for_path(dir)?;
        album_path_under(&location.root_path, dir)
    }
}

/// Album path of `dir` relative to `root`
pub fn album_path_under(root: &Path, dir: &Path) -> Option<String> {
    let relative = dir.strip_prefix(root).ok()?;
    let components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(format!("/{}", components.join("/")))
}

/// Fixed list of locations, as loaded from the store at startup
#[derive(Debug, Clone, Default)]
pub struct StaticLocations {
    locations: Vec<CollectionLocation>,
}

impl StaticLocations {
    pub fn new(locations: Vec<CollectionLocation>) -> Self {
        Self { locations }
    }

    pub fn push(&mut self, location: CollectionLocation) {
        self.locations.push(location);
    }
}

impl LocationProvider for StaticLocations {
    fn all_available_locations(&self) -> Vec<CollectionLocation> {
        self.locations
            .iter()
            .filter(|l| l.is_available())
            .cloned()
            .collect()
    }

    fn location_for_id(&self, id: LocationId) -> Option<CollectionLocation> {
        self.locations.iter().find(|l| l.id == id).cloned()
    }

    fn location_for_album_root_path(&self, root: &Path) -> Option<CollectionLocation> {
        self.locations.iter().find(|l| l.root_path == root).cloned()
    }

    fn location_for_path(&self, path: &Path) -> Option<CollectionLocation> {
        self.locations
            .iter()
            .filter(|l| path.starts_with(&l.root_path))
            .max_by_key(|l| l.root_path.components().count())
            .cloned()
    }
}

/// Join an album path and a child directory name
pub fn sub_album_path(album: &str, name: &str) -> String {
    if album == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", album, name)
    }
}

/// Remove paths whose ancestor is also in the list
pub fn prune_nested_paths(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort();
    paths.dedup();
    let mut kept: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for path in paths {
        if !kept.iter().any(|parent| path.starts_with(parent)) {
            kept.push(path);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocationAvailability;

    fn provider() -> StaticLocations {
        let mut unavailable = CollectionLocation::new(3, "/mnt/usb");
        unavailable.availability = LocationAvailability::Unavailable;
        StaticLocations::new(vec![
            CollectionLocation::new(1, "/media"),
            CollectionLocation::new(2, "/media/phone"),
            unavailable,
        ])
    }

    #[test]
    fn test_deepest_root_wins() {
        let locations = provider();
        let found = locations.location_for_path(Path::new("/media/phone/dcim/a.jpg"));
        assert_eq!(found.map(|l| l.id), Some(2));
        let found = locations.location_for_path(Path::new("/media/photos"));
        assert_eq!(found.map(|l| l.id), Some(1));
        assert!(locations.location_for_path(Path::new("/home")).is_none());
        // component-wise, not string prefix
        let found = locations.location_for_path(Path::new("/media/phoneold"));
        assert_eq!(found.map(|l| l.id), Some(1));
    }

    #[test]
    fn test_album_path() {
        let locations = provider();
        assert_eq!(locations.album_path(Path::new("/media")), Some("/".to_string()));
        assert_eq!(
            locations.album_path(Path::new("/media/2020/trip")),
            Some("/2020/trip".to_string())
        );
        assert_eq!(locations.album_path(Path::new("/elsewhere")), None);
    }

    #[test]
    fn test_unavailable_locations_are_not_scanned() {
        let ids: Vec<_> = provider().all_available_locations().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(provider().location_for_id(3).is_some());
        assert!(provider()
            .location_for_album_root_path(Path::new("/media/phone"))
            .is_some());
    }

    #[test]
    fn test_sub_album_path() {
        assert_eq!(sub_album_path("/", "a"), "/a");
        assert_eq!(sub_album_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_prune_nested_paths() {
        let pruned = prune_nested_paths(vec![
            PathBuf::from("/c/a/b"),
            PathBuf::from("/c/a"),
            PathBuf::from("/c/ab"),
            PathBuf::from("/c/a"),
        ]);
        assert_eq!(pruned, vec![PathBuf::from("/c/a"), PathBuf::from("/c/ab")]);
    }
}
