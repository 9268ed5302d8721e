//! Version history post-processing
//!
//! Stage 2 turns history references read from files into `DerivedFrom`
//! relations. Stage 3 tags every item of a relation cloud as original,
//! intermediate or current version. Both run one transaction per item.

use log::debug;
use std::collections::{BTreeSet, VecDeque};

use crate::error::Result;
use crate::models::{sort_for_identity, HistoryReference, ItemId, RelationType};
use crate::scanner::Flow;
use crate::store::{internal_tags, with_transaction, ItemStore};

/// Result of resolving one item's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryResolution {
    /// Every reference was matched to an item
    pub fully_resolved: bool,
    /// Root of the relation cloud, now tagged for stage 3
    pub root: Option<ItemId>,
}

fn resolve_reference<S: ItemStore + ?Sized>(
    store: &S,
    id: ItemId,
    reference: &HistoryReference,
) -> Result<Vec<ItemId>> {
    if let Some(uuid) = &reference.uuid {
        let found: Vec<ItemId> = store
            .item_ids_by_uuid(uuid)?
            .into_iter()
            .filter(|other| *other != id)
            .collect();
        if !found.is_empty() {
            return Ok(found);
        }
    }
    if let (Some(hash), Some(size)) = (&reference.unique_hash, reference.file_size) {
        let mut candidates = store.identical_items(hash, size, Some(id))?;
        sort_for_identity(&mut candidates);
        return Ok(candidates.first().map(|c| c.id).into_iter().collect());
    }
    Ok(Vec::new())
}

/// Follow `DerivedFrom` edges from `id` down to the original
fn version_root<S: ItemStore + ?Sized>(store: &S, id: ItemId) -> Result<ItemId> {
    let mut current = id;
    let mut visited = BTreeSet::from([id]);
    loop {
        let next = store
            .image_relations(current, RelationType::DerivedFrom)?
            .into_iter()
            .filter(|(subject, _)| *subject == current)
            .map(|(_, object)| object)
            .filter(|object| !visited.contains(object))
            .min();
        match next {
            Some(object) => {
                visited.insert(object);
                current = object;
            }
            None => return Ok(current),
        }
    }
}

/// Every item connected to `id` by `DerivedFrom` relations, with the edges
pub fn relation_cloud<S: ItemStore + ?Sized>(
    store: &S,
    id: ItemId,
) -> Result<(BTreeSet<ItemId>, BTreeSet<(ItemId, ItemId)>)> {
    let mut nodes = BTreeSet::from([id]);
    let mut edges = BTreeSet::new();
    let mut queue = VecDeque::from([id]);
    while let Some(current) = queue.pop_front() {
        for (subject, object) in store.image_relations(current, RelationType::DerivedFrom)? {
            edges.insert((subject, object));
            for other in [subject, object] {
                if nodes.insert(other) {
                    queue.push_back(other);
                }
            }
        }
    }
    Ok((nodes, edges))
}

/// Stage 2 for one item
pub fn resolve_image_history<S: ItemStore + ?Sized>(store: &mut S, id: ItemId) -> Result<HistoryResolution> {
    let resolving_tag = store.get_or_create_internal_tag(internal_tags::NEED_RESOLVING_HISTORY)?;
    let history = store.image_history(id)?;

    let mut targets = BTreeSet::new();
    let mut unresolved = false;
    for reference in &history {
        let found = resolve_reference(store, id, reference)?;
        if found.is_empty() {
            unresolved = true;
        }
        targets.extend(found);
    }

    for target in &targets {
        store.add_image_relation(id, *target, RelationType::DerivedFrom)?;
    }
    if !unresolved {
        store.remove_tags_from_items(&[id], &[resolving_tag])?;
    }
    if targets.is_empty() {
        return Ok(HistoryResolution {
            fully_resolved: !unresolved,
            root: None,
        });
    }

    let root = version_root(store, id)?;
    let tagging_tag = store.get_or_create_internal_tag(internal_tags::NEED_TAGGING_HISTORY_GRAPH)?;
    store.add_tags_to_items(&[root], &[tagging_tag])?;
    debug!(
        "Resolved history of item {}: {} sources, root {}",
        id,
        targets.len(),
        root
    );

    Ok(HistoryResolution {
        fully_resolved: !unresolved,
        root: Some(root),
    })
}

/// Stage 3 for one item: retag the version roles of its relation cloud
pub fn tag_image_history_graph<S: ItemStore + ?Sized>(store: &mut S, id: ItemId) -> Result<()> {
    if store.item_scan_info(id)?.is_none() {
        return Ok(());
    }

    let (nodes, edges) = relation_cloud(store, id)?;
    let original = store.get_or_create_internal_tag(internal_tags::ORIGINAL_VERSION)?;
    let current = store.get_or_create_internal_tag(internal_tags::CURRENT_VERSION)?;
    let intermediate = store.get_or_create_internal_tag(internal_tags::INTERMEDIATE_VERSION)?;
    let needs_tagging = store.get_or_create_internal_tag(internal_tags::NEED_TAGGING_HISTORY_GRAPH)?;

    let all: Vec<ItemId> = nodes.iter().copied().collect();
    store.remove_tags_from_items(&all, &[original, current, intermediate, needs_tagging])?;

    if edges.is_empty() {
        return Ok(());
    }

    let (mut originals, mut intermediates, mut currents) = (Vec::new(), Vec::new(), Vec::new());
    for node in &nodes {
        let derives = edges.iter().any(|(subject, _)| subject == node);
        let has_derivatives = edges.iter().any(|(_, object)| object == node);
        match (derives, has_derivatives) {
            (false, true) => originals.push(*node),
            (true, true) => intermediates.push(*node),
            (true, false) => currents.push(*node),
            (false, false) => {}
        }
    }

    store.add_tags_to_items(&originals, &[original])?;
    store.add_tags_to_items(&intermediates, &[intermediate])?;
    store.add_tags_to_items(&currents, &[current])?;
    Ok(())
}

/// Run stage 2 over `ids`; roots are added to `record` when given
pub(crate) fn run_stage2<S: ItemStore + ?Sized>(
    store: &mut S,
    ids: &[ItemId],
    mut record: Option<&mut BTreeSet<ItemId>>,
    keep_going: impl Fn() -> bool,
) -> Result<Flow> {
    for id in ids {
        if !keep_going() {
            return Ok(Flow::Cancelled);
        }
        let resolution = with_transaction(store, |store| resolve_image_history(store, *id))?;
        if let (Some(root), Some(record)) = (resolution.root, record.as_deref_mut()) {
            record.insert(root);
        }
    }
    Ok(Flow::Continue)
}

pub(crate) fn run_stage3<S: ItemStore + ?Sized>(
    store: &mut S,
    ids: &[ItemId],
    keep_going: impl Fn() -> bool,
) -> Result<Flow> {
    for id in ids {
        if !keep_going() {
            return Ok(Flow::Cancelled);
        }
        with_transaction(store, |store| tag_image_history_graph(store, *id))?;
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{AlbumId, ItemMetadata, ItemScanInfo};
    use std::path::Path;

    fn setup() -> (SqliteStore, AlbumId) {
        let mut store = SqliteStore::open_memory().unwrap();
        let location = store.add_location(Path::new("/c")).unwrap();
        let album = store.add_album(location, "/", None).unwrap();
        (store, album)
    }

    fn add(store: &mut SqliteStore, album: AlbumId, name: &str, hash: &str, uuid: Option<&str>) -> ItemId {
        let id = store
            .add_item(&ItemScanInfo {
                album_id: Some(album),
                name: name.to_string(),
                file_size: 10,
                unique_hash: Some(hash.to_string()),
                ..Default::default()
            })
            .unwrap();
        if let Some(uuid) = uuid {
            store
                .apply_item_metadata(
                    id,
                    &ItemMetadata {
                        uuid: Some(uuid.to_string()),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        id
    }

    fn tagged(store: &mut SqliteStore, tag: &str) -> Vec<ItemId> {
        let tag = store.get_or_create_internal_tag(tag).unwrap();
        store.item_ids_in_tag(tag).unwrap()
    }

    #[test]
    fn test_resolve_by_uuid_and_hash() {
        let (mut store, album) = setup();
        let original = add(&mut store, album, "a.jpg", "ha", Some("uuid-a"));
        let edited = add(&mut store, album, "a_v1.jpg", "hb", None);
        let twice = add(&mut store, album, "a_v2.jpg", "hc", None);
        store
            .set_image_history(
                edited,
                &[HistoryReference {
                    uuid: Some("uuid-a".to_string()),
                    ..Default::default()
                }],
            )
            .unwrap();
        store
            .set_image_history(
                twice,
                &[HistoryReference {
                    unique_hash: Some("hb".to_string()),
                    file_size: Some(10),
                    ..Default::default()
                }],
            )
            .unwrap();

        let first = resolve_image_history(&mut store, edited).unwrap();
        assert!(first.fully_resolved);
        assert_eq!(first.root, Some(original));
        let second = resolve_image_history(&mut store, twice).unwrap();
        assert_eq!(second.root, Some(original));

        let (nodes, edges) = relation_cloud(&store, original).unwrap();
        assert_eq!(nodes, BTreeSet::from([original, edited, twice]));
        assert_eq!(edges, BTreeSet::from([(edited, original), (twice, edited)]));
        assert_eq!(
            tagged(&mut store, internal_tags::NEED_TAGGING_HISTORY_GRAPH),
            vec![original]
        );
    }

    #[test]
    fn test_unresolved_keeps_todo_tag() {
        let (mut store, album) = setup();
        let edited = add(&mut store, album, "b.jpg", "hb", None);
        let todo = store
            .get_or_create_internal_tag(internal_tags::NEED_RESOLVING_HISTORY)
            .unwrap();
        store.add_tags_to_items(&[edited], &[todo]).unwrap();
        store
            .set_image_history(
                edited,
                &[HistoryReference {
                    uuid: Some("missing".to_string()),
                    ..Default::default()
                }],
            )
            .unwrap();

        let resolution = resolve_image_history(&mut store, edited).unwrap();
        assert!(!resolution.fully_resolved);
        assert_eq!(resolution.root, None);
        assert_eq!(store.item_ids_in_tag(todo).unwrap(), vec![edited]);
    }

    #[test]
    fn test_tag_history_graph_roles() {
        let (mut store, album) = setup();
        let original = add(&mut store, album, "a.jpg", "1", None);
        let middle = add(&mut store, album, "b.jpg", "2", None);
        let current = add(&mut store, album, "c.jpg", "3", None);
        store
            .add_image_relation(middle, original, RelationType::DerivedFrom)
            .unwrap();
        store
            .add_image_relation(current, middle, RelationType::DerivedFrom)
            .unwrap();
        let todo = store
            .get_or_create_internal_tag(internal_tags::NEED_TAGGING_HISTORY_GRAPH)
            .unwrap();
        store.add_tags_to_items(&[original], &[todo]).unwrap();

        tag_image_history_graph(&mut store, current).unwrap();

        assert_eq!(tagged(&mut store, internal_tags::ORIGINAL_VERSION), vec![original]);
        assert_eq!(tagged(&mut store, internal_tags::INTERMEDIATE_VERSION), vec![middle]);
        assert_eq!(tagged(&mut store, internal_tags::CURRENT_VERSION), vec![current]);
        assert!(store.item_ids_in_tag(todo).unwrap().is_empty());
    }

    #[test]
    fn test_stage_runners_stop_on_cancel() {
        let (mut store, album) = setup();
        let a = add(&mut store, album, "a.jpg", "1", None);
        let b = add(&mut store, album, "b.jpg", "2", None);
        store.add_image_relation(b, a, RelationType::DerivedFrom).unwrap();

        let flow = run_stage3(&mut store, &[b], || false).unwrap();
        assert_eq!(flow, Flow::Cancelled);
        assert!(tagged(&mut store, internal_tags::CURRENT_VERSION).is_empty());

        let flow = run_stage3(&mut store, &[b], || true).unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(tagged(&mut store, internal_tags::CURRENT_VERSION), vec![b]);

        let mut roots = BTreeSet::new();
        store
            .set_image_history(
                b,
                &[HistoryReference {
                    unique_hash: Some("1".to_string()),
                    file_size: Some(10),
                    ..Default::default()
                }],
            )
            .unwrap();
        run_stage2(&mut store, &[b], Some(&mut roots), || true).unwrap();
        assert_eq!(roots, BTreeSet::from([a]));
    }
}
