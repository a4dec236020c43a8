//! The hierarchical object store.
//!
//! Objects are indexed by type code and id under their parent node; the
//! path from the root is fixed by each type's declared parent chain. Locks
//! are per-node and held only for the duration of a single map or record
//! operation; traversals clone `Arc`s and snapshots instead of holding
//! the tree locked.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use mw_codec::escape::unescape;
use mw_protocol::{Prefix, ProtocolError};

use crate::error::CoreError;
use crate::object::DataObject;
use crate::registry::{TypeRegistry, TypeSpec};
use crate::sequencer::FullFrame;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TreeNode {
    object: RwLock<Option<DataObject>>,
    children: RwLock<HashMap<String, HashMap<String, Arc<TreeNode>>>>,
}

impl TreeNode {
    fn empty() -> Arc<TreeNode> {
        Arc::new(TreeNode {
            object: RwLock::new(None),
            children: RwLock::new(HashMap::new()),
        })
    }

    /// Clone the object record out from under the lock.
    pub fn snapshot(&self) -> Option<DataObject> {
        self.object.read().expect("tree poisoned").clone()
    }

    /// Mutate the object record in place.
    pub fn with_object_mut<R>(&self, f: impl FnOnce(&mut DataObject) -> R) -> Option<R> {
        let mut guard = self.object.write().expect("tree poisoned");
        guard.as_mut().map(f)
    }

    fn set_object(&self, obj: DataObject) {
        *self.object.write().expect("tree poisoned") = Some(obj);
    }

    fn child(&self, type_code: &str, id: &str) -> Option<Arc<TreeNode>> {
        self.children
            .read()
            .expect("tree poisoned")
            .get(type_code)
            .and_then(|by_id| by_id.get(id))
            .cloned()
    }
}

/// Outcome of applying one inbound frame to the tree.
#[derive(Debug)]
pub enum TreeUpdate {
    /// A new object was created.
    Created(Arc<TreeNode>),
    /// An existing object was updated in place.
    Updated(Arc<TreeNode>),
    /// The object was removed; the snapshot carries the tombstone.
    Removed(DataObject),
    /// The object was re-keyed; the snapshot is the obsolete shadow under
    /// the old id.
    Renamed { node: Arc<TreeNode>, shadow: DataObject },
    /// Disposable type: nothing stored, deliver and forget.
    Disposable(DataObject),
    /// Removal of an object we never had; nothing to do.
    Ignored,
}

// ---------------------------------------------------------------------------
// ObjectTree
// ---------------------------------------------------------------------------

pub struct ObjectTree {
    root: Arc<TreeNode>,
}

impl Default for ObjectTree {
    fn default() -> Self {
        ObjectTree { root: TreeNode::empty() }
    }
}

impl ObjectTree {
    pub fn new() -> Self {
        ObjectTree::default()
    }

    /// Look up a node by leaf type and full id path.
    pub fn get(
        &self,
        registry: &TypeRegistry,
        type_code: &str,
        keys: &[&str],
    ) -> Option<Arc<TreeNode>> {
        let path = registry.type_path(type_code).ok()?;
        if path.len() != keys.len() {
            return None;
        }
        let mut node = self.root.clone();
        for (spec, key) in path.iter().zip(keys) {
            node = node.child(&spec.code, &spec.normalize_id(key))?;
        }
        Some(node)
    }

    /// Create an object (and any missing intermediates) at the given id
    /// path. Idempotent: an existing node is returned as-is.
    pub fn create(
        &self,
        registry: &TypeRegistry,
        type_code: &str,
        keys: &[String],
        template: impl FnOnce() -> DataObject,
    ) -> Result<(Arc<TreeNode>, bool), CoreError> {
        let path = registry.type_path(type_code)?;
        if path.len() != keys.len() {
            return Err(CoreError::Parse(ProtocolError::BadFrame(format!(
                "key tuple length {} does not match type path of '{type_code}' ({})",
                keys.len(),
                path.len()
            ))));
        }
        let mut node = self.root.clone();
        let mut created = false;
        let mut template = Some(template);
        for (depth, (spec, key)) in path.iter().zip(keys).enumerate() {
            let id = spec.normalize_id(key);
            let leaf = depth + 1 == path.len();
            let template = &mut template;
            let (next, fresh) = attach_child(&node, spec, &id, || {
                let mut obj = match (leaf, template.take()) {
                    (true, Some(make)) => make(),
                    _ => DataObject::new(spec.code.clone(), String::new(), uuid::Uuid::nil()),
                };
                obj.id = id.clone();
                obj.parent_keys = keys[..depth].to_vec();
                obj
            });
            created = leaf && fresh;
            node = next;
        }
        Ok((node, created))
    }

    /// Remove the object (and its subtree) at the id path. Returns the
    /// tombstoned snapshot, or `None` if it was never there.
    pub fn remove(
        &self,
        registry: &TypeRegistry,
        type_code: &str,
        keys: &[&str],
    ) -> Option<DataObject> {
        let path = registry.type_path(type_code).ok()?;
        if path.len() != keys.len() || keys.is_empty() {
            return None;
        }
        let parent = self.parent_node(&path, keys)?;
        let leaf_spec = path.last().expect("non-empty path");
        let id = leaf_spec.normalize_id(keys[keys.len() - 1]);
        let removed = {
            let mut children = parent.children.write().expect("tree poisoned");
            let by_id = children.get_mut(&leaf_spec.code)?;
            let node = by_id.remove(&id)?;
            if by_id.is_empty() {
                children.remove(&leaf_spec.code);
            }
            node
        };
        let mut snapshot = removed.snapshot()?;
        snapshot.tombstone = true;
        Some(snapshot)
    }

    /// Atomically re-key an object to a new id under the same parent.
    ///
    /// The new id must be free. Returns the updated node plus the obsolete
    /// shadow (old id, `rename_target` set) for propagation.
    pub fn rename(
        &self,
        registry: &TypeRegistry,
        type_code: &str,
        keys: &[&str],
        new_id: &str,
    ) -> Result<(Arc<TreeNode>, DataObject), CoreError> {
        let path = registry.type_path(type_code)?;
        if path.len() != keys.len() || keys.is_empty() {
            return Err(CoreError::Application(format!(
                "rename: bad key path for '{type_code}'"
            )));
        }
        let leaf_spec = path.last().expect("non-empty path");
        let old_id = leaf_spec.normalize_id(keys[keys.len() - 1]);
        let new_id = leaf_spec.normalize_id(new_id);
        let parent = self.parent_node(&path, keys).ok_or_else(|| {
            CoreError::Application(format!("rename: parent of '{type_code}' not found"))
        })?;

        let mut children = parent.children.write().expect("tree poisoned");
        let by_id = children.get_mut(&leaf_spec.code).ok_or_else(|| {
            CoreError::Application(format!("rename: no '{type_code}' children"))
        })?;
        if by_id.contains_key(&new_id) {
            return Err(CoreError::Application(format!(
                "rename: id '{new_id}' already taken under '{type_code}'"
            )));
        }
        let node = by_id.remove(&old_id).ok_or_else(|| {
            CoreError::Application(format!("rename: '{type_code}/{old_id}' not found"))
        })?;
        by_id.insert(new_id.clone(), node.clone());
        drop(children);

        let mut shadow = node.snapshot().ok_or_else(|| {
            CoreError::Application("rename: node without object record".to_owned())
        })?;
        node.with_object_mut(|obj| obj.id = new_id.clone());
        shadow.rename_target = Some(new_id);
        Ok((node, shadow))
    }

    /// Apply one reconstructed inbound frame: walk the type path, create
    /// missing intermediates, and update, remove or rename the leaf.
    pub fn apply_frame(
        &self,
        registry: &TypeRegistry,
        spec: &TypeSpec,
        frame: &FullFrame,
        raw_line: Option<String>,
    ) -> Result<TreeUpdate, CoreError> {
        if spec.disposable {
            let obj = DataObject::from_frame(spec, frame, raw_line)?;
            return Ok(TreeUpdate::Disposable(obj));
        }
        let keys: Vec<&str> = frame.keys.iter().map(String::as_str).collect();

        if frame.prefix == Prefix::Remove {
            if frame.fields.is_empty() {
                return Ok(match self.remove(registry, &spec.code, &keys) {
                    Some(obj) => TreeUpdate::Removed(obj),
                    None => TreeUpdate::Ignored,
                });
            }
            // Non-empty obsolete payload is the escaped rename target.
            let new_id = unescape(&frame.fields).map_err(ProtocolError::Codec)?;
            return match self.rename(registry, &spec.code, &keys, &new_id) {
                Ok((node, shadow)) => Ok(TreeUpdate::Renamed { node, shadow }),
                // The old id was never indexed here; nothing to re-key.
                Err(CoreError::Application(_)) => Ok(TreeUpdate::Ignored),
                Err(e) => Err(e),
            };
        }

        let (node, created) = self.create(registry, &spec.code, &frame.keys, || {
            DataObject::new(spec.code.clone(), String::new(), frame.origin)
        })?;
        node.with_object_mut(|obj| -> Result<(), CoreError> {
            obj.apply_fields(spec, &frame.fields)?;
            obj.origin = frame.origin;
            obj.command_ts = frame.ts;
            obj.destinations = frame.destinations.clone();
            obj.raw_line = raw_line;
            obj.tombstone = false;
            obj.rename_target = None;
            Ok(())
        })
        .transpose()?;
        Ok(if created {
            TreeUpdate::Created(node)
        } else {
            TreeUpdate::Updated(node)
        })
    }

    /// All live objects of one type, in index order of their parents.
    pub fn collect_type(&self, registry: &TypeRegistry, type_code: &str) -> Vec<DataObject> {
        let Ok(path) = registry.type_path(type_code) else {
            return Vec::new();
        };
        let mut level: Vec<Arc<TreeNode>> = vec![self.root.clone()];
        for spec in &path {
            let mut next = Vec::new();
            for node in &level {
                let children = node.children.read().expect("tree poisoned");
                if let Some(by_id) = children.get(&spec.code) {
                    next.extend(by_id.values().cloned());
                }
            }
            level = next;
        }
        level
            .iter()
            .filter_map(|n| n.snapshot())
            .filter(|o| !o.is_obsolete())
            .collect()
    }

    /// Filtered traversal (see [`ObjectFilter`]).
    pub fn get_filtered_children(&self, filter: &dyn ObjectFilter) -> Vec<DataObject> {
        let mut out = Vec::new();
        collect_filtered(&self.root, filter, &mut out);
        out
    }

    /// Drop every object. Used on shutdown.
    pub fn cleanup(&self) {
        self.root.children.write().expect("tree poisoned").clear();
    }
}

impl ObjectTree {
    fn parent_node(&self, path: &[Arc<TypeSpec>], keys: &[&str]) -> Option<Arc<TreeNode>> {
        let mut node = self.root.clone();
        for (spec, key) in path.iter().zip(keys).take(path.len() - 1) {
            node = node.child(&spec.code, &spec.normalize_id(key))?;
        }
        Some(node)
    }
}

fn attach_child(
    parent: &Arc<TreeNode>,
    spec: &TypeSpec,
    id: &str,
    make: impl FnOnce() -> DataObject,
) -> (Arc<TreeNode>, bool) {
    if let Some(existing) = parent.child(&spec.code, id) {
        return (existing, false);
    }
    let mut children = parent.children.write().expect("tree poisoned");
    let by_id = children.entry(spec.code.clone()).or_default();
    if let Some(existing) = by_id.get(id) {
        return (existing.clone(), false);
    }
    let node = TreeNode::empty();
    node.set_object(make());
    by_id.insert(id.to_owned(), node.clone());
    (node, true)
}

fn collect_filtered(node: &Arc<TreeNode>, filter: &dyn ObjectFilter, out: &mut Vec<DataObject>) {
    let children = node.children.read().expect("tree poisoned");
    if let Some(targets) = children.get(filter.target_code()) {
        for target in targets.values() {
            if let Some(obj) = target.snapshot() {
                if !obj.is_obsolete() && filter.filter_object(&obj) {
                    out.push(obj);
                }
            }
        }
        return;
    }
    let next: Vec<Arc<TreeNode>> = children
        .values()
        .flat_map(|by_id| by_id.values().cloned())
        .collect();
    drop(children);
    for child in next {
        match child.snapshot() {
            Some(obj) if !filter.filter_parent(&obj) => continue,
            _ => collect_filtered(&child, filter, out),
        }
    }
}

/// Selection predicate for [`ObjectTree::get_filtered_children`].
pub trait ObjectFilter {
    /// The type code this filter selects.
    fn target_code(&self) -> &str;
    /// Test a candidate of the target type.
    fn filter_object(&self, obj: &DataObject) -> bool;
    /// Prune the traversal: should descent continue through this object?
    fn filter_parent(&self, _obj: &DataObject) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DefaultBehavior;
    use mw_codec::fields::{FieldCodec, FieldSpec, FieldValue};
    use uuid::Uuid;

    fn registry() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        reg.register(TypeSpec::new(
            "Px",
            vec![
                FieldSpec::new("label", FieldCodec::Str),
                FieldSpec::new("value", FieldCodec::Int),
            ],
            std::sync::Arc::new(DefaultBehavior),
        ));
        reg.register(
            TypeSpec::new(
                "Ch",
                vec![FieldSpec::new("state", FieldCodec::Str)],
                std::sync::Arc::new(DefaultBehavior),
            )
            .with_parent("Px")
            .case_insensitive(),
        );
        reg
    }

    fn make(code: &str, id: &str) -> DataObject {
        DataObject::new(code, id, Uuid::nil())
    }

    #[test]
    fn create_is_idempotent() {
        let reg = registry();
        let tree = ObjectTree::new();
        let (a, created_a) = tree
            .create(&reg, "Px", &["1".to_owned()], || make("Px", "1"))
            .unwrap();
        let (b, created_b) = tree
            .create(&reg, "Px", &["1".to_owned()], || make("Px", "1"))
            .unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn nested_create_builds_intermediates() {
        let reg = registry();
        let tree = ObjectTree::new();
        let keys = vec!["p1".to_owned(), "C3".to_owned()];
        let (node, created) = tree.create(&reg, "Ch", &keys, || make("Ch", "C3")).unwrap();
        assert!(created);
        // Case-insensitive type stores the lowercased id.
        let snap = node.snapshot().unwrap();
        assert_eq!(snap.id, "c3");
        assert_eq!(snap.parent_keys, vec!["p1".to_owned()]);
        assert!(tree.get(&reg, "Px", &["p1"]).is_some());
        // Lookups tolerate either case.
        assert!(tree.get(&reg, "Ch", &["p1", "c3"]).is_some());
        assert!(tree.get(&reg, "Ch", &["p1", "C3"]).is_some());
    }

    #[test]
    fn remove_detaches_and_tombstones() {
        let reg = registry();
        let tree = ObjectTree::new();
        tree.create(&reg, "Px", &["1".to_owned()], || make("Px", "1"))
            .unwrap();
        let gone = tree.remove(&reg, "Px", &["1"]).unwrap();
        assert!(gone.tombstone);
        assert!(tree.get(&reg, "Px", &["1"]).is_none());
        assert!(tree.remove(&reg, "Px", &["1"]).is_none());
    }

    #[test]
    fn rename_rekeys_atomically_and_yields_a_shadow() {
        let reg = registry();
        let tree = ObjectTree::new();
        tree.create(&reg, "Px", &["1".to_owned()], || make("Px", "1"))
            .unwrap();
        let (node, shadow) = tree.rename(&reg, "Px", &["1"], "1b").unwrap();
        assert_eq!(shadow.id, "1");
        assert_eq!(shadow.rename_target.as_deref(), Some("1b"));
        assert!(shadow.is_obsolete());
        assert_eq!(node.snapshot().unwrap().id, "1b");
        assert!(tree.get(&reg, "Px", &["1"]).is_none());
        assert!(tree.get(&reg, "Px", &["1b"]).is_some());
    }

    #[test]
    fn rename_to_a_taken_id_is_refused() {
        let reg = registry();
        let tree = ObjectTree::new();
        tree.create(&reg, "Px", &["1".to_owned()], || make("Px", "1"))
            .unwrap();
        tree.create(&reg, "Px", &["2".to_owned()], || make("Px", "2"))
            .unwrap();
        assert!(tree.rename(&reg, "Px", &["1"], "2").is_err());
    }

    #[test]
    fn live_children_ids_stay_a_set() {
        let reg = registry();
        let tree = ObjectTree::new();
        for id in ["1", "2", "3"] {
            tree.create(&reg, "Px", &[id.to_owned()], || make("Px", id))
                .unwrap();
        }
        tree.rename(&reg, "Px", &["2"], "2b").unwrap();
        tree.remove(&reg, "Px", &["3"]);
        let mut ids: Vec<String> = tree
            .collect_type(&reg, "Px")
            .into_iter()
            .map(|o| o.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1".to_owned(), "2b".to_owned()]);
    }

    #[test]
    fn filtered_traversal_tests_direct_children_of_the_target_type() {
        struct ByState<'a>(&'a str);
        impl ObjectFilter for ByState<'_> {
            fn target_code(&self) -> &str {
                "Ch"
            }
            fn filter_object(&self, obj: &DataObject) -> bool {
                obj.values.first().and_then(FieldValue::as_str) == Some(self.0)
            }
        }

        let reg = registry();
        let tree = ObjectTree::new();
        for (p, c, state) in [("p1", "a", "up"), ("p1", "b", "down"), ("p2", "c", "up")] {
            let keys = vec![p.to_owned(), c.to_owned()];
            let (node, _) = tree.create(&reg, "Ch", &keys, || make("Ch", c)).unwrap();
            node.with_object_mut(|o| o.values = vec![FieldValue::Str(state.to_owned())]);
        }
        let mut up: Vec<String> = tree
            .get_filtered_children(&ByState("up"))
            .into_iter()
            .map(|o| o.id)
            .collect();
        up.sort();
        assert_eq!(up, vec!["a".to_owned(), "c".to_owned()]);
    }
}
