//! Key-space tree
//!
//! Rebuilds the hierarchy behind a set of flat keys: each key segment becomes
//! a node, children keep the order in which they were first seen. The
//! [`TreeAggregator`] reducer only publishes a new snapshot when a batch
//! changes the tree, so consumers can compare snapshots by pointer.
//!
//! Removing a key clears its terminal mark and prunes every node on its path
//! that is left without children and without a key of its own.

use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::trace;

use crate::error::ClientResult;
use crate::event::{KeyValueEvent, SubscribeOptions};
use crate::key::{Key, Pattern};
use crate::primitives::{Connection, Subscription};
use crate::watch::{Reducer, Watch};

/// Live tree of every key matching a pattern
pub type TreeWatch = Watch<TreeAggregator>;

/// One segment in the tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeNode {
    children: IndexMap<String, TreeNode>,
    terminal: bool,
}

impl TreeNode {
    pub fn children(&self) -> &IndexMap<String, TreeNode> {
        &self.children
    }

    pub fn child(&self, segment: &str) -> Option<&TreeNode> {
        self.children.get(segment)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True when a key ends at this node
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}

/// Hierarchical view of a set of keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyTree {
    root: TreeNode,
}

impl KeyTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Insert a key; returns true when the tree changed
    ///
    /// Merging a key that is already present changes nothing.
    pub fn merge(&mut self, key: &Key) -> bool {
        let mut created = false;
        let mut node = &mut self.root;
        for segment in key.segments() {
            node = node
                .children
                .entry(segment.clone())
                .or_insert_with(|| {
                    created = true;
                    TreeNode::default()
                });
        }
        let marked = !node.terminal;
        node.terminal = true;
        created || marked
    }

    /// Remove a key; returns true when the tree changed
    pub fn remove(&mut self, key: &Key) -> bool {
        remove_path(&mut self.root, key.segments())
    }

    pub fn contains(&self, key: &Key) -> bool {
        let mut node = &self.root;
        for segment in key.segments() {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.terminal
    }

    /// Apply the upserts and then the removals of one batch
    pub fn apply(&mut self, event: &KeyValueEvent) -> bool {
        let mut changed = false;
        for (key, _) in &event.upserted {
            changed |= self.merge(key);
        }
        for (key, _) in &event.removed {
            changed |= self.remove(key);
        }
        changed
    }

    /// Root-to-leaf segment paths, depth first in insertion order
    pub fn paths(&self) -> Vec<Vec<String>> {
        let mut paths = Vec::new();
        let mut prefix = Vec::new();
        collect_paths(&self.root, &mut prefix, &mut paths);
        paths
    }
}

fn remove_path(node: &mut TreeNode, segments: &[String]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        let was_terminal = node.terminal;
        node.terminal = false;
        return was_terminal;
    };
    let Some(child) = node.children.get_mut(first) else {
        return false;
    };
    if !remove_path(child, rest) {
        return false;
    }
    if child.children.is_empty() && !child.terminal {
        node.children.shift_remove(first);
    }
    true
}

fn collect_paths(node: &TreeNode, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    for (segment, child) in &node.children {
        prefix.push(segment.clone());
        if child.is_leaf() {
            out.push(prefix.clone());
        } else {
            collect_paths(child, prefix, out);
        }
        prefix.pop();
    }
}

/// Reducer building a [`KeyTree`] from a pattern subscription
#[derive(Debug, Clone, Default)]
pub struct TreeAggregator {
    pattern: Option<Pattern>,
    tree: KeyTree,
    published: Arc<KeyTree>,
}

impl TreeAggregator {
    pub fn tree(&self) -> &KeyTree {
        &self.tree
    }
}

impl Reducer for TreeAggregator {
    type Target = Pattern;
    type Item = KeyValueEvent;
    type Snapshot = Arc<KeyTree>;

    fn open<'a, C: Connection>(
        connection: &'a C,
        target: &'a Pattern,
        options: SubscribeOptions,
    ) -> impl Future<Output = ClientResult<Subscription<KeyValueEvent>>> + Send + 'a {
        connection.psubscribe(target, options)
    }

    fn reset(&mut self, target: &Pattern) {
        self.pattern = Some(target.clone());
        self.tree = KeyTree::default();
        self.published = Arc::default();
    }

    fn fold(&mut self, bound: &Pattern, item: KeyValueEvent) -> bool {
        let stale = self.pattern.as_ref() != Some(bound);
        if stale {
            self.reset(bound);
        }
        if !self.tree.apply(&item) {
            trace!(pattern = %bound, "Batch left tree unchanged");
            return stale;
        }
        self.published = Arc::new(self.tree.clone());
        true
    }

    fn snapshot(&self) -> Arc<KeyTree> {
        self.published.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::primitives::Transport;
    use serde_json::json;
    use tokio::sync::watch;

    fn key(raw: &str) -> Key {
        Key::parse(raw).unwrap()
    }

    fn upsert(keys: &[&str]) -> KeyValueEvent {
        KeyValueEvent::upserted(keys.iter().map(|k| (key(k), json!(null))).collect())
    }

    fn remove(keys: &[&str]) -> KeyValueEvent {
        KeyValueEvent::removed(keys.iter().map(|k| (key(k), json!(null))).collect())
    }

    #[test]
    fn test_paths_in_insertion_order() {
        let mut tree = KeyTree::new();
        assert!(tree.merge(&key("a/b/c")));
        assert!(tree.merge(&key("a/b/d")));
        assert!(tree.merge(&key("x")));

        assert_eq!(
            tree.paths(),
            vec![
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
                vec!["a".to_string(), "b".to_string(), "d".to_string()],
                vec!["x".to_string()],
            ]
        );
    }

    #[test]
    fn test_merging_existing_key_changes_nothing() {
        let mut tree = KeyTree::new();
        tree.merge(&key("a/b"));
        assert!(!tree.merge(&key("a/b")));
    }

    #[test]
    fn test_interior_key_is_a_change() {
        let mut tree = KeyTree::new();
        tree.merge(&key("a/b"));
        assert!(tree.merge(&key("a")));
        assert!(tree.contains(&key("a")));
        // Still only one leaf
        assert_eq!(tree.paths().len(), 1);
    }

    #[test]
    fn test_remove_prunes_empty_branches() {
        let mut tree = KeyTree::new();
        tree.merge(&key("a/b/c"));
        tree.merge(&key("a/d"));

        assert!(tree.remove(&key("a/b/c")));
        assert!(!tree.contains(&key("a/b/c")));
        assert!(tree.root().child("a").unwrap().child("b").is_none());
        assert_eq!(tree.paths(), vec![vec!["a".to_string(), "d".to_string()]]);

        assert!(tree.remove(&key("a/d")));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_keeps_nodes_that_are_keys() {
        let mut tree = KeyTree::new();
        tree.merge(&key("a"));
        tree.merge(&key("a/b"));

        assert!(tree.remove(&key("a/b")));
        assert!(tree.contains(&key("a")));
        assert_eq!(tree.paths(), vec![vec!["a".to_string()]]);
    }

    #[test]
    fn test_remove_interior_key_keeps_children() {
        let mut tree = KeyTree::new();
        tree.merge(&key("a"));
        tree.merge(&key("a/b"));

        assert!(tree.remove(&key("a")));
        assert!(!tree.contains(&key("a")));
        assert!(tree.contains(&key("a/b")));
    }

    #[test]
    fn test_remove_unknown_key_changes_nothing() {
        let mut tree = KeyTree::new();
        tree.merge(&key("a/b"));
        let before = tree.clone();

        assert!(!tree.remove(&key("a")));
        assert!(!tree.remove(&key("a/b/c")));
        assert!(!tree.remove(&key("z")));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_aggregator_keeps_snapshot_for_known_keys() {
        let p = Pattern::parse("#").unwrap();
        let mut aggregator = TreeAggregator::default();
        aggregator.reset(&p);

        assert!(aggregator.fold(&p, upsert(&["a/b", "a/c"])));
        let first = aggregator.snapshot();

        assert!(!aggregator.fold(&p, upsert(&["a/b", "a/c"])));
        assert!(Arc::ptr_eq(&first, &aggregator.snapshot()));

        assert!(aggregator.fold(&p, remove(&["a/b"])));
        assert!(!Arc::ptr_eq(&first, &aggregator.snapshot()));
        // The earlier snapshot is untouched
        assert_eq!(first.paths().len(), 2);
    }

    #[tokio::test]
    async fn test_watch_builds_tree() {
        let transport = MemoryTransport::default();
        transport.store().set(&key("plant/line-1/temp"), json!(1));
        let conn = Arc::new(transport.connect("memory://test", None, None, None).await.unwrap());
        let (_tx, rx) = watch::channel(Some(conn.clone()));

        let watch: TreeWatch = Watch::spawn(
            rx,
            Pattern::parse("plant/#").unwrap(),
            SubscribeOptions::unique(),
            TreeAggregator::default(),
        );
        let mut snapshots = watch.subscribe();
        snapshots.wait_for(|tree| !tree.is_empty()).await.unwrap();

        conn.set(&key("plant/line-2/temp"), json!(2)).await.unwrap();
        let tree = snapshots
            .wait_for(|tree| tree.paths().len() == 2)
            .await
            .unwrap()
            .clone();
        assert!(tree.contains(&key("plant/line-2/temp")));
    }
}
