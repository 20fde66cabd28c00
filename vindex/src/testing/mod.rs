//! Shared helpers for unit and integration tests.

use std::sync::Arc;

use crate::index::{Database, LeafEntry, Node, NodeId, Tree, TreeConfig, TreeError, Value};
use crate::storage::{KvStore, MemoryStore};

/// A tree over a fresh in-memory store, plus a handle to that store so a
/// test can reopen it.
pub fn memory_tree(
    config: TreeConfig,
) -> Result<(Tree<Arc<MemoryStore>>, Arc<MemoryStore>), TreeError> {
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(Database::new(Arc::clone(&store)));
    let tree = Tree::open(db, None, config)?;
    Ok((tree, store))
}

/// Reopen the last committed tree in `store` through a new cache.
pub fn reopen<S: KvStore>(store: S, config: TreeConfig) -> Result<Tree<S>, TreeError> {
    Tree::open_latest(Arc::new(Database::new(store)), config)
}

/// Leaf IDs in chain order, starting from the leftmost leaf.
pub fn leaf_chain<S: KvStore>(tree: &Tree<S>) -> Result<Vec<NodeId>, TreeError> {
    let mut ids = Vec::new();
    let mut next = tree.first_leaf();
    while let Some(id) = next {
        ids.push(id);
        next = match tree.db().node(id)?.as_ref() {
            Node::Leaf(leaf) => leaf.next,
            other => {
                return Err(TreeError::Corrupt(format!(
                    "leaf chain reached non-leaf {}",
                    other.id()
                )));
            }
        };
    }
    Ok(ids)
}

/// Every entry stored in leaves, in chain order.
pub fn chain_entries<S: KvStore>(tree: &Tree<S>) -> Result<Vec<LeafEntry>, TreeError> {
    let mut entries = Vec::new();
    for id in leaf_chain(tree)? {
        if let Node::Leaf(leaf) = tree.db().node(id)?.as_ref() {
            entries.extend(leaf.entries.iter().cloned());
        }
    }
    Ok(entries)
}

/// Values of `entries` as integers. Values wider than 64 bits map to
/// `u64::MAX`.
#[must_use]
pub fn as_u64s(entries: &[LeafEntry]) -> Vec<u64> {
    entries
        .iter()
        .map(|e| e.value.to_u64().unwrap_or(u64::MAX))
        .collect()
}

/// Identifier used by tests for a numeric value.
#[must_use]
pub fn id_for(n: u64) -> Vec<u8> {
    format!("id-{n}").into_bytes()
}

/// Insert each value with `id_for(value)` as its identifier.
pub fn insert_all<S: KvStore>(tree: &mut Tree<S>, values: &[u64]) -> Result<(), TreeError> {
    for n in values {
        tree.insert(Value::from_u64(*n), id_for(*n))?;
    }
    Ok(())
}
