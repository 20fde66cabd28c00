//! Write-back node cache over a `KvStore`.
//!
//! Every node the tree creates or modifies lands here first as a *dirty*
//! node. Dirty nodes stay in memory until `commit` or `cap` serializes them
//! and writes them to the store; only once the store write succeeded are they
//! dropped from the cache.
//!
//! # Design
//!
//! - Dirty nodes live in a `HashMap` keyed by `NodeId`
//! - A doubly linked flush-list threads through the map in first-insertion
//!   order, so `cap` can evict the oldest nodes first
//! - Commit and cap are two-phase: read/serialize/write under the shared
//!   lock, then uncache under the exclusive lock
//!
//! # Invariants
//!
//! - Every dirty node appears exactly once in the flush-list
//! - `oldest == NO_NODE` iff `newest == NO_NODE` iff the cache is empty
//! - A node is uncached only after a store write containing it succeeded

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::index::codec::{self, NodeError};
use crate::index::node::{NO_NODE, Node, NodeId};
use crate::storage::{Batch, IDEAL_BATCH_SIZE, KvStore, StoreError};

/// Bookkeeping bytes charged per cached node on top of its encoded size.
///
/// Covers the map slot, the flush-list links and the `Arc` header.
pub const CACHED_NODE_OVERHEAD: usize = 64;

/// Metadata key holding the next node ID to allocate.
pub const SEQUENCE_KEY: &[u8] = b"sequence";
/// Metadata key holding the committed root node ID.
pub const ROOT_KEY: &[u8] = b"root";
/// Metadata key holding the encoded special-value entries.
pub const SPECIAL_KEY: &[u8] = b"special";

/// Store key for a node record.
#[must_use]
pub const fn node_key(id: NodeId) -> [u8; 8] {
    id.to_be_bytes()
}

/// Errors that can occur in the node cache.
#[derive(Debug)]
pub enum DatabaseError {
    /// The underlying store failed.
    Store(StoreError),
    /// The node is neither cached nor persisted.
    MissingNode(NodeId),
    /// The persisted record for a node could not be decoded, even after a
    /// second read.
    Malformed { id: NodeId, source: NodeError },
    /// A node could not be serialized.
    Node(NodeError),
    /// The operation was cancelled before its next batch write.
    Cancelled,
    /// The cache lock was poisoned by a panicking thread.
    LockPoisoned,
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::MissingNode(id) => write!(f, "missing node {id}"),
            Self::Malformed { id, source } => write!(f, "malformed node {id}: {source}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::LockPoisoned => write!(f, "cache lock poisoned"),
        }
    }
}

impl std::error::Error for DatabaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Malformed { source, .. } => Some(source),
            Self::Node(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for DatabaseError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<NodeError> for DatabaseError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

/// Cooperative cancellation flag for `commit_cancellable`/`cap_cancellable`.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect before the next batch write.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a successful `commit`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommitReport {
    /// Nodes written and uncached.
    pub nodes: usize,
    /// Nodes flushed that were not reachable from the root through dirty
    /// entries.
    pub stragglers: usize,
    /// Encoded bytes written, metadata included.
    pub bytes: usize,
    /// Store writes issued.
    pub batches: usize,
}

/// Outcome of a successful `cap`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapReport {
    pub evicted_nodes: usize,
    pub evicted_bytes: usize,
    pub batches: usize,
}

/// Snapshot of cache counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Nodes currently dirty.
    pub dirty_nodes: usize,
    /// Cached size of the dirty nodes, overhead included.
    pub dirty_size: usize,
    /// Successful commits that wrote something.
    pub commits: u64,
    /// Nodes written by commits.
    pub flushed_nodes: u64,
    /// Encoded bytes written by commits.
    pub flushed_bytes: u64,
    /// Nodes written by `cap`.
    pub evicted_nodes: u64,
    /// Encoded bytes written by `cap`.
    pub evicted_bytes: u64,
    /// Nodes loaded from the store.
    pub loads: u64,
    /// Store re-reads after a decode failure.
    pub decode_retries: u64,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    flushed_nodes: AtomicU64,
    flushed_bytes: AtomicU64,
    evicted_nodes: AtomicU64,
    evicted_bytes: AtomicU64,
    loads: AtomicU64,
    decode_retries: AtomicU64,
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(by as u64, Ordering::Relaxed);
}

/// A cached, not yet persisted node.
struct DirtyNode {
    node: Arc<Node>,
    /// Encoded size in bytes.
    size: usize,
    flush_prev: NodeId,
    flush_next: NodeId,
}

/// The dirty map plus its flush-list.
#[derive(Default)]
struct DirtyCache {
    dirties: HashMap<NodeId, DirtyNode>,
    /// Head of the flush-list, first to be evicted.
    oldest: NodeId,
    /// Tail of the flush-list.
    newest: NodeId,
    /// Sum of encoded sizes of the dirty nodes.
    size: usize,
}

impl DirtyCache {
    /// Cached size including per-node overhead.
    fn total_size(&self) -> usize {
        self.size + self.dirties.len() * CACHED_NODE_OVERHEAD
    }

    /// Add or replace a dirty node.
    ///
    /// A new ID is appended to the flush-list tail; an ID that is already
    /// dirty keeps its position and only has its content replaced.
    fn insert(&mut self, id: NodeId, node: Arc<Node>, size: usize) {
        if let Some(existing) = self.dirties.get_mut(&id) {
            self.size = self.size - existing.size + size;
            existing.node = node;
            existing.size = size;
            return;
        }

        let prev = self.newest;
        self.dirties.insert(
            id,
            DirtyNode {
                node,
                size,
                flush_prev: prev,
                flush_next: NO_NODE,
            },
        );
        if prev == NO_NODE {
            self.oldest = id;
        } else if let Some(tail) = self.dirties.get_mut(&prev) {
            tail.flush_next = id;
        }
        self.newest = id;
        self.size += size;
    }

    /// Unlink and drop a dirty node.
    fn remove(&mut self, id: NodeId) -> Option<DirtyNode> {
        let removed = self.dirties.remove(&id)?;
        match (removed.flush_prev, removed.flush_next) {
            // Only element
            (NO_NODE, NO_NODE) => {
                self.oldest = NO_NODE;
                self.newest = NO_NODE;
            }
            // Head
            (NO_NODE, next) => {
                self.oldest = next;
                if let Some(n) = self.dirties.get_mut(&next) {
                    n.flush_prev = NO_NODE;
                }
            }
            // Tail
            (prev, NO_NODE) => {
                self.newest = prev;
                if let Some(p) = self.dirties.get_mut(&prev) {
                    p.flush_next = NO_NODE;
                }
            }
            // Middle
            (prev, next) => {
                if let Some(p) = self.dirties.get_mut(&prev) {
                    p.flush_next = next;
                }
                if let Some(n) = self.dirties.get_mut(&next) {
                    n.flush_prev = prev;
                }
            }
        }
        self.size -= removed.size;
        Some(removed)
    }

    /// Dirty IDs from oldest to newest.
    fn flush_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.dirties.len());
        let mut cursor = self.oldest;
        while let Some(entry) = self.dirties.get(&cursor) {
            order.push(cursor);
            cursor = entry.flush_next;
        }
        order
    }

    /// Dirty nodes reachable from `root` through dirty entries, children
    /// before parents.
    fn post_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        if !self.dirties.contains_key(&root) {
            return order;
        }

        let mut visited = HashSet::new();
        // (id, children already pushed)
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(DirtyNode { node, .. }) = self.dirties.get(&id)
                && let Node::Internal(internal) = node.as_ref()
            {
                for child in internal.children.iter().rev() {
                    if self.dirties.contains_key(&child.child) && !visited.contains(&child.child) {
                        stack.push((child.child, false));
                    }
                }
            }
        }
        order
    }
}

/// A node serialized for writing, with the exact `Arc` it was taken from.
struct Collapsed {
    id: NodeId,
    node: Arc<Node>,
    bytes: Vec<u8>,
}

/// Write-back node cache.
///
/// # Thread Safety
///
/// Lookups take the cache lock shared. `insert` and the uncache phase of
/// `commit`/`cap` take it exclusively. Store I/O during `commit`/`cap` happens
/// while the shared lock is held, so readers keep making progress.
pub struct Database<S: KvStore> {
    store: S,
    cache: RwLock<DirtyCache>,
    counters: Counters,
}

impl<S: KvStore> Database<S> {
    /// Create a cache over `store` with nothing dirty.
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: RwLock::new(DirtyCache::default()),
            counters: Counters::default(),
        }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Put a node into the dirty cache under its own ID.
    ///
    /// Re-inserting an already dirty ID replaces the content but keeps the
    /// node's flush-list position.
    pub fn insert(&self, node: Node) -> Result<(), DatabaseError> {
        let id = node.id();
        if !node.is_resolved() {
            return Err(NodeError::UnresolvedNode(id).into());
        }
        let size = codec::encoded_len(&node);
        let mut cache = self.cache.write().map_err(|_| DatabaseError::LockPoisoned)?;
        cache.insert(id, Arc::new(node), size);
        Ok(())
    }

    /// Resolve a node: the dirty copy if there is one, else the stored one.
    pub fn node(&self, id: NodeId) -> Result<Arc<Node>, DatabaseError> {
        {
            let cache = self.cache.read().map_err(|_| DatabaseError::LockPoisoned)?;
            if let Some(dirty) = cache.dirties.get(&id) {
                return Ok(Arc::clone(&dirty.node));
            }
        }
        self.load(id).map(Arc::new)
    }

    fn load(&self, id: NodeId) -> Result<Node, DatabaseError> {
        let key = node_key(id);
        let bytes = self.store.get(&key)?.ok_or(DatabaseError::MissingNode(id))?;
        bump(&self.counters.loads, 1);

        match codec::decode(id, &bytes) {
            Ok(node) => Ok(node),
            Err(first) => {
                tracing::warn!("node {id} failed to decode ({first}), re-reading");
                bump(&self.counters.decode_retries, 1);
                let bytes = self.store.get(&key)?.ok_or(DatabaseError::MissingNode(id))?;
                codec::decode(id, &bytes).map_err(|source| DatabaseError::Malformed { id, source })
            }
        }
    }

    /// Whether `id` currently has a dirty copy.
    pub fn is_dirty(&self, id: NodeId) -> Result<bool, DatabaseError> {
        let cache = self.cache.read().map_err(|_| DatabaseError::LockPoisoned)?;
        Ok(cache.dirties.contains_key(&id))
    }

    /// Dirty IDs in flush order, oldest first.
    pub fn flush_order(&self) -> Result<Vec<NodeId>, DatabaseError> {
        let cache = self.cache.read().map_err(|_| DatabaseError::LockPoisoned)?;
        Ok(cache.flush_order())
    }

    /// Cached size of all dirty nodes, `CACHED_NODE_OVERHEAD` included.
    pub fn cached_size(&self) -> Result<usize, DatabaseError> {
        let cache = self.cache.read().map_err(|_| DatabaseError::LockPoisoned)?;
        Ok(cache.total_size())
    }

    /// Read a metadata record.
    pub fn meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.store.get(key)?)
    }

    /// Read a metadata record holding an 8-byte big-endian integer.
    pub fn meta_u64(&self, key: &[u8]) -> Result<Option<u64>, DatabaseError> {
        let Some(bytes) = self.meta(key)? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            DatabaseError::Store(StoreError::Corruption(format!(
                "metadata {} is {} bytes, expected 8",
                String::from_utf8_lossy(key),
                bytes.len()
            )))
        })?;
        Ok(Some(u64::from_be_bytes(raw)))
    }

    /// Persist every dirty node plus `meta`, then uncache the nodes.
    ///
    /// Nodes reachable from `root` are written children first; dirty nodes
    /// left over from earlier evictions follow in flush order.
    pub fn commit(
        &self,
        root: Option<NodeId>,
        meta: &[(&[u8], Vec<u8>)],
    ) -> Result<CommitReport, DatabaseError> {
        self.commit_cancellable(root, meta, &CancelToken::new())
    }

    /// `commit`, checking `cancel` before every batch write.
    ///
    /// On cancellation or store failure nothing is uncached and the call can
    /// be retried.
    pub fn commit_cancellable(
        &self,
        root: Option<NodeId>,
        meta: &[(&[u8], Vec<u8>)],
        cancel: &CancelToken,
    ) -> Result<CommitReport, DatabaseError> {
        let (collapsed, stragglers, bytes, batches) = {
            let cache = self.cache.read().map_err(|_| DatabaseError::LockPoisoned)?;

            let mut order = root.map(|r| cache.post_order(r)).unwrap_or_default();
            let reachable = order.len();
            let seen: HashSet<NodeId> = order.iter().copied().collect();
            order.extend(cache.flush_order().into_iter().filter(|id| !seen.contains(id)));
            let stragglers = order.len() - reachable;

            if order.is_empty() && meta.is_empty() {
                return Ok(CommitReport::default());
            }

            let collapsed = collapse(&cache, &order)?;
            let (bytes, batches) = self.write_batches(&collapsed, meta, cancel)?;
            (collapsed, stragglers, bytes, batches)
        };

        let nodes = self.uncache(&collapsed)?;
        bump(&self.counters.commits, 1);
        bump(&self.counters.flushed_nodes, nodes);
        bump(&self.counters.flushed_bytes, bytes);
        tracing::info!(
            "committed {nodes} nodes ({stragglers} evicted-ancestor stragglers), {bytes} bytes in {batches} batches"
        );

        Ok(CommitReport {
            nodes,
            stragglers,
            bytes,
            batches,
        })
    }

    /// Evict the oldest dirty nodes until the cached size is below `limit`.
    ///
    /// Evicted nodes are written to the store before they leave the cache.
    pub fn cap(&self, limit: usize) -> Result<CapReport, DatabaseError> {
        self.cap_cancellable(limit, &CancelToken::new())
    }

    /// `cap`, checking `cancel` before every batch write.
    pub fn cap_cancellable(
        &self,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<CapReport, DatabaseError> {
        let (collapsed, bytes, batches) = {
            let cache = self.cache.read().map_err(|_| DatabaseError::LockPoisoned)?;

            let mut projected = cache.total_size();
            if projected < limit {
                return Ok(CapReport::default());
            }

            let mut victims = Vec::new();
            let mut cursor = cache.oldest;
            while projected >= limit {
                let Some(entry) = cache.dirties.get(&cursor) else {
                    break;
                };
                victims.push(cursor);
                projected -= entry.size + CACHED_NODE_OVERHEAD;
                cursor = entry.flush_next;
            }

            let collapsed = collapse(&cache, &victims)?;
            let (bytes, batches) = self.write_batches(&collapsed, &[], cancel)?;
            (collapsed, bytes, batches)
        };

        let evicted_nodes = self.uncache(&collapsed)?;
        bump(&self.counters.evicted_nodes, evicted_nodes);
        bump(&self.counters.evicted_bytes, bytes);
        tracing::debug!("evicted {evicted_nodes} nodes ({bytes} bytes) to stay under {limit}");

        Ok(CapReport {
            evicted_nodes,
            evicted_bytes: bytes,
            batches,
        })
    }

    /// Write collapsed nodes and metadata, flushing whenever the batch
    /// reaches `IDEAL_BATCH_SIZE`. Returns (bytes, batches).
    fn write_batches(
        &self,
        collapsed: &[Collapsed],
        meta: &[(&[u8], Vec<u8>)],
        cancel: &CancelToken,
    ) -> Result<(usize, usize), DatabaseError> {
        let mut batch = Batch::new();
        let mut bytes = 0;
        let mut batches = 0;

        for entry in collapsed {
            batch.put(&node_key(entry.id), &entry.bytes);
            bytes += entry.bytes.len();
            if batch.value_size() >= IDEAL_BATCH_SIZE {
                self.flush(&batch, cancel)?;
                batches += 1;
                batch.reset();
            }
        }

        // Metadata rides in the final batch
        for (key, value) in meta {
            batch.put(key, value);
            bytes += value.len();
        }
        if !batch.is_empty() {
            self.flush(&batch, cancel)?;
            batches += 1;
        }
        Ok((bytes, batches))
    }

    fn flush(&self, batch: &Batch, cancel: &CancelToken) -> Result<(), DatabaseError> {
        if cancel.is_cancelled() {
            return Err(DatabaseError::Cancelled);
        }
        self.store.write(batch)?;
        Ok(())
    }

    /// Drop written nodes from the cache.
    ///
    /// A node re-inserted since it was serialized holds newer content and
    /// stays dirty.
    fn uncache(&self, collapsed: &[Collapsed]) -> Result<usize, DatabaseError> {
        let mut cache = self.cache.write().map_err(|_| DatabaseError::LockPoisoned)?;
        let mut removed = 0;
        for entry in collapsed {
            let unchanged = cache
                .dirties
                .get(&entry.id)
                .is_some_and(|d| Arc::ptr_eq(&d.node, &entry.node));
            if unchanged && cache.remove(entry.id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> Result<CacheStats, DatabaseError> {
        let cache = self.cache.read().map_err(|_| DatabaseError::LockPoisoned)?;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Ok(CacheStats {
            dirty_nodes: cache.dirties.len(),
            dirty_size: cache.total_size(),
            commits: load(&self.counters.commits),
            flushed_nodes: load(&self.counters.flushed_nodes),
            flushed_bytes: load(&self.counters.flushed_bytes),
            evicted_nodes: load(&self.counters.evicted_nodes),
            evicted_bytes: load(&self.counters.evicted_bytes),
            loads: load(&self.counters.loads),
            decode_retries: load(&self.counters.decode_retries),
        })
    }
}

/// Serialize the given dirty nodes in order.
fn collapse(cache: &DirtyCache, ids: &[NodeId]) -> Result<Vec<Collapsed>, DatabaseError> {
    ids.iter()
        .filter_map(|id| cache.dirties.get(id).map(|d| (*id, &d.node)))
        .map(|(id, node)| {
            Ok(Collapsed {
                id,
                node: Arc::clone(node),
                bytes: codec::encode(node)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::node::{ChildEntry, InternalNode, LeafNode};
    use crate::index::value::Value;
    use crate::storage::MemoryStore;

    fn leaf(id: NodeId, values: &[u64]) -> Node {
        let mut leaf = LeafNode::new(id);
        for v in values {
            leaf.insert(Value::from_u64(*v), v.to_be_bytes().to_vec());
        }
        Node::Leaf(leaf)
    }

    fn internal(id: NodeId, children: &[(u64, NodeId)]) -> Node {
        Node::Internal(InternalNode::new(
            id,
            children
                .iter()
                .map(|(sep, child)| ChildEntry {
                    separator: Value::from_u64(*sep),
                    child: *child,
                })
                .collect(),
        ))
    }

    fn db_with(ids: &[NodeId]) -> Database<MemoryStore> {
        let db = Database::new(MemoryStore::new());
        for id in ids {
            db.insert(leaf(*id, &[*id])).unwrap();
        }
        db
    }

    #[test]
    fn test_insert_and_lookup() {
        let db = db_with(&[1]);
        let node = db.node(1).unwrap();
        assert_eq!(*node, leaf(1, &[1]));
        assert!(db.is_dirty(1).unwrap());
        assert!(matches!(db.node(2), Err(DatabaseError::MissingNode(2))));
    }

    #[test]
    fn test_insert_unresolved_rejected() {
        let db = db_with(&[]);
        assert!(matches!(
            db.insert(Node::Unresolved(3)),
            Err(DatabaseError::Node(NodeError::UnresolvedNode(3)))
        ));
    }

    #[test]
    fn test_reinsert_keeps_flush_position() {
        let db = db_with(&[1, 2, 3]);
        db.insert(leaf(1, &[1, 10, 20])).unwrap();

        assert_eq!(db.flush_order().unwrap(), vec![1, 2, 3]);
        assert_eq!(*db.node(1).unwrap(), leaf(1, &[1, 10, 20]));

        let expected: usize = [leaf(1, &[1, 10, 20]), leaf(2, &[2]), leaf(3, &[3])]
            .iter()
            .map(|n| codec::encoded_len(n) + CACHED_NODE_OVERHEAD)
            .sum();
        assert_eq!(db.cached_size().unwrap(), expected);
    }

    #[test]
    fn test_flush_list_removal_cases() {
        let mut cache = DirtyCache::default();
        for id in 1..=4 {
            cache.insert(id, Arc::new(leaf(id, &[id])), 10);
        }

        // Middle
        cache.remove(2);
        assert_eq!(cache.flush_order(), vec![1, 3, 4]);
        // Head
        cache.remove(1);
        assert_eq!(cache.flush_order(), vec![3, 4]);
        assert_eq!(cache.oldest, 3);
        // Tail
        cache.remove(4);
        assert_eq!(cache.flush_order(), vec![3]);
        assert_eq!(cache.newest, 3);
        // Only element
        cache.remove(3);
        assert!(cache.flush_order().is_empty());
        assert_eq!((cache.oldest, cache.newest), (NO_NODE, NO_NODE));
        assert_eq!(cache.size, 0);

        // Removing an absent ID is a no-op
        assert!(cache.remove(3).is_none());

        // List is usable again after emptying
        cache.insert(9, Arc::new(leaf(9, &[9])), 10);
        assert_eq!(cache.flush_order(), vec![9]);
    }

    #[test]
    fn test_commit_writes_children_first_and_uncaches() {
        let db = Database::new(MemoryStore::new());
        db.insert(leaf(1, &[1, 2])).unwrap();
        db.insert(leaf(2, &[3, 4])).unwrap();
        db.insert(internal(3, &[(2, 1), (4, 2)])).unwrap();

        let report = db
            .commit(Some(3), &[(SEQUENCE_KEY, 4u64.to_be_bytes().to_vec())])
            .unwrap();
        assert_eq!(report.nodes, 3);
        assert_eq!(report.stragglers, 0);
        assert_eq!(report.batches, 1);

        assert!(db.flush_order().unwrap().is_empty());
        assert_eq!(db.cached_size().unwrap(), 0);
        assert_eq!(db.meta_u64(SEQUENCE_KEY).unwrap(), Some(4));

        // Reloaded from the store
        assert_eq!(*db.node(3).unwrap(), internal(3, &[(2, 1), (4, 2)]));
        assert_eq!(db.stats().unwrap().loads, 1);
    }

    #[test]
    fn test_post_order_visits_children_before_parent() {
        let mut cache = DirtyCache::default();
        cache.insert(5, Arc::new(internal(5, &[(2, 3), (4, 4)])), 1);
        cache.insert(3, Arc::new(leaf(3, &[1])), 1);
        cache.insert(4, Arc::new(leaf(4, &[3])), 1);

        assert_eq!(cache.post_order(5), vec![3, 4, 5]);
        // Clean root means nothing reachable
        assert!(cache.post_order(7).is_empty());
    }

    #[test]
    fn test_empty_commit_writes_nothing() {
        let db = db_with(&[]);
        let report = db.commit(None, &[]).unwrap();
        assert_eq!(report, CommitReport::default());
        assert_eq!(db.store().stats().unwrap().batch_writes, 0);
        assert_eq!(db.stats().unwrap().commits, 0);
    }

    #[test]
    fn test_commit_flushes_stragglers() {
        let db = db_with(&[1, 2]);
        db.insert(internal(3, &[(1, 1), (2, 2)])).unwrap();

        // Root 3 reachable walk finds 1 and 2; node 9 is unrelated
        db.insert(leaf(9, &[9])).unwrap();
        let report = db.commit(Some(3), &[]).unwrap();

        assert_eq!(report.nodes, 4);
        assert_eq!(report.stragglers, 1);
        assert!(db.store().has(&node_key(9)).unwrap());
    }

    #[test]
    fn test_failed_write_leaves_cache_intact() {
        let db = db_with(&[1, 2]);
        db.store().fail_next_writes(1).unwrap();

        let err = db.commit(Some(1), &[]).unwrap_err();
        assert!(matches!(err, DatabaseError::Store(StoreError::InjectedFault(_))));
        assert_eq!(db.flush_order().unwrap(), vec![1, 2]);
        assert!(db.store().is_empty().unwrap());

        // Retry succeeds
        let report = db.commit(Some(1), &[]).unwrap();
        assert_eq!(report.nodes, 2);
        assert!(db.flush_order().unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_commit_leaves_cache_intact() {
        let db = db_with(&[1, 2]);
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            db.commit_cancellable(Some(1), &[], &cancel),
            Err(DatabaseError::Cancelled)
        ));
        assert!(matches!(
            db.cap_cancellable(0, &cancel),
            Err(DatabaseError::Cancelled)
        ));
        assert_eq!(db.flush_order().unwrap(), vec![1, 2]);
        assert_eq!(db.store().stats().unwrap().batch_writes, 0);
    }

    #[test]
    fn test_cap_evicts_oldest_until_below_limit() {
        let db = db_with(&[1, 2, 3, 4]);
        let per_node = db.cached_size().unwrap() / 4;

        // Room for two and a bit: the two oldest go
        let report = db.cap(per_node * 2 + 1).unwrap();
        assert_eq!(report.evicted_nodes, 2);
        assert_eq!(db.flush_order().unwrap(), vec![3, 4]);
        assert!(db.cached_size().unwrap() < per_node * 2 + 1);
        assert!(db.store().has(&node_key(1)).unwrap());
        assert!(db.store().has(&node_key(2)).unwrap());

        // Evicted nodes are still resolvable
        assert_eq!(*db.node(1).unwrap(), leaf(1, &[1]));

        // Already under the limit: no-op
        assert_eq!(db.cap(usize::MAX).unwrap(), CapReport::default());

        // Zero evicts everything
        db.cap(0).unwrap();
        assert!(db.flush_order().unwrap().is_empty());
    }

    #[test]
    fn test_large_commit_splits_batches() {
        let db = Database::new(MemoryStore::new());
        let ids: Vec<u64> = (1..=40).collect();
        for id in &ids {
            let mut leaf = LeafNode::new(*id);
            leaf.insert(Value::from_u64(*id), vec![0xAB; 8 * 1024]);
            db.insert(Node::Leaf(leaf)).unwrap();
        }

        let report = db.commit(None, &[]).unwrap();
        assert_eq!(report.nodes, 40);
        assert!(report.batches > 1);
        assert_eq!(db.store().stats().unwrap().batch_writes, report.batches as u64);
    }

    #[test]
    fn test_decode_failure_retries_once() {
        let db = db_with(&[1]);
        db.commit(Some(1), &[]).unwrap();
        db.store().put_raw(&node_key(1), b"garbage").unwrap();

        assert!(matches!(
            db.node(1),
            Err(DatabaseError::Malformed { id: 1, .. })
        ));
        assert_eq!(db.stats().unwrap().decode_retries, 1);
        // One read for the first attempt, one for the retry
        assert_eq!(db.store().stats().unwrap().reads, 2);
    }

    #[test]
    fn test_meta_u64_rejects_wrong_width() {
        let db = db_with(&[]);
        db.store().put_raw(ROOT_KEY, b"abc").unwrap();
        assert!(matches!(
            db.meta_u64(ROOT_KEY),
            Err(DatabaseError::Store(StoreError::Corruption(_)))
        ));
        assert_eq!(db.meta_u64(SEQUENCE_KEY).unwrap(), None);
    }
}
