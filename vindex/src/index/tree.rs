//! Value-ordered B+tree over the node cache.
//!
//! Every internal child carries a *separator*: the largest value in that
//! child's subtree. Lookups descend into the first child whose separator is
//! >= the probe; inserts past the last separator extend the last child and
//! raise its separator. Leaves hold `(value, identifiers)` entries and are
//! linked left to right for scans.
//!
//! Nodes are never mutated in place. Each insert clones the nodes it changes
//! and puts the new versions into the [`Database`] under their existing IDs,
//! so readers holding an older `Arc<Node>` keep a consistent view.

use std::sync::Arc;

use crate::index::database::{
    CancelToken, Database, DatabaseError, ROOT_KEY, SEQUENCE_KEY, SPECIAL_KEY,
};
use crate::index::node::{ChildEntry, InternalNode, LeafEntry, LeafNode, NO_NODE, Node, NodeId};
use crate::index::special::SpecialValues;
use crate::index::stats::TreeStats;
use crate::index::value::{Identifier, Value};
use crate::storage::KvStore;

/// Default maximum number of entries in a leaf.
pub const DEFAULT_MAX_LEAF_FANOUT: usize = 64;
/// Default maximum number of children of an internal node.
pub const DEFAULT_MAX_INTERNAL_FANOUT: usize = 128;

/// Shape parameters of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConfig {
    pub max_leaf_fanout: usize,
    pub max_internal_fanout: usize,
    /// Values whose identifiers are kept outside the tree.
    pub special_values: Vec<Value>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_leaf_fanout: DEFAULT_MAX_LEAF_FANOUT,
            max_internal_fanout: DEFAULT_MAX_INTERNAL_FANOUT,
            special_values: Vec::new(),
        }
    }
}

impl TreeConfig {
    /// Config with the given fanouts and no special values.
    #[must_use]
    pub const fn with_fanout(max_leaf_fanout: usize, max_internal_fanout: usize) -> Self {
        Self {
            max_leaf_fanout,
            max_internal_fanout,
            special_values: Vec::new(),
        }
    }

    /// Check that a split always leaves two non-empty halves.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.max_leaf_fanout < 2 {
            return Err(TreeError::Config(format!(
                "max_leaf_fanout must be at least 2, got {}",
                self.max_leaf_fanout
            )));
        }
        if self.max_internal_fanout < 2 {
            return Err(TreeError::Config(format!(
                "max_internal_fanout must be at least 2, got {}",
                self.max_internal_fanout
            )));
        }
        Ok(())
    }
}

/// Errors that can occur during tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// The node cache or the store failed.
    Database(DatabaseError),
    /// A node still exceeds its fanout after a split.
    CapacityInvariantViolation {
        node: NodeId,
        fanout: usize,
        max: usize,
    },
    /// Fewer than `requested` entries exist; `partial` holds all of them.
    InsufficientResults {
        requested: usize,
        partial: Vec<LeafEntry>,
    },
    /// The persisted structure is impossible (e.g. an internal node with no
    /// children, or a leaf where an internal node belongs).
    Corrupt(String),
    /// Invalid `TreeConfig`.
    Config(String),
}

impl TreeError {
    /// An `Unresolved` node reached a traversal; reported as missing.
    pub(crate) const fn unresolved(id: NodeId) -> Self {
        Self::Database(DatabaseError::MissingNode(id))
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::CapacityInvariantViolation { node, fanout, max } => write!(
                f,
                "node {node} has fanout {fanout} after split, maximum is {max}"
            ),
            Self::InsufficientResults { requested, partial } => write!(
                f,
                "requested {requested} entries but only {} exist",
                partial.len()
            ),
            Self::Corrupt(msg) => write!(f, "corrupt tree: {msg}"),
            Self::Config(msg) => write!(f, "invalid tree config: {msg}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DatabaseError> for TreeError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}

/// One step of a root-to-leaf descent: the internal node and the child
/// index taken.
type PathStep = (Arc<Node>, usize);

/// A value-ordered index tree.
///
/// # Concurrency
///
/// Mutation takes `&mut self`, so one tree has exactly one writer. Searches
/// take `&self` and only read through the shared `Database`.
pub struct Tree<S: KvStore> {
    db: Arc<Database<S>>,
    config: TreeConfig,
    root: Option<NodeId>,
    /// Next ID to allocate.
    sequence: u64,
    specials: SpecialValues,
    /// The leftmost leaf. Splits keep the lower half in place, so this never
    /// changes once the first leaf exists.
    first_leaf: Option<NodeId>,
    /// Root to rightmost leaf, for `append_sorted`. Empty when stale.
    rightmost: Vec<NodeId>,
    stats: TreeStats,
    /// Whether anything changed since the last commit.
    changed: bool,
}

impl<S: KvStore> Tree<S> {
    /// Open a tree rooted at `root` (`None` for a new, empty tree).
    ///
    /// The sequence counter and special-value identifiers are read from the
    /// store's metadata when present.
    pub fn open(
        db: Arc<Database<S>>,
        root: Option<NodeId>,
        config: TreeConfig,
    ) -> Result<Self, TreeError> {
        config.validate()?;

        let root = root.filter(|id| *id != NO_NODE);
        let sequence = match (db.meta_u64(SEQUENCE_KEY)?, root) {
            (Some(sequence), _) => sequence,
            (None, None) => 1,
            (None, Some(root)) => {
                return Err(TreeError::Corrupt(format!(
                    "root {root} given but the store has no sequence counter"
                )));
            }
        };
        if root.is_some_and(|r| r >= sequence) {
            return Err(TreeError::Corrupt(format!(
                "root {root:?} is not below sequence {sequence}"
            )));
        }

        let mut specials = SpecialValues::new(&config.special_values);
        if let Some(bytes) = db.meta(SPECIAL_KEY)? {
            specials
                .restore(&bytes)
                .map_err(|e| TreeError::Corrupt(format!("special values: {e}")))?;
        }

        let mut tree = Self {
            db,
            config,
            root,
            sequence,
            specials,
            first_leaf: None,
            rightmost: Vec::new(),
            stats: TreeStats::default(),
            changed: false,
        };
        tree.first_leaf = tree.leftmost_leaf()?;

        tracing::info!(
            "opened tree at root {root:?}, sequence {sequence}, {} special values",
            tree.specials.len()
        );
        Ok(tree)
    }

    /// Open the tree recorded by the last commit, or an empty one.
    pub fn open_latest(db: Arc<Database<S>>, config: TreeConfig) -> Result<Self, TreeError> {
        let root = db.meta_u64(ROOT_KEY)?;
        Self::open(db, root, config)
    }

    /// The shared node cache.
    #[must_use]
    pub const fn db(&self) -> &Arc<Database<S>> {
        &self.db
    }

    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Current root, `None` while the tree is empty.
    #[must_use]
    pub const fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Next node ID to be allocated.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub const fn specials(&self) -> &SpecialValues {
        &self.specials
    }

    #[must_use]
    pub const fn first_leaf(&self) -> Option<NodeId> {
        self.first_leaf
    }

    #[must_use]
    pub const fn stats(&self) -> &TreeStats {
        &self.stats
    }

    /// Whether there are changes not yet committed.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.changed
    }

    /// Record `identifier` under `value`.
    pub fn insert(&mut self, value: Value, identifier: Identifier) -> Result<(), TreeError> {
        self.insert_entry(LeafEntry::new(value, identifier))
    }

    /// Record every identifier of `entry` under its value.
    pub fn insert_entry(&mut self, entry: LeafEntry) -> Result<(), TreeError> {
        let Some(entry) = self.absorb_special(entry) else {
            return Ok(());
        };
        let path = self.descend(&entry.value)?;
        self.insert_along(path, entry)
    }

    /// Insert a value that is expected to be >= everything inserted so far.
    ///
    /// Values at or beyond the first value of the rightmost leaf go straight
    /// to that leaf; anything else falls back to `insert`.
    pub fn append_sorted(&mut self, value: Value, identifier: Identifier) -> Result<(), TreeError> {
        self.append_entry(LeafEntry::new(value, identifier))
    }

    /// `append_sorted` for a whole entry.
    pub fn append_entry(&mut self, entry: LeafEntry) -> Result<(), TreeError> {
        let Some(entry) = self.absorb_special(entry) else {
            return Ok(());
        };

        if self.root.is_some() && self.rightmost.is_empty() {
            self.rightmost = self.rightmost_path()?;
        }

        if let Some(path) = self.fast_path(&entry.value)? {
            self.stats.fast_path_appends += 1;
            return self.insert_along(Some(path), entry);
        }

        self.stats.slow_path_appends += 1;
        let path = self.descend(&entry.value)?;
        self.insert_along(path, entry)
    }

    /// Persist all changes and return the root (`NO_NODE` when empty).
    ///
    /// Does nothing when nothing changed since the last commit.
    pub fn commit(&mut self) -> Result<NodeId, TreeError> {
        self.commit_cancellable(&CancelToken::new())
    }

    /// `commit`, checking `cancel` before every batch write.
    pub fn commit_cancellable(&mut self, cancel: &CancelToken) -> Result<NodeId, TreeError> {
        let root = self.root.unwrap_or(NO_NODE);
        if !self.changed {
            return Ok(root);
        }

        let meta: [(&[u8], Vec<u8>); 3] = [
            (SEQUENCE_KEY, self.sequence.to_be_bytes().to_vec()),
            (ROOT_KEY, root.to_be_bytes().to_vec()),
            (SPECIAL_KEY, self.specials.encode()),
        ];
        let report = self.db.commit_cancellable(self.root, &meta, cancel)?;

        self.changed = false;
        self.stats.commits += 1;
        tracing::info!(
            "tree commit at root {root}: {} nodes, sequence {}",
            report.nodes,
            self.sequence
        );
        Ok(root)
    }

    /// Route special values to the special table. Returns the entry when it
    /// belongs in the tree.
    fn absorb_special(&mut self, entry: LeafEntry) -> Option<LeafEntry> {
        let count = entry.identifiers.len() as u64;
        self.stats.inserts += count;
        match self.specials.record(&entry.value, entry.identifiers) {
            Ok(()) => {
                self.stats.special_hits += count;
                self.changed = true;
                None
            }
            Err(identifiers) => Some(LeafEntry {
                value: entry.value,
                identifiers,
            }),
        }
    }

    fn allocate(&mut self) -> NodeId {
        let id = self.sequence;
        self.sequence += 1;
        id
    }

    /// Descend from the root towards the leaf that should hold `value`.
    ///
    /// Past the last separator the last child is taken. Returns the internal
    /// nodes visited and the leaf, or `None` for an empty tree.
    fn descend(&self, value: &Value) -> Result<Option<(Vec<PathStep>, Arc<Node>)>, TreeError> {
        let Some(mut id) = self.root else {
            return Ok(None);
        };

        let mut path = Vec::new();
        loop {
            let node = self.db.node(id)?;
            match node.as_ref() {
                Node::Leaf(_) => return Ok(Some((path, node))),
                Node::Internal(internal) => {
                    if internal.children.is_empty() {
                        return Err(TreeError::Corrupt(format!(
                            "internal node {id} has no children"
                        )));
                    }
                    let index = internal.route(value);
                    id = internal.children[index].child;
                    path.push((node, index));
                }
                Node::Unresolved(id) => return Err(TreeError::unresolved(*id)),
            }
        }
    }

    /// The cached rightmost path, resolved, if `value` may be appended to
    /// its leaf directly.
    fn fast_path(&self, value: &Value) -> Result<Option<(Vec<PathStep>, Arc<Node>)>, TreeError> {
        let Some((&leaf_id, internals)) = self.rightmost.split_last() else {
            return Ok(None);
        };

        let leaf = self.db.node(leaf_id)?;
        let fits = match leaf.as_ref() {
            Node::Leaf(l) => l.min_value().is_some_and(|min| value >= min),
            _ => false,
        };
        if !fits {
            return Ok(None);
        }

        let mut path = Vec::with_capacity(internals.len());
        for id in internals {
            let node = self.db.node(*id)?;
            let last = node.fanout().checked_sub(1).ok_or_else(|| {
                TreeError::Corrupt(format!("rightmost path node {id} has no children"))
            })?;
            path.push((node, last));
        }
        Ok(Some((path, leaf)))
    }

    /// IDs from the root down the last children to the rightmost leaf.
    fn rightmost_path(&self) -> Result<Vec<NodeId>, TreeError> {
        let mut path = Vec::new();
        let mut next = self.root;
        while let Some(id) = next {
            path.push(id);
            next = match self.db.node(id)?.as_ref() {
                Node::Leaf(_) => None,
                Node::Internal(internal) => Some(
                    internal
                        .children
                        .last()
                        .ok_or_else(|| {
                            TreeError::Corrupt(format!("internal node {id} has no children"))
                        })?
                        .child,
                ),
                Node::Unresolved(id) => return Err(TreeError::unresolved(*id)),
            };
        }
        Ok(path)
    }

    /// Follow first children down to the leftmost leaf.
    pub(crate) fn leftmost_leaf(&self) -> Result<Option<NodeId>, TreeError> {
        let mut next = self.root;
        while let Some(id) = next {
            match self.db.node(id)?.as_ref() {
                Node::Leaf(_) => return Ok(Some(id)),
                Node::Internal(internal) => {
                    next = Some(
                        internal
                            .children
                            .first()
                            .ok_or_else(|| {
                                TreeError::Corrupt(format!("internal node {id} has no children"))
                            })?
                            .child,
                    );
                }
                Node::Unresolved(id) => return Err(TreeError::unresolved(*id)),
            }
        }
        Ok(None)
    }

    /// Add `entry` to the leaf at the end of `path`, then fix separators and
    /// split overflowing nodes bottom-up.
    fn insert_along(
        &mut self,
        path: Option<(Vec<PathStep>, Arc<Node>)>,
        entry: LeafEntry,
    ) -> Result<(), TreeError> {
        self.changed = true;

        let Some((path, leaf_node)) = path else {
            // Empty tree: the first leaf becomes the root
            let mut leaf = LeafNode::new(self.allocate());
            leaf.insert_entry(entry);
            let id = leaf.id;
            self.db.insert(Node::Leaf(leaf))?;
            self.root = Some(id);
            self.first_leaf = Some(id);
            self.rightmost = vec![id];
            tracing::debug!("created root leaf {id}");
            return Ok(());
        };

        let Node::Leaf(leaf) = leaf_node.as_ref() else {
            return Err(TreeError::Corrupt(format!(
                "node {} reached as a leaf",
                leaf_node.id()
            )));
        };
        let mut leaf = leaf.clone();
        leaf.insert_entry(entry);

        // New right sibling waiting to be linked into the parent
        let mut split: Option<ChildEntry> = None;
        if leaf.entries.len() > self.config.max_leaf_fanout {
            let right = leaf.split(self.allocate());
            check_fanout(leaf.id, leaf.entries.len(), self.config.max_leaf_fanout)?;
            check_fanout(right.id, right.entries.len(), self.config.max_leaf_fanout)?;
            split = Some(ChildEntry {
                separator: max_of(right.max_value(), right.id)?,
                child: right.id,
            });
            tracing::debug!("split leaf {} off {}", right.id, leaf.id);
            self.stats.leaf_splits += 1;
            self.rightmost.clear();
            self.db.insert(Node::Leaf(right))?;
        }
        let mut child_max = max_of(leaf.max_value(), leaf.id)?;
        let mut child_id = leaf.id;
        self.db.insert(Node::Leaf(leaf))?;

        for (node, index) in path.into_iter().rev() {
            let Node::Internal(parent) = node.as_ref() else {
                return Err(TreeError::Corrupt(format!(
                    "node {} on a descent path is not internal",
                    node.id()
                )));
            };
            let current = parent.children.get(index).ok_or_else(|| {
                TreeError::Corrupt(format!("child {index} of node {} is missing", parent.id))
            })?;
            if current.child != child_id {
                return Err(TreeError::Corrupt(format!(
                    "node {} child {index} is {}, expected {child_id}",
                    parent.id, current.child
                )));
            }

            // Neither a new sibling nor a moved maximum: ancestors are intact
            if split.is_none() && current.separator == child_max {
                return Ok(());
            }

            let mut parent = parent.clone();
            parent.children[index].separator = child_max;
            if let Some(right) = split.take() {
                parent.children.insert(index + 1, right);
            }

            if parent.children.len() > self.config.max_internal_fanout {
                let right = parent.split(self.allocate());
                let max = self.config.max_internal_fanout;
                check_fanout(parent.id, parent.children.len(), max)?;
                check_fanout(right.id, right.children.len(), max)?;
                split = Some(ChildEntry {
                    separator: max_of(right.max_value(), right.id)?,
                    child: right.id,
                });
                tracing::debug!("split internal node {} off {}", right.id, parent.id);
                self.stats.internal_splits += 1;
                self.rightmost.clear();
                self.db.insert(Node::Internal(right))?;
            }

            child_max = max_of(parent.max_value(), parent.id)?;
            child_id = parent.id;
            self.db.insert(Node::Internal(parent))?;
        }

        if let Some(right) = split {
            // The root itself split
            let root = InternalNode::new(
                self.allocate(),
                vec![
                    ChildEntry {
                        separator: child_max,
                        child: child_id,
                    },
                    right,
                ],
            );
            tracing::debug!("new root {} above {child_id}", root.id);
            self.root = Some(root.id);
            self.stats.root_splits += 1;
            self.db.insert(Node::Internal(root))?;
        }
        Ok(())
    }
}

/// Both halves of a split must be non-empty and within the maximum.
const fn check_fanout(node: NodeId, fanout: usize, max: usize) -> Result<(), TreeError> {
    if fanout > max || fanout == 0 {
        return Err(TreeError::CapacityInvariantViolation { node, fanout, max });
    }
    Ok(())
}

fn max_of(value: Option<&Value>, id: NodeId) -> Result<Value, TreeError> {
    value
        .cloned()
        .ok_or_else(|| TreeError::Corrupt(format!("node {id} is empty")))
}
