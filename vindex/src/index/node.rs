//! Index tree node types.
//!
//! The tree has two resolved node kinds plus a placeholder:
//! - Internal nodes: children ordered by separator, where a separator is the
//!   largest value reachable through that child
//! - Leaf nodes: value entries in ascending order, singly linked to the next
//!   leaf for range scans
//! - Unresolved: a node known only by ID, not yet loaded from the store
//!
//! Nodes never hold references to each other, only `NodeId`s. The database
//! resolves an ID to a node on demand.

use crate::index::value::{Identifier, Value};

/// Sequence number identifying a node; also its key in the store.
pub type NodeId = u64;

/// Reserved ID meaning "no node" on the wire. Sequences start at 1.
pub const NO_NODE: NodeId = 0;

/// All identifiers recorded under one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub value: Value,
    /// In insertion order.
    pub identifiers: Vec<Identifier>,
}

impl LeafEntry {
    /// Create an entry holding a single identifier.
    #[must_use]
    pub fn new(value: Value, identifier: Identifier) -> Self {
        Self {
            value,
            identifiers: vec![identifier],
        }
    }
}

/// A child pointer inside an internal node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    /// Maximum value in the child's subtree.
    pub separator: Value,
    pub child: NodeId,
}

/// A leaf node.
///
/// Stores value entries and a link to the next leaf in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub id: NodeId,
    /// Entries in ascending order by value, values unique.
    pub entries: Vec<LeafEntry>,
    /// Next leaf in ascending order, `None` at the tail of the chain.
    pub next: Option<NodeId>,
}

impl LeafNode {
    /// Create a new empty leaf node.
    #[must_use]
    pub const fn new(id: NodeId) -> Self {
        Self {
            id,
            entries: Vec::new(),
            next: None,
        }
    }

    /// Find the index where a value should be inserted (or exists).
    pub fn find_index(&self, value: &Value) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.value.cmp(value))
    }

    /// Index of the first entry whose value is >= `value`.
    #[must_use]
    pub fn lower_bound(&self, value: &Value) -> usize {
        self.entries.partition_point(|e| e.value < *value)
    }

    /// Get the identifiers recorded under a value.
    #[must_use]
    pub fn get(&self, value: &Value) -> Option<&[Identifier]> {
        self.find_index(value)
            .ok()
            .map(|i| self.entries[i].identifiers.as_slice())
    }

    /// Record `identifier` under `value`.
    ///
    /// Returns true if a new entry was created, false if the identifier was
    /// appended to an existing one.
    pub fn insert(&mut self, value: Value, identifier: Identifier) -> bool {
        self.insert_entry(LeafEntry::new(value, identifier))
    }

    /// Merge a whole entry into the leaf.
    ///
    /// Returns true if a new entry was created.
    pub fn insert_entry(&mut self, entry: LeafEntry) -> bool {
        match self.find_index(&entry.value) {
            Ok(i) => {
                self.entries[i].identifiers.extend(entry.identifiers);
                false
            }
            Err(i) => {
                self.entries.insert(i, entry);
                true
            }
        }
    }

    /// Largest value in the leaf.
    #[must_use]
    pub fn max_value(&self) -> Option<&Value> {
        self.entries.last().map(|e| &e.value)
    }

    /// Smallest value in the leaf.
    #[must_use]
    pub fn min_value(&self) -> Option<&Value> {
        self.entries.first().map(|e| &e.value)
    }

    /// Split the node at the midpoint, returning the new right node.
    ///
    /// The right node takes over this node's place in the leaf chain: it
    /// inherits `next`, and this node now links to it.
    #[must_use]
    pub fn split(&mut self, right_id: NodeId) -> Self {
        let mid = self.entries.len() / 2;

        // Right node gets entries from mid onwards
        let right = Self {
            id: right_id,
            entries: self.entries.drain(mid..).collect(),
            next: self.next,
        };
        self.next = Some(right_id);

        right
    }
}

/// An internal (non-leaf) node.
///
/// `children[i]` holds every value in `(children[i-1].separator,
/// children[i].separator]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub id: NodeId,
    /// Children in ascending order by separator.
    pub children: Vec<ChildEntry>,
}

impl InternalNode {
    /// Create an internal node with the given children.
    #[must_use]
    pub const fn new(id: NodeId, children: Vec<ChildEntry>) -> Self {
        Self { id, children }
    }

    /// Index of the first child whose separator is >= `value`.
    ///
    /// `None` means `value` is larger than everything under this node.
    #[must_use]
    pub fn find_child_index(&self, value: &Value) -> Option<usize> {
        let i = self.children.partition_point(|c| c.separator < *value);
        (i < self.children.len()).then_some(i)
    }

    /// Child index to descend into when inserting `value`.
    ///
    /// Falls back to the last child when `value` exceeds every separator.
    #[must_use]
    pub fn route(&self, value: &Value) -> usize {
        self.find_child_index(value)
            .unwrap_or_else(|| self.children.len().saturating_sub(1))
    }

    /// Largest separator, which is the largest value under this node.
    #[must_use]
    pub fn max_value(&self) -> Option<&Value> {
        self.children.last().map(|c| &c.separator)
    }

    /// Split the node at the midpoint, returning the new right node.
    #[must_use]
    pub fn split(&mut self, right_id: NodeId) -> Self {
        let mid = self.children.len() / 2;
        Self {
            id: right_id,
            children: self.children.drain(mid..).collect(),
        }
    }
}

/// A node of the index tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
    /// Placeholder for a node that lives in the store and hasn't been loaded.
    Unresolved(NodeId),
}

impl Node {
    /// The node's ID.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        match self {
            Self::Leaf(leaf) => leaf.id,
            Self::Internal(internal) => internal.id,
            Self::Unresolved(id) => *id,
        }
    }

    /// Whether the node's content is available.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved(_))
    }

    /// Number of entries (leaf) or children (internal).
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn fanout(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.entries.len(),
            Self::Internal(internal) => internal.children.len(),
            Self::Unresolved(_) => 0,
        }
    }

    /// Largest value under this node, if resolved and non-empty.
    #[must_use]
    pub fn max_value(&self) -> Option<&Value> {
        match self {
            Self::Leaf(leaf) => leaf.max_value(),
            Self::Internal(internal) => internal.max_value(),
            Self::Unresolved(_) => None,
        }
    }
}

impl From<LeafNode> for Node {
    fn from(leaf: LeafNode) -> Self {
        Self::Leaf(leaf)
    }
}

impl From<InternalNode> for Node {
    fn from(internal: InternalNode) -> Self {
        Self::Internal(internal)
    }
}
