//! Per-tree counters and shape inspection.

use crate::index::node::{Node, NodeId};
use crate::index::tree::{Tree, TreeError};
use crate::storage::KvStore;

/// Counters for one tree instance.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// `(value, identifier)` pairs accepted, special values included.
    pub inserts: u64,
    /// Inserts absorbed by the special-value table.
    pub special_hits: u64,
    pub leaf_splits: u64,
    pub internal_splits: u64,
    /// Splits that grew the tree by one level.
    pub root_splits: u64,
    /// `append_sorted` calls served from the cached rightmost path.
    pub fast_path_appends: u64,
    /// `append_sorted` calls that fell back to a top-down insert.
    pub slow_path_appends: u64,
    /// Commits that wrote something.
    pub commits: u64,
}

/// Structure of a tree, gathered by walking every node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeShape {
    /// Levels from root to leaves; 0 for an empty tree.
    pub depth: usize,
    pub leaves: usize,
    pub internals: usize,
    /// Distinct values stored in leaves.
    pub entries: usize,
    /// Identifiers stored in leaves.
    pub identifiers: usize,
    /// Identifiers held by special values.
    pub special_identifiers: usize,
}

impl TreeShape {
    /// Mean entries per leaf.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_leaf_fanout(&self) -> f64 {
        if self.leaves == 0 {
            return 0.0;
        }
        self.entries as f64 / self.leaves as f64
    }
}

impl<S: KvStore> Tree<S> {
    /// Walk the whole tree and report its shape.
    pub fn shape(&self) -> Result<TreeShape, TreeError> {
        let mut shape = TreeShape {
            special_identifiers: self.specials().identifier_count(),
            ..TreeShape::default()
        };
        let Some(root) = self.root() else {
            return Ok(shape);
        };

        let mut stack: Vec<(NodeId, usize)> = vec![(root, 1)];
        while let Some((id, level)) = stack.pop() {
            shape.depth = shape.depth.max(level);
            match self.db().node(id)?.as_ref() {
                Node::Leaf(leaf) => {
                    shape.leaves += 1;
                    shape.entries += leaf.entries.len();
                    shape.identifiers += leaf
                        .entries
                        .iter()
                        .map(|e| e.identifiers.len())
                        .sum::<usize>();
                }
                Node::Internal(internal) => {
                    shape.internals += 1;
                    stack.extend(internal.children.iter().map(|c| (c.child, level + 1)));
                }
                Node::Unresolved(id) => return Err(TreeError::unresolved(*id)),
            }
        }
        Ok(shape)
    }
}
