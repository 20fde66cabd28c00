//! Structural invariant checking.
//!
//! Walks every node reachable from the root and verifies:
//! - Fanout: no node is empty or above its configured maximum
//! - Separators: each child's separator equals the largest value under it
//! - Order: entries are strictly ascending within and across leaves
//! - Chain: following `next` from the leftmost leaf visits exactly the leaves
//!   of the tree, left to right
//!
//! Used by tests after every mutation batch and by `vindex-inspect`.

use crate::index::node::{Node, NodeId};
use crate::index::tree::{Tree, TreeError};
use crate::index::value::Value;
use crate::storage::KvStore;

/// An invariant violation found in a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Node where it was detected.
    pub node: NodeId,
    /// Description of the violation.
    pub description: String,
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}: {}", self.node, self.description)
    }
}

/// Checker for tree invariants.
#[derive(Debug, Default)]
pub struct InvariantChecker {
    violations: Vec<InvariantViolation>,
    /// Leaves in left-to-right order as reached from the root.
    leaves: Vec<NodeId>,
}

impl InvariantChecker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            violations: Vec::new(),
            leaves: Vec::new(),
        }
    }

    /// Get all violations.
    #[must_use]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    #[must_use]
    pub const fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    fn add(&mut self, node: NodeId, description: impl Into<String>) {
        self.violations.push(InvariantViolation {
            node,
            description: description.into(),
        });
    }

    /// Check every invariant of `tree`.
    ///
    /// Store and cache errors abort the check; structural problems are
    /// collected as violations.
    pub fn check<S: KvStore>(&mut self, tree: &Tree<S>) -> Result<(), TreeError> {
        self.leaves.clear();
        let Some(root) = tree.root() else {
            if tree.first_leaf().is_some() {
                self.add(0, "empty tree has a first leaf");
            }
            return Ok(());
        };

        self.check_subtree(tree, root)?;
        self.check_chain(tree)?;
        Ok(())
    }

    /// Depth-first check below `id`; returns the subtree's maximum value.
    fn check_subtree<S: KvStore>(
        &mut self,
        tree: &Tree<S>,
        id: NodeId,
    ) -> Result<Option<Value>, TreeError> {
        let node = tree.db().node(id)?;
        let config = tree.config();

        match node.as_ref() {
            Node::Leaf(leaf) => {
                self.leaves.push(id);
                if leaf.entries.is_empty() {
                    self.add(id, "leaf is empty");
                }
                if leaf.entries.len() > config.max_leaf_fanout {
                    self.add(
                        id,
                        format!(
                            "leaf has {} entries, maximum is {}",
                            leaf.entries.len(),
                            config.max_leaf_fanout
                        ),
                    );
                }
                for pair in leaf.entries.windows(2) {
                    if pair[0].value >= pair[1].value {
                        self.add(
                            id,
                            format!("entries {} and {} out of order", pair[0].value, pair[1].value),
                        );
                    }
                }
                for entry in &leaf.entries {
                    if entry.identifiers.is_empty() {
                        self.add(id, format!("value {} has no identifiers", entry.value));
                    }
                }
                Ok(leaf.max_value().cloned())
            }
            Node::Internal(internal) => {
                let fanout = internal.children.len();
                if fanout == 0 {
                    self.add(id, "internal node has no children");
                }
                if fanout > config.max_internal_fanout {
                    self.add(
                        id,
                        format!(
                            "internal node has {fanout} children, maximum is {}",
                            config.max_internal_fanout
                        ),
                    );
                }

                let mut previous: Option<&Value> = None;
                for child in &internal.children {
                    if previous.is_some_and(|p| *p >= child.separator) {
                        self.add(id, format!("separator {} not ascending", child.separator));
                    }
                    previous = Some(&child.separator);

                    let actual = self.check_subtree(tree, child.child)?;
                    if actual.as_ref() != Some(&child.separator) {
                        self.add(
                            id,
                            format!(
                                "separator {} for child {} but its maximum is {}",
                                child.separator,
                                child.child,
                                actual.map_or_else(|| "none".to_string(), |v| v.to_string())
                            ),
                        );
                    }
                }
                Ok(internal.max_value().cloned())
            }
            Node::Unresolved(id) => Err(TreeError::unresolved(*id)),
        }
    }

    /// Follow the leaf chain and compare it with the leaves found top-down.
    fn check_chain<S: KvStore>(&mut self, tree: &Tree<S>) -> Result<(), TreeError> {
        let expected_first = self.leaves.first().copied();
        if tree.first_leaf() != expected_first {
            self.add(
                tree.first_leaf().unwrap_or_default(),
                format!(
                    "first leaf is {:?} but the leftmost leaf is {expected_first:?}",
                    tree.first_leaf()
                ),
            );
        }

        let mut chain = Vec::new();
        let mut last: Option<Value> = None;
        let mut next = expected_first;
        while let Some(id) = next {
            // A cycle would otherwise never end
            if chain.len() > self.leaves.len() {
                self.add(id, "leaf chain is longer than the tree");
                break;
            }
            chain.push(id);

            let node = tree.db().node(id)?;
            let Node::Leaf(leaf) = node.as_ref() else {
                self.add(id, "leaf chain reached a non-leaf");
                break;
            };
            if let (Some(prev), Some(min)) = (&last, leaf.min_value())
                && prev >= min
            {
                self.add(id, format!("leaf starts at {min}, not above {prev}"));
            }
            if let Some(max) = leaf.max_value() {
                last = Some(max.clone());
            }
            next = leaf.next;
        }

        if chain != self.leaves {
            self.add(
                expected_first.unwrap_or_default(),
                format!(
                    "leaf chain {chain:?} differs from tree order {:?}",
                    self.leaves
                ),
            );
        }
        Ok(())
    }
}

/// Check `tree` and return every violation found.
pub fn check_invariants<S: KvStore>(tree: &Tree<S>) -> Result<Vec<InvariantViolation>, TreeError> {
    let mut checker = InvariantChecker::new();
    checker.check(tree)?;
    Ok(checker.violations)
}
