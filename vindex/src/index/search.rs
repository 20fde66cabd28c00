//! Read-only queries: exact match, top-k and bounded range.
//!
//! All three merge the special-value table into the tree's results, so the
//! caller sees one ascending sequence regardless of where an entry lives.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::index::database::Database;
use crate::index::node::{LeafEntry, Node};
use crate::index::tree::{Tree, TreeError};
use crate::index::value::{Identifier, Value};
use crate::storage::KvStore;

/// Position in the leaf chain.
struct LeafCursor<'a, S: KvStore> {
    db: &'a Database<S>,
    /// `None` once the chain is exhausted.
    leaf: Option<Arc<Node>>,
    pos: usize,
}

impl<'a, S: KvStore> LeafCursor<'a, S> {
    /// Cursor at `pos` of `leaf`, moved forward to the next real entry.
    fn at(db: &'a Database<S>, leaf: Option<Arc<Node>>, pos: usize) -> Result<Self, TreeError> {
        let mut cursor = Self { db, leaf, pos };
        cursor.settle()?;
        Ok(cursor)
    }

    /// Skip past exhausted leaves.
    fn settle(&mut self) -> Result<(), TreeError> {
        while let Some(node) = &self.leaf {
            let Node::Leaf(leaf) = node.as_ref() else {
                return Err(TreeError::Corrupt(format!(
                    "leaf chain reached non-leaf node {}",
                    node.id()
                )));
            };
            if self.pos < leaf.entries.len() {
                return Ok(());
            }
            let next = leaf.next;
            self.leaf = match next {
                Some(next) => Some(self.db.node(next)?),
                None => None,
            };
            self.pos = 0;
        }
        Ok(())
    }

    fn peek(&self) -> Option<&LeafEntry> {
        match self.leaf.as_deref() {
            Some(Node::Leaf(leaf)) => leaf.entries.get(self.pos),
            _ => None,
        }
    }

    fn advance(&mut self) -> Result<(), TreeError> {
        self.pos += 1;
        self.settle()
    }
}

impl<S: KvStore> Tree<S> {
    /// Identifiers recorded under exactly `value`, in insertion order.
    pub fn specific_search(&self, value: &Value) -> Result<Option<Vec<Identifier>>, TreeError> {
        let special = self.specials().get(value).map(<[Identifier]>::to_vec);

        let in_tree = match self.find_leaf(value)? {
            Some(node) => match node.as_ref() {
                Node::Leaf(leaf) => leaf.get(value).map(<[Identifier]>::to_vec),
                _ => None,
            },
            None => None,
        };

        Ok(match (in_tree, special) {
            (Some(mut ids), Some(extra)) => {
                ids.extend(extra);
                Some(ids)
            }
            (ids, None) | (None, ids) => ids,
        })
    }

    /// The `k` smallest entries, ascending.
    ///
    /// Fails with `InsufficientResults` (carrying everything found) when
    /// fewer than `k` entries exist.
    pub fn topk_search(&self, k: usize) -> Result<Vec<LeafEntry>, TreeError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let first = self
            .first_leaf()
            .map(|id| self.db().node(id))
            .transpose()?;
        let cursor = LeafCursor::at(self.db(), first, 0)?;
        let entries = self.merge_scan(cursor, None, None, k)?;

        if entries.len() < k {
            return Err(TreeError::InsufficientResults {
                requested: k,
                partial: entries,
            });
        }
        Ok(entries)
    }

    /// Up to `k` entries with `min <= value <= max`, ascending.
    ///
    /// Returns exactly `min(k, entries in range)`; a short range is not an
    /// error.
    pub fn range_search(
        &self,
        min: &Value,
        max: &Value,
        k: usize,
    ) -> Result<Vec<LeafEntry>, TreeError> {
        if k == 0 || min > max {
            return Ok(Vec::new());
        }

        let cursor = match self.find_leaf(min)? {
            Some(node) => {
                let pos = match node.as_ref() {
                    Node::Leaf(leaf) => leaf.lower_bound(min),
                    _ => 0,
                };
                LeafCursor::at(self.db(), Some(node), pos)?
            }
            // Every stored value is below `min`
            None => LeafCursor::at(self.db(), None, 0)?,
        };
        self.merge_scan(cursor, Some(min), Some(max), k)
    }

    /// Walk the leaf chain from `cursor` and the special values in
    /// `[min, max]` together, emitting up to `k` entries in ascending order.
    fn merge_scan(
        &self,
        mut cursor: LeafCursor<'_, S>,
        min: Option<&Value>,
        max: Option<&Value>,
        k: usize,
    ) -> Result<Vec<LeafEntry>, TreeError> {
        let mut specials = self.specials().entries_between(min, max).peekable();
        let mut out = Vec::new();

        while out.len() < k {
            let from_tree = cursor
                .peek()
                .filter(|e| max.is_none_or(|m| e.value <= *m))
                .cloned();

            match (from_tree, specials.peek()) {
                (None, None) => break,
                (Some(entry), None) => {
                    out.push(entry);
                    cursor.advance()?;
                }
                (None, Some(_)) => out.extend(specials.next()),
                (Some(entry), Some(special)) => match entry.value.cmp(&special.value) {
                    Ordering::Less => {
                        out.push(entry);
                        cursor.advance()?;
                    }
                    Ordering::Greater => out.extend(specials.next()),
                    Ordering::Equal => {
                        let mut merged = entry;
                        if let Some(special) = specials.next() {
                            merged.identifiers.extend(special.identifiers);
                        }
                        out.push(merged);
                        cursor.advance()?;
                    }
                },
            }
        }
        Ok(out)
    }

    /// Leaf that would hold `value`, or `None` when `value` is above every
    /// separator (or the tree is empty).
    fn find_leaf(&self, value: &Value) -> Result<Option<Arc<Node>>, TreeError> {
        let Some(mut id) = self.root() else {
            return Ok(None);
        };

        loop {
            let node = self.db().node(id)?;
            match node.as_ref() {
                Node::Leaf(_) => return Ok(Some(node)),
                Node::Internal(internal) => match internal.find_child_index(value) {
                    Some(index) => id = internal.children[index].child,
                    None => return Ok(None),
                },
                Node::Unresolved(id) => return Err(TreeError::unresolved(*id)),
            }
        }
    }
}
