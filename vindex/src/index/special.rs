//! Special values: high-frequency keys kept outside the tree.
//!
//! Recording every identifier of a very common value in one leaf entry would
//! make that leaf a hot spot that grows without bound. Values configured as
//! special bypass the tree and accumulate identifiers here instead. Searches
//! splice them back into their results at the right position.

use std::collections::BTreeMap;

use crate::index::codec::{self, NodeError};
use crate::index::node::LeafEntry;
use crate::index::value::{Identifier, Value};

/// The special-value table of a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialValues {
    entries: BTreeMap<Value, Vec<Identifier>>,
}

impl SpecialValues {
    /// Create a table tracking `values`, all initially without identifiers.
    #[must_use]
    pub fn new(values: &[Value]) -> Self {
        Self {
            entries: values.iter().map(|v| (v.clone(), Vec::new())).collect(),
        }
    }

    /// Whether `value` is tracked here.
    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        self.entries.contains_key(value)
    }

    /// Append identifiers to a special value.
    ///
    /// Hands the identifiers back when `value` is not special.
    pub fn record(
        &mut self,
        value: &Value,
        identifiers: Vec<Identifier>,
    ) -> Result<(), Vec<Identifier>> {
        match self.entries.get_mut(value) {
            Some(existing) => {
                existing.extend(identifiers);
                Ok(())
            }
            None => Err(identifiers),
        }
    }

    /// Identifiers recorded under `value`, if it is special and non-empty.
    #[must_use]
    pub fn get(&self, value: &Value) -> Option<&[Identifier]> {
        self.entries
            .get(value)
            .filter(|ids| !ids.is_empty())
            .map(Vec::as_slice)
    }

    /// Non-empty special entries within `[min, max]`, ascending.
    ///
    /// `None` leaves that side of the range open.
    pub fn entries_between<'a>(
        &'a self,
        min: Option<&'a Value>,
        max: Option<&'a Value>,
    ) -> impl Iterator<Item = LeafEntry> + 'a {
        self.entries
            .iter()
            .filter(move |(value, ids)| {
                !ids.is_empty()
                    && min.is_none_or(|m| *value >= m)
                    && max.is_none_or(|m| *value <= m)
            })
            .map(|(value, ids)| LeafEntry {
                value: value.clone(),
                identifiers: ids.clone(),
            })
    }

    /// Number of tracked values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total identifiers recorded across all special values.
    #[must_use]
    pub fn identifier_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Serialize every tracked value with its identifiers.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let entries: Vec<LeafEntry> = self
            .entries
            .iter()
            .map(|(value, ids)| LeafEntry {
                value: value.clone(),
                identifiers: ids.clone(),
            })
            .collect();
        codec::encode_entries(&entries)
    }

    /// Merge previously persisted entries into the table.
    ///
    /// Persisted values stay special even when they are no longer
    /// configured, so their identifiers remain searchable.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), NodeError> {
        for entry in codec::decode_entries(bytes)? {
            let ids = self.entries.entry(entry.value).or_default();
            // Persisted identifiers predate anything recorded since open
            let recent = std::mem::replace(ids, entry.identifiers);
            ids.extend(recent);
        }
        Ok(())
    }
}
