//! Value-ordered secondary index.
//!
//! The index maps numeric byte keys ([`Value`]) to the identifiers of the
//! records that carry them. It is a B+tree whose nodes live in a write-back
//! cache ([`Database`]) in front of a [`KvStore`](crate::storage::KvStore).
//!
//! # Architecture
//!
//! - `value`, `node`: keys, identifiers and the node variants
//! - `codec`: checksummed binary encoding of a node
//! - `database`: dirty-node cache, flush-list, batched commit and eviction
//! - `tree`: insert, split propagation and commit
//! - `search`: exact, top-k and range queries
//! - `special`: high-frequency values kept outside the tree
//! - `bulk`: parallel extraction and sorted appends
//! - `stats`, `invariants`: counters, shape and structural checks
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//!
//! use vindex::index::{Database, Tree, TreeConfig, Value};
//! use vindex::storage::MemoryStore;
//!
//! let db = Arc::new(Database::new(MemoryStore::new()));
//! let mut tree = Tree::open(db, None, TreeConfig::default())?;
//! tree.insert(Value::from_u64(42), b"tx-1".to_vec())?;
//! let root = tree.commit()?;
//!
//! assert_ne!(root, 0);
//! assert_eq!(
//!     tree.specific_search(&Value::from_u64(42))?,
//!     Some(vec![b"tx-1".to_vec()])
//! );
//! # Ok::<(), vindex::index::TreeError>(())
//! ```

pub mod bulk;
pub mod codec;
pub mod database;
pub mod invariants;
pub mod node;
mod search;
pub mod special;
pub mod stats;
pub mod tree;
pub mod value;

pub use bulk::{BulkLoadError, BulkLoadReport, BulkLoader, ExtractError, ExtractTask};
pub use codec::NodeError;
pub use database::{
    CACHED_NODE_OVERHEAD, CacheStats, CancelToken, CapReport, CommitReport, Database,
    DatabaseError,
};
pub use invariants::{InvariantChecker, InvariantViolation, check_invariants};
pub use node::{ChildEntry, InternalNode, LeafEntry, LeafNode, NO_NODE, Node, NodeId};
pub use special::SpecialValues;
pub use stats::{TreeShape, TreeStats};
pub use tree::{Tree, TreeConfig, TreeError};
pub use value::{Identifier, Value};
