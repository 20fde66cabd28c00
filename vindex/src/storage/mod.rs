//! Persistent key-value stores underneath the index.
//!
//! The index tree only needs point reads and batched writes, so storage is a
//! small trait with two implementations:
//!
//! - [`MemoryStore`]: a `HashMap` with seeded fault injection, for tests and
//!   simulation
//! - [`FileStore`]: an append-only, checksummed log file, for durability
//!
//! # Usage
//!
//! ```
//! use vindex::storage::{Batch, KvStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let mut batch = Batch::new();
//! batch.put(b"key", b"value");
//! store.write(&batch)?;
//!
//! assert_eq!(store.get(b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), vindex::storage::StoreError>(())
//! ```

mod file;
mod memory;
mod store;

pub use file::{CompactionStats, FileStore, RecoveryStats};
pub use memory::{FaultConfig, MemoryStore, MemoryStoreStats};
pub use store::{Batch, IDEAL_BATCH_SIZE, KvStore, StoreError};
