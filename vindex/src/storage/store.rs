//! Key-value store abstraction underneath the index.
//!
//! The index never talks to disk directly. Everything it persists goes
//! through the [`KvStore`] trait, which keeps the contract small enough for a
//! host to implement on top of whatever database it already runs:
//!
//! - Point reads (`get`, `has`)
//! - Batched writes (`Batch` + `write`)
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! simulation (with fault injection), and [`FileStore`] for durable storage.
//!
//! [`MemoryStore`]: crate::storage::MemoryStore
//! [`FileStore`]: crate::storage::FileStore

/// A batch is flushed to the store once its buffered payload reaches this size.
pub const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Errors that can occur during store operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// Persisted data failed validation.
    Corruption(String),
    /// Injected fault for simulation.
    InjectedFault(String),
    /// An internal lock was poisoned by a panicking thread.
    LockPoisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::LockPoisoned => write!(f, "store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A set of puts applied to a store in one `write` call.
///
/// Puts are kept in insertion order; when the same key appears twice the later
/// value wins once the batch is written.
#[derive(Debug, Default)]
pub struct Batch {
    writes: Vec<(Vec<u8>, Vec<u8>)>,
    size: usize,
}

impl Batch {
    /// Create an empty batch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writes: Vec::new(),
            size: 0,
        }
    }

    /// Queue a key-value pair for writing.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.size += key.len() + value.len();
        self.writes.push((key.to_vec(), value.to_vec()));
    }

    /// Total number of key and value bytes queued so far.
    #[must_use]
    pub const fn value_size(&self) -> usize {
        self.size
    }

    /// Number of queued puts.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing has been queued.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::is_empty() is not const-stable
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Iterate over the queued puts in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.writes.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Drop all queued puts so the batch can be reused.
    pub fn reset(&mut self) {
        self.writes.clear();
        self.size = 0;
    }
}

/// Abstraction over a persistent key-value store.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `get` returns the last value written for a key
/// - `write` applies the whole batch or returns an error; a failed write may
///   leave some puts applied, but callers only rely on a successful return
/// - after `write` returns `Ok`, the batch is durable (or as durable as the
///   store ever gets)
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Check whether `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Apply every put in `batch`.
    fn write(&self, batch: &Batch) -> Result<(), StoreError>;
}

impl<S: KvStore + ?Sized> KvStore for std::sync::Arc<S> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        (**self).has(key)
    }

    fn write(&self, batch: &Batch) -> Result<(), StoreError> {
        (**self).write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let e = StoreError::Corruption("bad checksum".to_string());
        assert!(e.to_string().contains("bad checksum"));

        let e = StoreError::InjectedFault("test fault".to_string());
        assert!(e.to_string().contains("test fault"));
    }

    #[test]
    fn test_batch_tracks_size() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());

        batch.put(b"key", b"value");
        batch.put(b"k2", b"v2");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.value_size(), 3 + 5 + 2 + 2);

        let keys: Vec<&[u8]> = batch.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"key".as_slice(), b"k2".as_slice()]);

        batch.reset();
        assert!(batch.is_empty());
        assert_eq!(batch.value_size(), 0);
    }
}
