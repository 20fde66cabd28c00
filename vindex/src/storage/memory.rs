//! In-memory key-value store for tests and simulation.
//!
//! This module provides an in-memory implementation of the `KvStore` trait
//! with deterministic fault injection:
//! - Read errors
//! - Write errors (whole batch rejected before anything is applied)
//! - A one-shot "fail the next N writes" switch for precise failure tests

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::store::{Batch, KvStore, StoreError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            write_error_rate: 0.001,
        }
    }
}

/// Statistics about store operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Number of `get`/`has` calls.
    pub reads: u64,
    /// Number of successful batch writes.
    pub batch_writes: u64,
    /// Number of individual puts applied by successful batch writes.
    pub puts: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
}

struct FaultState {
    config: FaultConfig,
    rng: StdRng,
    fail_next_writes: u32,
    stats: MemoryStoreStats,
}

impl FaultState {
    /// Check if a fault should be injected based on the given rate.
    fn should_inject(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }
}

/// In-memory store backed by a `HashMap`.
///
/// # Thread Safety
///
/// Readers share a `RwLock` over the map; writers take it exclusively for the
/// duration of a batch, so a batch is never observed half-applied.
pub struct MemoryStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    faults: Mutex<FaultState>,
}

impl MemoryStore {
    /// Create an empty store without faults.
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(0, FaultConfig::no_faults())
    }

    /// Create an empty store with the given fault configuration.
    ///
    /// The seed makes the injected fault sequence reproducible.
    #[must_use]
    pub fn with_faults(seed: u64, config: FaultConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            faults: Mutex::new(FaultState {
                config,
                rng: StdRng::seed_from_u64(seed),
                fail_next_writes: 0,
                stats: MemoryStoreStats::default(),
            }),
        }
    }

    /// Make the next `count` batch writes fail with an injected fault.
    pub fn fail_next_writes(&self, count: u32) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().map_err(|_| StoreError::LockPoisoned)?;
        faults.fail_next_writes = count;
        Ok(())
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().map_err(|_| StoreError::LockPoisoned)?;
        faults.config = config;
        Ok(())
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> Result<MemoryStoreStats, StoreError> {
        let faults = self.faults.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(faults.stats.clone())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> Result<usize, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.len())
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Overwrite a single key outside of any batch.
    ///
    /// Intended for tests that need to corrupt a stored record.
    pub fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        {
            let mut faults = self.faults.lock().map_err(|_| StoreError::LockPoisoned)?;
            faults.stats.reads += 1;
            let rate = faults.config.read_error_rate;
            if faults.should_inject(rate) {
                faults.stats.injected_read_errors += 1;
                return Err(StoreError::InjectedFault(
                    "simulated read error".to_string(),
                ));
            }
        }

        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, batch: &Batch) -> Result<(), StoreError> {
        {
            let mut faults = self.faults.lock().map_err(|_| StoreError::LockPoisoned)?;
            let rate = faults.config.write_error_rate;
            if faults.fail_next_writes > 0 || faults.should_inject(rate) {
                faults.fail_next_writes = faults.fail_next_writes.saturating_sub(1);
                faults.stats.injected_write_errors += 1;
                return Err(StoreError::InjectedFault(
                    "simulated write error".to_string(),
                ));
            }
            faults.stats.batch_writes += 1;
            faults.stats.puts += batch.len() as u64;
        }

        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        for (key, value) in batch.iter() {
            entries.insert(key.to_vec(), value.to_vec());
        }
        Ok(())
    }
}
