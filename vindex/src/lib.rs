// Test code is allowed to use unwrap()/expect() for convenience.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Disk-backed, value-ordered secondary index.
//!
//! - [`storage`]: the key-value store contract plus memory and file stores
//! - [`index`]: the B+tree, its node cache, queries and bulk loading
//! - [`config`]: environment configuration for the `vindex-inspect` binary

pub mod config;
pub mod index;
pub mod storage;

// Helpers for this crate's unit and integration tests; not part of the API.
#[doc(hidden)]
pub mod testing;
