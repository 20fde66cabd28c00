//! Index configuration module.
//!
//! This module provides configuration loading for `vindex-inspect` from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `VINDEX_DATA_FILE`: Path of the store's log file (required)
//! - `VINDEX_MAX_LEAF_FANOUT`: Maximum entries per leaf (default: `64`)
//! - `VINDEX_MAX_INTERNAL_FANOUT`: Maximum children per internal node
//!   (default: `128`)
//! - `VINDEX_CACHE_LIMIT`: Dirty-cache size limit in bytes (default: 64 MiB)
//! - `VINDEX_WORKERS`: Bulk-load extraction workers (default: available
//!   parallelism)
//! - `VINDEX_SPECIAL_VALUES`: Comma-separated integers kept outside the tree
//!   (default: none)
//!
//! # Invariants
//!
//! - Both fanouts are at least 2
//! - `workers` is at least 1

use std::path::PathBuf;

use crate::index::{TreeConfig, Value};
use crate::index::tree::{DEFAULT_MAX_INTERNAL_FANOUT, DEFAULT_MAX_LEAF_FANOUT};

/// Index configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Log file backing the `FileStore`.
    pub data_file: PathBuf,
    pub max_leaf_fanout: usize,
    pub max_internal_fanout: usize,
    /// `Database::cap` limit in bytes.
    pub cache_limit: usize,
    pub workers: usize,
    pub special_values: Vec<Value>,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.into(),
    }
}

impl IndexConfig {
    /// Default dirty-cache limit (64 MiB).
    pub const DEFAULT_CACHE_LIMIT: usize = 64 * 1024 * 1024;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `VINDEX_DATA_FILE` is not set or is empty
    /// - any optional variable is set but does not parse or is out of range
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_file = lookup("VINDEX_DATA_FILE")
            .ok_or_else(|| ConfigError::MissingEnvVar("VINDEX_DATA_FILE".to_string()))?;
        if data_file.is_empty() {
            return Err(invalid("VINDEX_DATA_FILE", "must not be empty"));
        }

        let default_workers = std::thread::available_parallelism().map_or(1, usize::from);

        Ok(Self {
            data_file: PathBuf::from(data_file),
            max_leaf_fanout: load_usize(&lookup, "VINDEX_MAX_LEAF_FANOUT", DEFAULT_MAX_LEAF_FANOUT, 2)?,
            max_internal_fanout: load_usize(
                &lookup,
                "VINDEX_MAX_INTERNAL_FANOUT",
                DEFAULT_MAX_INTERNAL_FANOUT,
                2,
            )?,
            cache_limit: load_usize(&lookup, "VINDEX_CACHE_LIMIT", Self::DEFAULT_CACHE_LIMIT, 0)?,
            workers: load_usize(&lookup, "VINDEX_WORKERS", default_workers, 1)?,
            special_values: load_special_values(&lookup)?,
        })
    }

    /// The tree shape part of this configuration.
    #[must_use]
    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            max_leaf_fanout: self.max_leaf_fanout,
            max_internal_fanout: self.max_internal_fanout,
            special_values: self.special_values.clone(),
        }
    }
}

/// Parse an optional integer variable, enforcing a lower bound.
fn load_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
    min: usize,
) -> Result<usize, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let value = raw
        .trim()
        .parse::<usize>()
        .map_err(|_| invalid(name, format!("'{raw}' is not a non-negative integer")))?;
    if value < min {
        return Err(invalid(name, format!("must be at least {min}, got {value}")));
    }
    Ok(value)
}

fn load_special_values(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Vec<Value>, ConfigError> {
    let Some(raw) = lookup("VINDEX_SPECIAL_VALUES") else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map(Value::from_u64).map_err(|_| {
                invalid("VINDEX_SPECIAL_VALUES", format!("'{s}' is not an unsigned integer"))
            })
        })
        .collect()
}
