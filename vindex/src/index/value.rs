//! Index keys.
//!
//! Values are unsigned big-endian integers of arbitrary width. Two values are
//! equal when they denote the same number, so `0x00000005` and `0x05` are the
//! same key: comparison strips leading zero bytes, then a shorter key is
//! smaller and keys of equal length compare byte by byte.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Opaque identifier of a source record (a transaction hash, a row id, ...).
pub type Identifier = Vec<u8>;

/// Drop leading zero bytes.
fn significant(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Compare two big-endian byte keys by numeric magnitude.
#[must_use]
pub fn byte_compare(a: &[u8], b: &[u8]) -> Ordering {
    let a = significant(a);
    let b = significant(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// A key in the index.
#[derive(Debug, Clone, Default)]
pub struct Value(Vec<u8>);

impl Value {
    /// Wrap raw big-endian bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encode a `u64` as an 8-byte big-endian key.
    #[must_use]
    pub fn from_u64(n: u64) -> Self {
        Self(n.to_be_bytes().to_vec())
    }

    /// The bytes as given at construction.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the value, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Interpret the value as a `u64` if it fits.
    #[must_use]
    pub fn to_u64(&self) -> Option<u64> {
        let digits = significant(&self.0);
        if digits.len() > 8 {
            return None;
        }
        Some(digits.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        byte_compare(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        byte_compare(&self.0, &other.0)
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        significant(&self.0).hash(state);
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::from_u64(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(n) = self.to_u64() {
            return write!(f, "{n}");
        }
        write!(f, "0x")?;
        for b in significant(&self.0) {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_zeros_are_ignored() {
        assert_eq!(byte_compare(&[0, 0, 0, 5], &[5]), Ordering::Equal);
        assert_eq!(Value::new(vec![0, 0, 0, 5]), Value::new(vec![5]));
        assert_eq!(byte_compare(&[], &[0, 0]), Ordering::Equal);
    }

    #[test]
    fn test_numeric_ordering() {
        // Lexicographic order would put [0x02] after [0x01, 0x00]
        assert_eq!(byte_compare(&[0x01, 0x00], &[0x02]), Ordering::Greater);
        assert_eq!(byte_compare(&[0x00, 0x02], &[0x01, 0x00]), Ordering::Less);
        assert!(Value::from_u64(255) < Value::from_u64(256));
        assert!(Value::from_u64(70) > Value::new(vec![0x45]));
    }

    #[test]
    fn test_to_u64() {
        assert_eq!(Value::from_u64(30_000).to_u64(), Some(30_000));
        assert_eq!(Value::new(vec![0, 0, 1, 0]).to_u64(), Some(256));
        assert_eq!(Value::new(vec![1; 9]).to_u64(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from_u64(42).to_string(), "42");
        assert_eq!(Value::new(vec![1; 9]).to_string(), "0x010101010101010101");
    }

    #[test]
    fn test_equal_values_hash_equal() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(Value::new(vec![0, 7]));
        assert!(set.contains(&Value::from_u64(7)));
    }
}
