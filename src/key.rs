//! Keys and the byte-level helpers used while descending the tree.

use std::cmp::Ordering;

/// Base of the polynomial hash used for fingerprints.
const FINGERPRINT_BASE: u16 = 131;

/// A key together with the value that should be stored under it.
///
/// Keys are ordered lexicographically by their bytes, shorter keys first when
/// one is a prefix of the other. The value only breaks ties between two
/// otherwise equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    key: Box<[u8]>,
    value: Box<[u8]>,
}

impl Key {
    /// Create a new key from key bytes and value bytes.
    pub fn new(key: impl Into<Box<[u8]>>, value: impl Into<Box<[u8]>>) -> Self {
        Key {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Number of key bytes.
    pub fn len(&self) -> usize {
        self.key.len()
    }

    /// Return true if the key has no bytes.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Fingerprint of the full key bytes.
    pub fn fingerprint(&self) -> u16 {
        fingerprint(&self.key)
    }
}

impl From<(&[u8], &[u8])> for Key {
    fn from((key, value): (&[u8], &[u8])) -> Self {
        Key::new(key, value)
    }
}

impl From<(&str, &str)> for Key {
    fn from((key, value): (&str, &str)) -> Self {
        Key::new(key.as_bytes(), value.as_bytes())
    }
}

/// 16-bit polynomial hash with base 131, used as an equality pre-filter.
pub fn fingerprint(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |hash, &byte| {
        hash.wrapping_mul(FINGERPRINT_BASE)
            .wrapping_add(u16::from(byte))
    })
}

/// Number of equal bytes in `a` and `b` starting at `from`.
pub fn common_prefix_len(a: &[u8], b: &[u8], from: usize) -> usize {
    match (a.get(from..), b.get(from..)) {
        (Some(a), Some(b)) => a.iter().zip(b).take_while(|(x, y)| x == y).count(),
        _ => 0,
    }
}

/// Compare a stored key `slice` against the part of `bound` it lines up with,
/// starting at `level`.
///
/// When `bound` runs out inside the slice and the slice starts with what is
/// left of `bound`, every key below the slice is longer than `bound` and
/// therefore bigger, so `Greater` is returned.
pub fn compare_slice(slice: &[u8], bound: &[u8], level: usize) -> Ordering {
    let rest = bound.get(level..).unwrap_or(&[]);
    let len = rest.len().min(slice.len());

    match slice[..len].cmp(&rest[..len]) {
        Ordering::Equal if len < slice.len() => Ordering::Greater,
        ordering => ordering,
    }
}
