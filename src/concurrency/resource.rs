//! Hierarchical resource names for the lock manager.
//!
//! A [`ResourceName`] is an ordered path of [`ResourceNamePart`]s rooted at
//! `db`. Every part is hashed once on construction and a name carries the
//! rolling hash of its whole path, so lookups key on a single `u64`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const PART_SEPARATOR: u8 = b'/';

/// Name of the root resource.
pub const ROOT_PART: &str = "db";

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// One path segment with its precomputed hash.
#[derive(Debug, Clone)]
pub struct ResourceNamePart {
    value: Arc<str>,
    hash: u64,
}

impl ResourceNamePart {
    pub fn new(value: impl AsRef<str>) -> Self {
        let value = value.as_ref();
        Self {
            hash: fnv1a(FNV_OFFSET_BASIS, value.as_bytes()),
            value: Arc::from(value),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for ResourceNamePart {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ResourceNamePart {}

impl From<&str> for ResourceNamePart {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceNamePart {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Immutable path identifying one node of the lock hierarchy.
///
/// Equality and hashing use the rolling hash only; two distinct paths with the
/// same hash are treated as the same resource. The lock tree checks the full
/// path when it registers a node and fails fast on a collision.
#[derive(Debug, Clone)]
pub struct ResourceName {
    parts: Arc<[ResourceNamePart]>,
    hash: u64,
}

impl ResourceName {
    /// The database root, `db`.
    pub fn root() -> Self {
        Self::from_parts(vec![ResourceNamePart::new(ROOT_PART)])
    }

    fn from_parts(parts: Vec<ResourceNamePart>) -> Self {
        let mut hash = FNV_OFFSET_BASIS;
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hash = fnv1a(hash, &[PART_SEPARATOR]);
            }
            hash = fnv1a(hash, part.as_str().as_bytes());
        }
        Self {
            parts: parts.into(),
            hash,
        }
    }

    /// Returns the name one level deeper. This is the only way to build
    /// names below the root.
    pub fn child(&self, part: impl Into<ResourceNamePart>) -> Self {
        let part = part.into();
        let hash = fnv1a(
            fnv1a(self.hash, &[PART_SEPARATOR]),
            part.as_str().as_bytes(),
        );
        let mut parts = self.parts.to_vec();
        parts.push(part);
        Self {
            parts: parts.into(),
            hash,
        }
    }

    /// Returns the enclosing name, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.parts.len() <= 1 {
            return None;
        }
        Some(Self::from_parts(self.parts[..self.parts.len() - 1].to_vec()))
    }

    /// Every name from the root down to and including `self`.
    pub fn ancestry(&self) -> Vec<Self> {
        (1..=self.parts.len())
            .map(|len| Self::from_parts(self.parts[..len].to_vec()))
            .collect()
    }

    pub fn parts(&self) -> &[ResourceNamePart] {
        &self.parts
    }

    pub fn last_part(&self) -> &ResourceNamePart {
        &self.parts[self.parts.len() - 1]
    }

    pub fn depth(&self) -> usize {
        self.parts.len()
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// Compares the full paths rather than the hashes.
    pub fn same_path(&self, other: &Self) -> bool {
        self.parts.len() == other.parts.len()
            && self
                .parts
                .iter()
                .zip(other.parts.iter())
                .all(|(a, b)| a.as_str() == b.as_str())
    }
}

impl PartialEq for ResourceName {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ResourceName {}

impl Hash for ResourceName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for ResourceName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders by hash value, the global lock acquisition order.
impl Ord for ResourceName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(part.as_str())?;
        }
        Ok(())
    }
}
