// Validated Types
// Strongly-typed wrappers that enforce invariants at construction time.
// These types cannot be built from invalid data, so downstream code never
// re-checks path grammar or timestamp format.

use anyhow::{ensure, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Grammar for entity paths: fragments of word characters joined by single
/// dots. No leading/trailing dot, no empty fragment.
static ENTITY_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]+(?:\.[a-zA-Z0-9_]+)*$").expect("static regex"));

/// Anchored ISO-8601 timestamp check. Matching strings order correctly under
/// plain lexicographic comparison, which is the only ordering the broker
/// performs on time.
static ISO8601_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(-?(?:[1-9][0-9]*)?[0-9]{4})-(1[0-2]|0[1-9])-(3[01]|0[1-9]|[12][0-9])T(2[0-3]|[01][0-9]):([0-5][0-9]):([0-5][0-9])(\.[0-9]+)?(Z|[+-](?:2[0-3]|[01][0-9]):[0-5][0-9])?$",
    )
    .expect("static regex")
});

/// Is this string a well-formed dotted entity path?
pub fn is_valid_entity_path(path: &str) -> bool {
    ENTITY_PATH_RE.is_match(path)
}

/// Is this string an ISO-8601 timestamp?
pub fn is_valid_iso8601(time: &str) -> bool {
    ISO8601_RE.is_match(time)
}

/// A dotted entity path that has been validated against the path grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityPath {
    inner: String,
}

impl EntityPath {
    /// Create a new validated entity path.
    ///
    /// # Invariants
    /// - Non-empty
    /// - Fragments are `[A-Za-z0-9_]+`, joined by single dots
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        ensure!(
            is_valid_entity_path(&path),
            "entity path {path:?} is not legal"
        );
        Ok(Self { inner: path })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// The dot-separated fragments, in order. Always at least one.
    pub fn fragments(&self) -> Vec<String> {
        self.inner.split('.').map(str::to_string).collect()
    }

    /// The first fragment, naming the organization root.
    pub fn root(&self) -> &str {
        self.inner.split('.').next().expect("validated non-empty")
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// An organization name: a single path fragment, since it doubles as the
/// first hop of every entity path and as a directory-name suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgName {
    inner: String,
}

impl OrgName {
    /// Create a validated organization name (one `[A-Za-z0-9_]+` fragment).
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        ensure!(
            !name.contains('.') && is_valid_entity_path(&name),
            "organization name {name:?} must be a single path fragment"
        );
        Ok(Self { inner: name })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for OrgName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// An ISO-8601 timestamp string. Ordering is lexicographic, which for this
/// format agrees with chronological order within a fixed offset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IsoTimestamp {
    inner: String,
}

impl IsoTimestamp {
    pub fn new(time: impl Into<String>) -> Result<Self> {
        let time = time.into();
        ensure!(
            is_valid_iso8601(&time),
            "timestamp {time:?} is not ISO-8601"
        );
        Ok(Self { inner: time })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for IsoTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}
