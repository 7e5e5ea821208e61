//! Callsign prefix to CQ zone lookup.
//!
//! The table is loaded once at startup from the `cty.plist` country file, or
//! from a JSON file with the same shape:
//!
//! ```json
//! { "VE3": { "Continent": "NA", "Country": "Canada", "CQZone": 4 } }
//! ```
//!
//! Extra per-prefix fields (ITU zone, coordinates, ...) are ignored. After
//! loading the table is never mutated, so it can be shared behind an `Arc`
//! without locking.
//!
//! Lookups are longest-prefix matches: `VE3XYZ` resolves through `VE3` when no
//! longer key matches. A character trie answers that in one pass over the
//! callsign instead of re-probing a hash map for every truncation.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Longest prefix key accepted in the table.
pub const MAX_PREFIX_LEN: usize = 6;

/// Errors that can occur while loading the zone table.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("Failed to read zone file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid zone file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid plist zone file {path}: {source}")]
    Plist {
        path: String,
        #[source]
        source: plist::Error,
    },

    #[error("Zone table contains no usable prefixes")]
    Empty,
}

/// Geographic metadata for one prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ZoneInfo {
    #[serde(rename = "Continent")]
    pub continent: String,

    #[serde(rename = "Country")]
    pub country: String,

    /// CQ zone, 1 through 40.
    #[serde(rename = "CQZone")]
    pub cq_zone: u8,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    entry: Option<usize>,
}

/// Immutable prefix table with longest-prefix lookup.
#[derive(Debug)]
pub struct ZoneTable {
    entries: Vec<(String, ZoneInfo)>,
    by_prefix: HashMap<String, usize>,
    root: TrieNode,
}

impl ZoneTable {
    /// Load the table from a file.
    ///
    /// A `.plist` extension selects the property-list reader (XML or binary);
    /// anything else is read as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ZoneError> {
        let path = path.as_ref();
        let content = fs::read(path).map_err(|source| ZoneError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let is_plist = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("plist"));
        let raw: HashMap<String, ZoneInfo> = if is_plist {
            plist::from_bytes(&content).map_err(|source| ZoneError::Plist {
                path: path.display().to_string(),
                source,
            })?
        } else {
            serde_json::from_slice(&content).map_err(|source| ZoneError::Json {
                path: path.display().to_string(),
                source,
            })?
        };

        let table = Self::from_entries(raw)?;
        info!(
            "Loaded {} zone prefixes from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Build a table from `(prefix, info)` pairs.
    ///
    /// Prefixes are upper-cased. Keys that are empty, longer than
    /// [`MAX_PREFIX_LEN`], contain characters other than letters, digits and
    /// `/`, or carry a zone outside 1-40 are skipped with a warning.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, ZoneError>
    where
        I: IntoIterator<Item = (S, ZoneInfo)>,
        S: AsRef<str>,
    {
        let mut table = Self {
            entries: Vec::new(),
            by_prefix: HashMap::new(),
            root: TrieNode::default(),
        };
        let mut skipped = 0usize;

        for (prefix, zone) in entries {
            let prefix = prefix.as_ref().trim().to_ascii_uppercase();
            if !is_valid_prefix(&prefix) || !(1..=40).contains(&zone.cq_zone) {
                skipped += 1;
                continue;
            }
            table.insert(prefix, zone);
        }

        if skipped > 0 {
            warn!("Skipped {} unusable zone table entries", skipped);
        }
        if table.entries.is_empty() {
            return Err(ZoneError::Empty);
        }
        Ok(table)
    }

    fn insert(&mut self, prefix: String, zone: ZoneInfo) {
        if let Some(&idx) = self.by_prefix.get(&prefix) {
            self.entries[idx].1 = zone;
            return;
        }

        let idx = self.entries.len();
        let mut node = &mut self.root;
        for c in prefix.chars() {
            node = node.children.entry(c).or_default();
        }
        node.entry = Some(idx);
        self.by_prefix.insert(prefix.clone(), idx);
        self.entries.push((prefix, zone));
    }

    /// Number of prefixes in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty. Never true for a loaded table.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact lookup of a prefix key.
    pub fn get(&self, prefix: &str) -> Option<&ZoneInfo> {
        self.by_prefix
            .get(&prefix.to_ascii_uppercase())
            .map(|&idx| &self.entries[idx].1)
    }

    /// Resolve a callsign to the zone of its longest matching prefix.
    ///
    /// # Example
    ///
    /// ```
    /// use dxcluster_ingest::zones::{ZoneInfo, ZoneTable};
    ///
    /// let table = ZoneTable::from_entries([(
    ///     "VE3",
    ///     ZoneInfo { continent: "NA".into(), country: "Canada".into(), cq_zone: 4 },
    /// )])
    /// .unwrap();
    /// assert_eq!(table.resolve("VE3XYZ").map(|z| z.cq_zone), Some(4));
    /// assert!(table.resolve("ZZ9ZZZ").is_none());
    /// ```
    pub fn resolve(&self, callsign: &str) -> Option<&ZoneInfo> {
        let mut node = &self.root;
        let mut best = None;

        for c in callsign.chars() {
            match node.children.get(&c.to_ascii_uppercase()) {
                Some(next) => {
                    node = next;
                    if node.entry.is_some() {
                        best = node.entry;
                    }
                }
                None => break,
            }
        }

        best.map(|idx| &self.entries[idx].1)
    }

    /// Resolve by exact match, then dropping the last character until a key
    /// matches or nothing is left.
    ///
    /// Gives the same answer as [`ZoneTable::resolve`]; kept for checking the
    /// trie against the straightforward algorithm.
    pub fn resolve_by_truncation(&self, callsign: &str) -> Option<&ZoneInfo> {
        let mut candidate = callsign.to_ascii_uppercase();
        while !candidate.is_empty() {
            if let Some(zone) = self.get(&candidate) {
                return Some(zone);
            }
            candidate.pop();
        }
        None
    }
}

fn is_valid_prefix(prefix: &str) -> bool {
    (1..=MAX_PREFIX_LEN).contains(&prefix.len())
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '/')
}
