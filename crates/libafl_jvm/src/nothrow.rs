//! Methods known to never throw, whose call sites need no return edge.
//!
//! A call to such a method always returns to the instruction after it, so probing the
//! return would only duplicate the probe of the surrounding block.

use std::{fs, path::Path};

use hashbrown::{Equivalent, HashSet};
use serde::{Deserialize, Serialize};

use crate::Error;

/// One method, in JVM internal form: `java/lang/Math`, `abs`, `(I)I`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoThrowEntry {
    /// Internal name of the declaring class
    pub owner: String,
    /// Method name
    pub name: String,
    /// Method descriptor
    pub descriptor: String,
}

impl NoThrowEntry {
    /// Creates an entry
    #[must_use]
    pub fn new(owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

/// Borrowed lookup key; hashes exactly like [`NoThrowEntry`]
#[derive(Hash)]
struct NoThrowKey<'a> {
    owner: &'a str,
    name: &'a str,
    descriptor: &'a str,
}

impl Equivalent<NoThrowEntry> for NoThrowKey<'_> {
    fn equivalent(&self, key: &NoThrowEntry) -> bool {
        self.owner == key.owner && self.name == key.name && self.descriptor == key.descriptor
    }
}

/// An immutable set of [`NoThrowEntry`]s
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoThrowTable {
    entries: HashSet<NoThrowEntry>,
}

impl FromIterator<NoThrowEntry> for NoThrowTable {
    fn from_iter<I: IntoIterator<Item = NoThrowEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl NoThrowTable {
    /// An empty table: every call gets a probe
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `owner#name#descriptor` lines.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_text(text: &str) -> Result<Self, Error> {
        let mut entries = HashSet::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, '#');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(owner), Some(name), Some(descriptor))
                    if !owner.is_empty() && !name.is_empty() && descriptor.starts_with('(') =>
                {
                    entries.insert(NoThrowEntry::new(owner, name, descriptor));
                }
                _ => {
                    return Err(Error::illegal_argument(format!(
                        "no-throw table line {}: expected `owner#name#descriptor`, got `{line}`",
                        lineno + 1
                    )));
                }
            }
        }
        Ok(Self { entries })
    }

    /// Deserializes a table written by [`Self::to_postcard`]
    pub fn from_postcard(bytes: &[u8]) -> Result<Self, Error> {
        let entries: Vec<NoThrowEntry> = postcard::from_bytes(bytes)?;
        Ok(entries.into_iter().collect())
    }

    /// Serializes the entries, sorted, with `postcard`
    pub fn to_postcard(&self) -> Result<Vec<u8>, Error> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_unstable();
        Ok(postcard::to_allocvec(&entries)?)
    }

    /// Loads a table from disk: `postcard` for `.postcard`/`.bin` files, text otherwise
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .map_err(|err| Error::os_error(err, format!("reading {}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("postcard" | "bin") => Self::from_postcard(&bytes),
            _ => Self::from_text(core::str::from_utf8(&bytes)?),
        }
    }

    /// Whether `owner.name descriptor` is known not to throw
    #[must_use]
    pub fn contains(&self, owner: &str, name: &str, descriptor: &str) -> bool {
        self.entries.contains(&NoThrowKey {
            owner,
            name,
            descriptor,
        })
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the entries in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &NoThrowEntry> {
        self.entries.iter()
    }
}
