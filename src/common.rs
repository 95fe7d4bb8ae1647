//! Read preferences and tag sets.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error::{self, ArgumentError};
use crate::error::Result;

/// The member roles a read may be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    /// Only the primary.
    #[default]
    Primary,
    /// The primary if one is available, otherwise a matching secondary.
    PrimaryPreferred,
    /// Only matching secondaries.
    Secondary,
    /// A matching secondary if one is available, otherwise the primary.
    SecondaryPreferred,
    /// Any matching primary or secondary.
    Nearest,
}

impl FromStr for ReadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "primary" => ReadMode::Primary,
            "primarypreferred" => ReadMode::PrimaryPreferred,
            "secondary" => ReadMode::Secondary,
            "secondarypreferred" => ReadMode::SecondaryPreferred,
            "nearest" => ReadMode::Nearest,
            _ => return Err(ArgumentError(format!("Unknown read preference mode '{}'.", s))),
        })
    }
}

impl fmt::Display for ReadMode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        };
        fmt.write_str(name)
    }
}

/// An unordered collection of key/value labels.
///
/// Used both for the tags a server advertises and for the tag sets of a read preference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> TagSet {
        TagSet(BTreeMap::new())
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Whether `server_tags` contains every pair in this set. The empty set matches
    /// every server.
    pub fn matches(&self, server_tags: &TagSet) -> bool {
        self.0
            .iter()
            .all(|(key, value)| server_tags.0.get(key) == Some(value))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> TagSet {
        TagSet(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Parses the `readPreferenceTags` connection string form, `key:value,key:value`.
/// The empty string is the empty tag set.
impl FromStr for TagSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<TagSet> {
        let mut tags = TagSet::new();
        for pair in s.split(',').filter(|pair| !pair.is_empty()) {
            match pair.find(':') {
                Some(idx) => tags.insert(&pair[..idx], &pair[idx + 1..]),
                None => return Err(ArgumentError(format!("Invalid read preference tag '{}'.", pair))),
            }
        }
        Ok(tags)
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                fmt.write_str(", ")?;
            }
            write!(fmt, "{}: {}", key, value)?;
        }
        fmt.write_str("}")
    }
}

/// Describes which servers may serve a read.
///
/// A primary read preference never carries tag sets or a max staleness; the constructors
/// reject that combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "RawReadPreference")]
pub struct ReadPreference {
    mode: ReadMode,
    tag_sets: Vec<TagSet>,
    max_staleness: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReadPreference {
    mode: ReadMode,
    #[serde(default)]
    tag_sets: Vec<TagSet>,
    #[serde(default)]
    max_staleness_seconds: Option<u64>,
}

impl TryFrom<RawReadPreference> for ReadPreference {
    type Error = Error;

    fn try_from(raw: RawReadPreference) -> Result<ReadPreference> {
        ReadPreference::new(
            raw.mode,
            raw.tag_sets,
            raw.max_staleness_seconds.map(Duration::from_secs),
        )
    }
}

impl ReadPreference {
    /// Creates a validated read preference.
    ///
    /// A primary read preference whose tag sets are all empty is normalized to have no tag
    /// sets; any non-empty tag set or a max staleness with mode primary is an error.
    pub fn new(mode: ReadMode, tag_sets: Vec<TagSet>, max_staleness: Option<Duration>)
               -> Result<ReadPreference> {
        let mut tag_sets = tag_sets;

        if mode == ReadMode::Primary {
            if tag_sets.iter().any(|set| !set.is_empty()) {
                return Err(ArgumentError(
                    "A primary read preference cannot be combined with tag sets.".to_owned(),
                ));
            }
            if max_staleness.is_some() {
                return Err(ArgumentError(
                    "A primary read preference cannot be combined with max staleness.".to_owned(),
                ));
            }
            tag_sets.clear();
        }

        if max_staleness == Some(Duration::ZERO) {
            return Err(ArgumentError("Max staleness must be positive.".to_owned()));
        }

        Ok(ReadPreference { mode, tag_sets, max_staleness })
    }

    /// Reads only from the primary.
    pub fn primary() -> ReadPreference {
        ReadPreference::default()
    }

    /// A read preference with the given mode and no tag sets or max staleness.
    pub fn with_mode(mode: ReadMode) -> ReadPreference {
        ReadPreference { mode, tag_sets: Vec::new(), max_staleness: None }
    }

    /// Returns a copy of this read preference with the given tag sets.
    pub fn with_tag_sets(&self, tag_sets: Vec<TagSet>) -> Result<ReadPreference> {
        ReadPreference::new(self.mode, tag_sets, self.max_staleness)
    }

    /// Returns a copy of this read preference with the given max staleness.
    pub fn with_max_staleness(&self, max_staleness: Duration) -> Result<ReadPreference> {
        ReadPreference::new(self.mode, self.tag_sets.clone(), Some(max_staleness))
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    pub fn max_staleness(&self) -> Option<Duration> {
        self.max_staleness
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{{ mode: {}", self.mode)?;
        if !self.tag_sets.is_empty() {
            fmt.write_str(", tagSets: [")?;
            for (i, set) in self.tag_sets.iter().enumerate() {
                if i > 0 {
                    fmt.write_str(", ")?;
                }
                write!(fmt, "{}", set)?;
            }
            fmt.write_str("]")?;
        }
        if let Some(max_staleness) = self.max_staleness {
            write!(fmt, ", maxStalenessSeconds: {}", max_staleness.as_secs())?;
        }
        fmt.write_str(" }")
    }
}
