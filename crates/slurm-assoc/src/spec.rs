//! Opaque `key=value` settings attached to clusters, accounts and users.
//!
//! Specs are kept as an ordered set, so insertion order never matters and exact duplicates
//! collapse. Two merge policies exist:
//! - [`SpecSet::insert`] accumulates (free-form specs coming from several sources),
//! - [`SpecSet::replace`] keeps only the newest value of a key (last writer wins).
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{SlurmError, SlurmResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Spec {
    key: String,
    value: Option<String>,
}

impl Spec {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl FromStr for Spec {
    type Err = SlurmError;

    fn from_str(input: &str) -> SlurmResult<Self> {
        let input = input.trim();
        match input.split_once('=') {
            Some(("", _)) => Err(SlurmError::Parse(format!("Spec `{input}` has an empty key"))),
            Some((key, value)) => Ok(Spec::new(key, value)),
            None if input.is_empty() => Err(SlurmError::Parse("Empty spec".to_string())),
            None => Ok(Spec::flag(input)),
        }
    }
}

impl Display for Spec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => f.write_str(&self.key),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<String>", try_from = "Vec<String>")]
pub struct SpecSet {
    specs: BTreeSet<Spec>,
}

impl SpecSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses specs joined by `separator` (e.g. `Fairshare=1:QOS=normal`).
    /// Empty tokens are skipped.
    pub fn parse_joined(input: &str, separator: char) -> SlurmResult<Self> {
        input
            .split(separator)
            .filter(|token| !token.trim().is_empty())
            .map(Spec::from_str)
            .collect()
    }

    /// Parses a list of spec strings, where every item may itself be colon-joined.
    pub fn parse_list<S: AsRef<str>>(items: &[S]) -> SlurmResult<Self> {
        let mut set = SpecSet::new();
        for item in items {
            set.extend(&SpecSet::parse_joined(item.as_ref(), ':')?);
        }
        Ok(set)
    }

    /// Adds a spec, keeping other values of the same key.
    /// Returns `false` if the exact spec was already present.
    pub fn insert(&mut self, spec: Spec) -> bool {
        self.specs.insert(spec)
    }

    pub fn extend(&mut self, other: &SpecSet) {
        self.specs.extend(other.specs.iter().cloned());
    }

    /// Returns the first value of `key` in spec order.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.specs
            .iter()
            .find(|s| s.key == key)
            .and_then(|s| s.value())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Spec> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.to_string()).collect()
    }

    pub fn join(&self, separator: &str) -> String {
        self.to_strings().join(separator)
    }
}

impl FromIterator<Spec> for SpecSet {
    fn from_iter<T: IntoIterator<Item = Spec>>(iter: T) -> Self {
        Self {
            specs: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a SpecSet {
    type Item = &'a Spec;
    type IntoIter = std::collections::btree_set::Iter<'a, Spec>;

    fn into_iter(self) -> Self::IntoIter {
        self.specs.iter()
    }
}

impl From<SpecSet> for Vec<String> {
    fn from(set: SpecSet) -> Self {
        set.to_strings()
    }
}

impl TryFrom<Vec<String>> for SpecSet {
    type Error = SlurmError;

    fn try_from(items: Vec<String>) -> SlurmResult<Self> {
        items.iter().map(|item| Spec::from_str(item)).collect()
    }
}
