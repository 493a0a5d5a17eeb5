//! Attribute/value pairs and pair lists

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown pair list: {0}")]
pub struct ListParseError(pub String);

/// Which list of a request an attribute reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListRef {
    /// Attributes received from the client
    #[default]
    Request,
    /// Attributes to send back
    Reply,
    /// Server-side control attributes
    Control,
}

impl ListRef {
    pub const fn as_str(self) -> &'static str {
        match self {
            ListRef::Request => "request",
            ListRef::Reply => "reply",
            ListRef::Control => "control",
        }
    }
}

impl fmt::Display for ListRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListRef {
    type Err = ListParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(ListRef::Request),
            "reply" => Ok(ListRef::Reply),
            "control" => Ok(ListRef::Control),
            other => Err(ListParseError(other.to_string())),
        }
    }
}

/// One attribute with its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub name: String,
    pub value: String,
}

impl Pair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Pair {
            name: name.into(),
            value: value.into(),
        }
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered list of pairs; an attribute may occur more than once
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairList {
    pairs: Vec<Pair>,
}

impl PairList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.push(Pair::new(name, value));
    }

    /// Replace every instance of an attribute with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.pairs.retain(|pair| !pair.is(name));
        self.pairs.push(Pair::new(name, value));
    }

    /// First value of an attribute
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|pair| pair.is(name))
            .map(|pair| pair.value.as_str())
    }

    /// All values of an attribute, in list order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |pair| pair.is(name))
            .map(|pair| pair.value.as_str())
    }

    /// Check if an attribute is present
    pub fn contains(&self, name: &str) -> bool {
        self.pairs.iter().any(|pair| pair.is(name))
    }

    /// Remove every instance of an attribute, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.pairs.len();
        self.pairs.retain(|pair| !pair.is(name));
        before - self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pair> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Flatten to a name → value map; later duplicates are joined with commas
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for pair in &self.pairs {
            map.entry(pair.name.clone())
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(&pair.value);
                })
                .or_insert_with(|| pair.value.clone());
        }
        map
    }
}

impl FromIterator<Pair> for PairList {
    fn from_iter<I: IntoIterator<Item = Pair>>(iter: I) -> Self {
        PairList {
            pairs: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a PairList {
    type Item = &'a Pair;
    type IntoIter = std::slice::Iter<'a, Pair>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut list = PairList::new();
        list.add("User-Name", "alice");
        list.add("Class", "a");
        list.add("Class", "b");

        assert_eq!(list.get("user-name"), Some("alice"));
        assert_eq!(list.get_all("Class").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_set_replaces_all() {
        let mut list = PairList::new();
        list.add("Class", "a");
        list.add("Class", "b");
        list.set("Class", "c");

        assert_eq!(list.get_all("Class").collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_remove() {
        let mut list = PairList::new();
        list.add("Class", "a");
        list.add("Class", "b");
        list.add("User-Name", "bob");

        assert_eq!(list.remove("class"), 2);
        assert!(!list.contains("Class"));
        assert!(list.contains("User-Name"));
    }

    #[test]
    fn test_to_map_joins_duplicates() {
        let list: PairList = vec![Pair::new("Class", "a"), Pair::new("Class", "b")]
            .into_iter()
            .collect();
        let map = list.to_map();
        assert_eq!(map.get("Class").map(String::as_str), Some("a,b"));
    }

    #[test]
    fn test_list_ref_parse() {
        assert_eq!("control".parse::<ListRef>().unwrap(), ListRef::Control);
        assert!("session-state".parse::<ListRef>().is_err());
    }
}
