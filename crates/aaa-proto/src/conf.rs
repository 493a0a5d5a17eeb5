//! Parsed configuration tree
//!
//! The server core never parses configuration text itself. It consumes this
//! tree, which mirrors the `name1 name2 { ... }` shape of processing sections:
//!
//! ```text
//! recv Identity-Response {
//!     users
//!     if &Identity =~ /^0/ {
//!         &control.Auth-Type := "users"
//!     }
//! }
//! ```
//!
//! Any front end that produces this tree can feed the server. The tree
//! derives `serde` so JSON documents can be loaded directly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a configuration item came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    server: Option<String>,
    path: String,
}

impl Location {
    pub fn new(server: Option<&str>, path: impl Into<String>) -> Self {
        Location {
            server: server.map(str::to_string),
            path: path.into(),
        }
    }

    /// Virtual server the item belongs to, if any
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Human readable position of the item
    pub fn path(&self) -> &str {
        &self.path
    }

    fn child(&self, segment: &str) -> Location {
        Location {
            server: self.server.clone(),
            path: if self.path.is_empty() {
                segment.to_string()
            } else {
                format!("{} / {}", self.path, segment)
            },
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str("<unknown>")
        } else {
            f.write_str(&self.path)
        }
    }
}

/// Assignment operator of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AssignOp {
    /// Replace existing values
    #[default]
    #[serde(rename = ":=")]
    Set,
    /// Append a value
    #[serde(rename = "+=")]
    Add,
    /// Set only if absent
    #[serde(rename = "=")]
    Default,
}

impl AssignOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            AssignOp::Set => ":=",
            AssignOp::Add => "+=",
            AssignOp::Default => "=",
        }
    }
}

/// A bare word such as a module name or a result code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ConfigWord {
    pub word: String,
    pub location: Location,
}

impl From<String> for ConfigWord {
    fn from(word: String) -> Self {
        ConfigWord {
            word,
            location: Location::default(),
        }
    }
}

impl From<ConfigWord> for String {
    fn from(word: ConfigWord) -> Self {
        word.word
    }
}

/// An `attribute op value` item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPair {
    pub attr: String,
    #[serde(default)]
    pub op: AssignOp,
    pub value: String,
    #[serde(skip)]
    pub location: Location,
}

/// A named section with nested items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSection {
    pub name1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name2: Option<String>,
    #[serde(default)]
    pub children: Vec<ConfigItem>,
    #[serde(skip)]
    pub location: Location,
}

/// Any item inside a section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigItem {
    Word(ConfigWord),
    Pair(ConfigPair),
    Section(ConfigSection),
}

impl ConfigItem {
    pub fn location(&self) -> &Location {
        match self {
            ConfigItem::Word(word) => &word.location,
            ConfigItem::Pair(pair) => &pair.location,
            ConfigItem::Section(section) => &section.location,
        }
    }
}

impl ConfigSection {
    pub fn new(name1: impl Into<String>, name2: Option<&str>) -> Self {
        ConfigSection {
            name1: name1.into(),
            name2: name2.map(str::to_string),
            children: Vec::new(),
            location: Location::default(),
        }
    }

    /// Append a bare word
    pub fn with_word(mut self, word: impl Into<String>) -> Self {
        self.children
            .push(ConfigItem::Word(ConfigWord::from(word.into())));
        self
    }

    /// Append a pair
    pub fn with_pair(mut self, attr: impl Into<String>, op: AssignOp, value: impl Into<String>) -> Self {
        self.children.push(ConfigItem::Pair(ConfigPair {
            attr: attr.into(),
            op,
            value: value.into(),
            location: Location::default(),
        }));
        self
    }

    /// Append a subsection
    pub fn with_section(mut self, section: ConfigSection) -> Self {
        self.children.push(ConfigItem::Section(section));
        self
    }

    pub fn name2(&self) -> Option<&str> {
        self.name2.as_deref()
    }

    /// `name1 name2` as written in configuration
    pub fn display_name(&self) -> String {
        match &self.name2 {
            Some(name2) => format!("{} {}", self.name1, name2),
            None => self.name1.clone(),
        }
    }

    /// Direct subsections
    pub fn subsections(&self) -> impl Iterator<Item = &ConfigSection> {
        self.children.iter().filter_map(|item| match item {
            ConfigItem::Section(section) => Some(section),
            _ => None,
        })
    }

    /// First direct subsection with matching names
    ///
    /// A `name2` of `None` matches only subsections without a second name.
    pub fn find_subsection(&self, name1: &str, name2: Option<&str>) -> Option<&ConfigSection> {
        self.subsections()
            .find(|section| section.name1 == name1 && section.name2() == name2)
    }

    /// Value of the first direct pair with this attribute name
    pub fn pair_value(&self, attr: &str) -> Option<&str> {
        self.children.iter().find_map(|item| match item {
            ConfigItem::Pair(pair) if pair.attr == attr => Some(pair.value.as_str()),
            _ => None,
        })
    }

    /// Stamp every item in the tree with its location
    ///
    /// `origin` names the source (usually a file), `server` the owning
    /// virtual server; both end up in error messages.
    pub fn assign_locations(&mut self, origin: &str, server: Option<&str>) {
        let root = Location::new(server, origin.to_string()).child(&self.display_name());
        self.stamp(root);
    }

    fn stamp(&mut self, location: Location) {
        for (i, item) in self.children.iter_mut().enumerate() {
            match item {
                ConfigItem::Word(word) => {
                    word.location = location.child(&format!("[{}] {}", i, word.word));
                }
                ConfigItem::Pair(pair) => {
                    pair.location = location.child(&format!("[{}] {}", i, pair.attr));
                }
                ConfigItem::Section(section) => {
                    let child = location.child(&format!("[{}] {}", i, section.display_name()));
                    section.stamp(child);
                }
            }
        }
        self.location = location;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigSection {
        ConfigSection::new("server", Some("aka"))
            .with_section(
                ConfigSection::new("recv", Some("Identity-Response"))
                    .with_word("users")
                    .with_pair("&reply.Reply-Message", AssignOp::Set, "hello"),
            )
            .with_section(ConfigSection::new("store", Some("session")))
    }

    #[test]
    fn test_find_subsection() {
        let cs = sample();
        assert!(cs.find_subsection("recv", Some("Identity-Response")).is_some());
        assert!(cs.find_subsection("recv", Some("Client-Error")).is_none());
        assert!(cs.find_subsection("store", None).is_none());
        assert_eq!(cs.subsections().count(), 2);
    }

    #[test]
    fn test_assign_locations() {
        let mut cs = sample();
        cs.assign_locations("aka.json", Some("aka"));

        let recv = cs.find_subsection("recv", Some("Identity-Response")).unwrap();
        assert_eq!(recv.location.server(), Some("aka"));
        assert_eq!(
            recv.location.path(),
            "aka.json / server aka / [0] recv Identity-Response"
        );
        let word = &recv.children[0];
        assert_eq!(
            word.location().path(),
            "aka.json / server aka / [0] recv Identity-Response / [0] users"
        );
    }

    #[test]
    fn test_json_tree() {
        let json = r#"{
            "name1": "recv",
            "name2": "Access-Request",
            "children": [
                "users",
                { "attr": "&control.Auth-Type", "op": ":=", "value": "users" },
                { "name1": "if", "name2": "&User-Name == \"bob\"", "children": ["reject"] }
            ]
        }"#;
        let cs: ConfigSection = serde_json::from_str(json).unwrap();
        assert_eq!(cs.children.len(), 3);
        assert!(matches!(&cs.children[0], ConfigItem::Word(w) if w.word == "users"));
        assert!(matches!(&cs.children[1], ConfigItem::Pair(p) if p.op == AssignOp::Set));
        assert!(matches!(&cs.children[2], ConfigItem::Section(s) if s.name1 == "if"));
    }

    #[test]
    fn test_pair_value() {
        let cs = ConfigSection::new("server", Some("x")).with_pair("namespace", AssignOp::Default, "radius");
        assert_eq!(cs.pair_value("namespace"), Some("radius"));
        assert_eq!(cs.pair_value("missing"), None);
    }
}
