//! Namespace resolver
//!
//! Maps virtual servers, and configuration items inside them, to the protocol
//! dictionary their attribute references resolve against. A server has no
//! namespace until bootstrap assigns one.

use aaa_proto::{ConfigItem, ConfigSection, Dictionary, Location};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    #[error("Virtual server {server} has no namespace assigned")]
    NotFound { server: String },
    #[error("{location}: virtual server {server} is in namespace {actual}, expected {expected}")]
    NamespaceMismatch {
        server: String,
        expected: String,
        actual: String,
        location: String,
    },
    #[error("{location}: no virtual server named {server}")]
    UnknownServer { server: String, location: String },
}

#[derive(Debug, Clone)]
struct Entry {
    dict: Option<Arc<Dictionary>>,
    config: Arc<ConfigSection>,
}

/// Virtual server name → namespace and configuration
#[derive(Debug, Clone, Default)]
pub struct Namespaces {
    servers: HashMap<String, Entry>,
}

impl Namespaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a virtual server without a namespace
    ///
    /// Returns false if the name is already taken.
    pub fn insert(&mut self, name: &str, config: Arc<ConfigSection>) -> bool {
        if self.servers.contains_key(name) {
            return false;
        }
        self.servers
            .insert(name.to_string(), Entry { dict: None, config });
        true
    }

    /// Bind a virtual server to its dictionary
    pub fn assign(&mut self, name: &str, dict: Arc<Dictionary>) -> Result<(), NamespaceError> {
        let entry = self
            .servers
            .get_mut(name)
            .ok_or_else(|| NamespaceError::UnknownServer {
                server: name.to_string(),
                location: "bootstrap".to_string(),
            })?;
        entry.dict = Some(dict);
        Ok(())
    }

    /// Dictionary of a virtual server
    pub fn dict_by_name(&self, server: &str) -> Result<Arc<Dictionary>, NamespaceError> {
        let entry = self
            .servers
            .get(server)
            .ok_or_else(|| NamespaceError::UnknownServer {
                server: server.to_string(),
                location: "lookup".to_string(),
            })?;
        entry.dict.clone().ok_or_else(|| NamespaceError::NotFound {
            server: server.to_string(),
        })
    }

    /// Dictionary of the server a section belongs to
    ///
    /// Accepts either a `server <name>` section itself or any section nested
    /// inside one.
    pub fn dict_by_cs(&self, cs: &ConfigSection) -> Result<Arc<Dictionary>, NamespaceError> {
        let server = owning_server(cs).ok_or_else(|| NamespaceError::UnknownServer {
            server: cs.display_name(),
            location: cs.location.to_string(),
        })?;
        self.dict_by_name(server)
    }

    /// Dictionary of the server any configuration item belongs to
    pub fn dict_by_child_ci(&self, item: &ConfigItem) -> Result<Arc<Dictionary>, NamespaceError> {
        match item {
            ConfigItem::Section(cs) => self.dict_by_cs(cs),
            other => {
                let location = other.location();
                let server = location
                    .server()
                    .ok_or_else(|| NamespaceError::UnknownServer {
                        server: "<none>".to_string(),
                        location: location.to_string(),
                    })?;
                self.dict_by_name(server)
            }
        }
    }

    /// Check that a virtual server exists and uses the expected namespace
    ///
    /// Returns the server's configuration on success. `location` names the
    /// reference being checked and ends up in the error.
    pub fn has_namespace(
        &self,
        server: &str,
        expected: &Dictionary,
        location: &Location,
    ) -> Result<Arc<ConfigSection>, NamespaceError> {
        let entry = self
            .servers
            .get(server)
            .ok_or_else(|| NamespaceError::UnknownServer {
                server: server.to_string(),
                location: location.to_string(),
            })?;
        let dict = entry.dict.as_ref().ok_or_else(|| NamespaceError::NotFound {
            server: server.to_string(),
        })?;
        if dict.name() != expected.name() {
            return Err(NamespaceError::NamespaceMismatch {
                server: server.to_string(),
                expected: expected.name().to_string(),
                actual: dict.name().to_string(),
                location: location.to_string(),
            });
        }
        Ok(entry.config.clone())
    }

    /// Configuration of a virtual server
    pub fn virtual_server_find(&self, name: &str) -> Option<Arc<ConfigSection>> {
        self.servers.get(name).map(|entry| entry.config.clone())
    }

    /// Configuration of the server owning a configuration item
    pub fn virtual_server_by_child(&self, item: &ConfigItem) -> Option<Arc<ConfigSection>> {
        let server = match item {
            ConfigItem::Section(cs) => owning_server(cs),
            other => other.location().server(),
        }?;
        self.virtual_server_find(server)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

fn owning_server(cs: &ConfigSection) -> Option<&str> {
    if cs.name1 == "server" {
        if let Some(name) = cs.name2() {
            return Some(name);
        }
    }
    cs.location.server()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aaa_proto::DataType;

    fn server_cs(name: &str) -> Arc<ConfigSection> {
        let mut cs = ConfigSection::new("server", Some(name))
            .with_section(ConfigSection::new("recv", Some("Identity-Response")).with_word("ok"));
        cs.assign_locations("test", Some(name));
        Arc::new(cs)
    }

    fn dict(name: &str) -> Arc<Dictionary> {
        Arc::new(
            Dictionary::new(name)
                .with_attr("User-Name", 1, DataType::String)
                .unwrap(),
        )
    }

    #[test]
    fn test_unassigned_is_not_found() {
        let mut ns = Namespaces::new();
        ns.insert("aka", server_cs("aka"));
        assert_eq!(
            ns.dict_by_name("aka"),
            Err(NamespaceError::NotFound {
                server: "aka".to_string()
            })
        );
        assert!(matches!(
            ns.dict_by_name("missing"),
            Err(NamespaceError::UnknownServer { .. })
        ));
    }

    #[test]
    fn test_lookup_by_child() {
        let mut ns = Namespaces::new();
        let cs = server_cs("aka");
        ns.insert("aka", cs.clone());
        ns.assign("aka", dict("eap-aka")).unwrap();

        let recv = cs.find_subsection("recv", Some("Identity-Response")).unwrap();
        assert_eq!(ns.dict_by_cs(recv).unwrap().name(), "eap-aka");
        assert_eq!(ns.dict_by_cs(&cs).unwrap().name(), "eap-aka");
        assert_eq!(ns.dict_by_child_ci(&recv.children[0]).unwrap().name(), "eap-aka");

        let found = ns.virtual_server_by_child(&recv.children[0]).unwrap();
        assert!(Arc::ptr_eq(&found, &cs));
    }

    #[test]
    fn test_has_namespace() {
        let mut ns = Namespaces::new();
        ns.insert("aka", server_cs("aka"));
        ns.insert("default", server_cs("default"));
        ns.assign("aka", dict("eap-aka")).unwrap();
        ns.assign("default", dict("radius")).unwrap();

        let here = Location::new(Some("default"), "call aka");
        let radius = dict("radius");
        assert!(ns.has_namespace("default", &radius, &here).is_ok());

        let err = ns.has_namespace("aka", &radius, &here).unwrap_err();
        assert!(matches!(
            err,
            NamespaceError::NamespaceMismatch { ref actual, ref expected, .. }
                if actual == "eap-aka" && expected == "radius"
        ));
        assert!(err.to_string().starts_with("call aka:"));
    }

    #[test]
    fn test_duplicate_insert() {
        let mut ns = Namespaces::new();
        assert!(ns.insert("aka", server_cs("aka")));
        assert!(!ns.insert("aka", server_cs("aka")));
        assert_eq!(ns.len(), 1);
    }
}
