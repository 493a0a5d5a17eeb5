//! Protocol dictionaries
//!
//! A dictionary is the attribute namespace of one protocol. Every virtual
//! server is bound to exactly one dictionary; attribute references in its
//! policy resolve against that dictionary and the shared internal one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Name of the dictionary holding server-internal attributes
pub const INTERNAL_DICT: &str = "internal";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DictError {
    #[error("Attribute {attr} already defined in dictionary {dict}")]
    DuplicateAttribute { dict: String, attr: String },
    #[error("Attribute number {number} already used in dictionary {dict}")]
    DuplicateNumber { dict: String, number: u32 },
}

/// Value type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Integer,
    Octets,
    Bool,
    IpAddr,
}

/// A single attribute definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrDef {
    pub name: String,
    pub number: u32,
    pub data_type: DataType,
}

/// Named set of attribute definitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionary {
    name: String,
    attrs: HashMap<String, AttrDef>,
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new(name: impl Into<String>) -> Self {
        Dictionary {
            name: name.into(),
            attrs: HashMap::new(),
        }
    }

    /// Define an attribute
    ///
    /// Names are case-insensitive; names and numbers must both be unique.
    pub fn define(
        &mut self,
        name: impl Into<String>,
        number: u32,
        data_type: DataType,
    ) -> Result<(), DictError> {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        if self.attrs.contains_key(&key) {
            return Err(DictError::DuplicateAttribute {
                dict: self.name.clone(),
                attr: name,
            });
        }
        if self.attrs.values().any(|def| def.number == number) {
            return Err(DictError::DuplicateNumber {
                dict: self.name.clone(),
                number,
            });
        }
        self.attrs.insert(
            key,
            AttrDef {
                name,
                number,
                data_type,
            },
        );
        Ok(())
    }

    /// Builder form of [`Dictionary::define`] for static tables
    pub fn with_attr(
        mut self,
        name: impl Into<String>,
        number: u32,
        data_type: DataType,
    ) -> Result<Self, DictError> {
        self.define(name, number, data_type)?;
        Ok(self)
    }

    /// Dictionary name, which is also the namespace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an attribute by name
    pub fn attr(&self, name: &str) -> Option<&AttrDef> {
        self.attrs.get(&name.to_ascii_lowercase())
    }

    /// Number of attributes defined
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Check if no attributes are defined
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Server-internal attributes, visible from every namespace
    pub fn internal() -> Self {
        let mut dict = Dictionary::new(INTERNAL_DICT);
        let defs = [
            ("Auth-Type", 1000, DataType::String),
            ("Packet-Type", 1001, DataType::String),
            ("Group-Name", 1002, DataType::String),
            ("Module-Failure-Message", 1003, DataType::String),
            ("Module-Success-Message", 1004, DataType::String),
            ("Virtual-Server", 1005, DataType::String),
        ];
        for (name, number, data_type) in defs {
            // Table is static and unique
            let _ = dict.define(name, number, data_type);
        }
        dict
    }
}
