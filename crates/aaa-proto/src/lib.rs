//! AAA Policy Data Model
//!
//! This crate provides the protocol-agnostic types shared by the server core
//! and by protocol modules plugged into it.
//!
//! # Features
//!
//! - Result codes and per-section default action tables
//! - Protocol dictionaries (attribute namespaces)
//! - Attribute/value pair lists
//! - The parsed configuration tree consumed by the section compiler
//!
//! # Example
//!
//! ```rust
//! use aaa_proto::{ConfigSection, ModActions, RCode};
//!
//! // A `recv Identity-Response { users }` section
//! let section = ConfigSection::new("recv", Some("Identity-Response")).with_word("users");
//! assert_eq!(section.display_name(), "recv Identity-Response");
//!
//! // Sections using the authorize table fall back to `noop`
//! assert_eq!(ModActions::authorize().default_rcode(), RCode::Noop);
//! ```

pub mod actions;
pub mod conf;
pub mod dict;
pub mod pair;
pub mod rcode;

pub use actions::{ModAction, ModActions};
pub use conf::{AssignOp, ConfigItem, ConfigPair, ConfigSection, ConfigWord, Location};
pub use dict::{AttrDef, DataType, DictError, Dictionary, INTERNAL_DICT};
pub use pair::{ListParseError, ListRef, Pair, PairList};
pub use rcode::{RCode, RCodeParseError};
