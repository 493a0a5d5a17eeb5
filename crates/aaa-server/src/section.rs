//! Processing section registry
//!
//! Each protocol module declares the processing sections it understands as a
//! table of [`SectionSpec`]s. Registering a spec hands back a [`SectionId`],
//! which later indexes the compiled-section slot table of every virtual
//! server bound to that protocol.
//!
//! Section names only need to be unique within one protocol's table: two
//! protocols may both define `recv Access-Request` because they live in
//! different namespaces.

use aaa_proto::ModActions;
use std::fmt;
use thiserror::Error;

/// Wildcard second name, matching any value
pub const IDENT_ANY: &str = "*";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate processing section '{name1} {name2}' in protocol {protocol}")]
    DuplicateSection {
        protocol: String,
        name1: String,
        name2: String,
    },
    #[error("Processing section '{name1} {name2}' in protocol {protocol} is cacheable but has no default actions")]
    MissingDefaultActions {
        protocol: String,
        name1: String,
        name2: String,
    },
}

/// A module method name pair, as allowed inside a section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodName {
    pub name1: &'static str,
    pub name2: &'static str,
}

impl MethodName {
    pub const fn new(name1: &'static str, name2: &'static str) -> Self {
        MethodName { name1, name2 }
    }

    /// Check if a called method matches this entry
    ///
    /// An entry with a wildcard second name matches any call with the same
    /// first name; otherwise the second names must be equal.
    pub fn matches(&self, name1: &str, name2: Option<&str>) -> bool {
        if self.name1 != IDENT_ANY && self.name1 != name1 {
            return false;
        }
        self.name2 == IDENT_ANY || Some(self.name2) == name2
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name1, self.name2)
    }
}

/// A processing section a protocol module supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSpec {
    /// First name, such as "recv" or "send"
    pub name1: &'static str,
    /// Second name, such as "Identity-Response", or [`IDENT_ANY`]
    pub name2: &'static str,
    /// Default actions bound to the compiled section
    pub actions: Option<ModActions>,
    /// Compile for validation only; never store the result
    pub dont_cache: bool,
    /// Module methods allowed in this section, on top of the protocol's own list
    pub methods: &'static [MethodName],
}

impl SectionSpec {
    pub const fn new(name1: &'static str, name2: &'static str, actions: ModActions) -> Self {
        SectionSpec {
            name1,
            name2,
            actions: Some(actions),
            dont_cache: false,
            methods: &[],
        }
    }

    /// Spec which is only ever validated, never cached
    pub const fn uncached(name1: &'static str, name2: &'static str) -> Self {
        SectionSpec {
            name1,
            name2,
            actions: None,
            dont_cache: true,
            methods: &[],
        }
    }

    pub const fn with_methods(mut self, methods: &'static [MethodName]) -> Self {
        self.methods = methods;
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.name2 == IDENT_ANY
    }

    /// Check if a configuration section with these names belongs to this spec
    pub fn matches(&self, name1: &str, name2: Option<&str>) -> bool {
        self.name1 == name1 && (self.is_wildcard() || Some(self.name2) == name2)
    }
}

impl fmt::Display for SectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name1, self.name2)
    }
}

/// Opaque handle to a registered section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(usize);

impl SectionId {
    /// Slot index of this section
    pub fn index(self) -> usize {
        self.0
    }
}

/// Entry descriptor handed to the dispatcher
///
/// Fixed sections are named by their id alone; wildcard sections also carry
/// the concrete second name (e.g. the `Auth-Type` value for `authenticate *`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SectionRef {
    pub id: SectionId,
    pub name2: Option<String>,
}

impl SectionRef {
    pub fn fixed(id: SectionId) -> Self {
        SectionRef { id, name2: None }
    }

    pub fn named(id: SectionId, name2: impl Into<String>) -> Self {
        SectionRef {
            id,
            name2: Some(name2.into()),
        }
    }
}

/// Table of processing sections for one protocol module
#[derive(Debug, Clone)]
pub struct SectionRegistry {
    protocol: String,
    specs: Vec<SectionSpec>,
}

impl SectionRegistry {
    pub fn new(protocol: impl Into<String>) -> Self {
        SectionRegistry {
            protocol: protocol.into(),
            specs: Vec::new(),
        }
    }

    /// Build a registry from a static table, in table order
    pub fn from_specs(
        protocol: impl Into<String>,
        specs: impl IntoIterator<Item = SectionSpec>,
    ) -> Result<Self, RegistryError> {
        let mut registry = SectionRegistry::new(protocol);
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Register a processing section
    ///
    /// Fails if the protocol already has a section with the same names, or if
    /// a cacheable section has no default actions.
    pub fn register(&mut self, spec: SectionSpec) -> Result<SectionId, RegistryError> {
        if self
            .specs
            .iter()
            .any(|existing| existing.name1 == spec.name1 && existing.name2 == spec.name2)
        {
            return Err(RegistryError::DuplicateSection {
                protocol: self.protocol.clone(),
                name1: spec.name1.to_string(),
                name2: spec.name2.to_string(),
            });
        }

        if !spec.dont_cache && spec.actions.is_none() {
            return Err(RegistryError::MissingDefaultActions {
                protocol: self.protocol.clone(),
                name1: spec.name1.to_string(),
                name2: spec.name2.to_string(),
            });
        }

        let id = SectionId(self.specs.len());
        self.specs.push(spec);
        Ok(id)
    }

    /// Find the section a `name1 name2` pair refers to
    ///
    /// Exact entries win over wildcard ones.
    pub fn lookup(&self, name1: &str, name2: Option<&str>) -> Option<(SectionId, &SectionSpec)> {
        let exact = self
            .specs
            .iter()
            .position(|spec| !spec.is_wildcard() && spec.matches(name1, name2));
        let index = exact.or_else(|| {
            self.specs
                .iter()
                .position(|spec| spec.is_wildcard() && spec.matches(name1, name2))
        })?;
        Some((SectionId(index), &self.specs[index]))
    }

    /// Module methods allowed in a section, if the section exists
    pub fn section_methods(&self, name1: &str, name2: Option<&str>) -> Option<&'static [MethodName]> {
        self.lookup(name1, name2).map(|(_, spec)| spec.methods)
    }

    pub fn get(&self, id: SectionId) -> Option<&SectionSpec> {
        self.specs.get(id.0)
    }

    /// Specs with their handles, in table order
    pub fn iter(&self) -> impl Iterator<Item = (SectionId, &SectionSpec)> {
        self.specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (SectionId(i), spec))
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
