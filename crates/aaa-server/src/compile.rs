//! Section compiler
//!
//! Walks a virtual server's configuration against its protocol's section
//! registry and turns every processing section present into a
//! [`CompiledSection`]. Module calls, attribute references and `call`
//! targets are all checked here, so a server that compiles never hits an
//! unknown reference at runtime.

use crate::module::{MethodCall, ModuleTable};
use crate::namespace::{NamespaceError, Namespaces};
use crate::policy::{
    AssignValue, Assignment, AttrRef, Condition, ModuleCall, Node, NodeId, PolicyError,
    PolicyGraph,
};
use crate::section::{MethodName, SectionId, SectionRef, SectionRegistry, SectionSpec};
use aaa_proto::{
    ConfigItem, ConfigPair, ConfigSection, ConfigWord, Dictionary, Location, ModActions, RCode,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("{location}: method call '{call}' is not permitted here")]
    MethodNotPermitted { call: String, location: String },
    #[error("{location}: no module instance named {module}")]
    UnknownModule { module: String, location: String },
    #[error("{location}: module {module} does not implement {method}")]
    UnknownMethod {
        module: String,
        method: String,
        location: String,
    },
    #[error("{location}: unknown attribute {attr} in namespace {namespace}")]
    UnknownAttribute {
        attr: String,
        namespace: String,
        location: String,
    },
    #[error("{location}: unknown processing section '{section}' for protocol {protocol}")]
    UnknownSection {
        section: String,
        protocol: String,
        location: String,
    },
    #[error("{location}: {reason}")]
    InvalidSection { reason: String, location: String },
    #[error("{location}: invalid condition '{condition}': {reason}")]
    InvalidCondition {
        condition: String,
        reason: String,
        location: String,
    },
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
}

fn invalid(reason: impl Into<String>, location: &Location) -> CompileError {
    CompileError::InvalidSection {
        reason: reason.into(),
        location: location.to_string(),
    }
}

/// A processing section ready to execute
#[derive(Debug)]
pub struct CompiledSection {
    pub name1: String,
    pub name2: Option<String>,
    pub id: SectionId,
    /// The configuration the graph was compiled from
    pub config: Arc<ConfigSection>,
    pub graph: PolicyGraph,
    pub actions: ModActions,
}

impl CompiledSection {
    pub fn display_name(&self) -> String {
        self.config.display_name()
    }

    /// Code returned when the graph produced none
    pub fn default_rcode(&self) -> RCode {
        self.actions.default_rcode()
    }
}

/// Compiled sections of one virtual server, indexed by section handle
#[derive(Debug, Default)]
pub struct CompiledSections {
    slots: Vec<Option<Arc<CompiledSection>>>,
    wildcards: HashMap<(SectionId, String), Arc<CompiledSection>>,
}

impl CompiledSections {
    fn with_slots(count: usize) -> Self {
        CompiledSections {
            slots: vec![None; count],
            wildcards: HashMap::new(),
        }
    }

    fn store(&mut self, spec: &SectionSpec, section: CompiledSection) {
        let id = section.id;
        match (spec.is_wildcard(), section.name2.clone()) {
            (true, Some(name2)) => {
                self.wildcards.insert((id, name2), Arc::new(section));
            }
            _ => {
                if let Some(slot) = self.slots.get_mut(id.index()) {
                    *slot = Some(Arc::new(section));
                }
            }
        }
    }

    /// Compiled section an entry refers to, if configured
    pub fn get(&self, entry: &SectionRef) -> Option<&Arc<CompiledSection>> {
        let fixed = self.slots.get(entry.id.index()).and_then(Option::as_ref);
        fixed.or_else(|| {
            let name2 = entry.name2.as_ref()?;
            self.wildcards.get(&(entry.id, name2.clone()))
        })
    }

    /// Every compiled section, fixed slots first
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CompiledSection>> {
        self.slots.iter().flatten().chain(self.wildcards.values())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compiles the processing sections of one virtual server
pub struct SectionCompiler<'a> {
    pub server: &'a str,
    pub config: &'a ConfigSection,
    pub registry: &'a SectionRegistry,
    /// Methods the protocol allows in every section
    pub protocol_methods: &'static [MethodName],
    pub dict: &'a Dictionary,
    pub internal: &'a Dictionary,
    pub modules: &'a ModuleTable,
    pub namespaces: &'a Namespaces,
}

impl SectionCompiler<'_> {
    /// Compile every configured section in registry order
    pub fn compile(&self) -> Result<CompiledSections, CompileError> {
        let mut compiled = CompiledSections::with_slots(self.registry.len());

        for (id, spec) in self.registry.iter() {
            let matching: Vec<&ConfigSection> = self
                .config
                .subsections()
                .filter(|cs| {
                    matches!(self.registry.lookup(&cs.name1, cs.name2()), Some((found, _)) if found == id)
                })
                .collect();

            if !spec.is_wildcard() && matching.len() > 1 {
                return Err(invalid(
                    format!("duplicate processing section '{}'", spec),
                    &matching[1].location,
                ));
            }

            let mut seen: Vec<Option<&str>> = Vec::new();
            for cs in matching {
                if seen.contains(&cs.name2()) {
                    return Err(invalid(
                        format!("duplicate processing section '{}'", cs.display_name()),
                        &cs.location,
                    ));
                }
                seen.push(cs.name2());

                let graph = self.compile_section(cs, spec)?;
                let actions = match spec.actions {
                    Some(actions) if !spec.dont_cache => actions,
                    _ => {
                        debug!(server = %self.server, section = %cs.display_name(), "Validated uncached section");
                        continue;
                    }
                };

                debug!(
                    server = %self.server,
                    section = %cs.display_name(),
                    nodes = graph.len(),
                    "Compiled section"
                );
                compiled.store(
                    spec,
                    CompiledSection {
                        name1: cs.name1.clone(),
                        name2: cs.name2.clone(),
                        id,
                        config: Arc::new(cs.clone()),
                        graph,
                        actions,
                    },
                );
            }
        }

        if let Some(cs) = self
            .config
            .subsections()
            .find(|cs| self.registry.lookup(&cs.name1, cs.name2()).is_none())
        {
            return Err(CompileError::UnknownSection {
                section: cs.display_name(),
                protocol: self.registry.protocol().to_string(),
                location: cs.location.to_string(),
            });
        }

        Ok(compiled)
    }

    fn compile_section(&self, cs: &ConfigSection, spec: &SectionSpec) -> Result<PolicyGraph, CompileError> {
        let mut graph = PolicyGraph::new();
        let root = self.compile_group(&mut graph, cs, cs, spec)?;
        graph.set_root(root);
        Ok(graph)
    }

    fn compile_group(
        &self,
        graph: &mut PolicyGraph,
        cs: &ConfigSection,
        top: &ConfigSection,
        spec: &SectionSpec,
    ) -> Result<NodeId, CompileError> {
        let mut children = Vec::new();
        let items = &cs.children;
        let mut i = 0;

        while i < items.len() {
            let node = match &items[i] {
                ConfigItem::Word(word) => self.compile_word(graph, word, top, spec)?,
                ConfigItem::Pair(pair) => self.compile_pair(graph, pair)?,
                ConfigItem::Section(sub) => match sub.name1.as_str() {
                    "if" => {
                        let mut branches = vec![self.compile_branch(graph, sub, top, spec)?];
                        let mut otherwise = None;
                        while let Some(ConfigItem::Section(next)) = items.get(i + 1) {
                            match next.name1.as_str() {
                                "elsif" => {
                                    branches.push(self.compile_branch(graph, next, top, spec)?);
                                    i += 1;
                                }
                                "else" => {
                                    if next.name2.is_some() {
                                        return Err(invalid("'else' takes no condition", &next.location));
                                    }
                                    otherwise = Some(self.compile_group(graph, next, top, spec)?);
                                    i += 1;
                                    break;
                                }
                                _ => break,
                            }
                        }
                        graph.push(Node::If {
                            branches,
                            otherwise,
                        })
                    }
                    "elsif" | "else" => {
                        return Err(invalid(
                            format!("'{}' without a preceding 'if'", sub.name1),
                            &sub.location,
                        ));
                    }
                    "group" => {
                        if sub.name2.is_some() {
                            return Err(invalid("'group' takes no name", &sub.location));
                        }
                        self.compile_group(graph, sub, top, spec)?
                    }
                    "call" => self.compile_call(graph, sub)?,
                    other => {
                        return Err(invalid(
                            format!("unexpected section '{}'", other),
                            &sub.location,
                        ));
                    }
                },
            };
            children.push(node);
            i += 1;
        }

        Ok(graph.push(Node::Group { children }))
    }

    fn compile_branch(
        &self,
        graph: &mut PolicyGraph,
        cs: &ConfigSection,
        top: &ConfigSection,
        spec: &SectionSpec,
    ) -> Result<(Condition, NodeId), CompileError> {
        let text = cs
            .name2()
            .ok_or_else(|| invalid(format!("'{}' needs a condition", cs.name1), &cs.location))?;
        let condition = Condition::parse(text).map_err(|e| match e {
            PolicyError::InvalidCondition { condition, reason } => CompileError::InvalidCondition {
                condition,
                reason,
                location: cs.location.to_string(),
            },
            other => CompileError::InvalidCondition {
                condition: text.to_string(),
                reason: other.to_string(),
                location: cs.location.to_string(),
            },
        })?;
        self.check_attr(condition.attr(), &cs.location)?;
        let body = self.compile_group(graph, cs, top, spec)?;
        Ok((condition, body))
    }

    fn compile_word(
        &self,
        graph: &mut PolicyGraph,
        word: &ConfigWord,
        top: &ConfigSection,
        spec: &SectionSpec,
    ) -> Result<NodeId, CompileError> {
        if let Some(rcode) = RCode::from_keyword(&word.word) {
            return Ok(graph.push(Node::Literal(rcode)));
        }

        let mut parts = word.word.splitn(3, '.');
        let module = parts.next().unwrap_or_default();
        let explicit_name1 = parts.next();
        let explicit_name2 = parts.next();

        let instance = self
            .modules
            .find(module)
            .ok_or_else(|| CompileError::UnknownModule {
                module: module.to_string(),
                location: word.location.to_string(),
            })?;

        let method = match explicit_name1 {
            Some(name1) => {
                let permitted = self
                    .protocol_methods
                    .iter()
                    .chain(spec.methods.iter())
                    .any(|allowed| allowed.matches(name1, explicit_name2));
                if !permitted {
                    return Err(CompileError::MethodNotPermitted {
                        call: word.word.clone(),
                        location: word.location.to_string(),
                    });
                }
                MethodCall::new(name1, explicit_name2)
            }
            None => MethodCall::new(top.name1.clone(), top.name2()),
        };

        if instance
            .module()
            .find_method(&method.name1, method.name2.as_deref())
            .is_none()
        {
            return Err(CompileError::UnknownMethod {
                module: module.to_string(),
                method: method.to_string(),
                location: word.location.to_string(),
            });
        }

        Ok(graph.push(Node::Module(ModuleCall {
            instance: instance.clone(),
            method,
            location: word.location.clone(),
        })))
    }

    fn compile_pair(&self, graph: &mut PolicyGraph, pair: &ConfigPair) -> Result<NodeId, CompileError> {
        let target = AttrRef::parse(&pair.attr).map_err(|e| invalid(e.to_string(), &pair.location))?;
        self.check_attr(&target, &pair.location)?;

        let value = if pair.value.starts_with('&') {
            let source =
                AttrRef::parse(&pair.value).map_err(|e| invalid(e.to_string(), &pair.location))?;
            self.check_attr(&source, &pair.location)?;
            AssignValue::Attr(source)
        } else {
            AssignValue::Literal(pair.value.clone())
        };

        Ok(graph.push(Node::Assign(Assignment {
            target,
            op: pair.op,
            value,
        })))
    }

    fn compile_call(&self, graph: &mut PolicyGraph, cs: &ConfigSection) -> Result<NodeId, CompileError> {
        let target = cs
            .name2()
            .ok_or_else(|| invalid("'call' needs a virtual server name", &cs.location))?;
        if !cs.children.is_empty() {
            return Err(invalid("'call' takes no policy of its own", &cs.location));
        }
        if target == self.server {
            return Err(invalid("virtual server calls itself", &cs.location));
        }
        self.namespaces.has_namespace(target, self.dict, &cs.location)?;

        Ok(graph.push(Node::Call {
            server: target.to_string(),
            location: cs.location.clone(),
        }))
    }

    fn check_attr(&self, attr: &AttrRef, location: &Location) -> Result<(), CompileError> {
        if self.dict.attr(&attr.name).is_some() || self.internal.attr(&attr.name).is_some() {
            return Ok(());
        }
        Err(CompileError::UnknownAttribute {
            attr: attr.name.clone(),
            namespace: self.dict.name().to_string(),
            location: location.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleCtx, PolicyModule};
    use crate::request::Request;
    use crate::section::IDENT_ANY;
    use aaa_proto::{AssignOp, DataType};
    use async_trait::async_trait;

    static PROTOCOL_METHODS: [MethodName; 1] = [MethodName::new("group", IDENT_ANY)];
    static STORE_METHODS: [MethodName; 1] = [MethodName::new("store", "session")];
    static STUB_METHODS: [MethodName; 4] = [
        MethodName::new("recv", IDENT_ANY),
        MethodName::new("authenticate", IDENT_ANY),
        MethodName::new("group", IDENT_ANY),
        MethodName::new("store", "session"),
    ];

    struct Stub;

    #[async_trait]
    impl PolicyModule for Stub {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn methods(&self) -> &'static [MethodName] {
            &STUB_METHODS
        }

        async fn call(&self, _ctx: &ModuleCtx<'_>, _method: &MethodCall, _request: &mut Request) -> RCode {
            RCode::Ok
        }
    }

    fn registry() -> SectionRegistry {
        SectionRegistry::from_specs(
            "test",
            [
                SectionSpec::new("recv", "Identity-Response", ModActions::authorize()),
                SectionSpec::new("recv", "Client-Error", ModActions::authorize().with_default(RCode::Reject)),
                SectionSpec::new("authenticate", IDENT_ANY, ModActions::authenticate()),
                SectionSpec::new("store", "session", ModActions::authorize()).with_methods(&STORE_METHODS),
                SectionSpec::uncached("listen", "udp"),
            ],
        )
        .unwrap()
    }

    fn dict() -> Dictionary {
        Dictionary::new("test")
            .with_attr("Identity", 1, DataType::String)
            .unwrap()
            .with_attr("Reply-Message", 2, DataType::String)
            .unwrap()
    }

    struct Fixture {
        registry: SectionRegistry,
        dict: Dictionary,
        internal: Dictionary,
        modules: ModuleTable,
        namespaces: Namespaces,
    }

    impl Fixture {
        fn new() -> Self {
            let mut modules = ModuleTable::new(100);
            modules
                .bootstrap("stub", Box::new(Stub), &serde_json::Value::Null)
                .unwrap();
            modules.instantiate().unwrap();

            let mut namespaces = Namespaces::new();
            namespaces.insert("other", Arc::new(ConfigSection::new("server", Some("other"))));
            namespaces.assign("other", Arc::new(Dictionary::new("radius"))).unwrap();
            namespaces.insert("peer", Arc::new(ConfigSection::new("server", Some("peer"))));
            namespaces.assign("peer", Arc::new(dict())).unwrap();

            Fixture {
                registry: registry(),
                dict: dict(),
                internal: Dictionary::internal(),
                modules,
                namespaces,
            }
        }

        fn compile(&self, mut config: ConfigSection) -> Result<CompiledSections, CompileError> {
            config.assign_locations("test", Some("aka"));
            SectionCompiler {
                server: "aka",
                config: &config,
                registry: &self.registry,
                protocol_methods: &PROTOCOL_METHODS,
                dict: &self.dict,
                internal: &self.internal,
                modules: &self.modules,
                namespaces: &self.namespaces,
            }
            .compile()
        }
    }

    fn server() -> ConfigSection {
        ConfigSection::new("server", Some("aka"))
    }

    fn recv(body: ConfigSection) -> ConfigSection {
        server().with_section(body)
    }

    fn identity() -> ConfigSection {
        ConfigSection::new("recv", Some("Identity-Response"))
    }

    #[test]
    fn test_compile_present_sections_only() {
        let fixture = Fixture::new();
        let compiled = fixture.compile(recv(identity().with_word("stub"))).unwrap();

        assert_eq!(compiled.len(), 1);
        let (id, _) = fixture.registry.lookup("recv", Some("Identity-Response")).unwrap();
        let section = compiled.get(&SectionRef::fixed(id)).unwrap();
        assert_eq!(section.default_rcode(), RCode::Noop);
        assert_eq!(section.display_name(), "recv Identity-Response");

        let (missing, _) = fixture.registry.lookup("recv", Some("Client-Error")).unwrap();
        assert!(compiled.get(&SectionRef::fixed(missing)).is_none());
    }

    #[test]
    fn test_wildcard_sections() {
        let fixture = Fixture::new();
        let config = server()
            .with_section(ConfigSection::new("authenticate", Some("pap")).with_word("stub"))
            .with_section(ConfigSection::new("authenticate", Some("eap")).with_word("ok"));
        let compiled = fixture.compile(config).unwrap();

        let (id, _) = fixture.registry.lookup("authenticate", Some("pap")).unwrap();
        assert!(compiled.get(&SectionRef::named(id, "pap")).is_some());
        assert!(compiled.get(&SectionRef::named(id, "eap")).is_some());
        assert!(compiled.get(&SectionRef::named(id, "chap")).is_none());
        assert!(compiled.get(&SectionRef::fixed(id)).is_none());
    }

    #[test]
    fn test_method_not_permitted() {
        let fixture = Fixture::new();
        let err = fixture
            .compile(recv(identity().with_word("stub.store.session")))
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::MethodNotPermitted { ref call, ref location }
                if call == "stub.store.session" && location.contains("recv Identity-Response")
        ));

        // Allowed by the protocol list, and by the section list
        assert!(fixture.compile(recv(identity().with_word("stub.group.admins"))).is_ok());
        let store = ConfigSection::new("store", Some("session")).with_word("stub.store.session");
        assert!(fixture.compile(recv(store)).is_ok());
    }

    #[test]
    fn test_unknown_module_and_method() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.compile(recv(identity().with_word("ldap"))),
            Err(CompileError::UnknownModule { ref module, .. }) if module == "ldap"
        ));

        let store_bare = ConfigSection::new("store", Some("session")).with_word("stub");
        assert!(fixture.compile(recv(store_bare)).is_ok());

        let listen = ConfigSection::new("listen", Some("udp")).with_word("stub");
        assert!(matches!(
            fixture.compile(recv(listen)),
            Err(CompileError::UnknownMethod { ref method, .. }) if method == "listen.udp"
        ));
    }

    #[test]
    fn test_unknown_section() {
        let fixture = Fixture::new();
        let err = fixture
            .compile(recv(ConfigSection::new("recv", Some("Bogus"))))
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownSection { ref section, .. } if section == "recv Bogus"));
    }

    #[test]
    fn test_uncached_section_is_validated() {
        let fixture = Fixture::new();
        let listen = ConfigSection::new("listen", Some("udp")).with_word("ok");
        let compiled = fixture.compile(recv(listen)).unwrap();
        assert!(compiled.is_empty());

        let bad = ConfigSection::new("listen", Some("udp")).with_word("nope");
        assert!(fixture.compile(recv(bad)).is_err());
    }

    #[test]
    fn test_conditions_and_attributes() {
        let fixture = Fixture::new();
        let body = identity()
            .with_section(
                ConfigSection::new("if", Some("&Identity =~ /^0/"))
                    .with_pair("&control.Auth-Type", AssignOp::Set, "stub"),
            )
            .with_section(ConfigSection::new("elsif", Some("&Identity == \"x\"")).with_word("reject"))
            .with_section(ConfigSection::new("else", None).with_word("ok"));
        assert!(fixture.compile(recv(body)).is_ok());

        let unknown = identity().with_pair("&reply.Nope", AssignOp::Set, "1");
        assert!(matches!(
            fixture.compile(recv(unknown)),
            Err(CompileError::UnknownAttribute { ref attr, .. }) if attr == "Nope"
        ));

        let regex = identity().with_section(ConfigSection::new("if", Some("&Identity =~ /(/")));
        assert!(matches!(
            fixture.compile(recv(regex)),
            Err(CompileError::InvalidCondition { .. })
        ));

        let orphan = identity().with_section(ConfigSection::new("else", None));
        assert!(matches!(
            fixture.compile(recv(orphan)),
            Err(CompileError::InvalidSection { .. })
        ));
    }

    #[test]
    fn test_call_checks_namespace() {
        let fixture = Fixture::new();
        let ok = identity().with_section(ConfigSection::new("call", Some("peer")));
        assert!(fixture.compile(recv(ok)).is_ok());

        let mismatch = identity().with_section(ConfigSection::new("call", Some("other")));
        assert!(matches!(
            fixture.compile(recv(mismatch)),
            Err(CompileError::Namespace(NamespaceError::NamespaceMismatch { .. }))
        ));

        let missing = identity().with_section(ConfigSection::new("call", Some("nowhere")));
        assert!(matches!(
            fixture.compile(recv(missing)),
            Err(CompileError::Namespace(NamespaceError::UnknownServer { .. }))
        ));
    }

    #[test]
    fn test_duplicate_config_section() {
        let fixture = Fixture::new();
        let config = server().with_section(identity()).with_section(identity());
        assert!(matches!(
            fixture.compile(config),
            Err(CompileError::InvalidSection { .. })
        ));
    }
}
