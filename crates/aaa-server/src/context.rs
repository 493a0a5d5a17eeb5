//! Server context
//!
//! Holds everything loaded once per process: protocol modules with their
//! section registries and dictionaries, and the policy module types that
//! configuration may instantiate. Built single-threaded at startup and
//! read-only afterwards, apart from the protocols' loaded flag: the server
//! unloads them on shutdown and loads them again on the next load.

use crate::error::ServerError;
use crate::module::ModuleConstructor;
use crate::modules::users::UsersModule;
use crate::process::{eap_aka::EapAka, radius::Radius};
use crate::protocol::{ProtocolError, ProtocolModule};
use crate::section::SectionRegistry;
use aaa_proto::Dictionary;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// A loaded protocol module
pub struct ProtocolEntry {
    module: Box<dyn ProtocolModule>,
    registry: SectionRegistry,
    dict: Arc<Dictionary>,
}

impl ProtocolEntry {
    pub fn name(&self) -> &'static str {
        self.module.name()
    }

    pub fn module(&self) -> &dyn ProtocolModule {
        self.module.as_ref()
    }

    pub fn registry(&self) -> &SectionRegistry {
        &self.registry
    }

    pub fn dict(&self) -> &Arc<Dictionary> {
        &self.dict
    }
}

/// Process-wide tables
pub struct Context {
    protocols: HashMap<String, Arc<ProtocolEntry>>,
    modules: HashMap<String, ModuleConstructor>,
    internal: Arc<Dictionary>,
    loaded: Mutex<bool>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Protocol serving a namespace
    pub fn protocol(&self, namespace: &str) -> Option<&Arc<ProtocolEntry>> {
        self.protocols.get(namespace)
    }

    /// Namespaces with a loaded protocol, sorted
    pub fn namespaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.protocols.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Constructor for a policy module type
    pub fn module_constructor(&self, kind: &str) -> Option<ModuleConstructor> {
        self.modules.get(kind).copied()
    }

    /// Attributes visible from every namespace
    pub fn internal_dict(&self) -> &Arc<Dictionary> {
        &self.internal
    }

    /// Check if every protocol's `onload` has run without a matching `unload`
    pub fn is_loaded(&self) -> bool {
        *self.lock_loaded()
    }

    /// Run every protocol's `onload` again after [`Context::unload`]
    ///
    /// Does nothing while the protocols are loaded.
    pub fn load(&self) -> Result<(), ProtocolError> {
        let mut loaded = self.lock_loaded();
        if *loaded {
            return Ok(());
        }
        let mut done: Vec<&Arc<ProtocolEntry>> = Vec::with_capacity(self.protocols.len());
        for entry in self.protocols.values() {
            if let Err(e) = entry.module.onload() {
                for entry in done {
                    entry.module.unload();
                }
                return Err(e);
            }
            done.push(entry);
        }
        info!(protocols = done.len(), "Loaded protocols");
        *loaded = true;
        Ok(())
    }

    /// Run every protocol's `unload`; idempotent
    pub fn unload(&self) {
        let mut loaded = self.lock_loaded();
        if !*loaded {
            return;
        }
        for entry in self.protocols.values() {
            debug!(protocol = entry.name(), "Unloading protocol");
            entry.module.unload();
        }
        *loaded = false;
    }

    fn lock_loaded(&self) -> MutexGuard<'_, bool> {
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.unload();
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    protocols: Vec<Box<dyn ProtocolModule>>,
    modules: Vec<(String, ModuleConstructor)>,
}

impl ContextBuilder {
    /// Add a protocol module
    pub fn protocol(mut self, module: impl ProtocolModule + 'static) -> Self {
        self.protocols.push(Box::new(module));
        self
    }

    /// Add a policy module type
    pub fn module(mut self, kind: &str, constructor: ModuleConstructor) -> Self {
        self.modules.push((kind.to_string(), constructor));
        self
    }

    /// Add the protocols and policy modules shipped with the server
    pub fn with_builtins(self) -> Self {
        self.protocol(EapAka)
            .protocol(Radius)
            .module("users", UsersModule::create)
    }

    /// Register every protocol's sections and run its `onload`
    pub fn build(self) -> Result<Context, ServerError> {
        let mut protocols: HashMap<String, Arc<ProtocolEntry>> = HashMap::new();

        for module in self.protocols {
            let result = load_protocol(module, &protocols);
            match result {
                Ok(entry) => {
                    info!(
                        protocol = entry.name(),
                        namespace = entry.dict.name(),
                        sections = entry.registry.len(),
                        "Loaded protocol"
                    );
                    protocols.insert(entry.dict.name().to_string(), Arc::new(entry));
                }
                Err(e) => {
                    for loaded in protocols.values() {
                        loaded.module.unload();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Context {
            protocols,
            modules: self.modules.into_iter().collect(),
            internal: Arc::new(Dictionary::internal()),
            loaded: Mutex::new(true),
        })
    }
}

fn load_protocol(
    module: Box<dyn ProtocolModule>,
    loaded: &HashMap<String, Arc<ProtocolEntry>>,
) -> Result<ProtocolEntry, ServerError> {
    let dict = module.dict().map_err(ProtocolError::from)?;
    if loaded.contains_key(dict.name()) {
        return Err(ServerError::DuplicateNamespace(dict.name().to_string()));
    }
    let registry = SectionRegistry::from_specs(module.name(), module.sections().iter().cloned())?;
    module.onload()?;

    Ok(ProtocolEntry {
        module,
        registry,
        dict: Arc::new(dict),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let context = Context::builder().with_builtins().build().unwrap();
        assert_eq!(context.namespaces(), vec!["eap-aka", "radius"]);

        let aka = context.protocol("eap-aka").unwrap();
        assert_eq!(aka.name(), "eap_aka");
        assert_eq!(aka.registry().len(), 23);
        assert!(context.module_constructor("users").is_some());
        assert!(context.module_constructor("ldap").is_none());
        assert!(context.internal_dict().attr("Auth-Type").is_some());
    }

    #[test]
    fn test_duplicate_namespace() {
        let err = Context::builder()
            .protocol(Radius)
            .protocol(Radius)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::DuplicateNamespace(ref ns) if ns == "radius"));
    }

    #[test]
    fn test_unload_and_load_again() {
        let context = Context::builder().with_builtins().build().unwrap();
        assert!(context.is_loaded());

        context.unload();
        assert!(!context.is_loaded());
        context.unload();

        context.load().unwrap();
        assert!(context.is_loaded());
        context.load().unwrap();
    }
}
