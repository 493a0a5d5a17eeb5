//! Policy modules
//!
//! A policy module exposes named methods which processing sections call, e.g.
//! `users` in `recv Access-Request` runs the module's `recv *` method. Modules
//! follow the same lifecycle as virtual servers: bootstrap with settings,
//! instantiate, then per-thread setup on every worker.
//!
//! Per-thread data lives in thread-local storage keyed by image generation
//! and module instance, so a module never shares its thread resources.

use crate::request::Request;
use crate::section::MethodName;
use aaa_proto::RCode;
use async_trait::async_trait;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("Invalid configuration for module {module}: {reason}")]
    Config { module: String, reason: String },
    #[error("Module {module} failed to start: {reason}")]
    Start { module: String, reason: String },
    #[error("Duplicate module instance {0}")]
    Duplicate(String),
    #[error("Unknown module type {0}")]
    UnknownType(String),
}

/// Method pair as written at a call site
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodCall {
    pub name1: String,
    pub name2: Option<String>,
}

impl MethodCall {
    pub fn new(name1: impl Into<String>, name2: Option<&str>) -> Self {
        MethodCall {
            name1: name1.into(),
            name2: name2.map(str::to_string),
        }
    }
}

impl fmt::Display for MethodCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name2 {
            Some(name2) => write!(f, "{}.{}", self.name1, name2),
            None => f.write_str(&self.name1),
        }
    }
}

/// Creates a fresh, unconfigured module
pub type ModuleConstructor = fn() -> Box<dyn PolicyModule>;

/// A pluggable policy provider
#[async_trait]
pub trait PolicyModule: Send + Sync {
    /// Module type name
    fn name(&self) -> &'static str;

    /// Methods this module implements
    fn methods(&self) -> &'static [MethodName];

    /// Parse settings
    fn bootstrap(&mut self, _settings: &serde_json::Value) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Prepare shared state once settings are known
    fn instantiate(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Create data private to the calling worker thread
    fn thread_instantiate(&self) -> Result<Option<Box<dyn Any>>, ModuleError> {
        Ok(None)
    }

    /// Release data created by [`PolicyModule::thread_instantiate`]
    fn thread_detach(&self, _data: Box<dyn Any>) {}

    /// Release shared state; the instance is not called again
    fn detach(&self) {}

    /// Run a method against a request
    async fn call(&self, ctx: &ModuleCtx<'_>, method: &MethodCall, request: &mut Request) -> RCode;

    /// Find the implemented method a call refers to
    fn find_method(&self, name1: &str, name2: Option<&str>) -> Option<MethodName> {
        self.methods()
            .iter()
            .find(|method| method.matches(name1, name2))
            .copied()
    }
}

/// A configured module
pub struct ModuleInstance {
    name: String,
    index: usize,
    generation: u64,
    module: Box<dyn PolicyModule>,
    detached: AtomicBool,
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field("module", &self.module.name())
            .field("generation", &self.generation)
            .finish()
    }
}

impl ModuleInstance {
    /// Instance name used in policy
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &dyn PolicyModule {
        self.module.as_ref()
    }

    /// Run a method with this instance's thread data in scope
    pub async fn call(&self, method: &MethodCall, request: &mut Request) -> RCode {
        let ctx = ModuleCtx { instance: self };
        self.module.call(&ctx, method, request).await
    }

    fn key(&self) -> (u64, usize) {
        (self.generation, self.index)
    }

    fn detach(&self) {
        if !self.detached.swap(true, Ordering::AcqRel) {
            debug!(module = %self.name, "Detaching module");
            self.module.detach();
        }
    }
}

/// Handed to [`PolicyModule::call`]
pub struct ModuleCtx<'a> {
    instance: &'a ModuleInstance,
}

impl ModuleCtx<'_> {
    pub fn instance_name(&self) -> &str {
        &self.instance.name
    }

    /// Borrow this thread's data for the instance
    ///
    /// Returns `None` if the calling thread was never set up for this
    /// instance or the data has a different type.
    pub fn with_thread<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        THREAD_DATA.with(|data| {
            let mut data = data.borrow_mut();
            data.get_mut(&self.instance.key())
                .and_then(|boxed| boxed.downcast_mut::<T>())
                .map(f)
        })
    }
}

thread_local! {
    static THREAD_DATA: RefCell<HashMap<(u64, usize), Box<dyn Any>>> = RefCell::new(HashMap::new());
    static THREAD_GENERATIONS: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

/// The module instances of one server image
#[derive(Debug, Default)]
pub struct ModuleTable {
    generation: u64,
    staged: Vec<ModuleInstance>,
    live: Vec<Arc<ModuleInstance>>,
}

impl ModuleTable {
    pub fn new(generation: u64) -> Self {
        ModuleTable {
            generation,
            staged: Vec::new(),
            live: Vec::new(),
        }
    }

    /// Bootstrap a module and stage it for instantiation
    pub fn bootstrap(
        &mut self,
        name: &str,
        mut module: Box<dyn PolicyModule>,
        settings: &serde_json::Value,
    ) -> Result<(), ModuleError> {
        if self.staged.iter().any(|inst| inst.name == name)
            || self.live.iter().any(|inst| inst.name == name)
        {
            return Err(ModuleError::Duplicate(name.to_string()));
        }

        module.bootstrap(settings)?;
        debug!(module = %name, kind = module.name(), "Bootstrapped module");

        let index = self.staged.len() + self.live.len();
        self.staged.push(ModuleInstance {
            name: name.to_string(),
            index,
            generation: self.generation,
            module,
            detached: AtomicBool::new(false),
        });
        Ok(())
    }

    /// Instantiate every staged module
    pub fn instantiate(&mut self) -> Result<(), ModuleError> {
        for mut inst in self.staged.drain(..) {
            inst.module.instantiate()?;
            info!(module = %inst.name, "Instantiated module");
            self.live.push(Arc::new(inst));
        }
        Ok(())
    }

    /// Instantiated module by instance name
    pub fn find(&self, name: &str) -> Option<&Arc<ModuleInstance>> {
        self.live.iter().find(|inst| inst.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModuleInstance>> {
        self.live.iter()
    }

    pub fn len(&self) -> usize {
        self.live.len() + self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set up thread data for every module on the calling thread
    ///
    /// Calling it again on the same thread does nothing. If any module
    /// fails, the modules already set up are released again.
    pub fn thread_instantiate(&self) -> Result<(), ModuleError> {
        let fresh = THREAD_GENERATIONS.with(|gens| gens.borrow_mut().insert(self.generation));
        if !fresh {
            return Ok(());
        }

        for inst in &self.live {
            match inst.module.thread_instantiate() {
                Ok(Some(data)) => {
                    THREAD_DATA.with(|map| map.borrow_mut().insert(inst.key(), data));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(module = %inst.name, "Thread instantiation failed: {}", e);
                    self.thread_detach();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Release this thread's module data; safe to call repeatedly
    pub fn thread_detach(&self) {
        let present = THREAD_GENERATIONS.with(|gens| gens.borrow_mut().remove(&self.generation));
        if !present {
            return;
        }

        for inst in &self.live {
            let data = THREAD_DATA.with(|map| map.borrow_mut().remove(&inst.key()));
            if let Some(data) = data {
                inst.module.thread_detach(data);
            }
        }
    }

    /// Check if the calling thread is set up
    pub fn is_thread_instantiated(&self) -> bool {
        THREAD_GENERATIONS.with(|gens| gens.borrow().contains(&self.generation))
    }

    /// Detach every module once
    pub fn detach(&self) {
        for inst in self.live.iter().rev() {
            inst.detach();
        }
    }
}
