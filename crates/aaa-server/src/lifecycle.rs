//! Virtual server lifecycle
//!
//! A [`VirtualServers`] value is one server image: every virtual server
//! built from one configuration, together with the policy modules, listeners
//! and statistics they share. An image moves through
//!
//! ```text
//! Unregistered → Bootstrapped → Instantiated → ThreadInstantiated → Open → Freed
//! ```
//!
//! and can be freed from any state. Requests register with
//! [`VirtualServers::enter`]; a retired image stays whole until the last of
//! them finishes, and is freed then.

use crate::compile::{CompiledSection, CompiledSections, SectionCompiler};
use crate::config::{Config, ListenConfig};
use crate::context::{Context, ProtocolEntry};
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, LifecycleError};
use crate::listen::{ListenData, ListenError, Listener, ListenerRegistry};
use crate::module::{ModuleError, ModuleTable};
use crate::namespace::Namespaces;
use crate::protocol::ProtocolInstance;
use crate::request::Request;
use crate::section::{SectionRef, SectionRegistry};
use crate::stats::DispatchStats;
use aaa_proto::{ConfigSection, Dictionary, RCode};
use arc_swap::ArcSwapOption;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Origin recorded in configuration locations
const CONFIG_ORIGIN: &str = "config";

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unregistered,
    Bootstrapped,
    Instantiated,
    ThreadInstantiated,
    Open,
    Freed,
}

impl LifecycleState {
    /// Check if moving from this state to `next` is allowed
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Unregistered, Bootstrapped)
                | (Bootstrapped, Instantiated)
                | (Instantiated, ThreadInstantiated)
                | (ThreadInstantiated, Open)
        ) || (next == Freed && self != Freed)
    }
}

/// One virtual server
pub struct VirtualServer {
    name: String,
    config: Arc<ConfigSection>,
    dict: Arc<Dictionary>,
    protocol: Arc<ProtocolEntry>,
    instance: OnceLock<Box<dyn ProtocolInstance>>,
    compiled: ArcSwapOption<CompiledSections>,
    listen: Vec<ListenConfig>,
}

impl VirtualServer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `server <name>` configuration section
    pub fn config(&self) -> &Arc<ConfigSection> {
        &self.config
    }

    pub fn dict(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    pub fn protocol(&self) -> &Arc<ProtocolEntry> {
        &self.protocol
    }

    pub fn registry(&self) -> &SectionRegistry {
        self.protocol.registry()
    }

    /// Protocol state; set once the image is instantiated
    pub fn instance(&self) -> Option<&dyn ProtocolInstance> {
        self.instance.get().map(|instance| instance.as_ref())
    }

    /// Compiled policy for a section, if the server configures one
    pub fn compiled_section(&self, entry: &SectionRef) -> Option<Arc<CompiledSection>> {
        let compiled = self.compiled.load();
        compiled.as_ref()?.get(entry).cloned()
    }

    /// Number of compiled sections; zero before instantiate and after free
    pub fn compiled_len(&self) -> usize {
        self.compiled.load().as_ref().map_or(0, |compiled| compiled.len())
    }

    /// Result of a section with no policy configured
    pub fn default_rcode(&self, entry: &SectionRef) -> Option<RCode> {
        let spec = self.registry().get(entry.id)?;
        Some(spec.actions.map_or(RCode::Noop, |actions| actions.default_rcode()))
    }

    /// `name1 name2` of the section an entry refers to
    pub fn section_name(&self, entry: &SectionRef) -> String {
        match (self.registry().get(entry.id), &entry.name2) {
            (Some(spec), Some(name2)) if spec.is_wildcard() => format!("{} {}", spec.name1, name2),
            (Some(spec), _) => spec.to_string(),
            (None, _) => format!("<section {}>", entry.id.index()),
        }
    }

    fn free(&self) {
        self.compiled.store(None);
    }
}

/// Requests running on an image
#[derive(Debug, Default)]
struct Drain {
    active: usize,
    retired: bool,
    closed: bool,
}

impl Drain {
    /// Close a retired image with nothing left running
    fn close_if_idle(&mut self) -> bool {
        if self.retired && self.active == 0 && !self.closed {
            self.closed = true;
            return true;
        }
        false
    }
}

/// A request registered with [`VirtualServers::enter`]
///
/// Dropping the last one of a retired image frees the image.
pub struct ActiveRequest {
    image: Arc<VirtualServers>,
}

impl ActiveRequest {
    pub fn image(&self) -> &Arc<VirtualServers> {
        &self.image
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.image.leave();
    }
}

/// One server image
pub struct VirtualServers {
    generation: u64,
    context: Arc<Context>,
    servers: BTreeMap<String, Arc<VirtualServer>>,
    /// Protocol instances waiting for instantiate
    pending: BTreeMap<String, Box<dyn ProtocolInstance>>,
    namespaces: Namespaces,
    modules: ModuleTable,
    listeners: ListenerRegistry,
    sockets: Mutex<Vec<(Arc<Listener>, Arc<UdpSocket>)>>,
    stats: DispatchStats,
    state: Mutex<LifecycleState>,
    drain: Mutex<Drain>,
    closing: watch::Sender<bool>,
}

impl VirtualServers {
    /// Create the virtual servers of a configuration
    ///
    /// Resolves every server's namespace, bootstraps the policy modules and
    /// hands each server's settings to its protocol. Every image gets a
    /// new generation number, which keys its modules' thread data.
    pub fn bootstrap(context: Arc<Context>, config: &Config) -> Result<Self, LifecycleError> {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let mut namespaces = Namespaces::new();
        let mut protocols = Vec::with_capacity(config.servers.len());

        for server in &config.servers {
            let cs = Arc::new(server.to_section(CONFIG_ORIGIN));
            if !namespaces.insert(&server.name, cs.clone()) {
                return Err(LifecycleError::DuplicateServer(server.name.clone()));
            }
            let protocol = context
                .protocol(&server.namespace)
                .ok_or_else(|| LifecycleError::UnknownNamespace {
                    server: server.name.clone(),
                    namespace: server.namespace.clone(),
                })?
                .clone();
            namespaces.assign(&server.name, protocol.dict().clone())?;
            protocols.push((server, cs, protocol));
        }

        let mut modules = ModuleTable::new(generation);
        for module in &config.modules {
            let constructor = context
                .module_constructor(&module.module)
                .ok_or_else(|| ModuleError::UnknownType(module.module.clone()))?;
            modules.bootstrap(&module.name, constructor(), &module.settings)?;
        }

        let mut servers = BTreeMap::new();
        let mut pending = BTreeMap::new();
        for (server, cs, protocol) in protocols {
            let instance = protocol
                .module()
                .bootstrap(&server.name, &server.settings)
                .map_err(|source| LifecycleError::Bootstrap {
                    server: server.name.clone(),
                    source,
                })?;
            debug!(server = %server.name, protocol = protocol.name(), "Bootstrapped virtual server");
            pending.insert(server.name.clone(), instance);
            servers.insert(
                server.name.clone(),
                Arc::new(VirtualServer {
                    name: server.name.clone(),
                    config: cs,
                    dict: protocol.dict().clone(),
                    protocol,
                    instance: OnceLock::new(),
                    compiled: ArcSwapOption::empty(),
                    listen: server.listen.clone(),
                }),
            );
        }

        info!(generation, servers = servers.len(), modules = modules.len(), "Bootstrapped server image");
        Ok(VirtualServers {
            generation,
            context,
            servers,
            pending,
            namespaces,
            modules,
            listeners: ListenerRegistry::new(),
            sockets: Mutex::new(Vec::new()),
            stats: DispatchStats::new(),
            state: Mutex::new(LifecycleState::Bootstrapped),
            drain: Mutex::new(Drain::default()),
            closing: watch::Sender::new(false),
        })
    }

    /// Instantiate modules, compile every server and finish protocol setup
    ///
    /// Servers receive their compiled sections and protocol state only once
    /// every server has compiled; a failure leaves all of them uncompiled.
    pub fn instantiate(&mut self) -> Result<(), LifecycleError> {
        self.check_transition(LifecycleState::Instantiated)?;
        self.modules.instantiate()?;

        for (name, instance) in self.pending.iter_mut() {
            let Some(server) = self.servers.get(name) else {
                continue;
            };
            instance
                .instantiate(server.protocol.registry())
                .map_err(|source| LifecycleError::Instantiate {
                    server: name.clone(),
                    source,
                })?;
        }

        let internal = self.context.internal_dict().clone();
        let mut compiled = Vec::with_capacity(self.servers.len());
        for (name, server) in &self.servers {
            let sections = SectionCompiler {
                server: name,
                config: &server.config,
                registry: server.protocol.registry(),
                protocol_methods: server.protocol.module().methods(),
                dict: &server.dict,
                internal: &internal,
                modules: &self.modules,
                namespaces: &self.namespaces,
            }
            .compile()
            .map_err(|source| LifecycleError::Compile {
                server: name.clone(),
                source,
            })?;
            info!(server = %name, sections = sections.len(), "Compiled virtual server");
            compiled.push(sections);
        }

        let mut pending = std::mem::take(&mut self.pending);
        for (server, sections) in self.servers.values().zip(compiled) {
            server.compiled.store(Some(Arc::new(sections)));
            if let Some(instance) = pending.remove(&server.name) {
                let _ = server.instance.set(instance);
            }
        }

        self.set_state(LifecycleState::Instantiated);
        Ok(())
    }

    /// Set up module thread data on the calling thread
    ///
    /// Idempotent per thread; the first successful call moves the image to
    /// `ThreadInstantiated`.
    pub fn thread_instantiate(&self) -> Result<(), ModuleError> {
        {
            let state = self.lock_state();
            if !matches!(
                *state,
                LifecycleState::Instantiated | LifecycleState::ThreadInstantiated | LifecycleState::Open
            ) {
                return Err(ModuleError::Start {
                    module: "<image>".to_string(),
                    reason: format!("image is {:?}", *state),
                });
            }
        }
        self.modules.thread_instantiate()?;

        let mut state = self.lock_state();
        if *state == LifecycleState::Instantiated {
            *state = LifecycleState::ThreadInstantiated;
        }
        Ok(())
    }

    /// Release module thread data on the calling thread; idempotent
    pub fn thread_detach(&self) {
        self.modules.thread_detach();
    }

    /// Check if the calling thread holds module thread data for this image
    pub fn is_thread_instantiated(&self) -> bool {
        self.modules.is_thread_instantiated()
    }

    /// Bind and record every configured listener
    pub async fn open(&self) -> Result<(), LifecycleError> {
        self.check_transition(LifecycleState::Open)?;

        let mut bound = Vec::new();
        for server in self.servers.values() {
            for listen in &server.listen {
                let (listener, socket) = self.bind(server, listen).await?;
                info!(server = %server.name, listener = %listener.id, data = %listener.data, "Listening");
                bound.push((listener, Arc::new(socket)));
            }
        }

        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(bound);
        self.set_state(LifecycleState::Open);
        Ok(())
    }

    async fn bind(&self, server: &VirtualServer, listen: &ListenConfig) -> Result<(Arc<Listener>, UdpSocket), ListenError> {
        let addr = listen.socket_addr().map_err(|e| ListenError::Invalid {
            server: server.name.clone(),
            reason: e.to_string(),
        })?;
        if listen.transport != "udp" {
            return Err(ListenError::UnsupportedTransport(listen.transport.clone()));
        }

        let requested = ListenData::new(listen.transport.clone(), addr);
        if addr.port() != 0 {
            if let Some(existing) = self.listeners.listen_find_any(&requested) {
                return Err(ListenError::Duplicate {
                    data: requested,
                    server: server.name.clone(),
                    existing: existing.data.clone(),
                    owner: existing.server.clone(),
                });
            }
        }

        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ListenError::Bind { addr, source })?;
        let local = socket
            .local_addr()
            .map_err(|source| ListenError::Bind { addr, source })?;
        let listener = self.listeners.listen_record(
            &server.name,
            server.dict.name(),
            ListenData::new(listen.transport.clone(), local),
        )?;
        Ok((listener, socket))
    }

    /// Stop listener loops and release the sockets
    ///
    /// The image keeps processing requests handed to it directly.
    pub fn free_listeners(&self) {
        self.closing.send_replace(true);
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.listeners.clear();
    }

    /// Register a request about to run on this image
    ///
    /// Returns `None` once the image is freed, or about to be.
    pub fn enter(self: &Arc<Self>) -> Option<ActiveRequest> {
        let mut drain = self.lock_drain();
        if drain.closed {
            return None;
        }
        drain.active += 1;
        Some(ActiveRequest { image: self.clone() })
    }

    fn leave(&self) {
        let idle = {
            let mut drain = self.lock_drain();
            drain.active = drain.active.saturating_sub(1);
            drain.close_if_idle()
        };
        if idle {
            debug!(generation = self.generation, "Last request on retired image finished");
            self.free();
        }
    }

    /// Take the image out of service
    ///
    /// Frees it now if no request is running on it, otherwise when the last
    /// [`ActiveRequest`] drops. Until then the image stays fully usable.
    pub fn retire(&self) {
        let (idle, active) = {
            let mut drain = self.lock_drain();
            if drain.closed {
                return;
            }
            drain.retired = true;
            (drain.close_if_idle(), drain.active)
        };
        if idle {
            self.free();
        } else {
            info!(generation = self.generation, active, "Retired server image, draining");
        }
    }

    pub fn is_retired(&self) -> bool {
        self.lock_drain().retired
    }

    /// Requests registered and not yet finished
    pub fn active_requests(&self) -> usize {
        self.lock_drain().active
    }

    /// Release compiled policy, modules and listeners
    ///
    /// Compiled sections already handed out stay alive with their holders.
    pub fn free(&self) {
        self.lock_drain().closed = true;
        {
            let mut state = self.lock_state();
            if *state == LifecycleState::Freed {
                return;
            }
            *state = LifecycleState::Freed;
        }

        self.free_listeners();
        for server in self.servers.values() {
            server.free();
        }
        self.modules.detach();
        info!(generation = self.generation, "Freed server image");
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock_state()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn server(&self, name: &str) -> Option<&Arc<VirtualServer>> {
        self.servers.get(name)
    }

    /// Virtual servers, ordered by name
    pub fn servers(&self) -> impl Iterator<Item = &Arc<VirtualServer>> {
        self.servers.values()
    }

    pub fn namespaces(&self) -> &Namespaces {
        &self.namespaces
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Bound sockets with their listeners
    pub fn sockets(&self) -> Vec<(Arc<Listener>, Arc<UdpSocket>)> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Flips to `true` when the image is freed; listener loops stop on it
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(self)
    }

    /// Run a request through its virtual server's protocol
    pub async fn process(&self, request: &mut Request) -> Result<RCode, DispatchError> {
        let outcome = if self.state() == LifecycleState::Freed {
            Err(DispatchError::NotRunning)
        } else {
            self.dispatcher().process(request).await
        };
        self.stats.record_request(&outcome);
        outcome
    }

    /// Dump every server's compiled sections
    pub fn process_debug(&self) -> String {
        let mut out = String::new();
        for server in self.servers.values() {
            let _ = writeln!(out, "server {} {{", server.name);
            let _ = writeln!(out, "  namespace = {}", server.dict.name());
            let settings = server.instance().map(|instance| instance.settings()).unwrap_or_default();
            let _ = writeln!(out, "  protocol = {} {}", server.protocol.name(), settings);

            let compiled = server.compiled.load();
            let mut sections: Vec<&Arc<CompiledSection>> =
                compiled.as_ref().map(|c| c.iter().collect()).unwrap_or_default();
            sections.sort_by_key(|section| (section.id, section.name2.clone()));
            for section in sections {
                let _ = writeln!(
                    out,
                    "  {} {{ # default {}",
                    section.display_name(),
                    section.default_rcode()
                );
                for line in section.graph.outline() {
                    let _ = writeln!(out, "    {}", line);
                }
                let _ = writeln!(out, "  }}");
            }
            let _ = writeln!(out, "}}");
        }
        out
    }

    fn check_transition(&self, next: LifecycleState) -> Result<(), LifecycleError> {
        let current = self.state();
        if current.can_transition_to(next) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition { from: current, to: next })
        }
    }

    fn set_state(&self, next: LifecycleState) {
        *self.lock_state() = next;
    }

    fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_drain(&self) -> MutexGuard<'_, Drain> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for VirtualServers {
    fn drop(&mut self) {
        if self.state() != LifecycleState::Freed {
            warn!(generation = self.generation, "Server image dropped without free");
            self.free();
        }
    }
}
