//! Shared helpers for the integration tests
//!
//! `tally` is an instrumented policy module. Every instance reports to the
//! counters registered under its `tag` setting, so tests running in
//! parallel never share counters. [`Counted`] wraps a protocol and counts
//! its global setup and teardown.

#![allow(dead_code)]

use aaa_proto::{ConfigSection, DictError, Dictionary, RCode};
use aaa_server::module::ModuleCtx;
use aaa_server::{
    Config, Context, MethodCall, MethodName, ModuleConfig, ModuleError, PolicyModule,
    ProtocolError, ProtocolInstance, ProtocolModule, Request, SectionSpec, ServerConfig, IDENT_ANY,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::ThreadId;
use std::time::Duration;

static TALLY_METHODS: [MethodName; 6] = [
    MethodName::new("recv", IDENT_ANY),
    MethodName::new("send", IDENT_ANY),
    MethodName::new("authenticate", IDENT_ANY),
    MethodName::new("load", IDENT_ANY),
    MethodName::new("store", IDENT_ANY),
    MethodName::new("clear", IDENT_ANY),
];

#[derive(Debug, Default)]
pub struct TallyStats {
    /// Thread handles created and not yet released
    pub live_handles: AtomicUsize,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub detached: AtomicUsize,
    pub threads: Mutex<HashSet<ThreadId>>,
}

impl TallyStats {
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<TallyStats>>> {
    static TALLIES: OnceLock<Mutex<HashMap<String, Arc<TallyStats>>>> = OnceLock::new();
    TALLIES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Counters of every tally instance configured with `tag`
pub fn tally_stats(tag: &str) -> Arc<TallyStats> {
    registry()
        .lock()
        .unwrap()
        .entry(tag.to_string())
        .or_default()
        .clone()
}

#[derive(Debug, Deserialize)]
struct TallySettings {
    tag: String,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default = "default_result")]
    result: String,
    /// Refuse per-thread setup
    #[serde(default)]
    fail_thread: bool,
}

fn default_result() -> String {
    "ok".to_string()
}

struct TallyHandle {
    calls: usize,
}

#[derive(Default)]
pub struct Tally {
    stats: Option<Arc<TallyStats>>,
    delay: Duration,
    result: Option<RCode>,
    fail_thread: bool,
}

impl Tally {
    pub fn create() -> Box<dyn PolicyModule> {
        Box::new(Tally::default())
    }

    fn stats(&self) -> &TallyStats {
        self.stats.as_deref().expect("tally bootstrapped")
    }
}

#[async_trait]
impl PolicyModule for Tally {
    fn name(&self) -> &'static str {
        "tally"
    }

    fn methods(&self) -> &'static [MethodName] {
        &TALLY_METHODS
    }

    fn bootstrap(&mut self, settings: &serde_json::Value) -> Result<(), ModuleError> {
        let settings: TallySettings =
            serde_json::from_value(settings.clone()).map_err(|e| ModuleError::Config {
                module: "tally".to_string(),
                reason: e.to_string(),
            })?;
        self.result = Some(RCode::from_keyword(&settings.result).ok_or_else(|| ModuleError::Config {
            module: "tally".to_string(),
            reason: format!("unknown result {}", settings.result),
        })?);
        self.delay = Duration::from_millis(settings.delay_ms);
        self.fail_thread = settings.fail_thread;
        self.stats = Some(tally_stats(&settings.tag));
        Ok(())
    }

    fn thread_instantiate(&self) -> Result<Option<Box<dyn Any>>, ModuleError> {
        if self.fail_thread {
            return Err(ModuleError::Start {
                module: "tally".to_string(),
                reason: "thread setup refused".to_string(),
            });
        }
        self.stats().live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(TallyHandle { calls: 0 })))
    }

    fn thread_detach(&self, data: Box<dyn Any>) {
        assert!(data.downcast::<TallyHandle>().is_ok());
        self.stats().live_handles.fetch_sub(1, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.stats().detached.fetch_add(1, Ordering::SeqCst);
    }

    async fn call(&self, ctx: &ModuleCtx<'_>, _method: &MethodCall, request: &mut Request) -> RCode {
        let stats = self.stats();
        stats.calls.fetch_add(1, Ordering::SeqCst);
        stats.threads.lock().unwrap().insert(std::thread::current().id());
        if ctx.with_thread(|handle: &mut TallyHandle| handle.calls += 1).is_none() {
            return request.fail("tally: no thread handle");
        }

        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        request.reply.add("Reply-Message", format!("tally {}", ctx.instance_name()));
        self.result.unwrap_or(RCode::Ok)
    }
}

#[derive(Debug, Default)]
pub struct LoadCounts {
    pub onload: AtomicUsize,
    pub unload: AtomicUsize,
}

impl LoadCounts {
    pub fn onload(&self) -> usize {
        self.onload.load(Ordering::SeqCst)
    }

    pub fn unload(&self) -> usize {
        self.unload.load(Ordering::SeqCst)
    }
}

/// A protocol that counts `onload` and `unload` calls
pub struct Counted<P> {
    inner: P,
    counts: Arc<LoadCounts>,
}

impl<P: ProtocolModule> Counted<P> {
    pub fn new(inner: P, counts: Arc<LoadCounts>) -> Self {
        Counted { inner, counts }
    }
}

impl<P: ProtocolModule> ProtocolModule for Counted<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn dict(&self) -> Result<Dictionary, DictError> {
        self.inner.dict()
    }

    fn sections(&self) -> &'static [SectionSpec] {
        self.inner.sections()
    }

    fn methods(&self) -> &'static [MethodName] {
        self.inner.methods()
    }

    fn onload(&self) -> Result<(), ProtocolError> {
        self.counts.onload.fetch_add(1, Ordering::SeqCst);
        self.inner.onload()
    }

    fn unload(&self) {
        self.counts.unload.fetch_add(1, Ordering::SeqCst);
        self.inner.unload();
    }

    fn bootstrap(
        &self,
        server: &str,
        settings: &serde_json::Value,
    ) -> Result<Box<dyn ProtocolInstance>, ProtocolError> {
        self.inner.bootstrap(server, settings)
    }
}

pub fn context() -> Arc<Context> {
    Arc::new(
        Context::builder()
            .with_builtins()
            .module("tally", Tally::create)
            .build()
            .unwrap(),
    )
}

pub fn server(name: &str, namespace: &str, sections: Vec<ConfigSection>) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        namespace: namespace.to_string(),
        settings: serde_json::Value::Null,
        listen: vec![],
        sections,
    }
}

pub fn tally_module(name: &str, settings: serde_json::Value) -> ModuleConfig {
    ModuleConfig {
        name: name.to_string(),
        module: "tally".to_string(),
        settings,
    }
}

pub fn users_module() -> ModuleConfig {
    ModuleConfig {
        name: "users".to_string(),
        module: "users".to_string(),
        settings: serde_json::json!({
            "users": [
                {
                    "username": "alice",
                    "password": "wonderland",
                    "groups": ["staff"],
                    "attributes": { "Reply-Message": "Hello, alice" }
                },
                { "username": "bob", "password": "builder" }
            ]
        }),
    }
}

pub fn config(modules: Vec<ModuleConfig>, servers: Vec<ServerConfig>) -> Config {
    Config {
        workers: 2,
        request_timeout_ms: 2000,
        modules,
        servers,
        ..Config::default()
    }
}

/// Request with the given request attributes
pub fn request(server: &str, attrs: &[(&str, &str)]) -> Request {
    let mut request = Request::new(0, server);
    for (name, value) in attrs {
        request.request.add(*name, *value);
    }
    request
}

/// Poll until `check` holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
