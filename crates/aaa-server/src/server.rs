//! Server
//!
//! Owns the current server image and the worker pool. `load` builds a new
//! image from configuration and swaps it in. The previous image is retired:
//! requests already running on it finish against the policy they started
//! with, and the last of them frees it.
//!
//! Listeners speak a JSON datagram: an object of request attributes in, an
//! object `{ "rcode": ..., "reply": { ... } }` out.

use crate::config::Config;
use crate::context::Context;
use crate::error::{DispatchError, ServerError};
use crate::lifecycle::{ActiveRequest, VirtualServers};
use crate::listen::Listener;
use crate::request::Request;
use crate::scheduler::{JobResult, Scheduler};
use aaa_proto::PairList;
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 4096;

/// Reply datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyDatagram {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcode: Option<String>,
    #[serde(default)]
    pub reply: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplyDatagram {
    fn from_result(result: &Result<JobResult, DispatchError>) -> Self {
        match result {
            Ok(JobResult {
                request,
                outcome: Ok(rcode),
            }) => ReplyDatagram {
                rcode: Some(rcode.to_string()),
                reply: request.reply.to_map(),
                error: None,
            },
            Ok(JobResult { outcome: Err(e), .. }) | Err(e) => ReplyDatagram {
                rcode: Some("fail".to_string()),
                reply: BTreeMap::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Turn a datagram into request attributes
///
/// Strings, numbers and booleans become one value each; arrays become
/// repeated attributes.
pub fn parse_datagram(data: &[u8]) -> Result<PairList, serde_json::Error> {
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(data)?;
    let mut pairs = PairList::new();
    for (name, value) in object {
        match value {
            serde_json::Value::Array(values) => {
                for value in values {
                    if let Some(text) = scalar(&value) {
                        pairs.add(name.clone(), text);
                    }
                }
            }
            other => {
                if let Some(text) = scalar(&other) {
                    pairs.add(name, text);
                }
            }
        }
    }
    Ok(pairs)
}

fn scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub struct Server {
    context: Arc<Context>,
    image: ArcSwapOption<VirtualServers>,
    scheduler: ArcSwapOption<Scheduler>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    timeout_ms: AtomicU64,
    next_request: AtomicU64,
}

impl Server {
    pub fn new(context: Arc<Context>) -> Self {
        Server {
            context,
            image: ArcSwapOption::empty(),
            scheduler: ArcSwapOption::empty(),
            listeners: Mutex::new(Vec::new()),
            timeout_ms: AtomicU64::new(0),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// The image new requests run against
    pub fn current(&self) -> Option<Arc<VirtualServers>> {
        self.image.load_full()
    }

    /// Build an image from configuration, open it and make it current
    ///
    /// The first load starts the worker pool with `config.workers` threads;
    /// later loads reuse it. A configuration that fails to build leaves the
    /// current image in place; one that fails to bind leaves no image.
    pub async fn load(&self, config: &Config) -> Result<Arc<VirtualServers>, ServerError> {
        self.context.load()?;
        let mut image = VirtualServers::bootstrap(self.context.clone(), config)?;
        if let Err(e) = image.instantiate() {
            image.free();
            return Err(e.into());
        }
        let image = Arc::new(image);

        let scheduler = match self.scheduler.load_full() {
            Some(scheduler) => {
                if let Err(e) = scheduler.attach(&image).await {
                    scheduler.retire(&image);
                    image.free();
                    return Err(e.into());
                }
                scheduler
            }
            None => {
                let scheduler = match Scheduler::start(&image, config.workers).await {
                    Ok(scheduler) => Arc::new(scheduler),
                    Err(e) => {
                        image.free();
                        return Err(e.into());
                    }
                };
                self.scheduler.store(Some(scheduler.clone()));
                scheduler
            }
        };

        // Ports move from the old image to the new one
        let previous = self.image.load_full();
        if let Some(previous) = &previous {
            self.close_listeners(previous).await;
        }
        if let Err(e) = image.open().await {
            scheduler.retire(&image);
            image.free();
            if let Some(previous) = &previous {
                self.image.store(None);
                previous.retire();
                scheduler.retire(previous);
            }
            return Err(e.into());
        }

        self.timeout_ms.store(config.request_timeout_ms, Ordering::Relaxed);
        self.spawn_listeners(&image);
        self.image.store(Some(image.clone()));
        if let Some(previous) = previous {
            previous.retire();
            scheduler.retire(&previous);
            info!(
                old = previous.generation(),
                new = image.generation(),
                "Reloaded server image"
            );
        }
        Ok(image)
    }

    /// Replace the current image
    pub async fn reload(&self, config: &Config) -> Result<Arc<VirtualServers>, ServerError> {
        if self.current().is_none() {
            return Err(ServerError::NotLoaded);
        }
        self.load(config).await
    }

    /// Run a request on the current image
    pub async fn process(&self, mut request: Request) -> Result<JobResult, DispatchError> {
        let scheduler = self.scheduler.load_full().ok_or(DispatchError::NotRunning)?;
        // A reload can free the image between loading and entering it
        let active = self
            .enter()
            .or_else(|| self.enter())
            .ok_or(DispatchError::NotRunning)?;
        if request.id == 0 {
            request.id = self.next_request.fetch_add(1, Ordering::Relaxed);
        }
        let timeout = Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed));
        scheduler.submit(active, request, timeout).await
    }

    fn enter(&self) -> Option<ActiveRequest> {
        self.current()?.enter()
    }

    /// Stop the workers, free the current image and unload the protocols
    ///
    /// Requests still running are cancelled.
    pub async fn shutdown(&self) {
        let image = self.image.swap(None);
        if let Some(image) = &image {
            self.close_listeners(image).await;
            image.retire();
        }
        if let Some(scheduler) = self.scheduler.swap(None) {
            let _ = tokio::task::spawn_blocking(move || scheduler.stop()).await;
        }
        if let Some(image) = image {
            image.free();
        }
        self.context.unload();
        info!("Server stopped");
    }

    fn spawn_listeners(&self, image: &Arc<VirtualServers>) {
        let mut handles = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for (listener, socket) in image.sockets() {
            let task = ListenerTask {
                image: image.clone(),
                scheduler: self.scheduler.load_full(),
                listener,
                socket,
                timeout: Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed)),
            };
            handles.push(tokio::spawn(task.run()));
        }
    }

    async fn close_listeners(&self, image: &Arc<VirtualServers>) {
        image.free_listeners();
        let handles: Vec<JoinHandle<()>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

struct ListenerTask {
    image: Arc<VirtualServers>,
    scheduler: Option<Arc<Scheduler>>,
    listener: Arc<Listener>,
    socket: Arc<UdpSocket>,
    timeout: Duration,
}

impl ListenerTask {
    async fn run(self) {
        let Some(scheduler) = self.scheduler.clone() else {
            return;
        };
        let mut closing = self.image.closing();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let next_id = Arc::new(AtomicU64::new(1));

        loop {
            let (len, peer) = tokio::select! {
                _ = closed(&mut closing) => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(listener = %self.listener.id, "Receive failed: {}", e);
                        continue;
                    }
                },
            };

            let pairs = match parse_datagram(&buf[..len]) {
                Ok(pairs) => pairs,
                Err(e) => {
                    debug!(listener = %self.listener.id, peer = %peer, "Dropping malformed datagram: {}", e);
                    continue;
                }
            };

            let Some(active) = self.image.enter() else {
                break;
            };
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let request = Request::new(id, self.listener.server.clone()).with_pairs(pairs);
            tokio::spawn(respond(
                scheduler.clone(),
                active,
                self.socket.clone(),
                peer,
                request,
                self.timeout,
            ));
        }
        debug!(listener = %self.listener.id, "Listener closed");
    }
}

/// Resolves once the image starts closing, or is gone
async fn closed(closing: &mut watch::Receiver<bool>) {
    loop {
        let closed = *closing.borrow_and_update();
        if closed || closing.changed().await.is_err() {
            return;
        }
    }
}

async fn respond(
    scheduler: Arc<Scheduler>,
    active: ActiveRequest,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    request: Request,
    timeout: Duration,
) {
    let id = request.id;
    let result = scheduler.submit(active, request, timeout).await;
    let reply = ReplyDatagram::from_result(&result);
    match serde_json::to_vec(&reply) {
        Ok(data) => {
            if let Err(e) = socket.send_to(&data, peer).await {
                warn!(request = id, peer = %peer, "Failed to send reply: {}", e);
            }
        }
        Err(e) => warn!(request = id, "Failed to encode reply: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aaa_proto::RCode;

    #[test]
    fn test_parse_datagram() {
        let pairs = parse_datagram(br#"{"User-Name":"bob","NAS-Port":7,"Class":["a","b"],"Skip":null}"#).unwrap();
        assert_eq!(pairs.get("User-Name"), Some("bob"));
        assert_eq!(pairs.get("NAS-Port"), Some("7"));
        assert_eq!(pairs.get_all("Class").count(), 2);
        assert!(!pairs.contains("Skip"));

        assert!(parse_datagram(b"[1,2]").is_err());
        assert!(parse_datagram(b"not json").is_err());
    }

    #[test]
    fn test_reply_datagram() {
        let mut request = Request::new(1, "default");
        request.reply.add("Reply-Message", "hi");
        let ok = Ok(JobResult {
            request,
            outcome: Ok(RCode::Ok),
        });
        let reply = ReplyDatagram::from_result(&ok);
        assert_eq!(reply.rcode.as_deref(), Some("ok"));
        assert_eq!(reply.reply.get("Reply-Message").map(String::as_str), Some("hi"));

        let failed = Err(DispatchError::NotRunning);
        let reply = ReplyDatagram::from_result(&failed);
        assert_eq!(reply.rcode.as_deref(), Some("fail"));
        assert!(reply.error.is_some());
    }
}
