//! Listener registry
//!
//! Records every socket a server image binds, keyed both by identity and by
//! listener data (transport plus address). A wildcard address (`0.0.0.0`
//! or `::`) covers every address of its family on the same port, so it
//! conflicts with any specific address there and vice versa.

use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ListenError {
    #[error("Listener {data} of server {server} conflicts with listener {existing} of server {owner}")]
    Duplicate {
        data: ListenData,
        server: String,
        existing: ListenData,
        owner: String,
    },
    #[error("Invalid listener in server {server}: {reason}")]
    Invalid { server: String, reason: String },
    #[error("Transport {0} is not supported")]
    UnsupportedTransport(String),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Listener identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a listener listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenData {
    pub transport: String,
    pub addr: SocketAddr,
}

impl ListenData {
    pub fn new(transport: impl Into<String>, addr: SocketAddr) -> Self {
        ListenData {
            transport: transport.into(),
            addr,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.addr.ip().is_unspecified()
    }

    /// Check if both listeners would receive the same packets
    pub fn overlaps(&self, other: &ListenData) -> bool {
        if self.transport != other.transport || self.addr.port() != other.addr.port() {
            return false;
        }
        if self.addr.ip() == other.addr.ip() {
            return true;
        }
        (self.is_wildcard() || other.is_wildcard()) && self.addr.is_ipv4() == other.addr.is_ipv4()
    }
}

impl fmt::Display for ListenData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.transport, self.addr)
    }
}

/// A bound listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub id: ListenerId,
    /// Virtual server receiving the listener's packets
    pub server: String,
    /// Namespace of that server
    pub namespace: String,
    pub data: ListenData,
}

#[derive(Debug, Default)]
pub struct ListenerRegistry {
    by_id: DashMap<ListenerId, Arc<Listener>>,
    by_data: DashMap<ListenData, ListenerId>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bound listener
    ///
    /// Fails if an already recorded listener overlaps the new one.
    pub fn listen_record(
        &self,
        server: &str,
        namespace: &str,
        data: ListenData,
    ) -> Result<Arc<Listener>, ListenError> {
        if let Some(existing) = self.listen_find_any(&data) {
            return Err(ListenError::Duplicate {
                data,
                server: server.to_string(),
                existing: existing.data.clone(),
                owner: existing.server.clone(),
            });
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Arc::new(Listener {
            id,
            server: server.to_string(),
            namespace: namespace.to_string(),
            data: data.clone(),
        });
        self.by_data.insert(data, id);
        self.by_id.insert(id, listener.clone());
        debug!(listener = %id, server = %server, data = %listener.data, "Recorded listener");
        Ok(listener)
    }

    /// Find a recorded listener overlapping `data`
    ///
    /// Exact matches win over wildcard matches.
    pub fn listen_find_any(&self, data: &ListenData) -> Option<Arc<Listener>> {
        if let Some(exact) = self.listener_by_data(data) {
            return Some(exact);
        }
        self.by_id
            .iter()
            .find(|entry| entry.value().data.overlaps(data))
            .map(|entry| entry.value().clone())
    }

    /// Listener recorded with exactly this data
    pub fn listener_by_data(&self, data: &ListenData) -> Option<Arc<Listener>> {
        let id = *self.by_data.get(data)?;
        self.listener_by_id(id)
    }

    pub fn listener_by_id(&self, id: ListenerId) -> Option<Arc<Listener>> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    /// Every listener, ordered by identity
    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        let mut listeners: Vec<Arc<Listener>> =
            self.by_id.iter().map(|entry| entry.value().clone()).collect();
        listeners.sort_by_key(|listener| listener.id);
        listeners
    }

    /// One line per listener
    pub fn listen_debug(&self) -> String {
        self.listeners()
            .iter()
            .map(|listener| {
                format!(
                    "listen {} {{ transport = {} address = {} port = {} server = {} namespace = {} }}\n",
                    listener.id,
                    listener.data.transport,
                    listener.data.addr.ip(),
                    listener.data.addr.port(),
                    listener.server,
                    listener.namespace
                )
            })
            .collect()
    }

    pub fn clear(&self) {
        self.by_data.clear();
        self.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
