//! Server error types

use crate::compile::CompileError;
use crate::config::ConfigError;
use crate::lifecycle::LifecycleState;
use crate::listen::ListenError;
use crate::module::ModuleError;
use crate::namespace::NamespaceError;
use crate::protocol::ProtocolError;
use crate::section::RegistryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid lifecycle transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("Duplicate virtual server {0}")]
    DuplicateServer(String),
    #[error("Virtual server {server} uses unknown namespace {namespace}")]
    UnknownNamespace { server: String, namespace: String },
    #[error("Failed to bootstrap virtual server {server}: {source}")]
    Bootstrap {
        server: String,
        #[source]
        source: ProtocolError,
    },
    #[error("Failed to instantiate virtual server {server}: {source}")]
    Instantiate {
        server: String,
        #[source]
        source: ProtocolError,
    },
    #[error("Failed to compile virtual server {server}: {source}")]
    Compile {
        server: String,
        #[source]
        source: CompileError,
    },
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),
    #[error("Namespace error: {0}")]
    Namespace(#[from] NamespaceError),
    #[error("Listener error: {0}")]
    Listen(#[from] ListenError),
}

/// Failures while processing one request
///
/// These never escape a request; the dispatcher turns them into `fail`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No virtual server named {0}")]
    UnknownServer(String),
    #[error("Protocol error in {server}: {reason}")]
    Protocol { server: String, reason: String },
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Server image is not running")]
    NotRunning,
}

/// A worker thread could not set up its resources
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Worker {worker} failed thread setup: {source}")]
    ThreadInstantiate {
        worker: usize,
        #[source]
        source: ModuleError,
    },
    #[error("No worker thread started")]
    NoWorkers,
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Top-level error of the server binary
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Duplicate namespace {0}")]
    DuplicateNamespace(String),
    #[error("No server image loaded")]
    NotLoaded,
}
