//! AAA Virtual Server Engine
//!
//! This crate hosts virtual servers: named pieces of configuration, each
//! bound to a protocol state machine and holding the policy sections that
//! state machine runs at every step of a request.
//!
//! # Features
//!
//! - Per-protocol section registries with wildcard matching
//! - Policy compilation with per-section default actions
//! - Dispatch of compiled sections, including `call` across servers
//! - Policy modules with per-thread data
//! - Image reload without disturbing requests in flight
//! - A worker pool of single-threaded runtimes
//! - JSON configuration and JSON datagram listeners
//!
//! # Example
//!
//! ```rust,no_run
//! use aaa_server::{Config, Context, Request, Server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = Arc::new(Context::builder().with_builtins().build()?);
//!     let server = Server::new(context);
//!     server.load(&Config::from_file("config.json")?).await?;
//!
//!     let mut request = Request::new(0, "default");
//!     request.request.add("User-Name", "alice");
//!     let result = server.process(request).await?;
//!     println!("{:?}", result.outcome);
//!
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod compile;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod listen;
pub mod module;
pub mod modules;
pub mod namespace;
pub mod policy;
pub mod process;
pub mod protocol;
pub mod request;
pub mod scheduler;
pub mod section;
pub mod server;
pub mod stats;

pub use compile::{CompileError, CompiledSection, CompiledSections, SectionCompiler};
pub use config::{Config, ConfigError, ListenConfig, ModuleConfig, ServerConfig};
pub use context::{Context, ContextBuilder, ProtocolEntry};
pub use dispatch::{Dispatcher, PushResult};
pub use error::{DispatchError, LifecycleError, ResourceError, ServerError};
pub use lifecycle::{ActiveRequest, LifecycleState, VirtualServer, VirtualServers};
pub use listen::{ListenData, ListenError, Listener, ListenerId, ListenerRegistry};
pub use module::{MethodCall, ModuleCtx, ModuleError, ModuleInstance, ModuleTable, PolicyModule};
pub use namespace::{NamespaceError, Namespaces};
pub use policy::{PolicyError, PolicyGraph};
pub use protocol::{ProtocolError, ProtocolInstance, ProtocolModule};
pub use request::{Request, MAX_REQUEST_DEPTH};
pub use scheduler::{JobResult, Scheduler};
pub use section::{MethodName, RegistryError, SectionId, SectionRef, SectionRegistry, SectionSpec, IDENT_ANY};
pub use server::{ReplyDatagram, Server};
pub use stats::{DispatchStats, StatsSnapshot};
