use aaa_proto::{AssignOp, ConfigSection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Transport name, e.g. "udp"
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Address to bind; 0.0.0.0 or :: binds every interface
    #[serde(default = "default_listen_address")]
    pub address: String,
    pub port: u16,
}

fn default_transport() -> String {
    "udp".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

impl ListenConfig {
    /// Get socket address for binding
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr: IpAddr = self
            .address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("Invalid listen address: {}", self.address)))?;
        Ok(SocketAddr::new(addr, self.port))
    }
}

/// A policy module instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Instance name used in policy
    pub name: String,
    /// Module type, e.g. "users"
    pub module: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// A virtual server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    /// Protocol dictionary the server's policy resolves against
    pub namespace: String,
    /// Protocol specific settings
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub listen: Vec<ListenConfig>,
    /// Processing sections, as `name1 name2 { ... }` trees
    #[serde(default)]
    pub sections: Vec<ConfigSection>,
}

impl ServerConfig {
    /// The `server <name> { ... }` section holding this server's policy
    ///
    /// Every item is stamped with a location under `origin`.
    pub fn to_section(&self, origin: &str) -> ConfigSection {
        let mut cs = ConfigSection::new("server", Some(&self.name)).with_pair(
            "namespace",
            AssignOp::Set,
            self.namespace.clone(),
        );
        for section in &self.sections {
            cs = cs.with_section(section.clone());
        }
        cs.assign_locations(origin, Some(&self.name));
        cs
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Worker threads processing requests
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Enable verbose logging (deprecated: use log_level instead)
    #[serde(default)]
    pub verbose: bool,

    /// Log level: "trace", "debug", "info", "warn", "error" (default: "info")
    #[serde(default)]
    pub log_level: Option<String>,

    /// Policy module instances, bootstrapped in order
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,

    /// Virtual servers
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

fn default_workers() -> usize {
    4
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: default_workers(),
            request_timeout_ms: default_request_timeout_ms(),
            verbose: false,
            log_level: None,
            modules: vec![],
            servers: vec![],
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Virtual server by name
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.name == name)
    }

    /// Validate configuration
    ///
    /// Only checks what can be checked without the protocol modules;
    /// namespaces and policy are checked when the servers are built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms cannot be 0".to_string()));
        }

        let mut modules = HashSet::new();
        for module in &self.modules {
            if module.name.is_empty() || module.module.is_empty() {
                return Err(ConfigError::Invalid("Module has empty name or type".to_string()));
            }
            if !modules.insert(module.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate module instance {}",
                    module.name
                )));
            }
        }

        let mut servers = HashSet::new();
        let mut sockets = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(ConfigError::Invalid("Virtual server has empty name".to_string()));
            }
            if server.namespace.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Virtual server {} has no namespace",
                    server.name
                )));
            }
            if !servers.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate virtual server {}",
                    server.name
                )));
            }
            for listen in &server.listen {
                let addr = listen.socket_addr()?;
                if !sockets.insert((listen.transport.as_str(), addr)) {
                    return Err(ConfigError::Invalid(format!(
                        "Duplicate listener {} {} in server {}",
                        listen.transport, addr, server.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Create an example configuration file
    pub fn example() -> Self {
        let users = serde_json::json!({
            "users": [
                {
                    "username": "admin",
                    "password": "admin123",
                    "groups": ["staff"],
                    "attributes": { "Reply-Message": "Welcome, admin" }
                },
                { "username": "user1", "password": "password1" }
            ],
            "max_handles": 32
        });

        let radius = ServerConfig {
            name: "default".to_string(),
            namespace: "radius".to_string(),
            settings: serde_json::Value::Null,
            listen: vec![ListenConfig {
                transport: "udp".to_string(),
                address: "0.0.0.0".to_string(),
                port: 1812,
            }],
            sections: vec![
                ConfigSection::new("recv", Some("Access-Request")).with_word("users"),
                ConfigSection::new("authenticate", Some("users")).with_word("users"),
                ConfigSection::new("send", Some("Access-Reject")).with_pair(
                    "&reply.Reply-Message",
                    AssignOp::Default,
                    "Access denied",
                ),
            ],
        };

        let aka = ServerConfig {
            name: "aka".to_string(),
            namespace: "eap-aka".to_string(),
            settings: serde_json::json!({ "request_identity": "permanent" }),
            listen: vec![ListenConfig {
                transport: "udp".to_string(),
                address: "0.0.0.0".to_string(),
                port: 1815,
            }],
            sections: vec![ConfigSection::new("recv", Some("Identity-Response")).with_section(
                ConfigSection::new("if", Some("&Identity !~ /^[024]/")).with_word("reject"),
            )],
        };

        Config {
            workers: default_workers(),
            request_timeout_ms: default_request_timeout_ms(),
            verbose: false,
            log_level: Some("info".to_string()),
            modules: vec![ModuleConfig {
                name: "users".to_string(),
                module: "users".to_string(),
                settings: users,
            }],
            servers: vec![radius, aka],
        }
    }
}
