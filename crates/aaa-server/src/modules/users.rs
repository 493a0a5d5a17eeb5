//! `users` policy module
//!
//! Authenticates against an in-memory user directory. Each worker thread
//! borrows one directory handle from a shared pool.
//!
//! Methods:
//! - `recv *`: claims the request by setting `&control.Auth-Type` when a
//!   password is present, `noop` otherwise
//! - `authenticate *`: `invalid` for a missing or empty name or password,
//!   then `ok` or `reject`
//! - `group *`: `ok` if the user is in the named group (or any of the
//!   `&control.Group-Name` values), `notfound` otherwise

use crate::module::{MethodCall, ModuleCtx, ModuleError, PolicyModule};
use crate::modules::pool::{DirectoryEntry, HandlePool, PooledHandle, Verdict};
use crate::request::Request;
use crate::section::{MethodName, IDENT_ANY};
use aaa_proto::RCode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

static METHODS: [MethodName; 3] = [
    MethodName::new("recv", IDENT_ANY),
    MethodName::new("authenticate", IDENT_ANY),
    MethodName::new("group", IDENT_ANY),
];

const USER_NAME: &str = "User-Name";
const USER_PASSWORD: &str = "User-Password";

/// User configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Reply attributes added on successful authentication
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersSettings {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default = "default_max_handles")]
    pub max_handles: usize,
}

fn default_max_handles() -> usize {
    32
}

impl Default for UsersSettings {
    fn default() -> Self {
        UsersSettings {
            users: Vec::new(),
            max_handles: default_max_handles(),
        }
    }
}

#[derive(Default)]
pub struct UsersModule {
    settings: UsersSettings,
    pool: Option<Arc<HandlePool>>,
}

impl UsersModule {
    /// Constructor registered with the server context
    pub fn create() -> Box<dyn PolicyModule> {
        Box::new(UsersModule::default())
    }

    /// The handle pool, once instantiated
    pub fn pool(&self) -> Option<&Arc<HandlePool>> {
        self.pool.as_ref()
    }

    fn recv(&self, ctx: &ModuleCtx<'_>, request: &mut Request) -> RCode {
        if !request.request.contains(USER_PASSWORD) {
            debug!(request = request.id, "No User-Password, not setting Auth-Type");
            return RCode::Noop;
        }
        if request.control.contains("Auth-Type") {
            return RCode::Noop;
        }
        request.control.add("Auth-Type", ctx.instance_name());
        RCode::Ok
    }

    fn authenticate(&self, ctx: &ModuleCtx<'_>, request: &mut Request) -> RCode {
        let username = match request.request.get(USER_NAME) {
            Some(name) if !name.is_empty() => name.to_string(),
            Some(_) => return invalid(request, "User-Name must not be empty"),
            None => return invalid(request, "Attribute \"User-Name\" is required for authentication"),
        };
        let password = match request.request.get(USER_PASSWORD) {
            Some(password) if !password.is_empty() => password.to_string(),
            Some(_) => return invalid(request, "User-Password must not be empty"),
            None => {
                return invalid(request, "Attribute \"User-Password\" is required for authentication")
            }
        };

        let checked = ctx.with_thread(|handle: &mut PooledHandle| {
            let verdict = handle.check_password(&username, &password);
            (verdict, handle.attributes(&username))
        });

        match checked {
            Some((Verdict::Accept, attributes)) => {
                for (name, value) in attributes {
                    request.reply.add(name, value);
                }
                RCode::Ok
            }
            Some((verdict, _)) => {
                debug!(request = request.id, user = %username, ?verdict, "Authentication rejected");
                RCode::Reject
            }
            None => request.fail("users: no directory handle on this thread"),
        }
    }

    fn group(&self, ctx: &ModuleCtx<'_>, method: &MethodCall, request: &mut Request) -> RCode {
        let Some(username) = request.request.get(USER_NAME).map(str::to_string) else {
            return RCode::NotFound;
        };
        let wanted: Vec<String> = match &method.name2 {
            Some(group) => vec![group.clone()],
            None => request.control.get_all("Group-Name").map(str::to_string).collect(),
        };
        if wanted.is_empty() {
            return RCode::Noop;
        }

        match ctx.with_thread(|handle: &mut PooledHandle| handle.groups(&username)) {
            Some(groups) if groups.iter().any(|g| wanted.contains(g)) => RCode::Ok,
            Some(_) => RCode::NotFound,
            None => request.fail("users: no directory handle on this thread"),
        }
    }
}

fn invalid(request: &mut Request, message: &str) -> RCode {
    request.control.add("Module-Failure-Message", message);
    RCode::Invalid
}

#[async_trait]
impl PolicyModule for UsersModule {
    fn name(&self) -> &'static str {
        "users"
    }

    fn methods(&self) -> &'static [MethodName] {
        &METHODS
    }

    fn bootstrap(&mut self, settings: &serde_json::Value) -> Result<(), ModuleError> {
        if settings.is_null() {
            return Ok(());
        }
        self.settings = serde_json::from_value(settings.clone()).map_err(|e| ModuleError::Config {
            module: "users".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn instantiate(&mut self) -> Result<(), ModuleError> {
        if self.settings.max_handles == 0 {
            return Err(ModuleError::Config {
                module: "users".to_string(),
                reason: "max_handles must be at least 1".to_string(),
            });
        }

        let mut directory = HashMap::new();
        for user in &self.settings.users {
            let entry = DirectoryEntry {
                password: user.password.clone(),
                groups: user.groups.clone(),
                attributes: user
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            };
            if directory.insert(user.username.clone(), entry).is_some() {
                warn!(user = %user.username, "Duplicate user entry, keeping the last one");
            }
        }
        self.pool = Some(HandlePool::new(directory, self.settings.max_handles));
        Ok(())
    }

    fn thread_instantiate(&self) -> Result<Option<Box<dyn Any>>, ModuleError> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };
        let handle = pool.acquire().map_err(|e| ModuleError::Start {
            module: "users".to_string(),
            reason: e.to_string(),
        })?;
        debug!(handle = handle.id(), "Acquired directory handle");
        Ok(Some(Box::new(handle)))
    }

    fn thread_detach(&self, data: Box<dyn Any>) {
        if let Ok(handle) = data.downcast::<PooledHandle>() {
            debug!(handle = handle.id(), lookups = handle.lookups(), "Released directory handle");
        }
    }

    fn detach(&self) {
        if let Some(pool) = &self.pool {
            if pool.outstanding() > 0 {
                warn!(outstanding = pool.outstanding(), "Detaching with handles still on loan");
            }
            pool.clear();
        }
    }

    async fn call(&self, ctx: &ModuleCtx<'_>, method: &MethodCall, request: &mut Request) -> RCode {
        match method.name1.as_str() {
            "recv" => self.recv(ctx, request),
            "authenticate" => self.authenticate(ctx, request),
            "group" => self.group(ctx, method, request),
            other => request.fail(format!("users: unsupported method {}", other)),
        }
    }
}
