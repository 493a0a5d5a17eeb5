//! Backend handle pool
//!
//! Worker threads each hold one backend handle for the lifetime of their
//! thread data. Handles go back to the pool when dropped, so detaching a
//! thread always leaves the outstanding count where it started.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Handle pool exhausted ({0} handles in use)")]
    Exhausted(usize),
}

/// A directory entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub password: String,
    pub groups: Vec<String>,
    pub attributes: Vec<(String, String)>,
}

/// Result of checking a password
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    WrongPassword,
    NoSuchUser,
}

/// Connection to the user directory
#[derive(Debug, Default)]
pub struct Handle {
    id: usize,
    directory: Arc<HashMap<String, DirectoryEntry>>,
    lookups: u64,
}

impl Handle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Lookups made through this handle since it was created
    pub fn lookups(&self) -> u64 {
        self.lookups
    }

    pub fn check_password(&mut self, username: &str, password: &str) -> Verdict {
        self.lookups += 1;
        match self.directory.get(username) {
            Some(entry) if entry.password == password => Verdict::Accept,
            Some(_) => Verdict::WrongPassword,
            None => Verdict::NoSuchUser,
        }
    }

    /// Groups of a user; empty for unknown users
    pub fn groups(&mut self, username: &str) -> Vec<String> {
        self.lookups += 1;
        self.directory
            .get(username)
            .map(|entry| entry.groups.clone())
            .unwrap_or_default()
    }

    /// Reply attributes configured for a user
    pub fn attributes(&self, username: &str) -> Vec<(String, String)> {
        self.directory
            .get(username)
            .map(|entry| entry.attributes.clone())
            .unwrap_or_default()
    }
}

/// A handle on loan from the pool
pub struct PooledHandle {
    handle: Handle,
    pool: Arc<HandlePool>,
}

impl Deref for PooledHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut Handle {
        &mut self.handle
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        // Return handle to pool when dropped
        let handle = std::mem::take(&mut self.handle);
        self.pool.release(handle);
    }
}

/// Pool of directory handles
pub struct HandlePool {
    idle: Mutex<Vec<Handle>>,
    directory: Arc<HashMap<String, DirectoryEntry>>,
    max_handles: usize,
    outstanding: AtomicUsize,
    created: AtomicUsize,
}

impl HandlePool {
    /// Create a pool over a directory
    ///
    /// # Arguments
    /// * `directory` - User entries keyed by user name
    /// * `max_handles` - Maximum number of handles on loan at once
    pub fn new(directory: HashMap<String, DirectoryEntry>, max_handles: usize) -> Arc<Self> {
        Arc::new(HandlePool {
            idle: Mutex::new(Vec::new()),
            directory: Arc::new(directory),
            max_handles,
            outstanding: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        })
    }

    /// Take a handle, reusing an idle one if possible
    pub fn acquire(self: &Arc<Self>) -> Result<PooledHandle, PoolError> {
        let in_use = self.outstanding.fetch_add(1, Ordering::AcqRel);
        if in_use >= self.max_handles {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::Exhausted(in_use));
        }

        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let handle = reused.unwrap_or_else(|| Handle {
            id: self.created.fetch_add(1, Ordering::AcqRel),
            directory: Arc::clone(&self.directory),
            lookups: 0,
        });

        Ok(PooledHandle {
            handle,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, handle: Handle) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(handle);
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Handles currently on loan
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Handles waiting for reuse
    pub fn idle(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Handles ever created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Close idle handles
    pub fn clear(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }
}
