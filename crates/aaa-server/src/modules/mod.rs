//! Policy modules shipped with the server

pub mod pool;
pub mod users;

pub use pool::{HandlePool, PoolError, PooledHandle};
pub use users::{UsersModule, UsersSettings};
