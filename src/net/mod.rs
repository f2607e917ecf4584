//! TCP connection handling.

pub mod pool;

pub use pool::{Connection, ConnectionPool, PoolListener};
