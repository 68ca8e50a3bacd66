//! Execution layer.
//!
//! This module provides the pooled execution engines:
//! - Backend handle factories (MySQL, Redis)
//! - The bounded connection pool
//! - The scheduling-context adapter for synchronous callers
//! - Relational and key-value engines behind the shared `Connection` contract
//! - Named parameter binding and row decoding

pub mod connection;
pub mod context;
pub mod factory;
pub mod kv;
pub mod params;
pub mod pool;
pub mod relational;
pub mod types;

pub use connection::Connection;
pub use context::{Blocking, SchedulingContext};
pub use factory::{HandleFactory, MySqlFactory, RedisFactory, RedisOptions};
pub use kv::{KvEngine, KvHandle, KvRequest, RedisHandle};
pub use params::{BoundStatement, NamedStatement};
pub use pool::{Pool, PoolStatus, Pooled};
pub use relational::{DirectSqlEngine, PooledSqlEngine, SqlHandle};
