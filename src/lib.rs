//! ORM Connection Pool Library
//!
//! This library provides pooled execution engines that let an ORM-style data-access layer
//! run statements against a relational backend (MySQL) and a key-value backend (Redis)
//! through one small contract, from async tasks and from plain synchronous code alike.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, ConnectionParams, PoolOptions};
pub use db::{Blocking, Connection, DirectSqlEngine, KvEngine, PooledSqlEngine};
pub use error::{EngineError, EngineResult};
pub use models::{Output, Params, Row};
