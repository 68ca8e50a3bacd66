//! Key-value execution engine.
//!
//! The key-value backend has no SQL surface. Instructions are one of the verbs `get`, `set`,
//! `del` and `keys`; the request is validated before any handle is borrowed and then
//! dispatched to backend primitives. Values are stored JSON-encoded.
//!
//! `set` over several keys is a best-effort bulk write: every key is attempted, failures are
//! reported together, and keys written before a failure stay written.

use crate::config::PoolOptions;
use crate::db::connection::Connection;
use crate::db::factory::HandleFactory;
use crate::db::pool::{Pool, Pooled};
use crate::error::{EngineError, EngineResult};
use crate::models::{KvVerb, Output, Params};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cluster_async::ClusterConnection;
use redis::FromRedisValue;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Key-value primitives the engine needs from a backend handle.
#[async_trait]
pub trait KvHandle: Send {
    async fn get(&mut self, key: &str) -> EngineResult<Option<String>>;

    /// Values for `keys`, in the same order.
    async fn mget(&mut self, keys: &[String]) -> EngineResult<Vec<Option<String>>>;

    async fn set(&mut self, key: &str, value: &str) -> EngineResult<()>;

    /// Number of keys removed (0 when the key did not exist).
    async fn del(&mut self, key: &str) -> EngineResult<u64>;

    /// Key names matching a glob pattern.
    async fn keys(&mut self, pattern: &str) -> EngineResult<Vec<String>>;
}

enum RedisConnection {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

/// A Redis client, single node or cluster, with an optional key prefix.
pub struct RedisHandle {
    conn: RedisConnection,
    prefix: Option<Arc<str>>,
}

impl RedisHandle {
    pub fn single(conn: MultiplexedConnection, prefix: Option<String>) -> Self {
        Self {
            conn: RedisConnection::Single(conn),
            prefix: prefix.map(Arc::from),
        }
    }

    pub fn cluster(conn: ClusterConnection, prefix: Option<String>) -> Self {
        Self {
            conn: RedisConnection::Cluster(conn),
            prefix: prefix.map(Arc::from),
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.conn, RedisConnection::Cluster(_))
    }

    fn key(&self, key: &str) -> String {
        prefixed(self.prefix.as_deref(), key)
    }

    async fn query<T: FromRedisValue>(&mut self, cmd: &redis::Cmd) -> EngineResult<T> {
        let value = match &mut self.conn {
            RedisConnection::Single(conn) => cmd.query_async(conn).await?,
            RedisConnection::Cluster(conn) => cmd.query_async(conn).await?,
        };
        Ok(value)
    }
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle")
            .field("cluster", &self.is_cluster())
            .field("prefix", &self.prefix)
            .finish()
    }
}

fn prefixed(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}{key}"),
        None => key.to_string(),
    }
}

#[async_trait]
impl KvHandle for RedisHandle {
    async fn get(&mut self, key: &str) -> EngineResult<Option<String>> {
        let cmd = redis::cmd("GET").arg(self.key(key)).clone();
        self.query(&cmd).await
    }

    async fn mget(&mut self, keys: &[String]) -> EngineResult<Vec<Option<String>>> {
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(self.key(key));
        }
        self.query(&cmd).await
    }

    async fn set(&mut self, key: &str, value: &str) -> EngineResult<()> {
        let cmd = redis::cmd("SET").arg(self.key(key)).arg(value).clone();
        self.query(&cmd).await
    }

    async fn del(&mut self, key: &str) -> EngineResult<u64> {
        let cmd = redis::cmd("DEL").arg(self.key(key)).clone();
        self.query(&cmd).await
    }

    async fn keys(&mut self, pattern: &str) -> EngineResult<Vec<String>> {
        let cmd = redis::cmd("KEYS").arg(self.key(pattern)).clone();
        let names: Vec<String> = self.query(&cmd).await?;
        // Report names the way callers address them
        Ok(match self.prefix.as_deref() {
            Some(prefix) => names
                .into_iter()
                .map(|name| match name.strip_prefix(prefix) {
                    Some(stripped) => stripped.to_string(),
                    None => name,
                })
                .collect(),
            None => names,
        })
    }
}

/// A validated key-value request.
#[derive(Debug, Clone, PartialEq)]
pub enum KvRequest {
    Get(Vec<String>),
    /// Keys with their JSON-encoded values
    Set(Vec<(String, String)>),
    Del(Vec<String>),
    Keys(Vec<String>),
}

impl KvRequest {
    /// Validate `params` for `verb`. Runs before any handle is borrowed.
    pub fn parse(verb: KvVerb, params: &Params) -> EngineResult<Self> {
        let key = params.get("key");
        if verb.requires_key() && key.is_none() {
            return Err(EngineError::precondition(format!(
                "{verb} requires a 'key' parameter"
            )));
        }

        match verb {
            KvVerb::Get => {
                let keys = key_list(key, "key")?;
                if keys.is_empty() {
                    return Err(EngineError::precondition("get with empty key bag"));
                }
                Ok(Self::Get(keys))
            }
            KvVerb::Set => Ok(Self::Set(set_pairs(key, params.get("value"))?)),
            KvVerb::Del => Ok(Self::Del(key_list(key, "key")?)),
            KvVerb::Keys => {
                let patterns = match (key, params.get("pattern")) {
                    (Some(key), _) => key_list(Some(key), "key")?,
                    (None, Some(pattern)) => key_list(Some(pattern), "pattern")?,
                    (None, None) => Vec::new(),
                };
                if patterns.is_empty() {
                    Ok(Self::Keys(vec!["*".to_string()]))
                } else {
                    Ok(Self::Keys(patterns))
                }
            }
        }
    }

    pub fn verb(&self) -> KvVerb {
        match self {
            Self::Get(_) => KvVerb::Get,
            Self::Set(_) => KvVerb::Set,
            Self::Del(_) => KvVerb::Del,
            Self::Keys(_) => KvVerb::Keys,
        }
    }

    /// Run the request on `handle`.
    pub async fn run<H: KvHandle + ?Sized>(&self, handle: &mut H) -> EngineResult<Output> {
        match self {
            Self::Get(keys) => {
                let raw = match keys.as_slice() {
                    [key] => vec![handle.get(key).await?],
                    _ => handle.mget(keys).await?,
                };
                Ok(Output::List(
                    keys.iter()
                        .zip(raw)
                        .map(|(key, value)| decode_value(key, value))
                        .collect(),
                ))
            }
            Self::Set(pairs) => {
                let mut failed = Vec::new();
                let mut transient = false;
                for (key, value) in pairs {
                    if let Err(e) = handle.set(key, value).await {
                        warn!(key = %key, error = %e, "Key-value write failed");
                        transient |= e.is_transient();
                        failed.push(format!("{key}: {e}"));
                    }
                }
                if failed.is_empty() {
                    Ok(Output::Empty)
                } else {
                    Err(EngineError::Connection {
                        message: format!("set failed ({})", failed.join("; ")),
                        sql_state: None,
                        code: None,
                        transient,
                    })
                }
            }
            Self::Del(keys) => {
                for key in keys {
                    handle.del(key).await?;
                }
                Ok(Output::Empty)
            }
            Self::Keys(patterns) => {
                let mut names = Vec::new();
                for pattern in patterns {
                    names.extend(handle.keys(pattern).await?.into_iter().map(JsonValue::String));
                }
                Ok(Output::List(names))
            }
        }
    }
}

/// A key parameter: one string or an array of strings.
fn key_list(value: Option<&JsonValue>, name: &str) -> EngineResult<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(JsonValue::String(key)) => Ok(vec![key.clone()]),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| match item {
                JsonValue::String(key) => Ok(key.clone()),
                other => Err(EngineError::precondition(format!(
                    "'{name}' entries must be strings, got {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(EngineError::precondition(format!(
            "'{name}' must be a string or an array of strings, got {other}"
        ))),
    }
}

fn set_pairs(key: Option<&JsonValue>, value: Option<&JsonValue>) -> EngineResult<Vec<(String, String)>> {
    let value = value.ok_or_else(|| EngineError::precondition("set requires a 'value' parameter"))?;

    let values: Vec<&JsonValue> = match key {
        // A single key stores the value whole, arrays included
        Some(JsonValue::String(_)) => vec![value],
        _ => match value {
            JsonValue::Array(items) => items.iter().collect(),
            _ => {
                return Err(EngineError::precondition(
                    "set with several keys requires 'value' to be an array",
                ));
            }
        },
    };
    let keys = key_list(key, "key")?;

    if keys.len() != values.len() {
        return Err(EngineError::precondition(format!(
            "set got {} keys but {} values",
            keys.len(),
            values.len()
        )));
    }

    keys.into_iter()
        .zip(values)
        .map(|(key, value)| {
            let encoded = serde_json::to_string(value)
                .map_err(|e| EngineError::internal(format!("Failed to encode value: {e}")))?;
            Ok((key, encoded))
        })
        .collect()
}

/// Decode a stored value; missing keys and non-JSON payloads become `null`.
fn decode_value(key: &str, value: Option<String>) -> JsonValue {
    let Some(raw) = value else {
        return JsonValue::Null;
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(key = %key, error = %e, "Stored value is not valid JSON");
        JsonValue::Null
    })
}

/// Pooled engine for the key-value backend.
pub struct KvEngine<F: HandleFactory> {
    factory: Arc<F>,
    options: PoolOptions,
    pool: OnceCell<Pool<F>>,
}

impl<F> KvEngine<F>
where
    F: HandleFactory,
    F::Handle: KvHandle,
{
    pub fn new(factory: F, options: PoolOptions) -> Self {
        Self {
            factory: Arc::new(factory),
            options,
            pool: OnceCell::new(),
        }
    }

    /// The engine's pool, created on first use.
    pub async fn pool(&self) -> EngineResult<&Pool<F>> {
        self.pool
            .get_or_try_init(|| async {
                Pool::with_options(Arc::clone(&self.factory), &self.options)
            })
            .await
    }

    /// Borrow a handle to pass back to [`Connection::execute`] across several calls.
    pub async fn handle(&self) -> EngineResult<Pooled<F>> {
        self.pool().await?.acquire().await
    }

    fn unsupported(&self, operation: &str) -> EngineError {
        EngineError::unsupported(operation, self.factory.backend())
    }
}

#[async_trait]
impl<F> Connection for KvEngine<F>
where
    F: HandleFactory,
    F::Handle: KvHandle,
{
    type Handle = Pooled<F>;
    type Provider = Pool<F>;

    async fn connect(&self, force_reconnect: bool) -> EngineResult<Pool<F>> {
        let pool = self.pool().await?;
        if force_reconnect {
            pool.clear_idle();
        }
        Ok(pool.clone())
    }

    async fn execute(
        &self,
        instruction: &str,
        params: &Params,
        handle: Option<&mut Pooled<F>>,
    ) -> EngineResult<Output> {
        let verb: KvVerb = instruction.parse()?;
        let request = KvRequest::parse(verb, params)?;
        debug!(backend = self.factory.backend(), verb = %verb, "Executing key-value instruction");

        if let Some(handle) = handle {
            return request.run(&mut **handle).await;
        }

        let mut handle = self.pool().await?.acquire().await?;
        let result = request.run(&mut *handle).await;
        match &result {
            Err(e) if e.is_transient() => handle.discard(),
            _ => handle.release(),
        }
        result
    }

    async fn start_transaction(&self) -> EngineResult<&Self> {
        Err(self.unsupported("transactions"))
    }

    async fn commit(&self) -> EngineResult<&Self> {
        Err(self.unsupported("transactions"))
    }

    async fn rollback(&self) -> EngineResult<&Self> {
        Err(self.unsupported("transactions"))
    }

    async fn last_insert_id(&self) -> EngineResult<u64> {
        Err(self.unsupported("last insert id"))
    }
}
