//! Backend client factories.
//!
//! A factory builds one raw backend handle from connection parameters. It does not
//! pool and does not retry; the pool calls it whenever it needs a new handle.

use crate::config::{Backend, ConnectionParams};
use crate::db::kv::RedisHandle;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::ConnectOptions;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

/// Prepared statements cached per relational handle.
const STATEMENT_CACHE_CAPACITY: usize = 100;

/// Builds live backend handles.
#[async_trait]
pub trait HandleFactory: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Open one new handle.
    async fn create(&self) -> EngineResult<Self::Handle>;

    /// Backend name used in logs and errors.
    fn backend(&self) -> &'static str;
}

fn expect_backend(params: &ConnectionParams, expected: Backend) -> EngineResult<()> {
    if params.backend != expected {
        return Err(EngineError::precondition(format!(
            "{} parameters cannot build a {} handle",
            params.backend, expected
        )));
    }
    Ok(())
}

/// Factory for MySQL driver handles.
#[derive(Debug, Clone)]
pub struct MySqlFactory {
    params: ConnectionParams,
}

impl MySqlFactory {
    pub fn new(params: ConnectionParams) -> EngineResult<Self> {
        expect_backend(&params, Backend::MySql)?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Driver options: character set, database, statement cache; statement logging is left
    /// to the engines.
    fn connect_options(&self) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&self.params.host)
            .port(self.params.port)
            .charset(&self.params.encoding)
            .statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        if let Some(user) = &self.params.username {
            options = options.username(user);
        }
        if let Some(password) = &self.params.password {
            options = options.password(password);
        }
        if let Some(database) = &self.params.database {
            options = options.database(database);
        }

        options.disable_statement_logging()
    }
}

#[async_trait]
impl HandleFactory for MySqlFactory {
    type Handle = MySqlConnection;

    async fn create(&self) -> EngineResult<MySqlConnection> {
        let connect_timeout = self.params.connect_timeout();
        debug!(target_db = %self.params.masked(), "Opening MySQL handle");

        match timeout(connect_timeout, self.connect_options().connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(connect_error(&self.params, e.into())),
            Err(_) => Err(timed_out(&self.params, connect_timeout)),
        }
    }

    fn backend(&self) -> &'static str {
        "mysql"
    }
}

/// Caller-supplied options merged into every Redis handle.
#[derive(Debug, Clone, Default)]
pub struct RedisOptions {
    /// Prepended to every key and key pattern
    pub prefix: Option<String>,
}

/// Factory for Redis clients; cluster mode when more than one host is configured.
#[derive(Debug, Clone)]
pub struct RedisFactory {
    params: ConnectionParams,
    options: RedisOptions,
}

impl RedisFactory {
    pub fn new(params: ConnectionParams, options: RedisOptions) -> EngineResult<Self> {
        expect_backend(&params, Backend::Redis)?;
        Ok(Self { params, options })
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// One `redis://` (or `rediss://`) URL per configured host, carrying credentials and database.
    pub fn node_urls(&self) -> EngineResult<Vec<String>> {
        let scheme = self.params.scheme();
        self.params
            .hosts()
            .into_iter()
            .map(|(host, port)| {
                let mut url = Url::parse(&format!("{scheme}://{host}:{port}"))
                    .map_err(|e| EngineError::precondition(format!("Invalid Redis host {host}: {e}")))?;
                if let Some(user) = &self.params.username {
                    url.set_username(user)
                        .map_err(|()| EngineError::precondition("Invalid Redis credentials"))?;
                }
                if let Some(password) = &self.params.password {
                    url.set_password(Some(password))
                        .map_err(|()| EngineError::precondition("Invalid Redis credentials"))?;
                }
                // Cluster nodes only serve database 0
                if !self.params.is_cluster() {
                    if let Some(db) = &self.params.database {
                        url.set_path(db);
                    }
                }
                Ok(url.to_string())
            })
            .collect()
    }

    async fn open(&self) -> EngineResult<RedisHandle> {
        let nodes = self.node_urls()?;
        let prefix = self.options.prefix.clone();

        if nodes.len() > 1 {
            let client = redis::cluster::ClusterClient::new(nodes)?;
            let conn = client.get_async_connection().await?;
            Ok(RedisHandle::cluster(conn, prefix))
        } else {
            let node = nodes
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::precondition("No Redis host configured"))?;
            let client = redis::Client::open(node)?;
            let conn = client.get_multiplexed_async_connection().await?;
            Ok(RedisHandle::single(conn, prefix))
        }
    }
}

#[async_trait]
impl HandleFactory for RedisFactory {
    type Handle = RedisHandle;

    async fn create(&self) -> EngineResult<RedisHandle> {
        let connect_timeout = self.params.connect_timeout();
        debug!(
            target_db = %self.params.masked(),
            cluster = self.params.is_cluster(),
            "Opening Redis handle"
        );

        match timeout(connect_timeout, self.open()).await {
            Ok(Ok(handle)) => {
                info!(target_db = %self.params.masked(), "Redis handle opened");
                Ok(handle)
            }
            Ok(Err(e)) => Err(connect_error(&self.params, e)),
            Err(_) => Err(timed_out(&self.params, connect_timeout)),
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Prefix a backend failure with the (masked) target, keeping its codes.
fn connect_error(params: &ConnectionParams, err: EngineError) -> EngineError {
    match err {
        EngineError::Connection {
            message,
            sql_state,
            code,
            transient,
        } => EngineError::Connection {
            message: format!("Failed to connect to {}: {}", params.masked(), message),
            sql_state,
            code,
            transient,
        },
        other => other,
    }
}

fn timed_out(params: &ConnectionParams, after: Duration) -> EngineError {
    EngineError::connection(format!(
        "Timed out connecting to {} after {}s",
        params.masked(),
        after.as_secs()
    ))
}
