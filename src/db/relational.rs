//! Relational execution engines.
//!
//! Two variants share the statement path:
//! - [`PooledSqlEngine`] borrows a pooled handle per call and refuses transactions, since
//!   consecutive calls may land on different handles.
//! - [`DirectSqlEngine`] owns one lazily-opened handle and supports a single transaction at a
//!   time, guarded by a flag.
//!
//! A statement failing with a transient disconnect is retried once on a fresh handle. The
//! broken handle is discarded, never returned to the pool. Every other error surfaces as-is.

use crate::config::PoolOptions;
use crate::db::connection::Connection;
use crate::db::factory::HandleFactory;
use crate::db::params::{BoundStatement, NamedStatement, bind_mysql_param};
use crate::db::pool::{Pool, Pooled};
use crate::db::types::row_to_json;
use crate::error::{EngineError, EngineResult};
use crate::models::{Output, Params, Row, StatementKind};
use async_trait::async_trait;
use sqlx::MySqlConnection;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

/// Statement primitives the engines need from a relational handle.
#[async_trait]
pub trait SqlHandle: Send {
    /// Run a statement and fetch every row it produces.
    async fn fetch_rows(&mut self, stmt: &BoundStatement) -> EngineResult<Vec<Row>>;

    /// Run a statement and return the identifier it generated.
    async fn execute_insert(&mut self, stmt: &BoundStatement) -> EngineResult<u64>;

    /// Identifier generated by the last insert on this handle.
    async fn last_insert_id(&mut self) -> EngineResult<u64>;
}

#[async_trait]
impl SqlHandle for MySqlConnection {
    async fn fetch_rows(&mut self, stmt: &BoundStatement) -> EngineResult<Vec<Row>> {
        // When args is empty, use the text protocol: some statements cannot be prepared
        let rows = if stmt.args.is_empty() {
            use sqlx::Executor;
            (&mut *self).fetch_all(stmt.sql.as_str()).await?
        } else {
            let mut query = sqlx::query(&stmt.sql);
            for arg in &stmt.args {
                query = bind_mysql_param(query, arg);
            }
            query.fetch_all(&mut *self).await?
        };
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute_insert(&mut self, stmt: &BoundStatement) -> EngineResult<u64> {
        let result = if stmt.args.is_empty() {
            use sqlx::Executor;
            (&mut *self).execute(stmt.sql.as_str()).await?
        } else {
            let mut query = sqlx::query(&stmt.sql);
            for arg in &stmt.args {
                query = bind_mysql_param(query, arg);
            }
            query.execute(&mut *self).await?
        };
        Ok(result.last_insert_id())
    }

    async fn last_insert_id(&mut self) -> EngineResult<u64> {
        let id: u64 = sqlx::query_scalar("SELECT LAST_INSERT_ID()")
            .fetch_one(&mut *self)
            .await?;
        Ok(id)
    }
}

/// Run a bound statement; the verb decides the result shape.
async fn run_statement<H: SqlHandle + ?Sized>(
    handle: &mut H,
    stmt: &BoundStatement,
) -> EngineResult<Output> {
    match stmt.kind {
        StatementKind::Insert => {
            let id = handle.execute_insert(stmt).await?;
            Ok(Output::Scalar(id.into()))
        }
        StatementKind::Update | StatementKind::Other => {
            handle.fetch_rows(stmt).await.map(Output::Rows)
        }
    }
}

fn bind(instruction: &str, params: &Params) -> EngineResult<BoundStatement> {
    let stmt = NamedStatement::parse(instruction).bind(params)?;
    debug!(
        sql = %stmt.sql,
        params = stmt.args.len(),
        kind = %stmt.kind,
        "Executing statement"
    );
    Ok(stmt)
}

// =============================================================================
// Pooled variant
// =============================================================================

/// Relational engine borrowing a pooled handle per call.
pub struct PooledSqlEngine<F: HandleFactory> {
    factory: Arc<F>,
    options: PoolOptions,
    pool: OnceCell<Pool<F>>,
}

impl<F> PooledSqlEngine<F>
where
    F: HandleFactory,
    F::Handle: SqlHandle,
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
        // OnceCell::get_or_try_init makes concurrent first callers share one pool
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

    async fn execute_pooled(&self, stmt: &BoundStatement) -> EngineResult<Output> {
        let pool = self.pool().await?;
        let mut retry = false;

        loop {
            let mut handle = pool.acquire().await?;
            match run_statement(&mut *handle, stmt).await {
                Ok(output) => {
                    handle.release();
                    return Ok(output);
                }
                Err(e) if e.is_transient() => {
                    handle.discard();
                    if retry {
                        return Err(e);
                    }
                    warn!(
                        backend = self.factory.backend(),
                        error = %e,
                        "Connection lost, retrying statement on a fresh handle"
                    );
                    retry = true;
                }
                Err(e) => {
                    handle.release();
                    return Err(e);
                }
            }
        }
    }

    fn unsupported(&self, operation: &str) -> EngineError {
        EngineError::unsupported(operation, format!("pooled {}", self.factory.backend()))
    }
}

#[async_trait]
impl<F> Connection for PooledSqlEngine<F>
where
    F: HandleFactory,
    F::Handle: SqlHandle,
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
        let stmt = bind(instruction, params)?;
        match handle {
            // Caller owns the handle: no retry, no release
            Some(handle) => run_statement(&mut **handle, &stmt).await,
            None => self.execute_pooled(&stmt).await,
        }
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

// =============================================================================
// Direct variant
// =============================================================================

/// Relational engine owning a single handle, with one transaction at a time.
pub struct DirectSqlEngine<F: HandleFactory> {
    factory: F,
    handle: Mutex<Option<F::Handle>>,
    in_transaction: AtomicBool,
}

impl<F> DirectSqlEngine<F>
where
    F: HandleFactory,
    F::Handle: SqlHandle,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            handle: Mutex::new(None),
            in_transaction: AtomicBool::new(false),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    /// Open a handle the caller owns, independent of the engine's own.
    pub async fn open_handle(&self) -> EngineResult<F::Handle> {
        self.factory.create().await
    }

    async fn ensure_open<'a>(
        &self,
        slot: &'a mut Option<F::Handle>,
    ) -> EngineResult<&'a mut F::Handle> {
        if slot.is_none() {
            *slot = Some(self.factory.create().await?);
            debug!(backend = self.factory.backend(), "Opened direct handle");
        }
        slot.as_mut()
            .ok_or_else(|| EngineError::internal("direct handle missing after open"))
    }

    async fn execute_owned(&self, stmt: &BoundStatement) -> EngineResult<Output> {
        let mut slot = self.handle.lock().await;
        let mut retry = false;

        loop {
            let handle = self.ensure_open(&mut *slot).await?;
            match run_statement(handle, stmt).await {
                Err(e) if e.is_transient() => {
                    *slot = None;
                    // The server dropped the open transaction along with the connection
                    if self.in_transaction.swap(false, Ordering::AcqRel) {
                        warn!(
                            backend = self.factory.backend(),
                            error = %e,
                            "Connection lost inside a transaction"
                        );
                        return Err(e);
                    }
                    if retry {
                        return Err(e);
                    }
                    warn!(
                        backend = self.factory.backend(),
                        error = %e,
                        "Connection lost, retrying statement on a fresh handle"
                    );
                    retry = true;
                }
                result => return result,
            }
        }
    }

    async fn control(&self, sql: &str) -> EngineResult<()> {
        self.execute_owned(&bind(sql, &Params::new())?).await.map(|_| ())
    }
}

#[async_trait]
impl<F> Connection for DirectSqlEngine<F>
where
    F: HandleFactory,
    F::Handle: SqlHandle,
{
    type Handle = F::Handle;
    type Provider = ();

    async fn connect(&self, force_reconnect: bool) -> EngineResult<()> {
        let mut slot = self.handle.lock().await;
        if force_reconnect {
            *slot = None;
        }
        self.ensure_open(&mut *slot).await.map(|_| ())
    }

    async fn execute(
        &self,
        instruction: &str,
        params: &Params,
        handle: Option<&mut F::Handle>,
    ) -> EngineResult<Output> {
        let stmt = bind(instruction, params)?;
        match handle {
            Some(handle) => run_statement(handle, &stmt).await,
            None => self.execute_owned(&stmt).await,
        }
    }

    async fn start_transaction(&self) -> EngineResult<&Self> {
        if self.in_transaction() {
            return Err(EngineError::transaction("Transaction already started"));
        }
        self.control("START TRANSACTION").await?;
        self.in_transaction.store(true, Ordering::Release);
        Ok(self)
    }

    async fn commit(&self) -> EngineResult<&Self> {
        if !self.in_transaction() {
            return Err(EngineError::transaction("Transaction not started"));
        }
        let result = self.control("COMMIT").await;
        self.in_transaction.store(false, Ordering::Release);
        result.map(|_| self)
    }

    async fn rollback(&self) -> EngineResult<&Self> {
        if !self.in_transaction() {
            return Err(EngineError::transaction("Transaction not started"));
        }
        let result = self.control("ROLLBACK").await;
        self.in_transaction.store(false, Ordering::Release);
        result.map(|_| self)
    }

    async fn last_insert_id(&self) -> EngineResult<u64> {
        let mut slot = self.handle.lock().await;
        match slot.as_mut() {
            Some(handle) => handle.last_insert_id().await,
            None => Err(EngineError::connection("No open connection")),
        }
    }
}
