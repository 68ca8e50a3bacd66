//! Scheduling-context adapter.
//!
//! Engines are async. [`Blocking`] lets synchronous code (a one-shot CLI, a worker thread)
//! call them through the same contract:
//! - outside any runtime, the call runs on a current-thread runtime owned by the facade,
//!   started on first use and shut down when the facade is dropped
//! - inside a multi-thread runtime, the calling worker is handed off with `block_in_place`
//!   and the call runs in place
//! - inside a current-thread runtime blocking would stall the only worker, so the call fails;
//!   async callers there `.await` the engine directly

use crate::db::connection::Connection;
use crate::error::{EngineError, EngineResult};
use crate::models::{Output, Params};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tracing::debug;

/// Where the current thread is executing.
#[derive(Debug, Clone)]
pub enum SchedulingContext {
    /// Inside a tokio runtime
    Scheduled(Handle),
    /// Plain thread with no runtime entered
    Unscheduled,
}

impl SchedulingContext {
    /// Inspect the thread-local runtime context.
    pub fn detect() -> Self {
        match Handle::try_current() {
            Ok(handle) => Self::Scheduled(handle),
            Err(_) => Self::Unscheduled,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled(_))
    }
}

/// Blocking facade over an async engine.
pub struct Blocking<C> {
    engine: Arc<C>,
    fallback: Mutex<Option<Arc<Runtime>>>,
}

impl<C: Connection> Blocking<C> {
    pub fn new(engine: C) -> Self {
        Self::from_shared(Arc::new(engine))
    }

    /// Wrap an engine that async code keeps using too.
    pub fn from_shared(engine: Arc<C>) -> Self {
        Self {
            engine,
            fallback: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &C {
        &self.engine
    }

    /// Run `operation` to completion from whatever context the caller is in.
    pub fn run<T, Fut>(&self, operation: Fut) -> EngineResult<T>
    where
        Fut: Future<Output = EngineResult<T>>,
    {
        match SchedulingContext::detect() {
            SchedulingContext::Scheduled(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::MultiThread => {
                    tokio::task::block_in_place(|| handle.block_on(operation))
                }
                _ => Err(EngineError::unsupported(
                    "blocking calls",
                    "a current-thread runtime",
                )),
            },
            SchedulingContext::Unscheduled => self.fallback_runtime()?.block_on(operation),
        }
    }

    fn fallback_runtime(&self) -> EngineResult<Arc<Runtime>> {
        let mut slot = self.fallback.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = slot.as_ref() {
            return Ok(Arc::clone(runtime));
        }

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::internal(format!("Failed to start runtime: {e}")))?;
        debug!("Started fallback runtime for unscheduled caller");

        let runtime = Arc::new(runtime);
        *slot = Some(Arc::clone(&runtime));
        Ok(runtime)
    }

    pub fn connect(&self, force_reconnect: bool) -> EngineResult<C::Provider> {
        self.run(self.engine.connect(force_reconnect))
    }

    pub fn execute(
        &self,
        instruction: &str,
        params: &Params,
        handle: Option<&mut C::Handle>,
    ) -> EngineResult<Output> {
        self.run(self.engine.execute(instruction, params, handle))
    }

    pub fn start_transaction(&self) -> EngineResult<&Self> {
        self.run(self.engine.start_transaction())?;
        Ok(self)
    }

    pub fn commit(&self) -> EngineResult<&Self> {
        self.run(self.engine.commit())?;
        Ok(self)
    }

    pub fn rollback(&self) -> EngineResult<&Self> {
        self.run(self.engine.rollback())?;
        Ok(self)
    }

    pub fn last_insert_id(&self) -> EngineResult<u64> {
        self.run(self.engine.last_insert_id())
    }
}

impl<C> Drop for Blocking<C> {
    fn drop(&mut self) {
        let slot = self
            .fallback
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = slot {
            if let Ok(runtime) = Arc::try_unwrap(runtime) {
                runtime.shutdown_background();
            }
        }
    }
}

impl<C> std::fmt::Debug for Blocking<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let started = self
            .fallback
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        f.debug_struct("Blocking")
            .field("fallback_runtime", &started)
            .finish_non_exhaustive()
    }
}
