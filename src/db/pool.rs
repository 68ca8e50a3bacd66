//! Bounded connection pool.
//!
//! Holds up to `max_connections` live handles built by a [`HandleFactory`]. Handles are
//! created on demand, reused across calls and destroyed on [`Pool::close`].
//!
//! # Concurrency
//!
//! - A fair `tokio::sync::Semaphore` carries one permit per slot. Waiters are served in
//!   FIFO order, so no acquire starves while releases keep occurring.
//! - A permit holder either takes an idle handle or creates a new one, so the number of
//!   live handles never exceeds the cap and no two tasks create a handle for the same slot.
//! - The idle set is a `std::sync::Mutex`; it is never held across an await point.
//! - A borrowed handle is returned by [`Pooled`]'s `Drop`, so every exit path of a caller
//!   (including `?` and panics) gives the slot back exactly once.

use crate::config::PoolOptions;
use crate::db::factory::HandleFactory;
use crate::error::{EngineError, EngineResult};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Cap on live handles
    pub max_connections: usize,
    /// Live handles (idle + borrowed)
    pub size: usize,
    /// Handles waiting in the idle set
    pub idle: usize,
    /// Slots currently borrowed (or being filled by a borrower)
    pub in_use: usize,
}

struct PoolInner<F: HandleFactory> {
    factory: Arc<F>,
    max_connections: usize,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<F::Handle>>,
    size: AtomicUsize,
}

impl<F: HandleFactory> PoolInner<F> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<F::Handle>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put_idle(&self, handle: F::Handle) {
        let mut idle = self.idle();
        // Checked under the lock so a concurrent close() cannot miss this handle
        if self.semaphore.is_closed() {
            drop(idle);
            drop(handle);
            self.shrink(1);
            return;
        }
        idle.push_back(handle);
    }

    fn shrink(&self, n: usize) {
        let result = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                Some(size.saturating_sub(n))
            });
        if let Ok(prev) = result {
            if prev < n {
                warn!(
                    backend = self.factory.backend(),
                    "Pool size underflow detected - handle destroyed twice"
                );
            }
        }
    }
}

/// Bounded pool of backend handles. Cloning shares the same pool.
pub struct Pool<F: HandleFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: HandleFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: HandleFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("backend", &self.inner.factory.backend())
            .field("status", &self.status())
            .finish()
    }
}

impl<F: HandleFactory> Pool<F> {
    /// Create an empty pool. No handle is opened until the first acquire (or [`Pool::fill`]).
    pub fn new(factory: F, max_connections: u32) -> EngineResult<Self> {
        Self::from_shared(Arc::new(factory), max_connections)
    }

    /// Create an empty pool around a factory shared with its owner.
    pub fn from_shared(factory: Arc<F>, max_connections: u32) -> EngineResult<Self> {
        if max_connections == 0 {
            return Err(EngineError::precondition(
                "max_connections must be greater than 0",
            ));
        }
        let max_connections = max_connections as usize;
        info!(
            backend = factory.backend(),
            max_connections, "Created connection pool"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                max_connections,
                semaphore: Arc::new(Semaphore::new(max_connections)),
                idle: Mutex::new(VecDeque::new()),
                size: AtomicUsize::new(0),
            }),
        })
    }

    /// Create a pool sized by `options`.
    pub fn with_options(factory: Arc<F>, options: &PoolOptions) -> EngineResult<Self> {
        options.validate().map_err(EngineError::precondition)?;
        Self::from_shared(factory, options.max_connections_or_default())
    }

    /// Borrow a handle, suspending the calling task while the pool is saturated.
    ///
    /// Reuses an idle handle when one exists, otherwise opens a new one. A factory failure
    /// is returned as-is and frees the slot.
    pub async fn acquire(&self) -> EngineResult<Pooled<F>> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::connection("Connection pool is closed"))?;

        let reused = self.inner.idle().pop_front();
        let handle = match reused {
            Some(handle) => handle,
            None => {
                let handle = self.inner.factory.create().await?;
                let size = self.inner.size.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(
                    backend = self.inner.factory.backend(),
                    size,
                    max_connections = self.inner.max_connections,
                    "Opened pooled handle"
                );
                handle
            }
        };

        Ok(Pooled {
            handle: Some(handle),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Open handles until the pool holds `max_connections` of them.
    ///
    /// Waits for every borrowed handle to come back first.
    pub async fn fill(&self) -> EngineResult<()> {
        let permits = Arc::clone(&self.inner.semaphore)
            .acquire_many_owned(self.inner.max_connections as u32)
            .await
            .map_err(|_| EngineError::connection("Connection pool is closed"))?;

        while self.inner.size.load(Ordering::Acquire) < self.inner.max_connections {
            let handle = self.inner.factory.create().await?;
            self.inner.size.fetch_add(1, Ordering::AcqRel);
            self.inner.idle().push_back(handle);
        }

        drop(permits);
        debug!(
            backend = self.inner.factory.backend(),
            size = self.inner.max_connections,
            "Pool filled"
        );
        Ok(())
    }

    /// Destroy every idle handle; borrowed handles are unaffected. Returns the number destroyed.
    pub fn clear_idle(&self) -> usize {
        let drained: Vec<F::Handle> = self.inner.idle().drain(..).collect();
        let n = drained.len();
        drop(drained);
        self.inner.shrink(n);
        if n > 0 {
            debug!(backend = self.inner.factory.backend(), destroyed = n, "Cleared idle handles");
        }
        n
    }

    /// Tear the pool down: pending and future acquires fail, idle handles are destroyed and
    /// borrowed handles are destroyed when returned.
    pub fn close(&self) {
        self.inner.semaphore.close();
        let destroyed = self.clear_idle();
        info!(
            backend = self.inner.factory.backend(),
            destroyed, "Connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        let available = self.inner.semaphore.available_permits();
        PoolStatus {
            max_connections: self.inner.max_connections,
            size: self.inner.size.load(Ordering::Acquire),
            idle: self.inner.idle().len(),
            in_use: self.inner.max_connections.saturating_sub(available),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

/// A handle borrowed from a [`Pool`].
///
/// Dropping it (or calling [`Pooled::release`]) returns the handle to the idle set;
/// [`Pooled::discard`] destroys it instead.
pub struct Pooled<F: HandleFactory> {
    handle: Option<F::Handle>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<F>>,
}

impl<F: HandleFactory> Pooled<F> {
    /// Return the handle to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Destroy the handle (e.g. after the backend dropped the connection) and free its slot.
    pub fn discard(mut self) {
        if let Some(handle) = self.handle.take() {
            drop(handle);
            self.pool.shrink(1);
            debug!(backend = self.pool.factory.backend(), "Discarded pooled handle");
        }
    }
}

impl<F: HandleFactory> Deref for Pooled<F> {
    type Target = F::Handle;

    fn deref(&self) -> &F::Handle {
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<F: HandleFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut F::Handle {
        match &mut self.handle {
            Some(handle) => handle,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<F: HandleFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.put_idle(handle);
        }
        // Slot is freed only after the handle is back in the idle set
        drop(self.permit.take());
    }
}

impl<F: HandleFactory> std::fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("backend", &self.pool.factory.backend())
            .field("holds_handle", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}
