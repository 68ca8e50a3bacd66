//! The execution contract shared by every engine.

use crate::error::EngineResult;
use crate::models::{Output, Params};
use async_trait::async_trait;

/// What the data-access layer sees of a backend.
///
/// Engines are async; synchronous callers go through [`crate::db::Blocking`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// A handle the caller may hold across calls and pass back to [`Connection::execute`].
    type Handle: Send;

    /// What `connect` hands back: the pool for pooled engines.
    type Provider: Send;

    /// Initialize the engine's handle provider. `force_reconnect` drops cached handles.
    async fn connect(&self, force_reconnect: bool) -> EngineResult<Self::Provider>;

    /// Run one instruction.
    ///
    /// With `handle` set, the engine uses it as-is and never returns it to a pool; otherwise a
    /// handle is borrowed for the duration of the call.
    async fn execute(
        &self,
        instruction: &str,
        params: &Params,
        handle: Option<&mut Self::Handle>,
    ) -> EngineResult<Output>;

    async fn start_transaction(&self) -> EngineResult<&Self>;

    async fn commit(&self) -> EngineResult<&Self>;

    async fn rollback(&self) -> EngineResult<&Self>;

    /// Identifier generated by the last insert on the engine's own handle.
    async fn last_insert_id(&self) -> EngineResult<u64>;
}
