//! Async access to the blocking store traits.
//!
//! Every store call from async code runs on the blocking pool under a
//! per-call timeout. A timed-out call is reported as
//! [`StoreError::Timeout`] and its result, if it ever arrives, is dropped.

use std::sync::Arc;
use std::time::Duration;

use accrue_core::error::StoreError;
use accrue_core::traits::{HistoryStore, LedgerStore, UserStore};

/// Everything the daemon needs from one backend.
pub trait Store: UserStore + LedgerStore + HistoryStore {}

impl<T: UserStore + LedgerStore + HistoryStore> Store for T {}

#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run `f` against the store on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StoreError::Backend(format!("store task failed: {e}"))),
            Err(_) => Err(StoreError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}
