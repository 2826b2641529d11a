//! At-least-once consumer for externally queued pending credits.
//!
//! Each message carries an idempotency token. The store claims the token and
//! credits the user's `pending` field in one write, so a redelivered message
//! is acknowledged without crediting twice.

use accrue_core::error::{AccrueError, StoreError};
use accrue_core::types::{PendingTier, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::handle::StoreHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCredit {
    pub token: String,
    pub user_id: UserId,
    pub tier: PendingTier,
    pub amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    Credited,
    Duplicate,
}

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("malformed pending credit: {0}")]
    Malformed(String),
    #[error(transparent)]
    Accrue(#[from] AccrueError),
}

impl From<StoreError> for ConsumeError {
    fn from(e: StoreError) -> Self {
        Self::Accrue(e.into())
    }
}

pub struct PendingCreditConsumer {
    store: StoreHandle,
}

impl PendingCreditConsumer {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub async fn consume(&self, credit: PendingCredit) -> Result<Consumed, ConsumeError> {
        if !credit.amount.is_finite() {
            return Err(ConsumeError::Malformed(format!("amount {} for token {}", credit.amount, credit.token)));
        }
        if credit.token.is_empty() {
            return Err(ConsumeError::Malformed("empty token".into()));
        }
        let PendingCredit { token, user_id, tier, amount } = credit;
        let log_token = token.clone();
        let credited = self.store.call(move |s| s.credit_pending_once(&token, user_id, tier, amount)).await?;
        if credited {
            debug!(user_id, token = %log_token, amount, "pending credit applied");
            Ok(Consumed::Credited)
        } else {
            debug!(user_id, token = %log_token, "duplicate pending credit ignored");
            Ok(Consumed::Duplicate)
        }
    }

    /// Decode a JSON message and consume it.
    pub async fn consume_json(&self, payload: &str) -> Result<Consumed, ConsumeError> {
        let credit: PendingCredit = serde_json::from_str(payload).map_err(|e| {
            warn!("rejecting pending credit message: {}", e);
            ConsumeError::Malformed(e.to_string())
        })?;
        self.consume(credit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use accrue_core::memory::MemoryStore;
    use accrue_core::traits::UserStore;
    use accrue_core::types::UserState;

    fn consumer() -> (PendingCreditConsumer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.put_user(UserState::new(3));
        (PendingCreditConsumer::new(StoreHandle::new(store.clone(), Duration::from_secs(1))), store)
    }

    fn credit(token: &str, amount: f64) -> PendingCredit {
        PendingCredit { token: token.into(), user_id: 3, tier: PendingTier::T2, amount }
    }

    #[tokio::test]
    async fn redelivery_is_a_noop() {
        let (c, store) = consumer();
        assert_eq!(c.consume(credit("a", 2.0)).await.unwrap(), Consumed::Credited);
        assert_eq!(c.consume(credit("a", 2.0)).await.unwrap(), Consumed::Duplicate);
        assert_eq!(c.consume(credit("b", 1.0)).await.unwrap(), Consumed::Credited);
        assert_eq!(store.get_user(3).unwrap().unwrap().t2_pending.pending, 3.0);
    }

    #[tokio::test]
    async fn json_messages_decode() {
        let (c, store) = consumer();
        let payload = r#"{"token":"m-9","user_id":3,"tier":"Solo","amount":1.25}"#;
        assert_eq!(c.consume_json(payload).await.unwrap(), Consumed::Credited);
        assert_eq!(store.get_user(3).unwrap().unwrap().solo_pending.pending, 1.25);
    }

    #[tokio::test]
    async fn malformed_messages_are_rejected() {
        let (c, _store) = consumer();
        assert!(matches!(c.consume_json("{").await, Err(ConsumeError::Malformed(_))));
        assert!(matches!(c.consume(credit("", 1.0)).await, Err(ConsumeError::Malformed(_))));
        assert!(matches!(c.consume(credit("x", f64::NAN)).await, Err(ConsumeError::Malformed(_))));
    }

    #[tokio::test]
    async fn unknown_user_is_a_store_error() {
        let (c, _store) = consumer();
        let missing = PendingCredit { user_id: 77, ..credit("z", 1.0) };
        assert!(matches!(
            c.consume(missing).await,
            Err(ConsumeError::Accrue(AccrueError::Store(StoreError::NotFound(_))))
        ));
    }
}
