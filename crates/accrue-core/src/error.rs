//! Error types for the Accrue engine.
use thiserror::Error;

use crate::types::UserId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key already exists: {0}")] AlreadyExists(String),
    #[error("not found: {0}")] NotFound(String),
    #[error("compare-and-set conflict on {0}")] Conflict(String),
    #[error("store call timed out after {0} ms")] Timeout(u64),
    #[error("codec: {0}")] Codec(String),
    #[error("backend: {0}")] Backend(String),
    #[error(transparent)] Invariant(#[from] InvariantViolation),
}

impl StoreError {
    /// Whether retrying the same operation on the next pass can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Invariant(_) | Self::Codec(_))
    }
}

/// Logic bugs. Never retried; the mining loop aborts the process on these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("counter {field} of user {user_id} would become negative ({value})")]
    NegativeCounter { user_id: UserId, field: &'static str, value: i64 },
    #[error("commit batch carries a zero counter delta for user {0}")]
    ZeroCounterDelta(UserId),
    #[error("ledger row for user {0} carries a negative magnitude")]
    NegativeLedgerMagnitude(UserId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("event bus closed")] Closed,
    #[error("delivery not confirmed for {kind} event of user {user_id}")] Unconfirmed { kind: &'static str, user_id: UserId },
    #[error("broker rejected event: {0}")] Rejected(String),
    #[error("publish timed out")] Timeout,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccrualError {
    #[error("adoption curve is empty")] EmptyAdoptionCurve,
    #[error("invalid base mining rate: {0}")] InvalidBaseRate(f64),
    #[error("boost level index {index} out of range (have {len})")] UnknownBoostLevel { index: usize, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")] Invalid { field: &'static str, reason: String },
    #[error("failed to load configuration: {0}")] Load(String),
}

#[derive(Error, Debug)]
pub enum AccrueError {
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Publish(#[from] PublishError),
    #[error(transparent)] Accrual(#[from] AccrualError),
    #[error(transparent)] Config(#[from] ConfigError),
    #[error(transparent)] Invariant(#[from] InvariantViolation),
    #[error("cancelled")] Cancelled,
}

impl AccrueError {
    /// Invariant violations surface either directly or wrapped by the store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Store(StoreError::Invariant(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        assert!(StoreError::Timeout(250).is_transient());
        assert!(StoreError::Backend("io".into()).is_transient());
    }

    #[test]
    fn invariant_is_fatal() {
        let v = InvariantViolation::NegativeCounter { user_id: 7, field: "active_t1_referrals", value: -1 };
        assert!(!StoreError::from(v.clone()).is_transient());
        assert!(AccrueError::from(StoreError::from(v.clone())).is_fatal());
        assert!(AccrueError::from(v).is_fatal());
        assert!(!AccrueError::from(StoreError::Timeout(1)).is_fatal());
    }

    #[test]
    fn display_messages() {
        assert_eq!(StoreError::AlreadyExists("user:1".into()).to_string(), "key already exists: user:1");
        assert_eq!(PublishError::Closed.to_string(), "event bus closed");
    }
}
