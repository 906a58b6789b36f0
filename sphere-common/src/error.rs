//! The user-visible error taxonomy of the wallet engine.
//!
//! Internal plumbing uses `anyhow` chains; anything that crosses the engine's
//! public API surface is classified into one of these kinds. Transient kinds
//! ([`AggregatorUnavailable`]) are retried internally before surfacing.
//!
//! [`AggregatorUnavailable`]: WalletError::AggregatorUnavailable

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    /// Bad recipient format, negative amount, unknown coin, bad hex.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Token selection cannot sum to the requested amount.
    #[error("insufficient balance: have {available}, need {requested}")]
    InsufficientBalance {
        available: crate::amount::Amount,
        requested: crate::amount::Amount,
    },

    /// The recipient could not be resolved to peer info.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Transport is not connected.
    #[error("not connected to any relay")]
    NotConnected,

    /// Aggregator network failure or 5xx; retried with backoff, then surfaced.
    #[error("aggregator unavailable: {0}")]
    AggregatorUnavailable(String),

    /// The aggregator rejected a commit (double spend detected upstream).
    /// The affected token transitions to `Failed`.
    #[error("aggregator rejected commit: {0}")]
    AggregatorRejected(String),

    /// Composite transfer failure; carries partial-progress metadata.
    #[error("transfer failed at stage {stage}: {message}")]
    TransferFailed { stage: String, message: String },

    /// Structural token validation failed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The sidecar name-record sequence regressed; reload and merge.
    #[error("conflicting sidecar publish: {0}")]
    ConflictingPublish(String),

    /// Corrupted local storage or unrecoverable identity state.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl WalletError {
    /// Whether retrying the same operation may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AggregatorUnavailable(_)
                | Self::NotConnected
                | Self::ConflictingPublish(_)
        )
    }

    /// The short machine-readable kind, for logs and client dispatch.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::InvalidRecipient(_) => "invalid_recipient",
            Self::NotConnected => "not_connected",
            Self::AggregatorUnavailable(_) => "aggregator_unavailable",
            Self::AggregatorRejected(_) => "aggregator_rejected",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::InvalidToken(_) => "invalid_token",
            Self::ConflictingPublish(_) => "conflicting_publish",
            Self::Fatal(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(WalletError::NotConnected.is_transient());
        assert!(WalletError::AggregatorUnavailable("503".to_owned()).is_transient());
        assert!(!WalletError::InvalidInput("bad hex".to_owned()).is_transient());
        assert!(!WalletError::Fatal("corrupt".to_owned()).is_transient());
    }

    #[test]
    fn kinds_are_stable_strings() {
        let err = WalletError::TransferFailed {
            stage: "burning".to_owned(),
            message: "x".to_owned(),
        };
        assert_eq!(err.kind(), "transfer_failed");
    }
}
