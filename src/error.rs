//! Error types for the nonce sequencer

use thiserror::Error;

/// Opaque error produced by a [`NetworkClient`](crate::chain::NetworkClient) implementation
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for nonce sequencing and dispatch
#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("nil network client")]
    NilProxy,

    #[error("nil account")]
    NilAccount,

    #[error("nil transaction")]
    NilTransaction,

    #[error("nil sequencer factory")]
    NilSequencerFactory,

    #[error("transaction with nonce {nonce} was already sent for account {account}")]
    TxAlreadySent { account: String, nonce: u64 },

    #[error(
        "transaction with nonce {nonce} has already been scheduled to send for account {account}"
    )]
    AlreadyScheduled { account: String, nonce: u64 },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("context canceled while sending transaction for address {account}")]
    Cancelled { account: String },

    #[error("network error: {0}")]
    Network(#[source] BoxError),
}

impl SequencerError {
    /// The call duplicated work that is already tracked
    pub fn is_redundant(&self) -> bool {
        matches!(
            self,
            SequencerError::TxAlreadySent { .. } | SequencerError::AlreadyScheduled { .. }
        )
    }

    /// The component is shutting down
    pub fn is_shutdown(&self) -> bool {
        matches!(self, SequencerError::Cancelled { .. })
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, SequencerError::Network(_))
    }

    /// The underlying network failure, if any
    pub fn network_cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            SequencerError::Network(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Result type for sequencer operations
pub type SequencerResult<T> = Result<T, SequencerError>;
