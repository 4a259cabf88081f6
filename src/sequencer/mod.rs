//! Per-account nonce sequencing strategies
//!
//! Every strategy implements [`AddressSequencer`] for exactly one account and
//! is created through a [`SequencerFactory`], so the registry never knows
//! which one it is driving:
//! - [`MultiTxSequencer`]: many transactions in flight, bulk resend
//! - [`SingleTxSequencer`]: one transaction in flight, fee bump replacement
//! - [`PacedSequencer`](crate::dispatch::PacedSequencer): rate limited dispatch

mod multi;
mod single;

pub use multi::{MultiTxSequencer, MultiTxSequencerFactory};
pub use single::{SingleTxSequencer, SingleTxSequencerFactory};

use crate::chain::NetworkClient;
use crate::error::{SequencerError, SequencerResult};
use crate::tx::{Account, Transaction, TransactionArgs};

use async_trait::async_trait;
use std::sync::Arc;

/// Nonce state machine for a single account
#[async_trait]
pub trait AddressSequencer: Send + Sync {
    /// The account this sequencer hands out nonces for
    fn account(&self) -> &Account;

    /// Write the next nonce and a gas price of at least the network minimum into `args`
    async fn apply_nonce(&self, args: &mut TransactionArgs) -> SequencerResult<()>;

    /// Track and propagate a transaction, returning its hash
    async fn send_transaction(&self, tx: Transaction) -> SequencerResult<String>;

    /// Reconcile tracked transactions against the chain nonce, resending what is unconfirmed
    async fn resend_if_required(&self) -> SequencerResult<()>;

    /// Forget in-flight state so the next assignment is derived from the chain again
    async fn drop_transactions(&self);

    /// Number of transactions currently tracked as unconfirmed
    async fn pending_count(&self) -> usize;

    /// Stop any background work owned by the sequencer
    fn close(&self) {}
}

/// Creates the sequencer used for a newly seen account
pub trait SequencerFactory: Send + Sync {
    fn create(
        &self,
        network: Arc<dyn NetworkClient>,
        account: Account,
    ) -> SequencerResult<Arc<dyn AddressSequencer>>;
}

pub(crate) fn check_account(account: &Account) -> SequencerResult<()> {
    if account.is_empty() {
        return Err(SequencerError::NilAccount);
    }
    Ok(())
}

pub(crate) async fn fetch_chain_nonce(
    network: &dyn NetworkClient,
    account: &Account,
) -> SequencerResult<u64> {
    network
        .get_account(account)
        .await
        .map(|info| info.nonce)
        .map_err(SequencerError::Network)
}
