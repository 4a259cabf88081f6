//! Multi transaction strategy
//!
//! Handles:
//! - Local nonce counting ahead of the chain
//! - Duplicate nonce rejection
//! - Eviction of confirmed nonces and bulk resend of the rest

use super::{check_account, fetch_chain_nonce, AddressSequencer, SequencerFactory};
use crate::chain::NetworkClient;
use crate::error::{SequencerError, SequencerResult};
use crate::tx::{Account, GasPriceCache, Transaction, TransactionArgs};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STRATEGY: &str = "multi";

/// Per-account nonce state
struct MultiTxState {
    /// Next nonce to hand out, unset until derived from the chain
    computed_nonce: Option<u64>,
    /// Unconfirmed transactions: nonce -> last sent transaction
    pending: BTreeMap<u64, Transaction>,
    gas: GasPriceCache,
}

/// Tracks every unconfirmed transaction of one account
pub struct MultiTxSequencer {
    account: Account,
    network: Arc<dyn NetworkClient>,
    state: Mutex<MultiTxState>,
}

impl MultiTxSequencer {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        account: Account,
        gas_price_ttl: Duration,
    ) -> SequencerResult<Self> {
        check_account(&account)?;

        Ok(Self {
            account,
            network,
            state: Mutex::new(MultiTxState {
                computed_nonce: None,
                pending: BTreeMap::new(),
                gas: GasPriceCache::new(gas_price_ttl),
            }),
        })
    }
}

#[async_trait]
impl AddressSequencer for MultiTxSequencer {
    fn account(&self) -> &Account {
        &self.account
    }

    async fn apply_nonce(&self, args: &mut TransactionArgs) -> SequencerResult<()> {
        let mut state = self.state.lock().await;

        let min_gas_price = state.gas.refresh_if_stale(self.network.as_ref()).await?;

        let nonce = match state.computed_nonce {
            Some(nonce) => nonce,
            None => {
                let chain_nonce = fetch_chain_nonce(self.network.as_ref(), &self.account).await?;
                // Never hand out a nonce already sent with a caller-chosen value
                let past_pending = state
                    .pending
                    .keys()
                    .next_back()
                    .map_or(0, |highest| highest + 1);
                let nonce = chain_nonce.max(past_pending);
                debug!("Derived nonce {} from chain for {}", nonce, self.account);
                nonce
            }
        };
        state.computed_nonce = Some(nonce + 1);

        args.nonce = nonce;
        args.gas_price = min_gas_price.max(args.gas_price);

        debug!("Allocated nonce {} for {}", nonce, self.account);
        crate::metrics::record_nonce_assigned(STRATEGY, 1);
        Ok(())
    }

    async fn send_transaction(&self, tx: Transaction) -> SequencerResult<String> {
        {
            let mut state = self.state.lock().await;
            if state.pending.contains_key(&tx.nonce) {
                crate::metrics::record_tx_rejected("already_sent");
                return Err(SequencerError::TxAlreadySent {
                    account: self.account.to_string(),
                    nonce: tx.nonce,
                });
            }

            state.pending.insert(tx.nonce, tx.clone());
            if let Some(computed) = state.computed_nonce {
                if tx.nonce >= computed {
                    state.computed_nonce = Some(tx.nonce + 1);
                }
            }
        }

        // Stays tracked on failure: the network may still have accepted it
        let hash = self
            .network
            .send_transaction(&tx)
            .await
            .map_err(|e| {
                warn!(
                    "Send failed for nonce {} of {}, kept for resend: {}",
                    tx.nonce, self.account, e
                );
                SequencerError::Network(e)
            })?;

        debug!("Sent transaction {} with nonce {} for {}", hash, tx.nonce, self.account);
        crate::metrics::record_tx_sent(STRATEGY);
        Ok(hash)
    }

    async fn resend_if_required(&self) -> SequencerResult<()> {
        let chain_nonce = fetch_chain_nonce(self.network.as_ref(), &self.account).await?;

        let remaining: Vec<Transaction> = {
            let mut state = self.state.lock().await;

            let unconfirmed = state.pending.split_off(&chain_nonce);
            let confirmed = std::mem::replace(&mut state.pending, unconfirmed);
            if !confirmed.is_empty() {
                debug!(
                    "Evicted {} confirmed transactions for {} (chain nonce {})",
                    confirmed.len(),
                    self.account,
                    chain_nonce
                );
                crate::metrics::record_tx_confirmed(STRATEGY, confirmed.len());
            }

            // Another sender may have moved the chain past us
            if let Some(computed) = state.computed_nonce {
                if computed < chain_nonce {
                    warn!(
                        "Chain nonce {} ahead of local nonce {} for {}",
                        chain_nonce, computed, self.account
                    );
                    state.computed_nonce = Some(chain_nonce);
                }
            }

            state.pending.values().cloned().collect()
        };

        if remaining.is_empty() {
            return Ok(());
        }

        let hashes = self
            .network
            .send_transactions(&remaining)
            .await
            .map_err(SequencerError::Network)?;

        debug!(
            "Resent {} transactions for {}: {:?}",
            remaining.len(),
            self.account,
            hashes
        );
        crate::metrics::record_tx_resent(STRATEGY, remaining.len());
        Ok(())
    }

    async fn drop_transactions(&self) {
        let mut state = self.state.lock().await;
        let dropped = state.pending.len();
        state.pending.clear();
        state.computed_nonce = None;
        info!(
            "Dropped {} tracked transactions for {}, nonce will be refetched",
            dropped, self.account
        );
    }

    async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

/// Creates [`MultiTxSequencer`] instances
#[derive(Debug, Clone)]
pub struct MultiTxSequencerFactory {
    gas_price_ttl: Duration,
}

impl MultiTxSequencerFactory {
    pub fn new(gas_price_ttl: Duration) -> Self {
        Self { gas_price_ttl }
    }
}

impl Default for MultiTxSequencerFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl SequencerFactory for MultiTxSequencerFactory {
    fn create(
        &self,
        network: Arc<dyn NetworkClient>,
        account: Account,
    ) -> SequencerResult<Arc<dyn AddressSequencer>> {
        Ok(Arc::new(MultiTxSequencer::new(
            network,
            account,
            self.gas_price_ttl,
        )?))
    }
}
