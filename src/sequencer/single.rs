//! Single transaction strategy with fee bump replacement

use super::{check_account, fetch_chain_nonce, AddressSequencer, SequencerFactory};
use crate::chain::NetworkClient;
use crate::error::{SequencerError, SequencerResult};
use crate::tx::{Account, GasRefetchPolicy, Transaction, TransactionArgs};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STRATEGY: &str = "single";

struct SingleTxState {
    transaction: Option<Transaction>,
    gas_price: u64,
    /// Nonce of the transaction dropped by the last fee bump
    nonce_at_last_bump: Option<u64>,
}

/// Tracks at most one unconfirmed transaction; the chain nonce is always authoritative
pub struct SingleTxSequencer {
    account: Account,
    network: Arc<dyn NetworkClient>,
    policy: GasRefetchPolicy,
    state: Mutex<SingleTxState>,
}

impl SingleTxSequencer {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        account: Account,
        policy: GasRefetchPolicy,
    ) -> SequencerResult<Self> {
        check_account(&account)?;

        Ok(Self {
            account,
            network,
            policy,
            state: Mutex::new(SingleTxState {
                transaction: None,
                gas_price: 0,
                nonce_at_last_bump: None,
            }),
        })
    }

    async fn refetch_gas_price(&self, state: &mut SingleTxState) {
        match self.network.get_network_config().await {
            Ok(config) => state.gas_price = config.min_gas_price,
            // Keep whatever we had; the caller floor still applies
            Err(e) => warn!(
                "Failed to fetch network config for {}, keeping gas price {}: {}",
                self.account, state.gas_price, e
            ),
        }
    }
}

#[async_trait]
impl AddressSequencer for SingleTxSequencer {
    fn account(&self) -> &Account {
        &self.account
    }

    async fn apply_nonce(&self, args: &mut TransactionArgs) -> SequencerResult<()> {
        let mut state = self.state.lock().await;

        let nonce = fetch_chain_nonce(self.network.as_ref(), &self.account).await?;

        if self
            .policy
            .should_refetch(state.gas_price, nonce, state.nonce_at_last_bump)
        {
            self.refetch_gas_price(&mut state).await;
        }

        args.nonce = nonce;
        args.gas_price = state.gas_price.max(args.gas_price);

        debug!(
            "Applied chain nonce {} and gas price {} for {}",
            nonce, args.gas_price, self.account
        );
        crate::metrics::record_nonce_assigned(STRATEGY, 1);
        Ok(())
    }

    async fn send_transaction(&self, tx: Transaction) -> SequencerResult<String> {
        self.state.lock().await.transaction = Some(tx.clone());

        let hash = self
            .network
            .send_transaction(&tx)
            .await
            .map_err(SequencerError::Network)?;

        debug!("Sent transaction {} with nonce {} for {}", hash, tx.nonce, self.account);
        crate::metrics::record_tx_sent(STRATEGY);
        Ok(hash)
    }

    async fn resend_if_required(&self) -> SequencerResult<()> {
        let Some(tracked) = self.state.lock().await.transaction.clone() else {
            return Ok(());
        };

        let chain_nonce = fetch_chain_nonce(self.network.as_ref(), &self.account).await?;
        if tracked.nonce != chain_nonce {
            let mut state = self.state.lock().await;
            // A newer send may have replaced it meanwhile
            if state.transaction.as_ref().map(|tx| tx.nonce) == Some(tracked.nonce) {
                state.transaction = None;
            }
            debug!(
                "Transaction with nonce {} resolved for {} (chain nonce {})",
                tracked.nonce, self.account, chain_nonce
            );
            crate::metrics::record_tx_confirmed(STRATEGY, 1);
            return Ok(());
        }

        let hash = self
            .network
            .send_transaction(&tracked)
            .await
            .map_err(SequencerError::Network)?;

        debug!("Resent transaction {} for {}", hash, self.account);
        crate::metrics::record_tx_resent(STRATEGY, 1);
        Ok(())
    }

    async fn drop_transactions(&self) {
        let mut state = self.state.lock().await;
        // Nothing to bump until a price has been fetched
        if state.gas_price > 0 {
            state.gas_price = state.gas_price.saturating_add(1);
        }
        if let Some(tx) = state.transaction.take() {
            state.nonce_at_last_bump = Some(tx.nonce);
        }
        info!(
            "Dropped tracked transaction for {}, next replacement uses gas price {}",
            self.account, state.gas_price
        );
    }

    async fn pending_count(&self) -> usize {
        usize::from(self.state.lock().await.transaction.is_some())
    }
}

/// Creates [`SingleTxSequencer`] instances
#[derive(Debug, Clone, Default)]
pub struct SingleTxSequencerFactory {
    policy: GasRefetchPolicy,
}

impl SingleTxSequencerFactory {
    pub fn new(policy: GasRefetchPolicy) -> Self {
        Self { policy }
    }
}

impl SequencerFactory for SingleTxSequencerFactory {
    fn create(
        &self,
        network: Arc<dyn NetworkClient>,
        account: Account,
    ) -> SequencerResult<Arc<dyn AddressSequencer>> {
        Ok(Arc::new(SingleTxSequencer::new(network, account, self.policy)?))
    }
}
