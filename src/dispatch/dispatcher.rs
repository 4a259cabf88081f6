//! Batch oriented dispatcher over paced per-account lanes

use super::lane::PacedSequencer;
use crate::chain::NetworkClient;
use crate::config::check_interval;
use crate::error::{SequencerError, SequencerResult};
use crate::sequencer::check_account;
use crate::tx::{Account, Transaction};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Dispatch};

/// Assigns contiguous nonce ranges to batches and dispatches them at a paced rate
pub struct BatchDispatcher {
    network: Arc<dyn NetworkClient>,
    interval_to_send: Duration,
    lanes: DashMap<Account, Arc<PacedSequencer>>,
    cancel: CancellationToken,
    logger: Dispatch,
}

/// Builder validating [`BatchDispatcher`] collaborators
pub struct BatchDispatcherBuilder {
    network: Option<Arc<dyn NetworkClient>>,
    interval_to_send: Duration,
    logger: Dispatch,
}

impl BatchDispatcherBuilder {
    pub fn network_client(mut self, network: Arc<dyn NetworkClient>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn interval_to_send(mut self, interval: Duration) -> Self {
        self.interval_to_send = interval;
        self
    }

    pub fn logger(mut self, logger: Dispatch) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> SequencerResult<BatchDispatcher> {
        let network = self.network.ok_or(SequencerError::NilProxy)?;
        check_interval("interval_to_send", self.interval_to_send)?;

        Ok(BatchDispatcher {
            network,
            interval_to_send: self.interval_to_send,
            lanes: DashMap::new(),
            cancel: CancellationToken::new(),
            logger: self.logger,
        })
    }
}

impl BatchDispatcher {
    pub fn builder() -> BatchDispatcherBuilder {
        BatchDispatcherBuilder {
            network: None,
            interval_to_send: crate::config::MIN_INTERVAL,
            logger: Dispatch::none(),
        }
    }

    /// Assign sequential nonces and a gas price floor to every transaction.
    ///
    /// One chain nonce fetch per sender; each sender's transactions get a
    /// contiguous range in the order given, even when other batches for the
    /// same sender run concurrently. Nothing is reserved unless every fetch
    /// succeeds.
    pub async fn apply_nonce_and_gas_price(&self, txs: &mut [Transaction]) -> SequencerResult<()> {
        if txs.is_empty() {
            return Err(SequencerError::NilTransaction);
        }

        let mut prepared = Vec::new();
        for (account, indices) in group_by_sender(txs) {
            check_account(&account)?;
            let lane = self.lane(&account)?;
            let (chain_nonce, min_gas_price) = lane.prepare().await?;
            prepared.push((lane, indices, chain_nonce, min_gas_price));
        }

        for (lane, indices, chain_nonce, min_gas_price) in prepared {
            let start = lane.reserve(chain_nonce, indices.len() as u64);
            for (offset, index) in indices.into_iter().enumerate() {
                let tx = &mut txs[index];
                tx.nonce = start + offset as u64;
                tx.gas_price = min_gas_price.max(tx.gas_price);
            }
        }

        Ok(())
    }

    /// Schedule every transaction and wait for its outcome.
    ///
    /// Results line up with the input. A nonce already scheduled for its
    /// sender fails on its own without affecting the rest of the batch.
    pub async fn send_transactions(
        &self,
        txs: Vec<Transaction>,
    ) -> SequencerResult<Vec<SequencerResult<String>>> {
        if txs.is_empty() {
            return Err(SequencerError::NilTransaction);
        }

        let total = txs.len();
        let groups = group_by_sender(&txs);
        let mut slots: Vec<Option<Transaction>> = txs.into_iter().map(Some).collect();
        let mut results: Vec<Option<SequencerResult<String>>> = (0..total).map(|_| None).collect();

        let mut dispatches = Vec::new();
        for (account, indices) in groups {
            let batch: Vec<Transaction> = indices
                .iter()
                .filter_map(|&index| slots[index].take())
                .collect();

            if account.is_empty() {
                for index in indices {
                    results[index] = Some(Err(SequencerError::NilAccount));
                }
                continue;
            }

            let lane = self.lane(&account)?;
            dispatches.push(async move {
                lane.prune_confirmed().await;
                (indices, lane.dispatch(batch).await)
            });
        }

        for (indices, outcomes) in join_all(dispatches).await {
            for (index, outcome) in indices.into_iter().zip(outcomes) {
                results[index] = Some(outcome);
            }
        }

        debug!("Dispatched batch of {} transactions", total);
        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(SequencerError::NilTransaction)))
            .collect())
    }

    /// Number of nonces scheduled and not yet confirmed for an account
    pub fn scheduled_count(&self, account: &Account) -> usize {
        self.lanes
            .get(account)
            .map(|lane| lane.scheduled_count())
            .unwrap_or(0)
    }

    /// Cancel every queued send; sends already handed to the network keep their outcome
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("Batch dispatcher closing");
        }
        self.cancel.cancel();
    }

    fn lane(&self, account: &Account) -> SequencerResult<Arc<PacedSequencer>> {
        match self.lanes.entry(account.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let lane = PacedSequencer::spawn(
                    self.network.clone(),
                    account.clone(),
                    self.interval_to_send,
                    self.cancel.child_token(),
                    self.logger.clone(),
                )?;
                entry.insert(lane.clone());
                Ok(lane)
            }
        }
    }
}

impl Drop for BatchDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Indices of each sender's transactions, senders in first-seen order
fn group_by_sender(txs: &[Transaction]) -> Vec<(Account, Vec<usize>)> {
    let mut groups: Vec<(Account, Vec<usize>)> = Vec::new();
    for (index, tx) in txs.iter().enumerate() {
        match groups.iter_mut().find(|(account, _)| *account == tx.sender) {
            Some((_, indices)) => indices.push(index),
            None => groups.push((tx.sender.clone(), vec![index])),
        }
    }
    groups
}
