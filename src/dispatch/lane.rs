//! Paced per-account lane
//!
//! Nonces are reserved from an atomic counter seeded by the chain nonce, so
//! concurrent batches for the same account get disjoint contiguous ranges.
//! Sends go through a worker task that releases at most one transaction per
//! interval tick, lowest nonce first.

use crate::chain::NetworkClient;
use crate::error::{SequencerError, SequencerResult};
use crate::sequencer::{check_account, fetch_chain_nonce, AddressSequencer};
use crate::tx::{Account, Transaction, TransactionArgs};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, info_span, warn, Dispatch, Instrument};

const STRATEGY: &str = "paced";

/// State of a scheduled nonce. Queued and sending slots carry the ticket of
/// the job that owns them, so a stale job never releases a newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Queued(u64),
    Sending(u64),
    Dispatched(Transaction),
}

struct QueuedSend {
    ticket: u64,
    tx: Transaction,
    reply: oneshot::Sender<SequencerResult<String>>,
}

struct Scheduled {
    nonce: u64,
    ticket: u64,
    reply: oneshot::Receiver<SequencerResult<String>>,
}

/// Releases still-queued slots of a dispatch whose caller went away
struct ReleaseQueued<'a> {
    scheduled: &'a DashMap<u64, Slot>,
    tickets: Vec<(u64, u64)>,
}

impl Drop for ReleaseQueued<'_> {
    fn drop(&mut self) {
        for &(nonce, ticket) in &self.tickets {
            self.scheduled
                .remove_if(&nonce, |_, slot| *slot == Slot::Queued(ticket));
        }
    }
}

// Min-heap on nonce
impl Ord for QueuedSend {
    fn cmp(&self, other: &Self) -> Ordering {
        other.tx.nonce.cmp(&self.tx.nonce)
    }
}

impl PartialOrd for QueuedSend {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedSend {
    fn eq(&self, other: &Self) -> bool {
        self.tx.nonce == other.tx.nonce
    }
}

impl Eq for QueuedSend {}

/// Rate limited sequencer for one account
pub struct PacedSequencer {
    account: Account,
    network: Arc<dyn NetworkClient>,
    /// Next nonce to reserve
    next_nonce: AtomicU64,
    next_ticket: AtomicU64,
    /// Nonces handed to the worker and not yet confirmed by the chain
    scheduled: Arc<DashMap<u64, Slot>>,
    min_gas_price: OnceCell<u64>,
    jobs: mpsc::UnboundedSender<QueuedSend>,
    cancel: CancellationToken,
}

impl PacedSequencer {
    /// Create the lane and start its worker. Must run inside a tokio runtime.
    pub fn spawn(
        network: Arc<dyn NetworkClient>,
        account: Account,
        interval_to_send: Duration,
        cancel: CancellationToken,
        logger: Dispatch,
    ) -> SequencerResult<Arc<Self>> {
        check_account(&account)?;

        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let scheduled = Arc::new(DashMap::new());

        let worker = LaneWorker {
            account: account.clone(),
            network: network.clone(),
            scheduled: scheduled.clone(),
            jobs: jobs_rx,
            queue: BinaryHeap::new(),
            interval_to_send,
            cancel: cancel.clone(),
        };
        let span = info_span!("paced_worker", account = %account);
        tokio::spawn(worker.run().instrument(span).with_subscriber(logger));

        Ok(Arc::new(Self {
            account,
            network,
            next_nonce: AtomicU64::new(0),
            next_ticket: AtomicU64::new(0),
            scheduled,
            min_gas_price: OnceCell::new(),
            jobs,
            cancel,
        }))
    }

    /// Fetch what a reservation needs from the network, without reserving anything
    pub(crate) async fn prepare(&self) -> SequencerResult<(u64, u64)> {
        let chain_nonce = fetch_chain_nonce(self.network.as_ref(), &self.account).await?;
        let min_gas_price = *self
            .min_gas_price
            .get_or_try_init(|| async {
                self.network
                    .get_network_config()
                    .await
                    .map(|config| config.min_gas_price)
                    .map_err(SequencerError::Network)
            })
            .await?;

        self.prune_scheduled(chain_nonce);
        Ok((chain_nonce, min_gas_price))
    }

    /// Reserve `count` contiguous nonces, returning the first one
    pub(crate) fn reserve(&self, chain_nonce: u64, count: u64) -> u64 {
        self.next_nonce.fetch_max(chain_nonce, AtomicOrdering::SeqCst);
        let start = self.next_nonce.fetch_add(count, AtomicOrdering::SeqCst);

        debug!(
            "Reserved nonces {}..{} for {}",
            start,
            start + count,
            self.account
        );
        crate::metrics::record_nonce_assigned(STRATEGY, count);
        start
    }

    /// Schedule transactions and wait for each outcome, in input order
    ///
    /// Dropping the returned future releases every nonce the worker has not
    /// started sending, so the same transactions can be scheduled again.
    pub(crate) async fn dispatch(&self, txs: Vec<Transaction>) -> Vec<SequencerResult<String>> {
        let waiting: Vec<_> = txs.into_iter().map(|tx| self.schedule(tx)).collect();
        let _release = ReleaseQueued {
            scheduled: &self.scheduled,
            tickets: waiting
                .iter()
                .filter_map(|outcome| outcome.as_ref().ok())
                .map(|s| (s.nonce, s.ticket))
                .collect(),
        };

        let mut results = Vec::with_capacity(waiting.len());
        for outcome in waiting {
            let result = match outcome {
                Ok(scheduled) => scheduled
                    .reply
                    .await
                    .unwrap_or_else(|_| Err(self.cancelled())),
                Err(e) => Err(e),
            };
            results.push(result);
        }
        results
    }

    /// Drop dispatched nonces the chain has passed. Failures only delay pruning.
    pub(crate) async fn prune_confirmed(&self) {
        match fetch_chain_nonce(self.network.as_ref(), &self.account).await {
            Ok(chain_nonce) => self.prune_scheduled(chain_nonce),
            Err(e) => warn!("Skipping prune for {}: {}", self.account, e),
        }
    }

    fn schedule(&self, tx: Transaction) -> SequencerResult<Scheduled> {
        if self.cancel.is_cancelled() {
            crate::metrics::record_tx_cancelled();
            return Err(self.cancelled());
        }

        let nonce = tx.nonce;
        let ticket = self.next_ticket.fetch_add(1, AtomicOrdering::SeqCst);
        match self.scheduled.entry(nonce) {
            Entry::Occupied(_) => {
                crate::metrics::record_tx_rejected("already_scheduled");
                return Err(SequencerError::AlreadyScheduled {
                    account: self.account.to_string(),
                    nonce,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::Queued(ticket));
            }
        }

        let (reply, reply_rx) = oneshot::channel();
        if self.jobs.send(QueuedSend { ticket, tx, reply }).is_err() {
            self.scheduled
                .remove_if(&nonce, |_, slot| *slot == Slot::Queued(ticket));
            crate::metrics::record_tx_cancelled();
            return Err(self.cancelled());
        }
        Ok(Scheduled {
            nonce,
            ticket,
            reply: reply_rx,
        })
    }

    fn prune_scheduled(&self, chain_nonce: u64) {
        self.scheduled.retain(|nonce, slot| {
            *nonce >= chain_nonce || !matches!(slot, Slot::Dispatched(_))
        });
    }

    fn cancelled(&self) -> SequencerError {
        SequencerError::Cancelled {
            account: self.account.to_string(),
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.len()
    }
}

#[async_trait]
impl AddressSequencer for PacedSequencer {
    fn account(&self) -> &Account {
        &self.account
    }

    async fn apply_nonce(&self, args: &mut TransactionArgs) -> SequencerResult<()> {
        let (chain_nonce, min_gas_price) = self.prepare().await?;
        args.nonce = self.reserve(chain_nonce, 1);
        args.gas_price = min_gas_price.max(args.gas_price);
        Ok(())
    }

    async fn send_transaction(&self, tx: Transaction) -> SequencerResult<String> {
        self.dispatch(vec![tx])
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(self.cancelled()))
    }

    async fn resend_if_required(&self) -> SequencerResult<()> {
        let chain_nonce = fetch_chain_nonce(self.network.as_ref(), &self.account).await?;
        self.prune_scheduled(chain_nonce);

        let mut unconfirmed: Vec<Transaction> = self
            .scheduled
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Dispatched(tx) => Some(tx.clone()),
                _ => None,
            })
            .collect();
        if unconfirmed.is_empty() {
            return Ok(());
        }
        unconfirmed.sort_by_key(|tx| tx.nonce);

        self.network
            .send_transactions(&unconfirmed)
            .await
            .map_err(SequencerError::Network)?;

        debug!(
            "Resent {} dispatched transactions for {}",
            unconfirmed.len(),
            self.account
        );
        crate::metrics::record_tx_resent(STRATEGY, unconfirmed.len());
        Ok(())
    }

    async fn drop_transactions(&self) {
        self.scheduled
            .retain(|_, slot| !matches!(slot, Slot::Dispatched(_)));
        self.next_nonce.store(0, AtomicOrdering::SeqCst);
        info!("Reset nonce counter for {}, next batch reseeds from chain", self.account);
    }

    async fn pending_count(&self) -> usize {
        self.scheduled_count()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Background task releasing queued sends for one account
struct LaneWorker {
    account: Account,
    network: Arc<dyn NetworkClient>,
    scheduled: Arc<DashMap<u64, Slot>>,
    jobs: mpsc::UnboundedReceiver<QueuedSend>,
    queue: BinaryHeap<QueuedSend>,
    interval_to_send: Duration,
    cancel: CancellationToken,
}

impl LaneWorker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval_to_send);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Paced worker started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                job = self.jobs.recv() => match job {
                    Some(job) => self.queue.push(job),
                    None => break,
                },

                // The send itself is never raced against cancellation
                _ = ticker.tick(), if !self.queue.is_empty() => {
                    self.dispatch_next().await;
                }
            }
        }

        self.cancel_remaining();
    }

    /// Send the lowest queued job whose caller is still waiting
    async fn dispatch_next(&mut self) {
        let job = loop {
            let Some(job) = self.queue.pop() else {
                return;
            };
            if self.claim(&job) {
                break job;
            }
            debug!("Caller gone, skipping nonce {}", job.tx.nonce);
            self.release(job.tx.nonce, Slot::Queued(job.ticket));
        };
        let nonce = job.tx.nonce;

        let result = self
            .network
            .send_transaction(&job.tx)
            .await
            .map_err(SequencerError::Network);

        match &result {
            Ok(hash) => {
                if let Some(mut slot) = self.scheduled.get_mut(&nonce) {
                    if *slot == Slot::Sending(job.ticket) {
                        *slot = Slot::Dispatched(job.tx.clone());
                    }
                }
                debug!("Dispatched nonce {}: {}", nonce, hash);
                crate::metrics::record_tx_sent(STRATEGY);
            }
            Err(e) => {
                self.release(nonce, Slot::Sending(job.ticket));
                warn!("Dispatch of nonce {} failed: {}", nonce, e);
            }
        }

        let _ = job.reply.send(result);
    }

    /// Move the job's slot to sending, unless its caller released it
    fn claim(&self, job: &QueuedSend) -> bool {
        if job.reply.is_closed() {
            return false;
        }
        match self.scheduled.get_mut(&job.tx.nonce) {
            Some(mut slot) if *slot == Slot::Queued(job.ticket) => {
                *slot = Slot::Sending(job.ticket);
                true
            }
            _ => false,
        }
    }

    fn release(&self, nonce: u64, owned: Slot) {
        self.scheduled.remove_if(&nonce, |_, slot| *slot == owned);
    }

    fn cancel_remaining(&mut self) {
        self.jobs.close();
        while let Ok(job) = self.jobs.try_recv() {
            self.queue.push(job);
        }

        let cancelled = self.queue.len();
        let jobs: Vec<QueuedSend> = self.queue.drain().collect();
        for job in jobs {
            self.release(job.tx.nonce, Slot::Queued(job.ticket));
            crate::metrics::record_tx_cancelled();
            let _ = job.reply.send(Err(SequencerError::Cancelled {
                account: self.account.to_string(),
            }));
        }

        info!("Paced worker for {} stopped, cancelled {} queued sends", self.account, cancelled);
    }
}

/// Creates [`PacedSequencer`] lanes for the registry
#[derive(Clone)]
pub struct PacedSequencerFactory {
    interval_to_send: Duration,
    cancel: CancellationToken,
    logger: Dispatch,
}

impl PacedSequencerFactory {
    pub fn new(interval_to_send: Duration) -> SequencerResult<Self> {
        crate::config::check_interval("interval_to_send", interval_to_send)?;

        Ok(Self {
            interval_to_send,
            cancel: CancellationToken::new(),
            logger: Dispatch::none(),
        })
    }

    /// Route worker logs to the given subscriber
    pub fn with_logger(mut self, logger: Dispatch) -> Self {
        self.logger = logger;
        self
    }

    /// Stop every lane created by this factory
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl crate::sequencer::SequencerFactory for PacedSequencerFactory {
    fn create(
        &self,
        network: Arc<dyn NetworkClient>,
        account: Account,
    ) -> SequencerResult<Arc<dyn AddressSequencer>> {
        let lane = PacedSequencer::spawn(
            network,
            account,
            self.interval_to_send,
            self.cancel.child_token(),
            self.logger.clone(),
        )?;
        Ok(lane)
    }
}
