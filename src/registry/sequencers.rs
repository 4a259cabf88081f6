//! Registry mapping accounts to their sequencers

use crate::chain::NetworkClient;
use crate::config::{check_interval, SequencerConfig};
use crate::error::{SequencerError, SequencerResult};
use crate::sequencer::{check_account, AddressSequencer, SequencerFactory};
use crate::tx::{Account, Transaction, TransactionArgs};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, info_span, warn, Dispatch, Instrument};

type Sequencers = Arc<DashMap<Account, Arc<dyn AddressSequencer>>>;

/// Entry point for nonce assignment and sending across accounts
pub struct SequencerRegistry {
    network: Arc<dyn NetworkClient>,
    factory: Arc<dyn SequencerFactory>,
    sequencers: Sequencers,
    cancel: CancellationToken,
}

/// Builder validating [`SequencerRegistry`] collaborators
pub struct SequencerRegistryBuilder {
    network: Option<Arc<dyn NetworkClient>>,
    factory: Option<Arc<dyn SequencerFactory>>,
    config: Option<SequencerConfig>,
    interval_to_resend: Duration,
    logger: Dispatch,
}

impl SequencerRegistryBuilder {
    pub fn network_client(mut self, network: Arc<dyn NetworkClient>) -> Self {
        self.network = Some(network);
        self
    }

    /// Use an explicit factory; takes precedence over the configured strategy
    pub fn factory(mut self, factory: Arc<dyn SequencerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Take the strategy and resend interval from configuration
    pub fn config(mut self, config: &SequencerConfig) -> Self {
        self.interval_to_resend = config.interval_to_resend();
        self.config = Some(config.clone());
        self
    }

    pub fn interval_to_resend(mut self, interval: Duration) -> Self {
        self.interval_to_resend = interval;
        self
    }

    pub fn logger(mut self, logger: Dispatch) -> Self {
        self.logger = logger;
        self
    }

    /// Validate and start the reconciliation loop. Must run inside a tokio runtime.
    pub fn build(self) -> SequencerResult<SequencerRegistry> {
        let network = self.network.ok_or(SequencerError::NilProxy)?;
        check_interval("interval_to_resend", self.interval_to_resend)?;

        let factory = match (self.factory, &self.config) {
            (Some(factory), _) => factory,
            (None, Some(config)) => config.strategy.factory(config)?,
            (None, None) => return Err(SequencerError::NilSequencerFactory),
        };

        let sequencers: Sequencers = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let reconciler = Reconciler {
            sequencers: sequencers.clone(),
            interval_to_resend: self.interval_to_resend,
            cancel: cancel.clone(),
        };
        tokio::spawn(
            reconciler
                .run()
                .instrument(info_span!("reconcile_loop"))
                .with_subscriber(self.logger),
        );

        Ok(SequencerRegistry {
            network,
            factory,
            sequencers,
            cancel,
        })
    }
}

impl SequencerRegistry {
    pub fn builder() -> SequencerRegistryBuilder {
        SequencerRegistryBuilder {
            network: None,
            factory: None,
            config: None,
            interval_to_resend: SequencerConfig::default().interval_to_resend(),
            logger: Dispatch::none(),
        }
    }

    /// Write the next nonce and a gas price floor for `account` into `args`
    pub async fn apply_nonce_and_gas_price(
        &self,
        account: &Account,
        args: &mut TransactionArgs,
    ) -> SequencerResult<()> {
        self.sequencer(account)?.apply_nonce(args).await
    }

    /// Send a transaction through its sender's sequencer
    pub async fn send_transaction(&self, tx: Transaction) -> SequencerResult<String> {
        let sequencer = self.sequencer(&tx.sender)?;
        sequencer.send_transaction(tx).await
    }

    /// Forget in-flight state so the next nonce for `account` comes from the chain
    pub async fn drop_transactions(&self, account: &Account) -> SequencerResult<()> {
        self.sequencer(account)?.drop_transactions().await;
        Ok(())
    }

    /// Transactions tracked as unconfirmed for `account`
    pub async fn pending_count(&self, account: &Account) -> usize {
        let sequencer = self.sequencers.get(account).map(|s| s.value().clone());
        match sequencer {
            Some(sequencer) => sequencer.pending_count().await,
            None => 0,
        }
    }

    pub fn known_accounts(&self) -> Vec<Account> {
        self.sequencers.iter().map(|s| s.key().clone()).collect()
    }

    /// Stop the reconciliation loop and any per-account workers
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        for sequencer in self.sequencers.iter() {
            sequencer.value().close();
        }
        info!("Sequencer registry closed");
    }

    fn sequencer(&self, account: &Account) -> SequencerResult<Arc<dyn AddressSequencer>> {
        check_account(account)?;

        let sequencer = match self.sequencers.entry(account.clone()) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let sequencer = self.factory.create(self.network.clone(), account.clone())?;
                entry.insert(sequencer.clone());
                sequencer
            }
        };

        debug!("Tracking new account {}", account);
        crate::metrics::record_tracked_accounts(self.sequencers.len());
        Ok(sequencer)
    }
}

impl Drop for SequencerRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background task resending unconfirmed transactions for every known account
struct Reconciler {
    sequencers: Sequencers,
    interval_to_resend: Duration,
    cancel: CancellationToken,
}

impl Reconciler {
    async fn run(self) {
        let mut ticker = interval_at(
            Instant::now() + self.interval_to_resend,
            self.interval_to_resend,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Reconciliation loop started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = ticker.tick() => self.reconcile_all().await,
            }
        }

        info!("Reconciliation loop stopped");
    }

    async fn reconcile_all(&self) {
        let snapshot: Vec<Arc<dyn AddressSequencer>> =
            self.sequencers.iter().map(|s| s.value().clone()).collect();

        let outcomes = join_all(snapshot.iter().map(|s| s.resend_if_required())).await;

        for (sequencer, outcome) in snapshot.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!("Reconciliation failed for {}: {}", sequencer.account(), e);
                crate::metrics::record_reconcile_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::stub::{make_transactions, StubNetwork};
    use crate::chain::MockNetworkClient;
    use crate::config::SequencingStrategy;
    use crate::sequencer::MultiTxSequencer;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;

    const CHAIN_NONCE: u64 = 664;
    const ACCOUNT: &str = "erd1zptg3eu7uw0qvzhnu009lwxupcn6ntjxptj5gaxt8curhxjqr9tsqpsnht";
    const RESEND: Duration = Duration::from_secs(2);

    fn registry(network: Arc<StubNetwork>) -> SequencerRegistry {
        SequencerRegistry::builder()
            .network_client(network)
            .config(&SequencerConfig::default())
            .interval_to_resend(RESEND)
            .build()
            .unwrap()
    }

    async fn next_nonce(registry: &SequencerRegistry, account: &Account) -> u64 {
        let mut args = TransactionArgs::default();
        registry
            .apply_nonce_and_gas_price(account, &mut args)
            .await
            .unwrap();
        args.nonce
    }

    async fn send_batch(registry: &SequencerRegistry, account: &Account, count: usize) {
        for _ in 0..count {
            let mut args = TransactionArgs::default();
            registry
                .apply_nonce_and_gas_price(account, &mut args)
                .await
                .unwrap();
            let tx = Transaction::from_args(account.clone(), args, "sig");
            registry.send_transaction(tx).await.unwrap();
        }
    }

    /// Sequencer whose reconciliation always fails
    struct BrokenSequencer(Account);

    #[async_trait]
    impl AddressSequencer for BrokenSequencer {
        fn account(&self) -> &Account {
            &self.0
        }

        async fn apply_nonce(&self, _args: &mut TransactionArgs) -> SequencerResult<()> {
            Ok(())
        }

        async fn send_transaction(&self, _tx: Transaction) -> SequencerResult<String> {
            Ok(String::new())
        }

        async fn resend_if_required(&self) -> SequencerResult<()> {
            Err(SequencerError::InvalidValue("broken".to_string()))
        }

        async fn drop_transactions(&self) {}

        async fn pending_count(&self) -> usize {
            0
        }
    }

    /// Hands "broken" a failing sequencer and everyone else a multi one
    struct MixedFactory;

    impl SequencerFactory for MixedFactory {
        fn create(
            &self,
            network: Arc<dyn NetworkClient>,
            account: Account,
        ) -> SequencerResult<Arc<dyn AddressSequencer>> {
            if account.as_str() == "broken" {
                return Ok(Arc::new(BrokenSequencer(account)));
            }
            Ok(Arc::new(MultiTxSequencer::new(
                network,
                account,
                Duration::from_secs(60),
            )?))
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let network = Arc::new(StubNetwork::with_nonce(0));

        assert!(matches!(
            SequencerRegistry::builder().config(&SequencerConfig::default()).build(),
            Err(SequencerError::NilProxy)
        ));
        assert!(matches!(
            SequencerRegistry::builder().network_client(network.clone()).build(),
            Err(SequencerError::NilSequencerFactory)
        ));
        assert!(matches!(
            SequencerRegistry::builder()
                .network_client(network)
                .config(&SequencerConfig::default())
                .interval_to_resend(Duration::from_millis(500))
                .build(),
            Err(SequencerError::InvalidValue(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_nonce_starts_at_chain_nonce() {
        let network = Arc::new(StubNetwork::with_nonce(CHAIN_NONCE));
        let registry = registry(network.clone());
        let account = Account::new(ACCOUNT);

        assert_eq!(next_nonce(&registry, &account).await, CHAIN_NONCE);
        assert_eq!(next_nonce(&registry, &account).await, CHAIN_NONCE + 1);
        assert_eq!(registry.known_accounts(), vec![account]);
    }

    #[tokio::test]
    async fn test_empty_account_is_rejected() {
        let registry = registry(Arc::new(StubNetwork::with_nonce(0)));
        let mut args = TransactionArgs::default();

        assert!(matches!(
            registry
                .apply_nonce_and_gas_price(&Account::default(), &mut args)
                .await,
            Err(SequencerError::NilAccount)
        ));
        let tx = make_transactions(&Account::default(), 1, 0).remove(0);
        assert!(matches!(
            registry.send_transaction(tx).await,
            Err(SequencerError::NilAccount)
        ));
        assert!(matches!(
            registry.drop_transactions(&Account::default()).await,
            Err(SequencerError::NilAccount)
        ));
        assert!(registry.known_accounts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_resends_what_chain_has_not_seen() {
        let network = Arc::new(StubNetwork::with_nonce(CHAIN_NONCE));
        let registry = registry(network.clone());
        let account = Account::new(ACCOUNT);

        send_batch(&registry, &account, 5).await;
        assert_eq!(registry.pending_count(&account).await, 5);

        // One transaction got in
        network.set_nonce(CHAIN_NONCE + 1);
        tokio::time::sleep(RESEND + Duration::from_millis(100)).await;

        let sent = network.sent();
        assert_eq!(sent.len(), 6);
        let resent: Vec<u64> = sent[5].iter().map(|tx| tx.nonce).collect();
        assert_eq!(resent, (CHAIN_NONCE + 1..CHAIN_NONCE + 5).collect::<Vec<u64>>());
        assert_eq!(registry.pending_count(&account).await, 4);

        // All of them got in
        network.set_nonce(CHAIN_NONCE + 5);
        tokio::time::sleep(RESEND).await;

        assert_eq!(network.sent().len(), 6);
        assert_eq!(registry.pending_count(&account).await, 0);
    }

    #[tokio::test]
    async fn test_send_error_keeps_network_cause() {
        #[derive(Debug, thiserror::Error)]
        #[error("gateway unreachable")]
        struct GatewayDown;

        let mut network = MockNetworkClient::new();
        network
            .expect_send_transaction()
            .times(1)
            .returning(|_| Err(Box::new(GatewayDown)));

        let registry = SequencerRegistry::builder()
            .network_client(Arc::new(network))
            .config(&SequencerConfig::default())
            .build()
            .unwrap();
        let account = Account::new(ACCOUNT);
        let tx = make_transactions(&account, 1, 0).remove(0);

        let err = registry.send_transaction(tx).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.network_cause().unwrap().downcast_ref::<GatewayDown>().is_some());
        // Still tracked for the next reconciliation
        assert_eq!(registry.pending_count(&account).await, 1);
    }

    #[tokio::test]
    async fn test_drop_rederives_nonce_from_chain() {
        let network = Arc::new(StubNetwork::with_nonce(CHAIN_NONCE));
        let registry = registry(network.clone());
        let account = Account::new(ACCOUNT);

        send_batch(&registry, &account, 3).await;
        registry.drop_transactions(&account).await.unwrap();

        assert_eq!(registry.pending_count(&account).await, 0);
        assert_eq!(next_nonce(&registry, &account).await, CHAIN_NONCE);
        assert_eq!(network.get_account_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_reconciliation() {
        let network = Arc::new(StubNetwork::with_nonce(CHAIN_NONCE));
        let registry = registry(network.clone());
        let account = Account::new(ACCOUNT);

        send_batch(&registry, &account, 1).await;
        registry.close();
        registry.close();

        tokio::time::sleep(RESEND * 3).await;
        assert_eq!(network.sent().len(), 1);
        assert_eq!(network.get_account_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_account_does_not_block_others() {
        let network = Arc::new(StubNetwork::with_nonce(CHAIN_NONCE));
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();

        let registry = SequencerRegistry::builder()
            .network_client(network.clone())
            .factory(Arc::new(MixedFactory))
            .interval_to_resend(RESEND)
            .logger(Dispatch::new(subscriber))
            .build()
            .unwrap();

        let healthy = Account::new(ACCOUNT);
        let broken = Account::new("broken");
        next_nonce(&registry, &broken).await;
        send_batch(&registry, &healthy, 2).await;

        tokio::time::sleep(RESEND + Duration::from_millis(100)).await;

        let sent = network.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].len(), 2);
        assert!(logs.contents().contains("Reconciliation failed for broken"));
    }

    #[tokio::test]
    async fn test_single_strategy_from_config() {
        let network = Arc::new(StubNetwork::with_nonce(CHAIN_NONCE));
        let config = SequencerConfig {
            strategy: SequencingStrategy::Single,
            ..Default::default()
        };
        let registry = SequencerRegistry::builder()
            .network_client(network.clone())
            .config(&config)
            .build()
            .unwrap();
        let account = Account::new(ACCOUNT);

        assert_eq!(next_nonce(&registry, &account).await, CHAIN_NONCE);
        assert_eq!(next_nonce(&registry, &account).await, CHAIN_NONCE);
        assert_eq!(network.get_account_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_strategy_lanes_close_with_registry() {
        let network = Arc::new(StubNetwork::with_nonce(CHAIN_NONCE));
        let config = SequencerConfig {
            strategy: SequencingStrategy::Paced,
            ..Default::default()
        };
        let registry = SequencerRegistry::builder()
            .network_client(network.clone())
            .config(&config)
            .build()
            .unwrap();
        let account = Account::new(ACCOUNT);

        assert_eq!(next_nonce(&registry, &account).await, CHAIN_NONCE);
        assert_eq!(next_nonce(&registry, &account).await, CHAIN_NONCE + 1);

        registry.close();
        let tx = make_transactions(&account, 1, CHAIN_NONCE).remove(0);
        let err = registry.send_transaction(tx).await.unwrap_err();
        assert!(err.is_shutdown());
        assert!(network.sent().is_empty());
    }
}
