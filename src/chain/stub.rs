//! In-memory network used by the unit tests

use super::{AccountInfo, NetworkClient, NetworkConfig};
use crate::error::BoxError;
use crate::tx::{Account, Transaction};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(crate) struct StubError(pub String);

/// Network whose chain nonce is set by the test and which records every send
#[derive(Default)]
pub(crate) struct StubNetwork {
    pub chain_nonce: AtomicU64,
    pub min_gas_price: AtomicU64,
    pub get_account_calls: AtomicUsize,
    pub network_config_calls: AtomicUsize,
    pub fail_get_account: AtomicBool,
    pub fail_sends: AtomicBool,
    pub send_delay: Option<Duration>,
    /// Every send call, single sends recorded as one element batches
    sent: Mutex<Vec<Vec<Transaction>>>,
}

impl StubNetwork {
    pub fn with_nonce(nonce: u64) -> Self {
        let stub = Self::default();
        stub.chain_nonce.store(nonce, Ordering::SeqCst);
        stub.min_gas_price.store(1_000_000_000, Ordering::SeqCst);
        stub
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.chain_nonce.store(nonce, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Vec<Transaction>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn get_account_calls(&self) -> usize {
        self.get_account_calls.load(Ordering::SeqCst)
    }

    pub fn network_config_calls(&self) -> usize {
        self.network_config_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkClient for StubNetwork {
    async fn get_account(&self, _account: &Account) -> Result<AccountInfo, BoxError> {
        self.get_account_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_get_account.load(Ordering::SeqCst) {
            return Err(Box::new(StubError("account lookup failed".to_string())));
        }
        Ok(AccountInfo {
            nonce: self.chain_nonce.load(Ordering::SeqCst),
            balance: "0".to_string(),
        })
    }

    async fn send_transaction(&self, tx: &Transaction) -> Result<String, BoxError> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().unwrap().push(vec![tx.clone()]);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Box::new(StubError("send failed".to_string())));
        }
        Ok(tx.nonce.to_string())
    }

    async fn send_transactions(&self, txs: &[Transaction]) -> Result<Vec<String>, BoxError> {
        self.sent.lock().unwrap().push(txs.to_vec());
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Box::new(StubError("bulk send failed".to_string())));
        }
        Ok(txs.iter().map(|tx| tx.nonce.to_string()).collect())
    }

    async fn get_network_config(&self) -> Result<NetworkConfig, BoxError> {
        self.network_config_calls.fetch_add(1, Ordering::SeqCst);
        Ok(NetworkConfig {
            min_gas_price: self.min_gas_price.load(Ordering::SeqCst),
            min_gas_limit: 50_000,
            chain_id: "T".to_string(),
        })
    }
}

pub(crate) fn make_transactions(sender: &Account, count: usize, start_nonce: u64) -> Vec<Transaction> {
    (0..count as u64)
        .map(|i| Transaction {
            nonce: start_nonce + i,
            gas_price: 1_000_000_000,
            gas_limit: 50_000,
            sender: sender.clone(),
            receiver: sender.to_string(),
            value: "1".to_string(),
            chain_id: "T".to_string(),
            version: 2,
            signature: "sig".to_string(),
            ..Default::default()
        })
        .collect()
}
