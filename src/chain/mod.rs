//! Chain module - the network collaborator consumed by the sequencers
//!
//! The sequencing engine never talks HTTP itself. Everything it needs from
//! the chain goes through [`NetworkClient`]:
//! - Account nonce lookups
//! - Single and bulk transaction propagation
//! - Network configuration (minimum gas price)

#[cfg(test)]
pub(crate) mod stub;

use crate::error::BoxError;
use crate::tx::{Account, Transaction};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Account state as reported by the network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// First nonce the chain has not seen yet
    pub nonce: u64,
    pub balance: String,
}

/// Network wide parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub min_gas_price: u64,
    pub min_gas_limit: u64,
    pub chain_id: String,
}

/// Gateway to the chain used by every sequencing strategy
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Fetch the current nonce and balance of an account
    async fn get_account(&self, account: &Account) -> Result<AccountInfo, BoxError>;

    /// Propagate one transaction, returning its hash
    async fn send_transaction(&self, tx: &Transaction) -> Result<String, BoxError>;

    /// Propagate many transactions in one call; hashes keep the input order
    async fn send_transactions(&self, txs: &[Transaction]) -> Result<Vec<String>, BoxError>;

    /// Fetch the network configuration
    async fn get_network_config(&self) -> Result<NetworkConfig, BoxError>;
}
