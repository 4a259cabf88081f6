//! Gas price caching and refetch policies
//!
//! Fetching the network configuration on every nonce assignment costs one
//! round trip per transaction, so strategies keep the minimum gas price
//! around and decide per strategy when it must be refreshed.

use crate::chain::NetworkClient;
use crate::error::{SequencerError, SequencerResult};

use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// When the single transaction strategy refetches the network minimum gas price
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GasRefetchPolicy {
    /// While unset, and on the first nonce after a fee bump
    #[default]
    AfterBump,
    /// On every assignment
    Always,
    /// Only while no gas price is known
    WhenUnset,
}

impl GasRefetchPolicy {
    pub fn should_refetch(&self, current: u64, nonce: u64, nonce_at_last_bump: Option<u64>) -> bool {
        if current == 0 {
            return true;
        }
        match self {
            GasRefetchPolicy::Always => true,
            GasRefetchPolicy::WhenUnset => false,
            GasRefetchPolicy::AfterBump => {
                nonce_at_last_bump.map_or(false, |bumped| nonce == bumped.saturating_add(1))
            }
        }
    }
}

/// Minimum gas price remembered for a bounded time
#[derive(Debug)]
pub struct GasPriceCache {
    ttl: Duration,
    value: u64,
    fetched_at: Option<Instant>,
}

impl GasPriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            value: 0,
            fetched_at: None,
        }
    }

    pub fn current(&self) -> u64 {
        self.value
    }

    pub fn is_stale(&self) -> bool {
        self.fetched_at
            .map_or(true, |fetched| fetched.elapsed() >= self.ttl)
    }

    /// Refresh from the network when stale.
    ///
    /// A failed refresh keeps serving the previous value; it is only an error
    /// when no value was ever fetched.
    pub async fn refresh_if_stale(&mut self, network: &dyn NetworkClient) -> SequencerResult<u64> {
        if !self.is_stale() {
            return Ok(self.value);
        }

        match network.get_network_config().await {
            Ok(config) => {
                debug!("Refreshed minimum gas price: {}", config.min_gas_price);
                self.value = config.min_gas_price;
                self.fetched_at = Some(Instant::now());
                Ok(self.value)
            }
            Err(e) if self.value > 0 => {
                warn!("Failed to refresh gas price, keeping {}: {}", self.value, e);
                Ok(self.value)
            }
            Err(e) => Err(SequencerError::Network(e)),
        }
    }

    /// Raise a caller supplied gas price to the cached minimum
    pub fn floor(&self, requested: u64) -> u64 {
        self.value.max(requested)
    }
}
