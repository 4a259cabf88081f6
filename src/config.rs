//! Configuration for the nonce sequencer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::dispatch::PacedSequencerFactory;
use crate::error::{SequencerError, SequencerResult};
use crate::sequencer::{MultiTxSequencerFactory, SequencerFactory, SingleTxSequencerFactory};
use crate::tx::GasRefetchPolicy;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Lowest accepted resend or send interval
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Which [`AddressSequencer`](crate::sequencer::AddressSequencer) the registry creates
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SequencingStrategy {
    #[default]
    Multi,
    Single,
    Paced,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub interval_to_resend_ms: u64,
    pub interval_to_send_ms: u64,
    pub strategy: SequencingStrategy,
    pub gas_price_refresh_secs: u64,
    pub gas_refetch_policy: GasRefetchPolicy,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            interval_to_resend_ms: 60_000,
            interval_to_send_ms: 1_000,
            strategy: SequencingStrategy::Multi,
            gas_price_refresh_secs: 60,
            gas_refetch_policy: GasRefetchPolicy::AfterBump,
        }
    }
}

impl SequencerConfig {
    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let config: SequencerConfig =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> SequencerResult<()> {
        check_interval("interval_to_resend", self.interval_to_resend())?;
        check_interval("interval_to_send", self.interval_to_send())?;
        if self.gas_price_refresh_secs == 0 {
            return Err(SequencerError::InvalidValue(
                "gas_price_refresh_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval_to_resend(&self) -> Duration {
        Duration::from_millis(self.interval_to_resend_ms)
    }

    pub fn interval_to_send(&self) -> Duration {
        Duration::from_millis(self.interval_to_send_ms)
    }

    pub fn gas_price_refresh(&self) -> Duration {
        Duration::from_secs(self.gas_price_refresh_secs)
    }
}

impl SequencingStrategy {
    /// Build the factory for this strategy
    pub fn factory(&self, config: &SequencerConfig) -> SequencerResult<Arc<dyn SequencerFactory>> {
        let factory: Arc<dyn SequencerFactory> = match self {
            SequencingStrategy::Multi => {
                Arc::new(MultiTxSequencerFactory::new(config.gas_price_refresh()))
            }
            SequencingStrategy::Single => {
                Arc::new(SingleTxSequencerFactory::new(config.gas_refetch_policy))
            }
            SequencingStrategy::Paced => {
                Arc::new(PacedSequencerFactory::new(config.interval_to_send())?)
            }
        };
        Ok(factory)
    }
}

pub(crate) fn check_interval(name: &str, interval: Duration) -> SequencerResult<()> {
    if interval < MIN_INTERVAL {
        return Err(SequencerError::InvalidValue(format!(
            "{} is {:?}, minimum is {:?}",
            name, interval, MIN_INTERVAL
        )));
    }
    Ok(())
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
