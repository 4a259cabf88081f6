//! Nonce Sequencer
//!
//! Hands out per-account transaction nonces and keeps sent transactions
//! moving until the chain confirms them:
//! 1. Callers ask the [`SequencerRegistry`] for a nonce and gas price floor
//! 2. Signed transactions are sent through the same registry
//! 3. A background loop compares tracked transactions with the chain nonce
//!    and resends whatever has not been included yet
//!
//! Three strategies plug into the registry through [`SequencerFactory`]:
//! many transactions in flight, a single fee-bumped transaction, or a paced
//! lane. [`BatchDispatcher`] drives paced lanes directly for batch workloads.

pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod sequencer;
pub mod tx;

pub use chain::{AccountInfo, NetworkClient, NetworkConfig};
pub use config::{SequencerConfig, SequencingStrategy};
pub use dispatch::{BatchDispatcher, PacedSequencerFactory};
pub use error::{SequencerError, SequencerResult};
pub use registry::SequencerRegistry;
pub use sequencer::{AddressSequencer, SequencerFactory};
pub use tx::{Account, Transaction, TransactionArgs};
