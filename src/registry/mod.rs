//! Account registry and background reconciliation

mod sequencers;

pub use sequencers::{SequencerRegistry, SequencerRegistryBuilder};
