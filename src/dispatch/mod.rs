//! Paced batch dispatch
//!
//! [`BatchDispatcher`] fronts one [`PacedSequencer`] lane per sender. Lanes can
//! also be handed to the registry through [`PacedSequencerFactory`].

mod dispatcher;
mod lane;

pub use dispatcher::{BatchDispatcher, BatchDispatcherBuilder};
pub use lane::{PacedSequencer, PacedSequencerFactory};
