//! Transaction model and gas price handling shared by every sequencing strategy

mod gas;
mod types;

pub use gas::{GasPriceCache, GasRefetchPolicy};
pub use types::{Account, Transaction, TransactionArgs};
