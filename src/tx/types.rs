//! Account and transaction records
//!
//! The sequencing engine only ever reads or writes `nonce` and `gas_price`.
//! Every other field is carried through untouched to the network client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier of a chain account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Account(String);

impl Account {
    /// Wrap an already canonical account string
    pub fn new(canonical: impl Into<String>) -> Self {
        Self(canonical.into())
    }

    /// Build an account from a raw public key
    pub fn from_bytes(pubkey: &[u8]) -> Self {
        Self(hex::encode(pubkey))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty canonical form stands for an absent account
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Account {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Account {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Arguments used to build a transaction before signing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionArgs {
    pub nonce: u64,
    /// Caller supplied floor; raised to at least the network minimum
    pub gas_price: u64,
    pub gas_limit: u64,
    pub receiver: String,
    pub value: String,
    pub data: Vec<u8>,
    pub chain_id: String,
    pub version: u32,
}

/// A signed transaction ready to be propagated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub sender: Account,
    pub receiver: String,
    pub value: String,
    pub data: Vec<u8>,
    pub chain_id: String,
    pub version: u32,
    pub signature: String,
}

impl Transaction {
    /// Assemble a transaction from prepared arguments and an external signature
    pub fn from_args(sender: Account, args: TransactionArgs, signature: impl Into<String>) -> Self {
        Self {
            nonce: args.nonce,
            gas_price: args.gas_price,
            gas_limit: args.gas_limit,
            sender,
            receiver: args.receiver,
            value: args.value,
            data: args.data,
            chain_id: args.chain_id,
            version: args.version,
            signature: signature.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_from_bytes_is_hex() {
        let account = Account::from_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(account.as_str(), "deadbeef");
        assert!(!account.is_empty());
        assert!(Account::default().is_empty());
    }

    #[test]
    fn test_from_args_keeps_assigned_fields() {
        let args = TransactionArgs {
            nonce: 664,
            gas_price: 1_000_000_000,
            gas_limit: 50_000,
            receiver: "receiver".to_string(),
            value: "1".to_string(),
            ..Default::default()
        };
        let tx = Transaction::from_args(Account::new("sender"), args, "sig");
        assert_eq!(tx.nonce, 664);
        assert_eq!(tx.gas_price, 1_000_000_000);
        assert_eq!(tx.sender.as_str(), "sender");
        assert_eq!(tx.signature, "sig");
    }
}
