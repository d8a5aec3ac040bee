//! Ledger node access
//!
//! The [`Network`] trait is the only way the account talks to the ledger.
//! [`HttpNetwork`] speaks the node's JSON command API; tests use an
//! in-process mock.

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bundle::{Hash, Transaction};
use crate::error::{Error, Result};

pub use http::HttpNetwork;

/// Tips selected by the node for a new attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsToApprove {
    pub trunk_transaction: Hash,
    pub branch_transaction: Hash,
}

/// Node connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node API endpoint
    pub provider: String,
    pub timeout_ms: u64,
    /// Attempts per command before giving up
    pub max_retries: u32,
    /// Confirmation threshold (percent) for balance queries
    pub balance_threshold: u8,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            provider: "http://localhost:14265".to_string(),
            timeout_ms: 10_000,
            max_retries: 3,
            balance_threshold: 100,
        }
    }
}

/// Ledger node operations used by the account
///
/// Implementations must answer queries for empty inputs without a round-trip.
#[async_trait]
pub trait Network: Send + Sync {
    /// Hashes of transactions at any of `addresses`
    async fn find_transactions(&self, addresses: &[String]) -> Result<Vec<Hash>>;

    /// Transactions for `hashes`, skipping unknown ones
    async fn get_trytes(&self, hashes: &[Hash]) -> Result<Vec<Transaction>>;

    /// Confirmed balances, in the order of `addresses`
    async fn get_balances(&self, addresses: &[String]) -> Result<Vec<u64>>;

    async fn get_balance(&self, address: &str) -> Result<u64> {
        let balances = self.get_balances(&[address.to_string()]).await?;
        balances
            .first()
            .copied()
            .ok_or_else(|| Error::Rpc(format!("no balance returned for {}", address)))
    }

    /// Check that all `tails` can still be approved together
    async fn check_consistency(&self, tails: &[Hash]) -> Result<bool>;

    /// Inclusion of `hashes` as of the latest solid milestone
    async fn get_latest_inclusion(&self, hashes: &[Hash]) -> Result<Vec<bool>>;

    async fn get_transactions_to_approve(
        &self,
        depth: u32,
        reference: Option<&Hash>,
    ) -> Result<TransactionsToApprove>;

    /// Do proof of work over `transactions` (head first) on top of the given tips
    async fn attach_to_tangle(
        &self,
        trunk: &Hash,
        branch: &Hash,
        min_weight_magnitude: u32,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>>;

    /// Store attached transactions on the node and gossip them
    async fn store_and_broadcast(&self, transactions: &[Transaction]) -> Result<()>;

    /// Whether each address has ever been spent from
    async fn were_addresses_spent_from(&self, addresses: &[String]) -> Result<Vec<bool>>;

    /// Select tips, attach and broadcast; returns the attached transactions
    async fn send_trytes(
        &self,
        transactions: Vec<Transaction>,
        depth: u32,
        min_weight_magnitude: u32,
        reference: Option<&Hash>,
    ) -> Result<Vec<Transaction>> {
        let tips = self.get_transactions_to_approve(depth, reference).await?;
        debug!(
            "Attaching {} transactions on trunk {} branch {}",
            transactions.len(),
            tips.trunk_transaction,
            tips.branch_transaction
        );

        let attached = self
            .attach_to_tangle(
                &tips.trunk_transaction,
                &tips.branch_transaction,
                min_weight_magnitude,
                transactions,
            )
            .await?;
        self.store_and_broadcast(&attached).await?;
        Ok(attached)
    }

    /// Replace the node connection settings
    fn set_settings(&self, settings: NodeSettings) -> Result<()>;
}
