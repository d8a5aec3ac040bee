//! In-process node for tests

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Network, NodeSettings, TransactionsToApprove};
use crate::bundle::{Hash, Transaction};
use crate::error::{Error, Result};
use crate::trytes;

/// Simulated node with scriptable balances, inclusion and failures
#[derive(Default)]
pub struct MockNetwork {
    balances: DashMap<String, u64>,
    spent: DashSet<String>,
    ledger: Mutex<Vec<Transaction>>,
    included_bundles: DashSet<Hash>,
    /// Include every bundle as soon as it is broadcast
    pub auto_include: AtomicBool,
    /// Report every tail as inconsistent
    pub inconsistent: AtomicBool,
    /// Number of upcoming attach calls to fail
    pub failing_attaches: AtomicUsize,
    pub attach_calls: AtomicUsize,
    pub balance_calls: AtomicUsize,
    pub references: Mutex<Vec<Option<Hash>>>,
    pub settings: Mutex<Option<NodeSettings>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, address: &str, balance: u64) {
        self.balances.insert(address.to_string(), balance);
    }

    pub fn mark_spent(&self, address: &str) {
        self.spent.insert(address.to_string());
    }

    pub fn include(&self, bundle: &Hash) {
        self.included_bundles.insert(bundle.clone());
    }

    pub fn attach_count(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    /// Transactions stored on the node
    pub fn ledger(&self) -> Vec<Transaction> {
        self.ledger.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn stored(&self) -> Result<std::sync::MutexGuard<'_, Vec<Transaction>>> {
        self.ledger
            .lock()
            .map_err(|e| Error::Internal(format!("ledger poisoned: {}", e)))
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn find_transactions(&self, addresses: &[String]) -> Result<Vec<Hash>> {
        Ok(self
            .stored()?
            .iter()
            .filter(|tx| addresses.contains(&tx.address))
            .map(|tx| tx.hash.clone())
            .collect())
    }

    async fn get_trytes(&self, hashes: &[Hash]) -> Result<Vec<Transaction>> {
        Ok(self
            .stored()?
            .iter()
            .filter(|tx| hashes.contains(&tx.hash))
            .cloned()
            .collect())
    }

    async fn get_balances(&self, addresses: &[String]) -> Result<Vec<u64>> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        Ok(addresses
            .iter()
            .map(|address| self.balances.get(address).map(|b| *b).unwrap_or(0))
            .collect())
    }

    async fn check_consistency(&self, _tails: &[Hash]) -> Result<bool> {
        Ok(!self.inconsistent.load(Ordering::SeqCst))
    }

    async fn get_latest_inclusion(&self, hashes: &[Hash]) -> Result<Vec<bool>> {
        let ledger = self.stored()?;
        Ok(hashes
            .iter()
            .map(|hash| {
                ledger
                    .iter()
                    .find(|tx| &tx.hash == hash)
                    .is_some_and(|tx| self.included_bundles.contains(&tx.bundle))
            })
            .collect())
    }

    async fn get_transactions_to_approve(
        &self,
        _depth: u32,
        reference: Option<&Hash>,
    ) -> Result<TransactionsToApprove> {
        if let Ok(mut references) = self.references.lock() {
            references.push(reference.cloned());
        }
        Ok(TransactionsToApprove {
            trunk_transaction: reference.cloned().unwrap_or_else(|| "T".repeat(81)),
            branch_transaction: "B".repeat(81),
        })
    }

    async fn attach_to_tangle(
        &self,
        trunk: &Hash,
        branch: &Hash,
        _min_weight_magnitude: u32,
        transactions: Vec<Transaction>,
    ) -> Result<Vec<Transaction>> {
        let call = self.attach_calls.fetch_add(1, Ordering::SeqCst);

        let fail = self
            .failing_attaches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Rpc("attachToTangle failed".to_string()));
        }

        let now = Utc::now().timestamp_millis();
        Ok(transactions
            .into_iter()
            .map(|mut tx| {
                tx.trunk_transaction = trunk.clone();
                tx.branch_transaction = branch.clone();
                tx.attachment_timestamp = now;
                tx.nonce = "N".repeat(27);
                tx.hash = trytes::hash_trytes(&[
                    tx.bundle.as_bytes(),
                    &(tx.current_index as u64).to_be_bytes(),
                    &(call as u64).to_be_bytes(),
                ]);
                tx
            })
            .collect())
    }

    async fn store_and_broadcast(&self, transactions: &[Transaction]) -> Result<()> {
        let mut ledger = self.stored()?;
        for tx in transactions {
            if tx.value < 0 {
                self.spent.insert(tx.address.clone());
            }
            if self.auto_include.load(Ordering::SeqCst) {
                self.included_bundles.insert(tx.bundle.clone());
            }
            ledger.push(tx.clone());
        }
        Ok(())
    }

    async fn were_addresses_spent_from(&self, addresses: &[String]) -> Result<Vec<bool>> {
        Ok(addresses.iter().map(|a| self.spent.contains(a)).collect())
    }

    fn set_settings(&self, settings: NodeSettings) -> Result<()> {
        if let Ok(mut current) = self.settings.lock() {
            *current = Some(settings);
        }
        Ok(())
    }
}
