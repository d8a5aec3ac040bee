//! Bundles and transaction entries
//!
//! A bundle is an ordered group of transactions sharing one bundle hash.
//! Once finalized and signed it is immutable; the attachment loop only ever
//! produces attached copies of it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::trytes::{self, HASH_LENGTH};

/// 81-tryte transaction or bundle hash
pub type Hash = String;

/// Interval between milestones on the tangle
pub const MILESTONE_INTERVAL_MS: i64 = 2 * 60 * 1000;

/// Allowance for propagation delay when judging reference age
pub const ONE_WAY_DELAY_MS: i64 = 60 * 1000;

/// A single ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction hash, all nines until attached
    pub hash: Hash,
    /// Signature fragment (inputs) or message (outputs)
    pub signature_message_fragment: String,
    /// Address without checksum
    pub address: String,
    /// Signed value: positive for outputs, negative for inputs
    pub value: i64,
    /// Issuance time in seconds
    pub timestamp: u64,
    pub current_index: usize,
    pub last_index: usize,
    /// Bundle hash shared by all entries
    pub bundle: Hash,
    pub trunk_transaction: Hash,
    pub branch_transaction: Hash,
    /// Attachment time in milliseconds, zero until attached
    #[serde(default)]
    pub attachment_timestamp: i64,
    #[serde(default)]
    pub nonce: String,
}

impl Transaction {
    /// Check if this is the first entry of its bundle
    pub fn is_tail(&self) -> bool {
        self.current_index == 0
    }

    /// Essence fields covered by the bundle hash
    pub(crate) fn essence(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.address, self.value, self.timestamp, self.current_index, self.last_index
        )
    }
}

/// An outgoing value transfer inside a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutput {
    /// Recipient address without checksum
    pub address: String,
    pub value: u64,
}

/// A finalized bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub hash: Hash,
    pub transactions: Vec<Transaction>,
}

impl Bundle {
    /// Build a bundle from finalized transactions, checking structure
    pub fn new(transactions: Vec<Transaction>) -> Result<Self> {
        let first = transactions
            .first()
            .ok_or_else(|| Error::BundleBuild("empty bundle".to_string()))?;
        let hash = first.bundle.clone();

        if !trytes::is_trytes_of_length(&hash, HASH_LENGTH) {
            return Err(Error::BundleBuild(format!("illegal bundle hash {}", hash)));
        }

        let last_index = transactions.len() - 1;
        for (i, tx) in transactions.iter().enumerate() {
            if tx.bundle != hash {
                return Err(Error::BundleBuild(format!(
                    "transaction {} belongs to bundle {}",
                    i, tx.bundle
                )));
            }
            if tx.current_index != i || tx.last_index != last_index {
                return Err(Error::BundleBuild(format!(
                    "transaction {} has index {}/{}",
                    i, tx.current_index, tx.last_index
                )));
            }
        }

        let sum: i128 = transactions.iter().map(|tx| tx.value as i128).sum();
        if sum != 0 {
            return Err(Error::BundleBuild(format!("values sum to {}", sum)));
        }

        Ok(Self { hash, transactions })
    }

    /// Compute the bundle hash over the essence of each entry
    pub fn essence_hash(transactions: &[Transaction]) -> Hash {
        let essence: Vec<String> = transactions.iter().map(|tx| tx.essence()).collect();
        let chunks: Vec<&[u8]> = essence.iter().map(|e| e.as_bytes()).collect();
        trytes::hash_trytes(&chunks)
    }

    /// Address used to look up prior attachments of this bundle
    pub fn search_address(&self) -> Option<&str> {
        self.transactions.last().map(|tx| tx.address.as_str())
    }

    /// Positive-value entries
    pub fn outputs(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| tx.value > 0)
    }

    /// Negative-value entries
    pub fn inputs(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| tx.value < 0)
    }

    /// Entries in the order the node expects for attachment (head first)
    pub fn for_attachment(&self) -> Vec<Transaction> {
        self.transactions.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Check if a reference attached at `attachment_timestamp` is still young
/// enough to be approved within `max_depth` milestones
pub fn is_above_max_depth(attachment_timestamp: i64, max_depth: u32, now_ms: i64) -> bool {
    attachment_timestamp < now_ms
        && (now_ms - attachment_timestamp)
            < max_depth as i64 * (MILESTONE_INTERVAL_MS - ONE_WAY_DELAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(address: &str, value: i64, index: usize, last: usize) -> Transaction {
        Transaction {
            hash: trytes::null_hash(),
            signature_message_fragment: String::new(),
            address: address.to_string(),
            value,
            timestamp: 1,
            current_index: index,
            last_index: last,
            bundle: trytes::null_hash(),
            trunk_transaction: trytes::null_hash(),
            branch_transaction: trytes::null_hash(),
            attachment_timestamp: 0,
            nonce: String::new(),
        }
    }

    fn finalized(mut txs: Vec<Transaction>) -> Vec<Transaction> {
        let hash = Bundle::essence_hash(&txs);
        for tx in txs.iter_mut() {
            tx.bundle = hash.clone();
        }
        txs
    }

    #[test]
    fn test_bundle_validation() {
        let txs = finalized(vec![tx("A", 5, 0, 1), tx("B", -5, 1, 1)]);
        let bundle = Bundle::new(txs).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.search_address(), Some("B"));
        assert_eq!(bundle.outputs().count(), 1);
        assert_eq!(bundle.for_attachment()[0].current_index, 1);
    }

    #[test]
    fn test_unbalanced_bundle_rejected() {
        let txs = finalized(vec![tx("A", 5, 0, 1), tx("B", -4, 1, 1)]);
        assert!(Bundle::new(txs).is_err());
        assert!(Bundle::new(Vec::new()).is_err());
    }

    #[test]
    fn test_max_depth() {
        let now = 10 * MILESTONE_INTERVAL_MS;
        assert!(is_above_max_depth(now - 1000, 6, now));
        assert!(!is_above_max_depth(now - 7 * 60 * 1000, 6, now));
        assert!(!is_above_max_depth(now + 1, 6, now));
    }
}
