//! Retired deposits and included transfers

use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

use crate::bundle::{Bundle, Hash};
use crate::cda::CdaInput;
use crate::error::{Error, Result};
use crate::persistence::{
    deposit_key, transfer_key, DepositEntry, Persistence, RangeOptions, TransferEntry,
    DEPOSIT_PREFIX, TRANSFER_PREFIX,
};

use super::clock::Clock;

/// Read access to the history store
pub struct History {
    store: Arc<Persistence>,
}

impl History {
    pub fn new(store: Arc<Persistence>) -> Self {
        Self { store }
    }

    /// Deposits in address order within `options` (bounds are addresses)
    pub async fn read_included_deposits(&self, options: RangeOptions) -> Result<Vec<DepositEntry>> {
        self.read(DEPOSIT_PREFIX, options).await
    }

    /// Transfers in bundle-hash order within `options` (bounds are hashes)
    pub async fn read_included_transfers(&self, options: RangeOptions) -> Result<Vec<TransferEntry>> {
        self.read(TRANSFER_PREFIX, options).await
    }

    pub async fn get_deposit(&self, address: &str) -> Result<DepositEntry> {
        let value = self.store.history_get(&deposit_key(address)).await?;
        decode(&value)
    }

    pub async fn get_transfer(&self, hash: &str) -> Result<TransferEntry> {
        let value = self.store.history_get(&transfer_key(hash)).await?;
        decode(&value)
    }

    pub async fn delete_deposit(&self, address: &str) -> Result<()> {
        self.store.history_del(&deposit_key(address)).await
    }

    pub async fn delete_transfer(&self, hash: &str) -> Result<()> {
        self.store.history_del(&transfer_key(hash)).await
    }

    async fn read<T: DeserializeOwned>(&self, prefix: &str, options: RangeOptions) -> Result<Vec<T>> {
        let mut entries = self.store.history_stream(options.within_prefix(prefix)).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next().await {
            let (_, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

fn decode<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Record a deposit leaving the state store
pub(crate) async fn record_deposit(
    store: &Persistence,
    clock: &dyn Clock,
    input: &CdaInput,
    bundle: Option<&Hash>,
) -> Result<()> {
    let entry = DepositEntry {
        cda: input.to_cda(),
        index: input.index,
        balance: input.balance.unwrap_or(0),
        bundle: bundle.cloned(),
        recorded_at: clock.now_utc(),
    };
    store
        .history_put(&deposit_key(&input.address), serde_json::to_vec(&entry)?)
        .await?;
    debug!("Recorded deposit {} in history", input.address);
    Ok(())
}

/// Record an included transfer
pub(crate) async fn record_transfer(store: &Persistence, clock: &dyn Clock, bundle: &Bundle) -> Result<()> {
    let entry = TransferEntry {
        bundle: bundle.clone(),
        included_at: clock.now_utc(),
    };
    store
        .history_put(&transfer_key(&bundle.hash), serde_json::to_vec(&entry)?)
        .await?;
    debug!("Recorded transfer {} in history", bundle.hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::clock::FixedClock;
    use crate::signing::Security;

    fn input(tag: char, balance: u64) -> CdaInput {
        CdaInput {
            address: tag.to_string().repeat(81),
            index: 3,
            security: Security::Medium,
            timeout_at: 0,
            multi_use: false,
            expected_amount: None,
            balance: Some(balance),
        }
    }

    #[tokio::test]
    async fn test_deposit_history() {
        let store = Arc::new(Persistence::in_memory());
        let clock = FixedClock::new(1_700_000_000);
        let history = History::new(store.clone());

        for (tag, balance) in [('A', 1), ('B', 2), ('C', 3)] {
            record_deposit(&store, &clock, &input(tag, balance), None).await.unwrap();
        }

        let all = history.read_included_deposits(RangeOptions::default()).await.unwrap();
        assert_eq!(all.iter().map(|d| d.balance).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(all[0].recorded_at.timestamp(), 1_700_000_000);

        let last = history
            .read_included_deposits(RangeOptions {
                reverse: true,
                limit: Some(1),
                ..RangeOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(last[0].balance, 3);

        let address = "B".repeat(81);
        assert_eq!(history.get_deposit(&address).await.unwrap().balance, 2);
        history.delete_deposit(&address).await.unwrap();
        assert!(history.get_deposit(&address).await.unwrap_err().is_not_found());

        assert!(history
            .read_included_transfers(RangeOptions::default())
            .await
            .unwrap()
            .is_empty());
    }
}
