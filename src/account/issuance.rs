//! Transfer issuance: input selection, remainder handling and signing
//!
//! Issuance calls for one account run one at a time. A call either commits
//! one store batch (spent inputs deleted, bundle and remainder CDA written)
//! or leaves every popped deposit back on the queue.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bundle::{Bundle, TransferOutput};
use crate::cda::{verify_cda_transfer, CdaInput, CdaTransfer};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::persistence::{BatchOp, OutgoingTransfer, Persistence, Record, RecordKey};
use crate::queue::AsyncQueue;
use crate::signing::{Security, Signer};

use super::clock::Clock;
use super::events::{AccountEvent, EventBus};
use super::history;

/// Inputs accepted for a transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedInputs {
    pub inputs: Vec<CdaInput>,
    pub total_balance: u64,
}

pub struct Issuance {
    signer: Arc<dyn Signer>,
    store: Arc<Persistence>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    deposits: AsyncQueue<CdaInput>,
    events: EventBus,
    lock: Mutex<()>,
}

impl Issuance {
    pub fn new(
        signer: Arc<dyn Signer>,
        store: Arc<Persistence>,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
        deposits: AsyncQueue<CdaInput>,
        events: EventBus,
    ) -> Self {
        Self {
            signer,
            store,
            network,
            clock,
            deposits,
            events,
            lock: Mutex::new(()),
        }
    }

    /// Pay `transfer.value` into the CDA, returning the persisted bundle
    pub async fn send_to_cda(&self, transfer: CdaTransfer) -> Result<Bundle> {
        let _guard = self.lock.lock().await;
        self.store.ready().await?;

        let now = self.clock.now();
        verify_cda_transfer(now, &transfer)?;

        let address = transfer.cda.address_without_checksum().to_string();

        if !transfer.cda.multi_use && self.store.contains(&RecordKey::Outgoing(address.clone())).await? {
            return Err(Error::SendingTwice(address));
        }

        let spent = self
            .network
            .were_addresses_spent_from(std::slice::from_ref(&address))
            .await?;
        if spent.first().copied().unwrap_or(false) {
            return Err(Error::SpentAddress(address));
        }

        let selected = self.accumulate_inputs(transfer.value).await?;
        for input in &selected.inputs {
            self.events.emit(AccountEvent::SelectedInput {
                transfer: transfer.clone(),
                input: input.clone(),
            });
        }

        match self.issue(&transfer, &address, &selected, now).await {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                warn!("Issuance failed, returning {} inputs: {}", selected.inputs.len(), e);
                self.deposits.extend(selected.inputs.into_iter().map(|mut input| {
                    input.balance = None;
                    input
                }));
                Err(e)
            }
        }
    }

    async fn issue(
        &self,
        transfer: &CdaTransfer,
        address: &str,
        selected: &SelectedInputs,
        now: u64,
    ) -> Result<Bundle> {
        let remainder = selected.total_balance - transfer.value;
        let remainder_input = if remainder > 0 {
            Some(self.remainder_input(remainder).await?)
        } else {
            None
        };

        let outputs = [TransferOutput {
            address: address.to_string(),
            value: transfer.value,
        }];
        let bundle = self.signer.prepare_transfers(
            &outputs,
            &selected.inputs,
            remainder_input.as_ref().map(|input| input.address.as_str()),
            now,
        )?;
        self.events.emit(AccountEvent::PreparedTransfer {
            transfer: transfer.clone(),
            bundle: bundle.clone(),
        });

        let mut ops: Vec<BatchOp> = selected
            .inputs
            .iter()
            .map(|input| BatchOp::Del(RecordKey::Cda(input.address.clone())))
            .collect();
        ops.push(BatchOp::Put(Record::Bundle(bundle.clone())));
        if !transfer.cda.multi_use {
            ops.push(BatchOp::Put(Record::Outgoing(OutgoingTransfer {
                address: address.to_string(),
                bundle: bundle.hash.clone(),
            })));
        }
        if let Some(input) = remainder_input {
            ops.push(BatchOp::Put(Record::Cda(input)));
        }
        self.store.batch(ops).await?;

        for input in &selected.inputs {
            if let Err(e) = history::record_deposit(&self.store, self.clock.as_ref(), input, Some(&bundle.hash)).await {
                warn!("Failed to record spent deposit {}: {}", input.address, e);
            }
        }

        info!(
            "Prepared bundle {} sending {} from {} inputs (remainder {})",
            bundle.hash,
            transfer.value,
            selected.inputs.len(),
            remainder
        );
        Ok(bundle)
    }

    /// Pop deposits until their balances cover `threshold`
    ///
    /// Deposits that are funded but not yet spendable, or unfunded but still
    /// open, go back on the queue whatever the outcome. Expired unfunded
    /// deposits are deleted.
    pub async fn accumulate_inputs(&self, threshold: u64) -> Result<SelectedInputs> {
        let mut selected = SelectedInputs::default();
        let mut set_aside = Vec::new();

        let outcome = self
            .select_until(threshold, &mut selected, &mut set_aside)
            .await;
        self.deposits.extend(set_aside);

        match outcome {
            Ok(()) => Ok(selected),
            Err(e) => {
                self.deposits.extend(selected.inputs.into_iter().map(|mut input| {
                    input.balance = None;
                    input
                }));
                Err(e)
            }
        }
    }

    async fn select_until(
        &self,
        threshold: u64,
        selected: &mut SelectedInputs,
        set_aside: &mut Vec<CdaInput>,
    ) -> Result<()> {
        while selected.total_balance < threshold {
            let Some(mut input) = self.deposits.try_pop() else {
                return Err(Error::InsufficientBalance);
            };

            let balance = match self.network.get_balance(&input.address).await {
                Ok(balance) => balance,
                Err(e) => {
                    set_aside.push(input);
                    return Err(e);
                }
            };
            let now = self.clock.now();

            if balance > 0 {
                let spendable = input.expected_amount.is_some_and(|expected| balance >= expected)
                    || (input.multi_use && input.is_expired(now))
                    || !input.multi_use;

                if spendable {
                    debug!("Selected input {} with balance {}", input.address, balance);
                    input.balance = Some(balance);
                    selected.total_balance += balance;
                    selected.inputs.push(input);
                } else {
                    set_aside.push(input);
                }
            } else if input.timeout_at != 0 && input.is_expired(now) {
                debug!("Deleting expired unfunded CDA {}", input.address);
                let key = RecordKey::Cda(input.address.clone());
                if let Err(e) = self.store.del(key).await {
                    set_aside.push(input);
                    return Err(e);
                }
                input.balance = Some(0);
                if let Err(e) = history::record_deposit(&self.store, self.clock.as_ref(), &input, None).await {
                    warn!("Failed to record expired deposit {}: {}", input.address, e);
                }
            } else {
                set_aside.push(input);
            }
        }
        Ok(())
    }

    /// Derive a zero-timeout single-use CDA expecting `remainder`
    ///
    /// Only the index is consumed here; the CDA is written with the bundle.
    async fn remainder_input(&self, remainder: u64) -> Result<CdaInput> {
        let index = self.store.increment().await?;
        let security = Security::Medium;
        debug!("Remainder of {} goes to index {}", remainder, index);

        Ok(CdaInput {
            address: self.signer.address(index, security),
            index,
            security,
            timeout_at: 0,
            multi_use: false,
            expected_amount: Some(remainder),
            balance: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::clock::FixedClock;
    use crate::account::testing::*;
    use crate::cda::CdaParams;
    use crate::network::mock::MockNetwork;
    use crate::persistence::adapter::testing::FaultyAdapter;
    use crate::persistence::record::CDA_PREFIX;
    use crate::persistence::MemoryAdapter;
    use crate::signing::{Seed, SeedSigner};
    use std::sync::atomic::Ordering;

    fn transfer(value: u64) -> CdaTransfer {
        CdaTransfer {
            cda: foreign_cda(false, None),
            value,
        }
    }

    #[tokio::test]
    async fn test_no_deposits_is_insufficient_balance() {
        let harness = harness('A');
        let err = harness.account.send_to_cda(transfer(1)).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance));
        assert_eq!(err.to_string(), "Insufficient balance");
    }

    #[tokio::test]
    async fn test_spent_target_aborts_before_attaching() {
        let harness = harness('B');
        funded_cda(&harness, 10).await;

        let target = foreign_cda(false, None);
        harness.network.mark_spent(target.address_without_checksum());

        let err = harness
            .account
            .send_to_cda(CdaTransfer { cda: target, value: 5 })
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Aborted sending to spent address"));
        assert_eq!(harness.network.attach_count(), 0);
        assert_eq!(harness.network.balance_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_use_target_accepts_one_transfer() {
        let harness = harness('C');
        funded_cda(&harness, 4).await;
        funded_cda(&harness, 4).await;

        harness.account.send_to_cda(transfer(4)).await.unwrap();
        let err = harness.account.send_to_cda(transfer(4)).await.unwrap_err();
        assert!(err.to_string().starts_with("Aborted sending twice to the same address"));
    }

    #[tokio::test]
    async fn test_multi_use_target_accepts_repeated_transfers() {
        let harness = harness('D');
        funded_cda(&harness, 4).await;
        funded_cda(&harness, 4).await;

        let target = foreign_cda(true, None);
        for _ in 0..2 {
            harness
                .account
                .send_to_cda(CdaTransfer { cda: target.clone(), value: 4 })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_two_inputs_with_remainder() {
        let harness = harness('E');
        let first = funded_cda(&harness, 9).await;
        let second = funded_cda(&harness, 3).await;

        let bundle = harness.account.send_to_cda(transfer(10)).await.unwrap();

        let spent: Vec<&str> = bundle.inputs().map(|tx| tx.address.as_str()).collect();
        assert!(spent.contains(&first.address_without_checksum()));
        assert!(spent.contains(&second.address_without_checksum()));
        assert_eq!(bundle.inputs().map(|tx| tx.value).sum::<i64>(), -12);

        let remainder: Vec<_> = bundle
            .outputs()
            .filter(|tx| tx.address != transfer(10).cda.address_without_checksum())
            .collect();
        assert_eq!(remainder.len(), 1);
        assert_eq!(remainder[0].value, 2);

        let deposits = harness.account.deposits().await.unwrap();
        assert_eq!(deposits.len(), 1);
        let change = &deposits[0];
        assert_eq!(change.address, remainder[0].address);
        assert_eq!(change.index, 3);
        assert_eq!(change.timeout_at, 0);
        assert!(!change.multi_use);
        assert_eq!(change.expected_amount, Some(2));

        assert_eq!(harness.account.pending_bundles().await.unwrap(), vec![bundle]);
        let history = harness
            .account
            .get_deposit(first.address_without_checksum())
            .await
            .unwrap();
        assert_eq!(history.balance, 9);
    }

    #[tokio::test]
    async fn test_expired_unfunded_deposit_is_deleted() {
        let harness = harness('F');
        let cda = harness
            .account
            .generate_cda(CdaParams {
                timeout_at: NOW + 10,
                ..Default::default()
            })
            .await
            .unwrap();
        harness.clock.set(NOW + 20);

        let err = harness.account.send_to_cda(transfer(1)).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance));
        assert!(harness.account.deposits().await.unwrap().is_empty());

        // The deposit is gone from the queue too
        harness.network.set_balance(cda.address_without_checksum(), 100);
        let err = harness.account.send_to_cda(transfer(1)).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance));
        assert_eq!(harness.network.balance_calls.load(Ordering::SeqCst), 1);

        let history = harness
            .account
            .get_deposit(cda.address_without_checksum())
            .await
            .unwrap();
        assert_eq!(history.balance, 0);
        assert_eq!(history.bundle, None);
    }

    #[tokio::test]
    async fn test_failed_attempt_keeps_deposits() {
        let harness = harness('G');
        funded_cda(&harness, 3).await;
        let unfunded = harness
            .account
            .generate_cda(CdaParams {
                timeout_at: NOW + 3600,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(matches!(
            harness.account.send_to_cda(transfer(5)).await,
            Err(Error::InsufficientBalance)
        ));

        harness.network.set_balance(unfunded.address_without_checksum(), 2);
        let bundle = harness.account.send_to_cda(transfer(5)).await.unwrap();
        assert_eq!(bundle.inputs().count(), 2);
    }

    #[tokio::test]
    async fn test_multi_use_deposit_waits_until_expiry() {
        let harness = harness('H');
        let cda = harness
            .account
            .generate_cda(CdaParams {
                timeout_at: NOW + 10,
                multi_use: true,
                ..Default::default()
            })
            .await
            .unwrap();
        harness.network.set_balance(cda.address_without_checksum(), 7);

        assert!(matches!(
            harness.account.send_to_cda(transfer(7)).await,
            Err(Error::InsufficientBalance)
        ));

        harness.clock.set(NOW + 10);
        let bundle = harness.account.send_to_cda(transfer(7)).await.unwrap();
        assert_eq!(bundle.inputs().count(), 1);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let harness = harness('I');
        let expected = foreign_cda(false, Some(5));
        assert!(matches!(
            harness
                .account
                .send_to_cda(CdaTransfer { cda: expected, value: 6 })
                .await,
            Err(Error::ValueExceedsExpectedAmount(5))
        ));

        harness.clock.set(NOW + 3600);
        assert!(matches!(
            harness.account.send_to_cda(transfer(1)).await,
            Err(Error::ExpiredTimeout)
        ));
    }

    #[tokio::test]
    async fn test_zero_value_transfer_spends_nothing() {
        let harness = harness('J');
        funded_cda(&harness, 5).await;

        let bundle = harness.account.send_to_cda(transfer(0)).await.unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.inputs().count(), 0);
        assert_eq!(harness.network.balance_calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.account.deposits().await.unwrap().len(), 1);

        assert!(matches!(
            harness.account.send_to_cda(transfer(0)).await,
            Err(Error::SendingTwice(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_share_deposits() {
        let harness = harness('K');
        let deposit = funded_cda(&harness, 5).await;
        let target = foreign_cda(true, None);
        let account = &harness.account;
        let send = move || {
            account.send_to_cda(CdaTransfer {
                cda: target.clone(),
                value: 5,
            })
        };

        let (first, second) = tokio::join!(send(), send());
        let results = [first, second];

        let bundles: Vec<&Bundle> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(bundles.len(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(Error::InsufficientBalance))));

        let spent: Vec<&str> = bundles[0].inputs().map(|tx| tx.address.as_str()).collect();
        assert_eq!(spent, vec![deposit.address_without_checksum()]);
        assert!(harness.account.deposits().await.unwrap().is_empty());
        assert_eq!(harness.account.pending_bundles().await.unwrap().len(), 1);

        // The next transfer only sees the new deposit
        let next = funded_cda(&harness, 5).await;
        let bundle = send().await.unwrap();
        let spent: Vec<&str> = bundle.inputs().map(|tx| tx.address.as_str()).collect();
        assert_eq!(spent, vec![next.address_without_checksum()]);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_remainder() {
        let state = Arc::new(FaultyAdapter::default());
        let store = Arc::new(Persistence::new(state.clone(), Arc::new(MemoryAdapter::new())));
        let network = Arc::new(MockNetwork::new());
        let deposits = AsyncQueue::new();
        let signer = Arc::new(SeedSigner::new(Seed::from_trytes(&"L".repeat(81)).unwrap()));
        let issuance = Issuance::new(
            signer.clone(),
            store.clone(),
            network.clone(),
            Arc::new(FixedClock::new(NOW)),
            deposits.clone(),
            EventBus::new(),
        );

        let input = CdaInput {
            address: signer.address(5, Security::Medium),
            index: 5,
            security: Security::Medium,
            timeout_at: NOW + 3600,
            multi_use: false,
            expected_amount: None,
            balance: None,
        };
        store.put(Record::Cda(input.clone())).await.unwrap();
        deposits.push(input.clone());
        network.set_balance(&input.address, 9);

        state.fail_batches.store(true, Ordering::SeqCst);
        let err = issuance.send_to_cda(transfer(4)).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        assert_eq!(store.records(CDA_PREFIX).await.unwrap(), vec![Record::Cda(input.clone())]);
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits.try_pop().map(|i| i.address), Some(input.address));
    }
}
