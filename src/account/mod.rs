//! Account facade
//!
//! An [`Account`] owns one store, one deposit queue, one bundle queue and one
//! attachment loop. Store writes feed the queues directly: every CDA written
//! or replayed lands on the deposit queue and every bundle on the bundle
//! queue.

pub mod attachment;
pub mod clock;
pub mod events;
pub mod generation;
pub mod history;
pub mod issuance;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::bundle::Bundle;
use crate::cda::{Cda, CdaInput, CdaParams, CdaTransfer};
use crate::error::Result;
use crate::network::{Network, NodeSettings};
use crate::persistence::{
    DepositEntry, JsonFileAdapter, MemoryAdapter, Persistence, RangeOptions, Record,
    StorageAdapter, StoreEvent, TransferEntry,
};
use crate::queue::AsyncQueue;
use crate::signing::{persistence_id, Security, Signer};

pub use attachment::{Attachment, AttachmentParams};
pub use clock::{Clock, SystemClock};
pub use events::{AccountEvent, EventBus};
pub use generation::AddressGeneration;
pub use history::History;
pub use issuance::{Issuance, SelectedInputs};

/// Everything an account is built from
pub struct AccountParams {
    pub signer: Arc<dyn Signer>,
    pub network: Arc<dyn Network>,
    pub state: Arc<dyn StorageAdapter>,
    pub history: Arc<dyn StorageAdapter>,
    pub clock: Arc<dyn Clock>,
    /// Default security of generated addresses
    pub security: Security,
    pub attachment: AttachmentParams,
}

impl AccountParams {
    /// Volatile storage, wall clock and default settings
    pub fn new(signer: Arc<dyn Signer>, network: Arc<dyn Network>) -> Self {
        Self {
            signer,
            network,
            state: Arc::new(MemoryAdapter::new()),
            history: Arc::new(MemoryAdapter::new()),
            clock: Arc::new(SystemClock),
            security: Security::default(),
            attachment: AttachmentParams::default(),
        }
    }

    /// Keep state and history in JSON files under `dir`, named after the seed
    pub fn with_file_persistence(mut self, dir: impl AsRef<Path>) -> Self {
        let id = persistence_id(self.signer.as_ref());
        let dir = dir.as_ref();
        self.state = Arc::new(JsonFileAdapter::new(dir.join(format!("{}.state.json", id))));
        self.history = Arc::new(JsonFileAdapter::new(dir.join(format!("{}.history.json", id))));
        self
    }
}

pub struct Account {
    store: Arc<Persistence>,
    network: Arc<dyn Network>,
    events: EventBus,
    generation: AddressGeneration,
    issuance: Issuance,
    attachment: Attachment,
    history: History,
    attachment_params: AttachmentParams,
}

impl Account {
    pub fn new(params: AccountParams) -> Self {
        let store = Arc::new(Persistence::new(params.state, params.history));
        let deposits: AsyncQueue<CdaInput> = AsyncQueue::new();
        let bundles: AsyncQueue<Bundle> = AsyncQueue::new();
        let events = EventBus::new();

        {
            let deposits = deposits.clone();
            let bundles = bundles.clone();
            let events = events.clone();
            store.add_listener(move |event| {
                match event {
                    StoreEvent::Replayed(Record::Cda(input)) | StoreEvent::Written(Record::Cda(input)) => {
                        deposits.push(input.clone())
                    }
                    StoreEvent::Replayed(Record::Bundle(bundle))
                    | StoreEvent::Written(Record::Bundle(bundle)) => bundles.push(bundle.clone()),
                    _ => {}
                }
                events.emit(AccountEvent::Data(event.clone()));
            });
        }

        let generation = AddressGeneration::new(
            params.signer.clone(),
            store.clone(),
            params.clock.clone(),
            params.security,
        );
        let issuance = Issuance::new(
            params.signer,
            store.clone(),
            params.network.clone(),
            params.clock.clone(),
            deposits,
            events.clone(),
        );
        let attachment = Attachment::new(
            store.clone(),
            params.network.clone(),
            params.clock,
            bundles,
            events.clone(),
        );
        let history = History::new(store.clone());

        Self {
            store,
            network: params.network,
            events,
            generation,
            issuance,
            attachment,
            history,
            attachment_params: params.attachment,
        }
    }

    /// Open the stores, replay pending records and start attaching
    pub async fn start(&self) -> Result<()> {
        self.store.ready().await?;
        self.events.emit(AccountEvent::Ready);
        self.attachment
            .start_attaching(self.attachment_params.clone())
            .await;
        info!("Account started");
        Ok(())
    }

    /// Stop attaching, then close the stores
    pub async fn stop(&self) -> Result<()> {
        self.attachment.stop_attaching().await;
        self.store.close().await?;
        info!("Account stopped");
        Ok(())
    }

    /// Resolves once startup replay is complete
    pub async fn ready(&self) -> Result<()> {
        self.store.ready().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.events.subscribe()
    }

    pub async fn generate_cda(&self, params: CdaParams) -> Result<Cda> {
        self.generation.generate_cda(params).await
    }

    pub async fn send_to_cda(&self, transfer: CdaTransfer) -> Result<Bundle> {
        self.issuance.send_to_cda(transfer).await
    }

    pub async fn start_attaching(&self, params: AttachmentParams) -> bool {
        self.attachment.start_attaching(params).await
    }

    pub async fn stop_attaching(&self) {
        self.attachment.stop_attaching().await
    }

    pub async fn is_attaching(&self) -> bool {
        self.attachment.is_attaching().await
    }

    pub fn set_settings(&self, settings: NodeSettings) -> Result<()> {
        self.network.set_settings(settings)
    }

    pub async fn read_included_deposits(&self, options: RangeOptions) -> Result<Vec<DepositEntry>> {
        self.history.read_included_deposits(options).await
    }

    pub async fn read_included_transfers(&self, options: RangeOptions) -> Result<Vec<TransferEntry>> {
        self.history.read_included_transfers(options).await
    }

    pub async fn get_deposit(&self, address: &str) -> Result<DepositEntry> {
        self.history.get_deposit(address).await
    }

    pub async fn get_transfer(&self, hash: &str) -> Result<TransferEntry> {
        self.history.get_transfer(hash).await
    }

    pub async fn delete_deposit(&self, address: &str) -> Result<()> {
        self.history.delete_deposit(address).await
    }

    pub async fn delete_transfer(&self, hash: &str) -> Result<()> {
        self.history.delete_transfer(hash).await
    }

    /// Live CDAs in the state store
    pub async fn deposits(&self) -> Result<Vec<CdaInput>> {
        let records = self.store.records(crate::persistence::record::CDA_PREFIX).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| match record {
                Record::Cda(input) => Some(input),
                _ => None,
            })
            .collect())
    }

    /// Bundles not yet included
    pub async fn pending_bundles(&self) -> Result<Vec<Bundle>> {
        let records = self.store.records(crate::persistence::record::BUNDLE_PREFIX).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| match record {
                Record::Bundle(bundle) => Some(bundle),
                _ => None,
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::network::mock::MockNetwork;
    use crate::signing::{Seed, SeedSigner};
    use std::time::Duration;

    pub const NOW: u64 = 1_700_000_000;

    pub struct Harness {
        pub account: Account,
        pub network: Arc<MockNetwork>,
        pub clock: Arc<clock::FixedClock>,
        pub state: Arc<MemoryAdapter>,
    }

    pub fn fast_attachment() -> AttachmentParams {
        AttachmentParams {
            delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            ..AttachmentParams::default()
        }
    }

    pub fn harness(seed: char) -> Harness {
        harness_with_state(seed, Arc::new(MemoryAdapter::new()))
    }

    pub fn harness_with_state(seed: char, state: Arc<MemoryAdapter>) -> Harness {
        let network = Arc::new(MockNetwork::new());
        let clock = Arc::new(clock::FixedClock::new(NOW));
        let signer = Arc::new(SeedSigner::new(Seed::from_trytes(&seed.to_string().repeat(81)).unwrap()));

        let mut params = AccountParams::new(signer, network.clone());
        params.state = state.clone();
        params.clock = clock.clone();
        params.attachment = fast_attachment();

        Harness {
            account: Account::new(params),
            network,
            clock,
            state,
        }
    }

    /// A valid CDA owned by some other seed
    pub fn foreign_cda(multi_use: bool, expected_amount: Option<u64>) -> Cda {
        let signer = SeedSigner::new(Seed::from_trytes(&"F".repeat(81)).unwrap());
        CdaInput {
            address: signer.address(7, Security::Medium),
            index: 7,
            security: Security::Medium,
            timeout_at: NOW + 3600,
            multi_use,
            expected_amount,
            balance: None,
        }
        .to_cda()
    }

    /// Generate a CDA and fund it on the mock node
    pub async fn funded_cda(harness: &Harness, balance: u64) -> Cda {
        let cda = harness
            .account
            .generate_cda(CdaParams {
                timeout_at: NOW + 3600,
                ..Default::default()
            })
            .await
            .unwrap();
        harness
            .network
            .set_balance(cda.address_without_checksum(), balance);
        cda
    }
}
