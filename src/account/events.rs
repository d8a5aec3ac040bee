//! Account event stream

use tokio::sync::broadcast;

use crate::bundle::{Bundle, Transaction};
use crate::cda::{CdaInput, CdaTransfer};
use crate::persistence::StoreEvent;

const EVENT_CAPACITY: usize = 1024;

/// Something observable happened in the account
#[derive(Debug, Clone)]
pub enum AccountEvent {
    /// Startup replay finished
    Ready,
    /// A store record was replayed, written or deleted
    Data(StoreEvent),
    /// A deposit was selected as input for a transfer
    SelectedInput {
        transfer: CdaTransfer,
        input: CdaInput,
    },
    /// A transfer bundle was built and signed
    PreparedTransfer {
        transfer: CdaTransfer,
        bundle: Bundle,
    },
    /// A bundle was attached and broadcast
    AttachedToTangle(Vec<Transaction>),
    /// A bundle was confirmed and retired
    Included(Bundle),
    /// A recovered failure in the attachment loop
    Error(String),
}

/// Fan-out of account events to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AccountEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped when nobody listens
    pub fn emit(&self, event: AccountEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.tx.subscribe()
    }
}
