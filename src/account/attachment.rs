//! Attachment loop driving outbound bundles to inclusion
//!
//! Each iteration pops one bundle and either retires it (a prior attachment
//! is included), waits on it (a prior attachment is still consistent), or
//! reattaches it. Bundles are never dropped: any failure puts the bundle
//! straight back on the queue and surfaces as an `Error` event.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bundle::{is_above_max_depth, Bundle, Hash, Transaction};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::persistence::{Persistence, RecordKey};
use crate::queue::AsyncQueue;

use super::clock::Clock;
use super::events::{AccountEvent, EventBus};
use super::history;

/// Attachment loop settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentParams {
    /// Tip selection depth
    pub depth: u32,
    pub min_weight_magnitude: u32,
    /// Wait before a pending bundle is looked at again
    pub delay: Duration,
    /// Pause between queue pops
    pub poll_interval: Duration,
    /// Milestones a reference may lag before it is replaced
    pub max_depth: u32,
}

impl Default for AttachmentParams {
    fn default() -> Self {
        Self {
            depth: 3,
            min_weight_magnitude: 9,
            delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            max_depth: 6,
        }
    }
}

struct Worker {
    store: Arc<Persistence>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    bundles: AsyncQueue<Bundle>,
    events: EventBus,
    /// Tail of the last attachment, reused as tip selection reference
    reference: Mutex<Option<Transaction>>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Attachment {
    worker: Arc<Worker>,
    running: Mutex<Option<Running>>,
}

impl Attachment {
    pub fn new(
        store: Arc<Persistence>,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
        bundles: AsyncQueue<Bundle>,
        events: EventBus,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                store,
                network,
                clock,
                bundles,
                events,
                reference: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the loop; returns false if it was already running
    pub async fn start_attaching(&self, params: AttachmentParams) -> bool {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        info!(
            "Starting attachment loop (depth {}, mwm {}, delay {:?})",
            params.depth, params.min_weight_magnitude, params.delay
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(self.worker.clone(), params, token.clone()));
        *running = Some(Running { token, handle });
        true
    }

    /// Stop the loop and wait for the in-flight iteration to finish
    ///
    /// No bundle is popped after this returns.
    pub async fn stop_attaching(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.token.cancel();
        if let Err(e) = running.handle.await {
            error!("Attachment loop ended abnormally: {}", e);
        }
        info!("Attachment loop stopped");
    }

    pub async fn is_attaching(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

async fn run(worker: Arc<Worker>, params: AttachmentParams, token: CancellationToken) {
    loop {
        let bundle = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            bundle = worker.bundles.pop() => match bundle {
                Some(bundle) => bundle,
                None => break,
            },
        };

        if let Err(e) = worker.process(&bundle, &params, &token).await {
            warn!("Attachment of bundle {} failed: {}", bundle.hash, e);
            worker.bundles.push(bundle);
            worker.events.emit(AccountEvent::Error(e.to_string()));
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(params.poll_interval) => {}
        }
    }
    debug!("Attachment loop exited");
}

impl Worker {
    async fn process(&self, bundle: &Bundle, params: &AttachmentParams, token: &CancellationToken) -> Result<()> {
        let search_address = bundle
            .search_address()
            .ok_or_else(|| Error::Internal(format!("bundle {} is empty", bundle.hash)))?
            .to_string();

        let hashes = self.network.find_transactions(&[search_address]).await?;
        let prior: Vec<Transaction> = self
            .network
            .get_trytes(&hashes)
            .await?
            .into_iter()
            .filter(|tx| tx.bundle == bundle.hash)
            .collect();
        let prior_hashes: Vec<Hash> = prior.iter().map(|tx| tx.hash.clone()).collect();

        let inclusion = self.network.get_latest_inclusion(&prior_hashes).await?;
        if inclusion.contains(&true) {
            self.store.del(RecordKey::Bundle(bundle.hash.clone())).await?;
            if let Err(e) = history::record_transfer(&self.store, self.clock.as_ref(), bundle).await {
                warn!("Failed to record transfer {}: {}", bundle.hash, e);
            }
            info!("Bundle {} included", bundle.hash);
            self.events.emit(AccountEvent::Included(bundle.clone()));
            return Ok(());
        }

        for hash in &prior_hashes {
            if self.network.check_consistency(std::slice::from_ref(hash)).await? {
                debug!("Bundle {} has a consistent attachment {}, waiting", bundle.hash, hash);
                self.requeue_later(bundle.clone(), params.delay, token);
                return Ok(());
            }
        }

        let mut reference = self.reference.lock().await;
        let mut reference_hash = None;
        if let Some(tx) = reference.as_ref() {
            if self.is_usable_reference(tx, params.max_depth).await {
                reference_hash = Some(tx.hash.clone());
            }
        }

        let attached = self
            .network
            .send_trytes(
                bundle.for_attachment(),
                params.depth,
                params.min_weight_magnitude,
                reference_hash.as_ref(),
            )
            .await?;
        info!("Attached bundle {} ({} transactions)", bundle.hash, attached.len());
        self.events.emit(AccountEvent::AttachedToTangle(attached.clone()));

        if let Some(tail) = attached.iter().find(|tx| tx.is_tail()) {
            if self.is_usable_reference(tail, params.max_depth).await {
                *reference = Some(tail.clone());
            }
        }
        drop(reference);

        self.requeue_later(bundle.clone(), params.delay, token);
        Ok(())
    }

    /// Young enough and consistent; a failed consistency check counts as unusable
    async fn is_usable_reference(&self, tx: &Transaction, max_depth: u32) -> bool {
        if !is_above_max_depth(tx.attachment_timestamp, max_depth, self.clock.now_ms()) {
            return false;
        }
        match self.network.check_consistency(std::slice::from_ref(&tx.hash)).await {
            Ok(consistent) => consistent,
            Err(e) => {
                warn!("Consistency check of reference {} failed: {}", tx.hash, e);
                false
            }
        }
    }

    /// Put the bundle back after `delay`, or at once if the loop stops first
    fn requeue_later(&self, bundle: Bundle, delay: Duration, token: &CancellationToken) {
        let bundles = self.bundles.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            bundles.push(bundle);
        });
    }
}
