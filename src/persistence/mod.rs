//! Durable account state
//!
//! Two adapters back an account: the state store holds live records (CDAs,
//! outbound bundles, outgoing markers and the address index counter) and
//! the history store holds retired deposits and included transfers.
//!
//! Every durable write is reported to registered listeners after it
//! completes. Records already on disk are reported as `Replayed` when the
//! store first becomes ready, so listeners see each live record exactly once
//! per process. A closed store reopens on the next `ready` without replaying
//! again.

pub mod adapter;
pub mod file;
pub mod record;

use futures::StreamExt;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use adapter::{AdapterOp, EntryStream, MemoryAdapter, RangeOptions, StorageAdapter};
pub use file::JsonFileAdapter;
pub use record::{
    deposit_key, transfer_key, BatchOp, DepositEntry, OutgoingTransfer, Record, RecordKey,
    StoreEvent, TransferEntry, DEPOSIT_PREFIX, KEY_INDEX_KEY, TRANSFER_PREFIX,
};

/// Largest integer a key index may reach
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct Lifecycle {
    open: bool,
    replayed: bool,
}

/// Persistence layer of one account
pub struct Persistence {
    state: Arc<dyn StorageAdapter>,
    history: Arc<dyn StorageAdapter>,
    lifecycle: Mutex<Lifecycle>,
    /// Cached counter value, loaded on ready
    key_index: Mutex<Option<i64>>,
    listeners: RwLock<Vec<Listener>>,
}

impl Persistence {
    pub fn new(state: Arc<dyn StorageAdapter>, history: Arc<dyn StorageAdapter>) -> Self {
        Self {
            state,
            history,
            lifecycle: Mutex::new(Lifecycle::default()),
            key_index: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Volatile store, mostly for tests
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAdapter::new()), Arc::new(MemoryAdapter::new()))
    }

    /// Register a callback for store events
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(e) => warn!("Listener registry poisoned: {}", e),
        }
    }

    fn emit(&self, event: StoreEvent) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(e) => {
                warn!("Listener registry poisoned: {}", e);
                return;
            }
        };
        for listener in listeners {
            listener(&event);
        }
    }

    /// Open both stores, replay live records and load the counter
    ///
    /// Does nothing while the store is open. A failed attempt is retried on
    /// the next call; after `close` the next call reopens both stores.
    pub async fn ready(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.open {
            self.initialize(!lifecycle.replayed).await?;
            lifecycle.open = true;
            lifecycle.replayed = true;
        }
        Ok(())
    }

    async fn initialize(&self, replay: bool) -> Result<()> {
        self.history.open().await?;
        self.state.open().await?;

        let mut replayed = 0usize;
        if replay {
            let mut entries = self.state.stream(RangeOptions::default()).await?;
            while let Some(entry) = entries.next().await {
                let (key, value) = entry?;
                if key == KEY_INDEX_KEY {
                    continue;
                }
                match Record::decode(&key, &value) {
                    Ok(record) => {
                        replayed += 1;
                        self.emit(StoreEvent::Replayed(record));
                    }
                    Err(e) => warn!("Skipping unreadable record {}: {}", key, e),
                }
            }
        }

        let index = match self.state.get(KEY_INDEX_KEY).await {
            Ok(value) => parse_key_index(&value)?,
            Err(e) if e.is_not_found() => {
                self.state.put(KEY_INDEX_KEY, b"0".to_vec()).await?;
                0
            }
            Err(e) => return Err(e),
        };
        *self.key_index.lock().await = Some(index);

        info!("Store ready: {} records replayed, key index {}", replayed, index);
        Ok(())
    }

    /// Close the state store, then the history store
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.state.close().await?;
        self.history.close().await?;
        lifecycle.open = false;
        *self.key_index.lock().await = None;
        debug!("Store closed");
        Ok(())
    }

    /// Durably advance the address index counter and return the new value
    ///
    /// Concurrent callers always receive distinct, consecutive values. The
    /// cached counter only moves after the write lands.
    pub async fn increment(&self) -> Result<u64> {
        self.ready().await?;

        let mut cached = self.key_index.lock().await;
        let current = match *cached {
            Some(index) => index,
            None => parse_key_index(&self.state.get(KEY_INDEX_KEY).await?)?,
        };
        verify_key_index(current)?;

        let next = current + 1;
        verify_key_index(next)?;

        self.state
            .put(KEY_INDEX_KEY, next.to_string().into_bytes())
            .await?;
        *cached = Some(next);

        Ok(next as u64)
    }

    /// Current counter value without advancing it
    pub async fn key_index(&self) -> Result<u64> {
        self.ready().await?;
        let cached = self.key_index.lock().await;
        let current = cached.ok_or_else(|| Error::IllegalKeyIndex("not loaded".to_string()))?;
        verify_key_index(current)?;
        Ok(current as u64)
    }

    pub async fn get(&self, key: &RecordKey) -> Result<Record> {
        self.ready().await?;
        let encoded = key.to_key();
        let value = self.state.get(&encoded).await?;
        Record::decode(&encoded, &value)
    }

    pub async fn contains(&self, key: &RecordKey) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write a record
    ///
    /// CDAs are write-once: writing an address already in the store fails
    /// with `CdaAlreadyInStore`.
    pub async fn put(&self, record: Record) -> Result<()> {
        self.ready().await?;
        let key = record.key();

        if let RecordKey::Cda(address) = &key {
            if self.contains(&key).await? {
                return Err(Error::CdaAlreadyInStore(address.clone()));
            }
        }

        self.state.put(&key.to_key(), record.encode()?).await?;
        debug!("Wrote {}", key);
        self.emit(StoreEvent::Written(record));
        Ok(())
    }

    pub async fn del(&self, key: RecordKey) -> Result<()> {
        self.ready().await?;
        self.state.del(&key.to_key()).await?;
        debug!("Deleted {}", key);
        self.emit(StoreEvent::Deleted(key));
        Ok(())
    }

    /// Apply all operations atomically, then emit one event per operation
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.ready().await?;

        let mut raw = Vec::with_capacity(ops.len());
        for op in &ops {
            raw.push(match op {
                BatchOp::Put(record) => AdapterOp::Put {
                    key: record.key().to_key(),
                    value: record.encode()?,
                },
                BatchOp::Del(key) => AdapterOp::Del { key: key.to_key() },
            });
        }

        self.state.batch(raw).await?;
        debug!("Applied batch of {} operations", ops.len());

        for op in ops {
            self.emit(match op {
                BatchOp::Put(record) => StoreEvent::Written(record),
                BatchOp::Del(key) => StoreEvent::Deleted(key),
            });
        }
        Ok(())
    }

    /// Live records whose key starts with `prefix`
    pub async fn records(&self, prefix: &str) -> Result<Vec<Record>> {
        self.ready().await?;
        let mut entries = self.state.stream(RangeOptions::prefix(prefix)).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next().await {
            let (key, value) = entry?;
            records.push(Record::decode(&key, &value)?);
        }
        Ok(records)
    }

    pub async fn history_get(&self, key: &str) -> Result<Vec<u8>> {
        self.ready().await?;
        self.history.get(key).await
    }

    pub async fn history_put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.ready().await?;
        self.history.put(key, value).await
    }

    pub async fn history_del(&self, key: &str) -> Result<()> {
        self.ready().await?;
        self.history.del(key).await
    }

    /// Stream history entries within `options`
    pub async fn history_stream(&self, options: RangeOptions) -> Result<EntryStream> {
        self.ready().await?;
        self.history.stream(options).await
    }
}

fn parse_key_index(value: &[u8]) -> Result<i64> {
    let text = std::str::from_utf8(value)
        .map_err(|_| Error::IllegalKeyIndex("not utf-8".to_string()))?;
    text.trim()
        .parse::<i64>()
        .map_err(|_| Error::IllegalKeyIndex(text.to_string()))
}

fn verify_key_index(index: i64) -> Result<()> {
    if !(0..=MAX_SAFE_INTEGER).contains(&index) {
        return Err(Error::IllegalKeyIndex(index.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::adapter::testing::FaultyAdapter;
    use super::*;
    use crate::cda::CdaInput;
    use crate::signing::Security;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn cda(tag: char) -> CdaInput {
        CdaInput {
            address: tag.to_string().repeat(81),
            index: 1,
            security: Security::Medium,
            timeout_at: 0,
            multi_use: true,
            expected_amount: None,
            balance: None,
        }
    }

    #[tokio::test]
    async fn test_counter_starts_at_zero() {
        let store = Persistence::in_memory();
        assert_eq!(store.key_index().await.unwrap(), 0);
        assert_eq!(store.increment().await.unwrap(), 1);
        assert_eq!(store.increment().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_distinct() {
        let state = Arc::new(MemoryAdapter::new());
        let store = Arc::new(Persistence::new(state.clone(), Arc::new(MemoryAdapter::new())));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment().await.unwrap() })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            assert!(seen.insert(task.await.unwrap()));
        }
        assert_eq!(seen, (1..=50).collect::<HashSet<u64>>());
        assert_eq!(state.get(KEY_INDEX_KEY).await.unwrap(), b"50".to_vec());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_counter_unchanged() {
        let state = Arc::new(FaultyAdapter::default());
        let store = Persistence::new(state.clone(), Arc::new(MemoryAdapter::new()));
        assert_eq!(store.increment().await.unwrap(), 1);

        state.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(store.increment().await, Err(Error::Storage(_))));

        state.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(store.increment().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_illegal_stored_counter() {
        let state = Arc::new(MemoryAdapter::new());
        state.put(KEY_INDEX_KEY, b"-1".to_vec()).await.unwrap();
        let store = Persistence::new(state, Arc::new(MemoryAdapter::new()));
        assert!(matches!(store.increment().await, Err(Error::IllegalKeyIndex(_))));

        let state = Arc::new(MemoryAdapter::new());
        state
            .put(KEY_INDEX_KEY, MAX_SAFE_INTEGER.to_string().into_bytes())
            .await
            .unwrap();
        let store = Persistence::new(state, Arc::new(MemoryAdapter::new()));
        assert!(matches!(store.increment().await, Err(Error::IllegalKeyIndex(_))));
    }

    #[tokio::test]
    async fn test_events_follow_writes() {
        let store = Persistence::in_memory();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let events = events.clone();
            store.add_listener(move |event| events.lock().unwrap().push(event.clone()));
        }

        let input = cda('A');
        store.put(Record::Cda(input.clone())).await.unwrap();
        assert!(matches!(
            store.put(Record::Cda(input.clone())).await,
            Err(Error::CdaAlreadyInStore(_))
        ));
        store
            .batch(vec![BatchOp::Del(RecordKey::Cda(input.address.clone())), BatchOp::Put(Record::Cda(cda('B')))])
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StoreEvent::Written(Record::Cda(c)) if c.address == input.address));
        assert!(matches!(&events[1], StoreEvent::Deleted(RecordKey::Cda(a)) if *a == input.address));
        assert!(matches!(&events[2], StoreEvent::Written(Record::Cda(_))));
    }

    #[tokio::test]
    async fn test_failed_batch_emits_nothing() {
        let state = Arc::new(FaultyAdapter::default());
        let store = Persistence::new(state.clone(), Arc::new(MemoryAdapter::new()));
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let count = count.clone();
            store.add_listener(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        store.ready().await.unwrap();

        state.fail_writes.store(true, Ordering::SeqCst);
        assert!(store.batch(vec![BatchOp::Put(Record::Cda(cda('C')))]).await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!store.contains(&RecordKey::Cda("C".repeat(81))).await.unwrap());
    }

    #[tokio::test]
    async fn test_ready_replays_live_records() {
        let state = Arc::new(MemoryAdapter::new());
        {
            let store = Persistence::new(state.clone(), Arc::new(MemoryAdapter::new()));
            store.put(Record::Cda(cda('D'))).await.unwrap();
            store.put(Record::Cda(cda('E'))).await.unwrap();
            store.increment().await.unwrap();
        }

        let store = Persistence::new(state, Arc::new(MemoryAdapter::new()));
        let replayed = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let replayed = replayed.clone();
            store.add_listener(move |event| {
                if let StoreEvent::Replayed(record) = event {
                    replayed.lock().unwrap().push(record.key());
                }
            });
        }

        store.ready().await.unwrap();
        store.ready().await.unwrap();

        let replayed = replayed.lock().unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(store.key_index().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_then_ready_reopens_without_replay() {
        let state = Arc::new(MemoryAdapter::new());
        let store = Persistence::new(state.clone(), Arc::new(MemoryAdapter::new()));
        let replayed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let replayed = replayed.clone();
            store.add_listener(move |event| {
                if let StoreEvent::Replayed(_) = event {
                    replayed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        state.put(&RecordKey::Cda("F".repeat(81)).to_key(), Record::Cda(cda('F')).encode().unwrap())
            .await
            .unwrap();

        assert_eq!(store.increment().await.unwrap(), 1);
        assert_eq!(replayed.load(Ordering::SeqCst), 1);

        store.close().await.unwrap();
        assert!(state.get(KEY_INDEX_KEY).await.is_err());

        assert_eq!(store.increment().await.unwrap(), 2);
        assert!(store.contains(&RecordKey::Cda("F".repeat(81))).await.unwrap());
        assert_eq!(replayed.load(Ordering::SeqCst), 1);
    }
}
