//! Storage adapter port and the in-memory adapter

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Stream of `(key, value)` entries
pub type EntryStream = BoxStream<'static, Result<(String, Vec<u8>)>>;

/// Raw adapter operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterOp {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

/// Key range for streaming reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOptions {
    pub gt: Option<String>,
    pub gte: Option<String>,
    pub lt: Option<String>,
    pub lte: Option<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl RangeOptions {
    /// All keys starting with `prefix`
    pub fn prefix(prefix: &str) -> Self {
        Self::default().within_prefix(prefix)
    }

    /// Narrow these options to keys starting with `prefix`
    pub fn within_prefix(mut self, prefix: &str) -> Self {
        let scoped = |bound: Option<String>| bound.map(|b| format!("{}{}", prefix, b));
        self.gt = scoped(self.gt);
        self.lt = scoped(self.lt);
        self.lte = scoped(self.lte);
        self.gte = Some(scoped(self.gte).unwrap_or_else(|| prefix.to_string()));
        if self.lt.is_none() && self.lte.is_none() {
            self.lt = Some(prefix_end(prefix));
        }
        self
    }

    fn lower(&self) -> Bound<&str> {
        match (&self.gt, &self.gte) {
            (Some(gt), _) => Bound::Excluded(gt.as_str()),
            (None, Some(gte)) => Bound::Included(gte.as_str()),
            (None, None) => Bound::Unbounded,
        }
    }

    fn upper(&self) -> Bound<&str> {
        match (&self.lt, &self.lte) {
            (Some(lt), _) => Bound::Excluded(lt.as_str()),
            (None, Some(lte)) => Bound::Included(lte.as_str()),
            (None, None) => Bound::Unbounded,
        }
    }
}

/// Smallest string greater than every string starting with `prefix`
fn prefix_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < u8::MAX {
            bytes.push(last + 1);
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    String::new()
}

/// Select entries of an ordered map within `options`
pub(crate) fn select_range<V: Clone>(
    entries: &BTreeMap<String, V>,
    options: &RangeOptions,
) -> Vec<(String, V)> {
    let lower = options.lower();
    let upper = options.upper();

    // BTreeMap::range panics on inverted bounds, so filter instead
    let in_range = |key: &str| {
        let above = match lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below = match upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above && below
    };

    let limit = options.limit.unwrap_or(usize::MAX);
    let matching = entries.iter().filter(|(k, _)| in_range(k));

    if options.reverse {
        matching
            .rev()
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        matching
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Key-value storage backing the state and history stores
///
/// `get` distinguishes a missing key (`Error::NotFound`) from I/O failures.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Apply all operations or none
    async fn batch(&self, ops: Vec<AdapterOp>) -> Result<()>;

    /// Stream entries in key order within `options`
    async fn stream(&self, options: RangeOptions) -> Result<EntryStream>;
}

/// Volatile adapter over an ordered map
#[derive(Default)]
pub struct MemoryAdapter {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Storage("adapter is closed".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.check_open()?;
        self.entries
            .read()
            .map_err(|e| Error::Storage(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.check_open()?;
        self.entries
            .write()
            .map_err(|e| Error::Storage(format!("lock poisoned: {}", e)))
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn open(&self) -> Result<()> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn batch(&self, ops: Vec<AdapterOp>) -> Result<()> {
        let mut entries = self.write()?;
        for op in ops {
            match op {
                AdapterOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                AdapterOp::Del { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn stream(&self, options: RangeOptions) -> Result<EntryStream> {
        let selected = select_range(&*self.read()?, &options);
        Ok(stream::iter(selected.into_iter().map(Ok)).boxed())
    }
}
