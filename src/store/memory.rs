use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::error::{ConvoyError, Result};
use crate::store::{KvLock, KvPair, KvStore};

/// In-memory store for tests and single-process clusters.
///
/// Versions are a store-wide modify index, so every successful write gets a
/// version strictly greater than any earlier one.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    injected_conflicts: AtomicUsize,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, (Vec<u8>, u64)>,
    index: u64,
}

impl State {
    fn write(&mut self, key: &str, value: Vec<u8>) {
        self.index += 1;
        self.entries.insert(key.to_string(), (value, self.index));
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` compare-and-swap writes fail as if another writer
    /// had updated the key first.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.fetch_add(n, Ordering::SeqCst);
    }

    /// Conflicts injected but not yet consumed.
    pub fn pending_conflicts(&self) -> usize {
        self.injected_conflicts.load(Ordering::SeqCst)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| ConvoyError::Store("memory store lock poisoned".into()))
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        let state = self.state()?;
        Ok(state.entries.get(key).map(|(value, version)| KvPair {
            key: key.to_string(),
            value: value.clone(),
            version: *version,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.state()?.write(key, value);
        Ok(())
    }

    async fn cas(&self, key: &str, value: Vec<u8>, version: u64) -> Result<bool> {
        if self.take_injected_conflict() {
            return Ok(false);
        }

        let mut state = self.state()?;
        let current = state.entries.get(key).map(|(_, v)| *v).unwrap_or(0);
        if current != version {
            return Ok(false);
        }
        state.write(key, value);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state()?.entries.remove(key);
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        self.state()?.entries.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let state = self.state()?;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (value, version))| KvPair {
                key: k.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect())
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn KvLock>> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| ConvoyError::Store("memory lock table poisoned".into()))?;
            locks.entry(key.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(Box::new(MemoryLock { _guard: guard }))
    }
}

struct MemoryLock {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl KvLock for MemoryLock {
    async fn unlock(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
