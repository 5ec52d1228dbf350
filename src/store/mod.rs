//! Shared key/value store abstraction.
//!
//! Every piece of cross-node state (queues, the decision lock, the result
//! ledger) is built from the primitives in [`KvStore`]. Any store offering a
//! linearizable compare-and-swap on a single key plus prefix listing can back
//! a cluster:
//!
//! - [`MemoryStore`]: in-process, used by tests and single-process setups
//! - [`ConsulStore`]: Consul KV over HTTP
//!
//! # Versions
//!
//! Each stored value carries an opaque, monotonically increasing `version`
//! (Consul's `ModifyIndex`). [`KvStore::cas`] with `version == 0` writes only
//! when the key does not exist yet.

pub mod consul;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use consul::ConsulStore;
pub use memory::MemoryStore;

/// A single stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

impl KvPair {
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a key. Absent keys are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<KvPair>>;

    /// Write unconditionally.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Write only if the key's current version equals `version`.
    ///
    /// Returns `Ok(false)` when another writer got there first; that is a
    /// normal outcome, not an error.
    async fn cas(&self, key: &str, value: Vec<u8>, version: u64) -> Result<bool>;

    /// Delete a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key under `prefix`.
    async fn delete_tree(&self, prefix: &str) -> Result<()>;

    /// List every entry whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Block until the named mutual-exclusion lock is held.
    async fn lock(&self, key: &str) -> Result<Box<dyn KvLock>>;
}

/// A held distributed lock.
#[async_trait]
pub trait KvLock: Send {
    async fn unlock(self: Box<Self>) -> Result<()>;
}
