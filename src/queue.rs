use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::BackoffConfig;
use crate::error::{ConvoyError, Result};
use crate::store::KvStore;

/// Generates a random retry delay within the configured range
pub fn random_backoff(backoff: &BackoffConfig) -> Duration {
    let (min, max) = if backoff.min_ms <= backoff.max_ms {
        (backoff.min_ms, backoff.max_ms)
    } else {
        (backoff.max_ms, backoff.min_ms)
    };
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min..=max))
}

/// Ordered list persisted as one JSON array under a single store key.
///
/// Every mutation is read, modify, compare-and-swap. A lost swap is retried
/// after a randomized backoff, so no enqueue or dequeue is silently dropped;
/// latency under heavy contention is unbounded.
pub struct SharedQueue<T> {
    store: Arc<dyn KvStore>,
    key: String,
    backoff: BackoffConfig,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            backoff: self.backoff.clone(),
            _item: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for SharedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedQueue").field("key", &self.key).finish()
    }
}

impl<T> SharedQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self::with_backoff(store, key, BackoffConfig::default())
    }

    pub fn with_backoff(
        store: Arc<dyn KvStore>,
        key: impl Into<String>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            backoff,
            _item: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append an item at the tail
    pub async fn enqueue(&self, item: T) -> Result<()> {
        self.update(|items| {
            items.push(item.clone());
            ((), true)
        })
        .await
    }

    /// Append every item at the tail in a single write
    pub async fn enqueue_all(&self, new_items: Vec<T>) -> Result<()> {
        if new_items.is_empty() {
            return Ok(());
        }
        self.update(|items| {
            items.extend(new_items.iter().cloned());
            ((), true)
        })
        .await
    }

    /// Append an item unless an already-queued item satisfies `exists`.
    /// Returns false when the item was not added.
    pub async fn enqueue_unless<F>(&self, item: T, exists: F) -> Result<bool>
    where
        F: Fn(&T) -> bool,
    {
        self.update(|items| {
            if items.iter().any(&exists) {
                (false, false)
            } else {
                items.push(item.clone());
                (true, true)
            }
        })
        .await
    }

    /// Remove and return the head item
    pub async fn dequeue(&self) -> Result<Option<T>> {
        self.update(|items| {
            if items.is_empty() {
                (None, false)
            } else {
                (Some(items.remove(0)), true)
            }
        })
        .await
    }

    /// Remove the head item only if it satisfies `matches`
    pub async fn dequeue_if<F>(&self, matches: F) -> Result<Option<T>>
    where
        F: Fn(&T) -> bool,
    {
        self.update(|items| match items.first() {
            Some(head) if matches(head) => (Some(items.remove(0)), true),
            _ => (None, false),
        })
        .await
    }

    /// Remove every item
    pub async fn clear(&self) -> Result<usize> {
        self.update(|items| {
            let removed = items.len();
            items.clear();
            (removed, removed > 0)
        })
        .await
    }

    /// Read the head item without a write. May be stale by the time it
    /// returns.
    pub async fn peek_head(&self) -> Result<Option<T>> {
        Ok(self.items().await?.into_iter().next())
    }

    /// Snapshot of every queued item in order
    pub async fn items(&self) -> Result<Vec<T>> {
        let (items, _) = self.read().await?;
        Ok(items)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.items().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.items().await?.is_empty())
    }

    async fn read(&self) -> Result<(Vec<T>, u64)> {
        match self.store.get(&self.key).await? {
            None => Ok((Vec::new(), 0)),
            Some(pair) if pair.value.is_empty() => Ok((Vec::new(), pair.version)),
            Some(pair) => Ok((serde_json::from_slice(&pair.value)?, pair.version)),
        }
    }

    /// Apply `mutate` until a compare-and-swap succeeds. The closure
    /// returns its result and whether it changed the list; unchanged lists
    /// are not written back.
    async fn update<R, F>(&self, mut mutate: F) -> Result<R>
    where
        F: FnMut(&mut Vec<T>) -> (R, bool),
    {
        loop {
            match self.try_update(&mut mutate).await {
                Err(e) if e.is_retryable() => {
                    let delay = random_backoff(&self.backoff);
                    tracing::warn!(key = %self.key, delay_ms = delay.as_millis() as u64, "{}", e);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn try_update<R, F>(&self, mutate: &mut F) -> Result<R>
    where
        F: FnMut(&mut Vec<T>) -> (R, bool),
    {
        let (mut items, version) = self.read().await?;
        let (result, changed) = mutate(&mut items);
        if !changed {
            return Ok(result);
        }

        let data = serde_json::to_vec(&items)?;
        if self.store.cas(&self.key, data, version).await? {
            Ok(result)
        } else {
            Err(ConvoyError::Conflict(self.key.clone()))
        }
    }
}
