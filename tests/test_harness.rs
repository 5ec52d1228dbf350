//! Test harness for multi-node agent tests.
//!
//! Every node shares one in-memory store and one static catalog, which is
//! all the coordination the agents have in production as well.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convoy::agent::Agent;
use convoy::catalog::StaticCatalog;
use convoy::config::{AgentConfig, BackoffConfig, TimeoutConfig};
use convoy::dispatch::{EventTask, QueueEventSink, Trigger};
use convoy::error::{ConvoyError, Result};
use convoy::ledger::Ledger;
use convoy::operation::OperationRegistry;
use convoy::queue::SharedQueue;
use convoy::schedule::Schedule;
use convoy::store::{KvLock, KvPair, KvStore, MemoryStore};
use tempfile::TempDir;

pub const PREFIX: &str = "convoy";

/// Backoff short enough to keep conflict retries fast in tests
pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig { min_ms: 1, max_ms: 5 }
}

pub struct TestCluster {
    pub store: Arc<MemoryStore>,
    pub catalog: Arc<StaticCatalog>,
    pub schedule: Arc<Schedule>,
    pub dir: TempDir,
}

impl TestCluster {
    /// Write each `(pattern, yaml)` to `<tmp>/<pattern>/pattern.yml` and load
    /// them in order.
    pub fn new(patterns: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut paths: Vec<PathBuf> = Vec::new();
        for (name, yaml) in patterns {
            let pattern_dir = dir.path().join(name);
            std::fs::create_dir_all(&pattern_dir).unwrap();
            let path = pattern_dir.join("pattern.yml");
            std::fs::write(&path, yaml).unwrap();
            paths.push(path);
        }
        let schedule = Schedule::load(&paths, &OperationRegistry::builtin()).unwrap();

        Self {
            store: Arc::new(MemoryStore::new()),
            catalog: Arc::new(StaticCatalog::new()),
            schedule: Arc::new(schedule),
            dir,
        }
    }

    /// Register a node advertising `services` as (name, tags).
    pub fn add_node(&self, name: &str, services: &[(&str, &[&str])]) {
        self.catalog.add_node(name, &format!("10.0.0.{}", name.len()));
        for (service, tags) in services {
            self.catalog.add_service(name, service, tags);
        }
    }

    pub fn config(&self, node: &str) -> AgentConfig {
        let mut config = AgentConfig::new(node);
        config.key_prefix = PREFIX.to_string();
        config.poll_interval = Duration::from_millis(10);
        config.backoff = fast_backoff();
        config.timeouts = TimeoutConfig {
            start: Duration::from_secs(5),
            run: Duration::from_secs(30),
        };
        config
    }

    pub fn agent(&self, node: &str) -> Agent {
        self.agent_with(self.config(node))
    }

    pub fn agent_with(&self, config: AgentConfig) -> Agent {
        self.agent_on(config, self.store.clone())
    }

    /// Build an agent that talks to `store` instead of the shared memory
    /// store, typically a [`FaultyStore`] wrapping it.
    pub fn agent_on(&self, config: AgentConfig, store: Arc<dyn KvStore>) -> Agent {
        let sink = Arc::new(QueueEventSink::new(self.triggers()));
        Agent::new(config, store, self.catalog.clone(), sink, self.schedule.clone())
    }

    pub fn triggers(&self) -> SharedQueue<Trigger> {
        SharedQueue::with_backoff(
            self.store.clone(),
            format!("{PREFIX}/queue/events"),
            fast_backoff(),
        )
    }

    pub fn progress(&self) -> SharedQueue<EventTask> {
        SharedQueue::with_backoff(
            self.store.clone(),
            format!("{PREFIX}/queue/progress"),
            fast_backoff(),
        )
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.store.clone(), format!("{PREFIX}/results"))
    }

    /// Queue a trigger directly, bypassing the push checks.
    pub async fn trigger(&self, id: &str, name: &str) {
        self.triggers()
            .enqueue(Trigger::new(name).with_id(id))
            .await
            .unwrap();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Put,
    Cas,
}

/// Store wrapper that fails chosen calls once and records when locks are
/// taken. Everything else goes to the wrapped store.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    faults: Mutex<Vec<(StoreOp, String)>>,
    lock_times: Mutex<Vec<tokio::time::Instant>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(Vec::new()),
            lock_times: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next `op` on a key starting with `prefix`
    pub fn fail_once(&self, op: StoreOp, prefix: &str) {
        self.faults.lock().unwrap().push((op, prefix.to_string()));
    }

    pub fn lock_times(&self) -> Vec<tokio::time::Instant> {
        self.lock_times.lock().unwrap().clone()
    }

    fn check(&self, op: StoreOp, key: &str) -> Result<()> {
        let mut faults = self.faults.lock().unwrap();
        match faults
            .iter()
            .position(|(fault, prefix)| *fault == op && key.starts_with(prefix.as_str()))
        {
            Some(index) => {
                faults.remove(index);
                Err(ConvoyError::Store(format!("injected {op:?} failure on {key}")))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        self.check(StoreOp::Get, key)?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check(StoreOp::Put, key)?;
        self.inner.put(key, value).await
    }

    async fn cas(&self, key: &str, value: Vec<u8>, version: u64) -> Result<bool> {
        self.check(StoreOp::Cas, key)?;
        self.inner.cas(key, value, version).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        self.inner.delete_tree(prefix).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.inner.list(prefix).await
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn KvLock>> {
        let lock = self.inner.lock(key).await?;
        self.lock_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        Ok(lock)
    }
}

/// Wait for a condition to become true, polling every `interval`.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    condition().await
}

pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
