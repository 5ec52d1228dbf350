//! Result ledger.
//!
//! Hierarchical status records in the shared store:
//!
//! ```text
//! {prefix}/{event_id}                   EventResult
//! {prefix}/{event_id}/{no}              TaskResult
//! {prefix}/{event_id}/{no}/{node}       NodeTaskResult
//! {prefix}/{event_id}/{no}/{node}/log   captured output of that node
//! ```
//!
//! The ledger is both the source of truth for "is this instance done" and
//! the externally queryable execution history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    InProgress,
    Success,
    Error,
    Skip,
    Timeout,
}

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultStatus::InProgress)
    }

    /// Error and timeout abort the rest of the in-progress queue.
    pub fn aborts_queue(&self) -> bool {
        matches!(self, ResultStatus::Error | ResultStatus::Timeout)
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::InProgress => write!(f, "inprogress"),
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::Error => write!(f, "error"),
            ResultStatus::Skip => write!(f, "skip"),
            ResultStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of an entire dispatched event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub id: String,
    pub name: String,
    pub status: ResultStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl EventResult {
    pub fn started(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ResultStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, status: ResultStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Aggregate result of one task instance across all nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub event_id: String,
    pub no: u32,
    pub name: String,
    pub status: ResultStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn started(event_id: impl Into<String>, no: u32, name: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            no,
            name: name.into(),
            status: ResultStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, status: ResultStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Result of one task instance on a single node.
///
/// The captured log is stored under its own key and is not part of the
/// serialized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTaskResult {
    pub event_id: String,
    pub no: u32,
    pub node: String,
    pub status: ResultStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub log: String,
}

impl NodeTaskResult {
    pub fn started(event_id: impl Into<String>, no: u32, node: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            no,
            node: node.into(),
            status: ResultStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            log: String::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("prefix", &self.prefix).finish()
    }
}

impl Ledger {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn event_key(&self, event_id: &str) -> String {
        format!("{}/{}", self.prefix, event_id)
    }

    pub fn task_key(&self, event_id: &str, no: u32) -> String {
        format!("{}/{}/{}", self.prefix, event_id, no)
    }

    pub fn node_key(&self, event_id: &str, no: u32, node: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, event_id, no, node)
    }

    async fn get_record<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(pair) if !pair.value.is_empty() => Ok(Some(serde_json::from_slice(&pair.value)?)),
            _ => Ok(None),
        }
    }

    async fn put_record<T: Serialize + Sync>(&self, key: &str, record: &T) -> Result<()> {
        self.store.put(key, serde_json::to_vec(record)?).await
    }

    /// Write `record` only if nothing is stored under `key` yet.
    async fn create_record<T: Serialize + Sync>(&self, key: &str, record: &T) -> Result<bool> {
        self.store.cas(key, serde_json::to_vec(record)?, 0).await
    }

    pub async fn event(&self, event_id: &str) -> Result<Option<EventResult>> {
        self.get_record(&self.event_key(event_id)).await
    }

    pub async fn save_event(&self, result: &EventResult) -> Result<()> {
        self.put_record(&self.event_key(&result.id), result).await
    }

    /// Every recorded event, ordered by start time
    pub async fn events(&self) -> Result<Vec<EventResult>> {
        let root = format!("{}/", self.prefix);
        let mut results = Vec::new();
        for pair in self.store.list(&root).await? {
            let rest = &pair.key[root.len()..];
            if rest.is_empty() || rest.contains('/') || pair.value.is_empty() {
                continue;
            }
            results.push(serde_json::from_slice::<EventResult>(&pair.value)?);
        }
        results.sort_by_key(|r| r.started_at);
        Ok(results)
    }

    pub async fn task(&self, event_id: &str, no: u32) -> Result<Option<TaskResult>> {
        self.get_record(&self.task_key(event_id, no)).await
    }

    pub async fn save_task(&self, result: &TaskResult) -> Result<()> {
        self.put_record(&self.task_key(&result.event_id, result.no), result)
            .await
    }

    /// Every task result recorded for an event, ordered by sequence number
    pub async fn tasks(&self, event_id: &str) -> Result<Vec<TaskResult>> {
        let root = format!("{}/", self.event_key(event_id));
        let mut results = Vec::new();
        for pair in self.store.list(&root).await? {
            let rest = &pair.key[root.len()..];
            if rest.is_empty() || rest.contains('/') || pair.value.is_empty() {
                continue;
            }
            results.push(serde_json::from_slice::<TaskResult>(&pair.value)?);
        }
        results.sort_by_key(|r| r.no);
        Ok(results)
    }

    /// Fetch the task result, or a fresh in-progress one if none exists yet.
    /// The fresh record is not persisted.
    pub async fn task_or_new(&self, event_id: &str, no: u32, name: &str) -> Result<TaskResult> {
        Ok(self
            .task(event_id, no)
            .await?
            .unwrap_or_else(|| TaskResult::started(event_id, no, name)))
    }

    pub async fn node_result(
        &self,
        event_id: &str,
        no: u32,
        node: &str,
    ) -> Result<Option<NodeTaskResult>> {
        let key = self.node_key(event_id, no, node);
        let Some(mut result) = self.get_record::<NodeTaskResult>(&key).await? else {
            return Ok(None);
        };
        if let Some(log) = self.store.get(&format!("{key}/log")).await? {
            result.log = log.value_str();
        }
        Ok(Some(result))
    }

    pub async fn save_node_result(&self, result: &NodeTaskResult) -> Result<()> {
        let key = self.node_key(&result.event_id, result.no, &result.node);
        self.put_record(&key, result).await?;
        self.store
            .put(&format!("{key}/log"), result.log.clone().into_bytes())
            .await
    }

    /// Every node result recorded for a task instance, logs included
    pub async fn node_results(&self, event_id: &str, no: u32) -> Result<Vec<NodeTaskResult>> {
        let root = format!("{}/", self.task_key(event_id, no));
        let pairs = self.store.list(&root).await?;

        let mut results = Vec::new();
        for pair in &pairs {
            let node = &pair.key[root.len()..];
            if node.is_empty() || node.contains('/') || pair.value.is_empty() {
                continue;
            }
            let mut result: NodeTaskResult = serde_json::from_slice(&pair.value)?;
            let log_key = format!("{}/log", pair.key);
            if let Some(log) = pairs.iter().find(|p| p.key == log_key) {
                result.log = log.value_str();
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Record that `node` started the instance, creating the task result
    /// first if this is the first node to touch it.
    pub async fn write_start(
        &self,
        event_id: &str,
        no: u32,
        name: &str,
        node: &str,
    ) -> Result<NodeTaskResult> {
        let task = TaskResult::started(event_id, no, name);
        if self.create_record(&self.task_key(event_id, no), &task).await? {
            tracing::debug!(event_id, no, task = name, "Task result created");
        }

        let result = NodeTaskResult::started(event_id, no, node);
        self.save_node_result(&result).await?;
        Ok(result)
    }

    /// Record the terminal status and captured output for `node`.
    pub async fn write_finish(
        &self,
        event_id: &str,
        no: u32,
        node: &str,
        status: ResultStatus,
        log: String,
    ) -> Result<NodeTaskResult> {
        let mut result = self
            .node_result(event_id, no, node)
            .await?
            .unwrap_or_else(|| NodeTaskResult::started(event_id, no, node));
        result.status = status;
        result.finished_at = Some(Utc::now());
        result.log = log;
        self.save_node_result(&result).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ResultStatus::InProgress).unwrap(),
            "\"inprogress\""
        );
        assert_eq!(
            serde_json::from_str::<ResultStatus>("\"timeout\"").unwrap(),
            ResultStatus::Timeout
        );
    }

    #[test]
    fn status_display_matches_wire_format() {
        for status in [
            ResultStatus::InProgress,
            ResultStatus::Success,
            ResultStatus::Error,
            ResultStatus::Skip,
            ResultStatus::Timeout,
        ] {
            assert_eq!(
                format!("\"{status}\""),
                serde_json::to_string(&status).unwrap()
            );
        }
    }

    #[test]
    fn terminal_and_abort_classification() {
        assert!(!ResultStatus::InProgress.is_terminal());
        assert!(ResultStatus::Skip.is_terminal());
        assert!(ResultStatus::Error.aborts_queue());
        assert!(ResultStatus::Timeout.aborts_queue());
        assert!(!ResultStatus::Success.aborts_queue());
        assert!(!ResultStatus::Skip.aborts_queue());
    }

    #[test]
    fn node_result_log_is_not_serialized() {
        let mut result = NodeTaskResult::started("e1", 0, "web-1");
        result.log = "secret output".to_string();
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("secret output"));
        assert!(!json.contains("finished_at"));
    }

    #[test]
    fn event_result_finish_sets_time() {
        let mut result = EventResult::started("e1", "deploy");
        assert!(result.finished_at.is_none());
        result.finish(ResultStatus::Success);
        assert_eq!(result.status, ResultStatus::Success);
        assert!(result.finished_at.is_some());
    }
}
