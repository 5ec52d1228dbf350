//! Dispatch engine.
//!
//! Upstream triggers land on the inbound event queue through [`Dispatcher::push`].
//! [`Dispatcher::dispatch_event`] takes the next trigger, expands every event
//! with that name into task instances and appends them to the progress queue.
//! The sequence number assigned here is the only ordering the cluster uses.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::catalog::NodeFilter;
use crate::error::{ConvoyError, Result};
use crate::ledger::{EventResult, Ledger, ResultStatus};
use crate::queue::SharedQueue;
use crate::schedule::{Event, EventBody, Schedule};
use crate::store::KvStore;

/// Identity of a task instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub event_id: String,
    pub no: u32,
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.event_id, self.no)
    }
}

/// An upstream request to run every event called `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Trigger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            payload: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Event notification as delivered by a Consul watch handler
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamEvent {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    /// Base64 encoded
    #[serde(rename = "Payload", default)]
    pub payload: Option<String>,
}

impl UpstreamEvent {
    pub fn into_trigger(self) -> Result<Trigger> {
        let payload = match self.payload.filter(|p| !p.is_empty()) {
            None => None,
            Some(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| ConvoyError::Store(format!("Invalid event payload: {e}")))?;
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
        };
        Ok(Trigger {
            id: self.id,
            name: self.name,
            payload,
        })
    }
}

/// One queued occurrence of a task, created when an event is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTask {
    pub pattern: String,
    pub id: String,
    pub no: u32,
    #[serde(flatten)]
    pub filter: NodeFilter,
    pub task: String,
    pub skippable: bool,
}

impl EventTask {
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            event_id: self.id.clone(),
            no: self.no,
        }
    }
}

impl std::fmt::Display for EventTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} (ID: {}, No: {}, Filter: {})",
            self.pattern, self.task, self.id, self.no, self.filter
        )
    }
}

/// Outbound event delivery, used by the `event` step.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Fire `name` at the nodes matching `filter`, returning the event ID.
    async fn fire(&self, name: &str, filter: &NodeFilter, payload: Option<&str>) -> Result<String>;
}

/// Delivers fired events straight onto the inbound event queue.
///
/// Used when there is no external event bus (the in-memory store); every
/// node shares the queue, so the filter is not applied.
#[derive(Debug, Clone)]
pub struct QueueEventSink {
    queue: SharedQueue<Trigger>,
}

impl QueueEventSink {
    pub fn new(queue: SharedQueue<Trigger>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventSink for QueueEventSink {
    async fn fire(&self, name: &str, filter: &NodeFilter, payload: Option<&str>) -> Result<String> {
        let mut trigger = Trigger::new(name);
        trigger.payload = payload.map(str::to_string);
        tracing::debug!(event = name, filter = %filter, id = %trigger.id, "Queueing fired event");
        let id = trigger.id.clone();
        self.queue.enqueue(trigger).await?;
        Ok(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Already queued or already dispatched
    Duplicate,
    /// Payload did not match the shared secret
    Rejected,
}

#[derive(Clone)]
pub struct Dispatcher {
    schedule: Arc<Schedule>,
    store: Arc<dyn KvStore>,
    lock_key: String,
    events: SharedQueue<Trigger>,
    progress: SharedQueue<EventTask>,
    ledger: Ledger,
    skippable: bool,
    shared_secret: Option<String>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("events", &self.events)
            .field("progress", &self.progress)
            .field("skippable", &self.skippable)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        schedule: Arc<Schedule>,
        store: Arc<dyn KvStore>,
        lock_key: impl Into<String>,
        events: SharedQueue<Trigger>,
        progress: SharedQueue<EventTask>,
        ledger: Ledger,
    ) -> Self {
        Self {
            schedule,
            store,
            lock_key: lock_key.into(),
            events,
            progress,
            ledger,
            skippable: true,
            shared_secret: None,
        }
    }

    /// Skippable flag stamped onto every instance this dispatcher creates
    pub fn with_skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    pub fn with_shared_secret(mut self, secret: Option<String>) -> Self {
        self.shared_secret = secret.filter(|s| !s.is_empty());
        self
    }

    /// Expand a trigger into its ordered task instances.
    ///
    /// Matching events are taken in priority order; instances are numbered
    /// from 0 across the whole expansion.
    pub fn expand(&self, trigger: &Trigger) -> Vec<EventTask> {
        let mut instances = Vec::new();
        for event in self.schedule.events_named(&trigger.name) {
            for (task, filter) in self.entries(event) {
                instances.push(EventTask {
                    pattern: event.pattern.clone(),
                    id: trigger.id.clone(),
                    no: instances.len() as u32,
                    filter,
                    task,
                    skippable: self.skippable,
                });
            }
        }
        instances
    }

    fn entries(&self, event: &Event) -> Vec<(String, NodeFilter)> {
        let task_filter = |task: &str| {
            self.schedule
                .task(&event.pattern, task)
                .map(|t| t.filter.clone())
                .unwrap_or_default()
        };
        match &event.body {
            EventBody::Single(task) => vec![(task.clone(), task_filter(task))],
            EventBody::Ordered(entries) => entries
                .iter()
                .map(|e| {
                    let filter = e.filter().unwrap_or_else(|| task_filter(&e.task));
                    (e.task.clone(), filter)
                })
                .collect(),
        }
    }

    /// Dispatch the trigger at the head of the event queue.
    ///
    /// The `EventResult` is saved first, then every instance is appended in
    /// one write, and the trigger is removed last. A failed cycle leaves the
    /// trigger in place. When the next cycle finds an in-progress
    /// `EventResult` for it, the instances are queued unless they already
    /// are. Returns the dispatched event ID, or `None` when nothing
    /// was pending or the trigger had already been dispatched.
    pub async fn dispatch_event(&self) -> Result<Option<String>> {
        let Some(trigger) = self.events.peek_head().await? else {
            return Ok(None);
        };

        let recorded = self.ledger.event(&trigger.id).await?;
        if recorded.as_ref().is_some_and(|e| e.status.is_terminal()) {
            tracing::info!(
                id = %trigger.id,
                event = %trigger.name,
                "Event already dispatched, skipping"
            );
            self.consume(&trigger).await?;
            return Ok(None);
        }

        let instances = self.expand(&trigger);
        if instances.is_empty() {
            tracing::warn!(
                id = %trigger.id,
                event = %trigger.name,
                "No pattern defines this event"
            );
            let mut result = EventResult::started(&trigger.id, &trigger.name);
            result.finish(ResultStatus::Skip);
            self.ledger.save_event(&result).await?;
            self.consume(&trigger).await?;
            return Ok(Some(trigger.id));
        }

        let count = instances.len();
        let queued = match recorded {
            Some(_) => {
                tracing::info!(
                    id = %trigger.id,
                    event = %trigger.name,
                    "Resuming interrupted dispatch"
                );
                let items = self.progress.items().await?;
                items.iter().any(|item| item.id == trigger.id)
            }
            None => {
                let result = EventResult::started(&trigger.id, &trigger.name);
                self.ledger.save_event(&result).await?;
                false
            }
        };

        if !queued {
            for instance in &instances {
                tracing::debug!(instance = %instance, "Enqueue task instance");
            }
            self.progress.enqueue_all(instances).await?;
        }
        self.consume(&trigger).await?;

        tracing::info!(
            id = %trigger.id,
            event = %trigger.name,
            instances = count,
            "Event dispatched"
        );
        Ok(Some(trigger.id))
    }

    async fn consume(&self, trigger: &Trigger) -> Result<()> {
        self.events
            .dequeue_if(|head: &Trigger| head.id == trigger.id)
            .await?;
        Ok(())
    }

    /// Put a trigger on the event queue unless it is a duplicate.
    pub async fn push(&self, trigger: Trigger) -> Result<PushOutcome> {
        if let Some(secret) = &self.shared_secret {
            if trigger.payload.as_deref() != Some(secret.as_str()) {
                tracing::warn!(
                    id = %trigger.id,
                    event = %trigger.name,
                    "Rejecting trigger with invalid secret"
                );
                return Ok(PushOutcome::Rejected);
            }
        }

        let lock = self.store.lock(&self.lock_key).await?;
        let outcome = self.push_locked(trigger).await;
        lock.unlock().await?;
        outcome
    }

    async fn push_locked(&self, trigger: Trigger) -> Result<PushOutcome> {
        if self.ledger.event(&trigger.id).await?.is_some() {
            tracing::info!(id = %trigger.id, "Trigger already dispatched");
            return Ok(PushOutcome::Duplicate);
        }

        let id = trigger.id.clone();
        let name = trigger.name.clone();
        let queued = self
            .events
            .enqueue_unless(trigger, |queued: &Trigger| queued.id == id)
            .await?;
        if queued {
            tracing::info!(id = %id, event = %name, "Pushed trigger to event queue");
            Ok(PushOutcome::Queued)
        } else {
            tracing::info!(id = %id, "Trigger already queued");
            Ok(PushOutcome::Duplicate)
        }
    }

    pub fn schedule(&self) -> &Arc<Schedule> {
        &self.schedule
    }

    pub fn progress(&self) -> &SharedQueue<EventTask> {
        &self.progress
    }

    pub fn events(&self) -> &SharedQueue<Trigger> {
        &self.events
    }
}
