//! Per-node agent: the polling state machine.
//!
//! Every node runs the same loop. Each cycle takes the coarse decision lock,
//! looks at the head of the progress queue and does exactly one of:
//! dispatch a new event, run the head instance here, finalize the head
//! instance, or nothing. The lock is released before a task runs, so long
//! tasks never block other nodes from polling.

mod runner;

pub use runner::roll_up;

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, EventSink, EventTask, InstanceKey, Trigger};
use crate::error::{ConvoyError, Result};
use crate::ledger::{Ledger, ResultStatus};
use crate::queue::SharedQueue;
use crate::schedule::Schedule;
use crate::status::{self, StatusState};
use crate::store::KvStore;
use crate::watchdog::{ForcedFinish, Watchdog};

/// What one polling cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Queue was empty and nothing was pending
    Idle,
    /// A trigger was expanded onto the progress queue
    Dispatched(String),
    /// This node ran its copy of the head instance
    Ran(InstanceKey, ResultStatus),
    /// The head instance was finalized and popped
    Finalized(InstanceKey, ResultStatus),
    /// The head instance is waiting on other nodes
    Waiting(InstanceKey),
}

enum Decision {
    Run(EventTask),
    Done(Cycle),
}

#[derive(Serialize)]
struct ServerRecord<'a> {
    roles: &'a [String],
    private_ip: String,
}

/// Everything a node needs, built once at startup and shared by the polling
/// loop, the watchdog and the status server.
pub struct Agent {
    config: AgentConfig,
    store: Arc<dyn KvStore>,
    catalog: Arc<dyn Catalog>,
    events: Arc<dyn EventSink>,
    schedule: Arc<Schedule>,
    dispatcher: Dispatcher,
    progress: SharedQueue<EventTask>,
    ledger: Ledger,
    forced: ForcedFinish,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("node", &self.config.node)
            .field("roles", &self.config.roles)
            .field("patterns", &self.schedule.patterns().len())
            .finish()
    }
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn KvStore>,
        catalog: Arc<dyn Catalog>,
        events: Arc<dyn EventSink>,
        schedule: Arc<Schedule>,
    ) -> Self {
        let progress = SharedQueue::with_backoff(
            store.clone(),
            config.progress_queue_key(),
            config.backoff.clone(),
        );
        let triggers: SharedQueue<Trigger> = SharedQueue::with_backoff(
            store.clone(),
            config.event_queue_key(),
            config.backoff.clone(),
        );
        let ledger = Ledger::new(store.clone(), config.results_prefix());
        let dispatcher = Dispatcher::new(
            schedule.clone(),
            store.clone(),
            config.lock_key(),
            triggers,
            progress.clone(),
            ledger.clone(),
        )
        .with_skippable(config.skippable)
        .with_shared_secret(config.shared_secret.clone());

        Self {
            config,
            store,
            catalog,
            events,
            schedule,
            dispatcher,
            progress,
            ledger,
            forced: ForcedFinish::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn progress(&self) -> &SharedQueue<EventTask> {
        &self.progress
    }

    pub fn forced_finish(&self) -> &ForcedFinish {
        &self.forced
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(
            self.progress.clone(),
            self.ledger.clone(),
            self.config.timeouts.clone(),
            self.config.poll_interval,
            self.forced.clone(),
        )
    }

    /// Publish this node's roles and address under `{prefix}/servers/{node}`.
    pub async fn register(&self) -> Result<()> {
        let address = self
            .catalog
            .address_of(&self.config.node)
            .await?
            .ok_or_else(|| {
                ConvoyError::Config(format!("Node {} is not in the catalog", self.config.node))
            })?;
        let record = ServerRecord {
            roles: &self.config.roles,
            private_ip: address,
        };
        self.store
            .put(&self.config.server_key(), serde_json::to_vec(&record)?)
            .await?;
        tracing::info!(node = %self.config.node, roles = ?self.config.roles, "Registered node");
        Ok(())
    }

    /// One polling cycle.
    pub async fn poll_once(&self) -> Result<Cycle> {
        let lock = self.store.lock(&self.config.lock_key()).await?;
        let decision = self.decide().await;
        lock.unlock().await?;

        match decision? {
            Decision::Run(instance) => {
                let status = self.run_task(&instance).await?;
                Ok(Cycle::Ran(instance.key(), status))
            }
            Decision::Done(cycle) => Ok(cycle),
        }
    }

    /// Decide what to do with the head instance; runs under the decision lock.
    async fn decide(&self) -> Result<Decision> {
        let items = self.progress.items().await?;
        let Some(head) = items.into_iter().next() else {
            return Ok(Decision::Done(match self.dispatcher.dispatch_event().await? {
                Some(id) => Cycle::Dispatched(id),
                None => Cycle::Idle,
            }));
        };

        if self.is_runnable(&head).await? {
            return Ok(Decision::Run(head));
        }

        if let Some(status) = self.finished_status(&head).await? {
            self.finish_task(&head, status).await?;
            return Ok(Decision::Done(Cycle::Finalized(head.key(), status)));
        }

        tracing::debug!(instance = %head, "Waiting for other nodes to finish task instance");
        Ok(Decision::Done(Cycle::Waiting(head.key())))
    }

    /// Poll until `shutdown` is cancelled. Cycle errors are logged and the
    /// next cycle tries again.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.register().await?;

        let watchdog = self.watchdog();
        let watchdog_shutdown = shutdown.clone();
        let watchdog_handle = tokio::spawn(async move {
            watchdog.run(watchdog_shutdown).await;
        });

        if let Some(addr) = self.config.status_addr {
            let state = StatusState::new(
                self.ledger.clone(),
                self.progress.clone(),
                self.dispatcher.events().clone(),
            );
            let status_shutdown = shutdown.clone();
            tokio::spawn(async move {
                status::serve(addr, state, status_shutdown).await;
            });
        }

        tracing::info!(
            node = %self.config.node,
            interval = ?self.config.poll_interval,
            "Agent polling started"
        );

        // Wait a full interval after every cycle, however long the cycle ran
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.poll_once().await {
                        Ok(Cycle::Idle) => {}
                        Ok(cycle) => tracing::debug!(cycle = ?cycle, "Polling cycle"),
                        Err(e) => tracing::error!(error = %e, "Polling cycle failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Agent shutting down");
                    break;
                }
            }
        }

        let _ = watchdog_handle.await;
        Ok(())
    }

    /// Run every event called `name` on this node right now, bypassing the
    /// queues and the ledger. Stops at the first failing task.
    pub async fn dispatch_local(&self, name: &str) -> Result<()> {
        let events = self.schedule.events_named(name);
        if events.is_empty() {
            return Err(ConvoyError::Definition(format!("Event {name} is not defined")));
        }

        for event in events {
            tracing::info!(event = %event, "Dispatching event locally");
            for task in event.task_names() {
                match self.run_definition(&event.pattern, task).await {
                    Ok(log) => tracing::debug!(task, output = %log, "Task finished"),
                    Err((e, log)) => {
                        tracing::error!(task, output = %log, "Task failed");
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}
