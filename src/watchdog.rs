//! Timeout watchdog.
//!
//! Follows the head of the progress queue. Each head instance gets a start
//! budget (some node must begin it) and then a run budget (it must be popped).
//! When a budget runs out the watchdog fires [`ForcedFinish`] for that
//! instance, and the next polling cycle finalizes it regardless of which
//! nodes have reported.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::TimeoutConfig;
use crate::dispatch::{EventTask, InstanceKey};
use crate::ledger::Ledger;
use crate::queue::SharedQueue;

/// One-shot forced-finish signal for the tracked instance.
///
/// Tracking a different instance replaces the signal, so a late fire for an
/// old instance never leaks into the new one.
#[derive(Debug, Clone, Default)]
pub struct ForcedFinish {
    current: Arc<Mutex<Option<(InstanceKey, CancellationToken)>>>,
}

impl ForcedFinish {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `key`; a no-op if it is already tracked.
    pub fn track(&self, key: &InstanceKey) -> CancellationToken {
        let Ok(mut current) = self.current.lock() else {
            return CancellationToken::new();
        };
        match current.as_ref() {
            Some((tracked, token)) if tracked == key => token.clone(),
            _ => {
                let token = CancellationToken::new();
                *current = Some((key.clone(), token.clone()));
                token
            }
        }
    }

    /// Signal that `key` must be finalized now. Returns false if `key` is
    /// not the tracked instance.
    pub fn fire(&self, key: &InstanceKey) -> bool {
        let Ok(current) = self.current.lock() else {
            return false;
        };
        match current.as_ref() {
            Some((tracked, token)) if tracked == key => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_forced(&self, key: &InstanceKey) -> bool {
        self.current
            .lock()
            .map(|current| match current.as_ref() {
                Some((tracked, token)) => tracked == key && token.is_cancelled(),
                None => false,
            })
            .unwrap_or(false)
    }
}

enum StartPhase {
    Started,
    HeadChanged,
}

#[derive(Clone)]
pub struct Watchdog {
    progress: SharedQueue<EventTask>,
    ledger: Ledger,
    timeouts: TimeoutConfig,
    poll_interval: Duration,
    signal: ForcedFinish,
}

impl Watchdog {
    pub fn new(
        progress: SharedQueue<EventTask>,
        ledger: Ledger,
        timeouts: TimeoutConfig,
        poll_interval: Duration,
        signal: ForcedFinish,
    ) -> Self {
        Self {
            progress,
            ledger,
            timeouts,
            poll_interval,
            signal,
        }
    }

    pub fn signal(&self) -> &ForcedFinish {
        &self.signal
    }

    /// Watch head instances until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            start_timeout = ?self.timeouts.start,
            run_timeout = ?self.timeouts.run,
            "Watchdog started"
        );

        while !shutdown.is_cancelled() {
            let head = match self.progress.peek_head().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::warn!(error = %e, "Watchdog failed to read progress queue");
                    None
                }
            };

            let Some(head) = head else {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            };

            let key = head.key();
            self.signal.track(&key);
            tokio::select! {
                _ = self.watch(&key) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        tracing::info!("Watchdog stopped");
    }

    /// Run both phases for one instance and return once it is no longer head.
    async fn watch(&self, key: &InstanceKey) {
        tracing::debug!(instance = %key, "Watching task instance");

        let started = tokio::select! {
            phase = self.wait_started(key) => phase,
            _ = tokio::time::sleep(self.timeouts.start) => {
                tracing::warn!(
                    instance = %key,
                    timeout = ?self.timeouts.start,
                    "No node started task instance in time"
                );
                self.signal.fire(key);
                self.wait_head_changed(key).await;
                return;
            }
        };
        if let StartPhase::HeadChanged = started {
            return;
        }

        tracing::debug!(instance = %key, "Task instance started");
        tokio::select! {
            _ = self.wait_head_changed(key) => {}
            _ = tokio::time::sleep(self.timeouts.run) => {
                tracing::warn!(
                    instance = %key,
                    timeout = ?self.timeouts.run,
                    "Task instance did not finish in time"
                );
                self.signal.fire(key);
                self.wait_head_changed(key).await;
            }
        }
    }

    async fn wait_started(&self, key: &InstanceKey) -> StartPhase {
        loop {
            if self.head_changed(key).await {
                return StartPhase::HeadChanged;
            }
            match self.ledger.node_results(&key.event_id, key.no).await {
                Ok(results) if !results.is_empty() => return StartPhase::Started,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(instance = %key, error = %e, "Failed to read node results")
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_head_changed(&self, key: &InstanceKey) {
        while !self.head_changed(key).await {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn head_changed(&self, key: &InstanceKey) -> bool {
        match self.progress.peek_head().await {
            Ok(head) => head.map(|h| &h.key() != key).unwrap_or(true),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read progress queue");
                false
            }
        }
    }
}
