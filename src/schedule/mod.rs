//! Schedule catalog.
//!
//! Every loaded [`Pattern`] contributes events and tasks. The same event name
//! may appear in several patterns; dispatch collects all of them and orders
//! them by priority, ties broken by load order.

pub mod event;
pub mod pattern;
pub mod task;

use std::path::PathBuf;

use crate::error::{ConvoyError, Result};
use crate::operation::OperationRegistry;

pub use event::{Event, EventBody, OrderedTask};
pub use pattern::{Pattern, PatternDefault};
pub use task::{Task, DEFAULT_TASK_TIMEOUT};

/// Immutable set of patterns, in load order.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    patterns: Vec<Pattern>,
}

impl Schedule {
    pub fn new(patterns: Vec<Pattern>) -> Result<Self> {
        for (i, p) in patterns.iter().enumerate() {
            if patterns[..i].iter().any(|q| q.name == p.name) {
                return Err(ConvoyError::Definition(format!(
                    "Pattern {} is loaded twice",
                    p.name
                )));
            }
        }
        Ok(Self { patterns })
    }

    /// Load every pattern file, failing on the first invalid one.
    pub fn load(paths: &[PathBuf], registry: &OperationRegistry) -> Result<Self> {
        let patterns = paths
            .iter()
            .map(|path| {
                let pattern = Pattern::load(path, registry)?;
                tracing::info!(
                    pattern = %pattern.name,
                    path = %path.display(),
                    events = pattern.events.len(),
                    tasks = pattern.tasks.len(),
                    "Loaded pattern"
                );
                Ok(pattern)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(patterns)
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn pattern(&self, name: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.name == name)
    }

    pub fn task(&self, pattern: &str, task: &str) -> Option<&Task> {
        self.pattern(pattern).and_then(|p| p.tasks.get(task))
    }

    /// Events named `name` across all patterns, sorted by priority.
    pub fn events_named(&self, name: &str) -> Vec<&Event> {
        let mut events: Vec<&Event> = self
            .patterns
            .iter()
            .filter_map(|p| p.events.get(name))
            .collect();
        events.sort_by_key(|e| e.priority);
        events
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
