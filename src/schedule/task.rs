use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::catalog::NodeFilter;
use crate::error::{ConvoyError, Result};
use crate::operation::{Operation, OperationContext, OperationRegistry};

/// Used when neither the task nor its pattern sets a timeout
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(1800);

/// Task as written in a pattern file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct TaskDefinition {
    pub description: String,
    /// Seconds
    pub timeout: Option<u64>,
    pub filter: NodeFilter,
    pub operations: Vec<Value>,
}

/// Ordered list of steps, run strictly in order under one timeout.
#[derive(Debug, Clone)]
pub struct Task {
    pub pattern: String,
    pub name: String,
    pub description: String,
    pub timeout: Duration,
    pub filter: NodeFilter,
    pub operations: Vec<Arc<dyn Operation>>,
}

impl Task {
    pub(crate) fn from_definition(
        pattern: &str,
        name: &str,
        def: TaskDefinition,
        default_timeout: Option<u64>,
        registry: &OperationRegistry,
    ) -> Result<Self> {
        let operations = registry
            .build_all(def.operations)
            .map_err(|e| ConvoyError::Definition(format!("{pattern}/{name}: {e}")))?;
        let timeout = def
            .timeout
            .or(default_timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TASK_TIMEOUT);

        Ok(Self {
            pattern: pattern.to_string(),
            name: name.to_string(),
            description: def.description,
            timeout,
            filter: def.filter,
            operations,
        })
    }

    /// Run every step in order. The first failing step aborts the rest, and
    /// so does running past the task timeout.
    pub async fn run(&self, ctx: &mut OperationContext) -> Result<()> {
        tracing::info!(pattern = %self.pattern, task = %self.name, "Task started");

        let steps = async {
            for op in &self.operations {
                tracing::info!(task = %self.name, operation = op.name(), "Operation started");
                if let Err(e) = op.run(ctx).await {
                    tracing::error!(
                        task = %self.name,
                        operation = op.name(),
                        error = %e,
                        "Operation failed"
                    );
                    return Err(e);
                }
                tracing::debug!(task = %self.name, operation = op.name(), "Operation finished");
            }
            Ok(())
        };

        match tokio::time::timeout(self.timeout, steps).await {
            Ok(Ok(())) => {
                tracing::info!(task = %self.name, "Task finished successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(task = %self.name, "Task failed");
                Err(e)
            }
            Err(_) => {
                tracing::error!(task = %self.name, timeout = ?self.timeout, "Task expired");
                Err(ConvoyError::Timeout(format!(
                    "Task {} did not finish within {:?}",
                    self.name, self.timeout
                )))
            }
        }
    }
}
