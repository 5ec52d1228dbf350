use std::collections::{BTreeSet, HashMap};

use crate::dispatch::EventTask;
use crate::error::{ConvoyError, Result};
use crate::ledger::{NodeTaskResult, ResultStatus};
use crate::operation::{OperationContext, OutputLog};
use crate::schedule::Pattern;

use super::Agent;

/// Overall status of an instance from the nodes that had to run it.
///
/// Any error wins; otherwise a node that is still running or never reported
/// makes it a timeout.
pub fn roll_up(nodes: &BTreeSet<String>, results: &[NodeTaskResult]) -> ResultStatus {
    if results.iter().any(|r| r.status == ResultStatus::Error) {
        return ResultStatus::Error;
    }

    let by_node: HashMap<&str, ResultStatus> =
        results.iter().map(|r| (r.node.as_str(), r.status)).collect();
    let unfinished = nodes
        .iter()
        .any(|n| !by_node.get(n.as_str()).is_some_and(|s| s.is_terminal()));
    if unfinished || by_node.values().any(|s| *s == ResultStatus::Timeout) {
        ResultStatus::Timeout
    } else {
        ResultStatus::Success
    }
}

impl Agent {
    /// Status for an instance nothing will ever run
    fn unrunnable_status(instance: &EventTask) -> ResultStatus {
        if instance.skippable {
            ResultStatus::Skip
        } else {
            ResultStatus::Timeout
        }
    }

    /// Whether this node should run its copy of the instance now.
    pub async fn is_runnable(&self, instance: &EventTask) -> Result<bool> {
        if !self.catalog.has_record(&self.config.node, &instance.filter).await? {
            return Ok(false);
        }
        let result = self
            .ledger
            .node_result(&instance.id, instance.no, &self.config.node)
            .await?;
        Ok(!result.is_some_and(|r| r.is_finished()))
    }

    /// Terminal status for the instance if it is finished, `None` while it
    /// still has to wait for nodes.
    pub async fn finished_status(&self, instance: &EventTask) -> Result<Option<ResultStatus>> {
        let forced = self.forced.is_forced(&instance.key());
        let results = self.ledger.node_results(&instance.id, instance.no).await?;

        let mut nodes: BTreeSet<String> = self
            .catalog
            .matching_nodes(&instance.filter)
            .await?
            .into_iter()
            .collect();
        nodes.extend(results.iter().map(|r| r.node.clone()));

        if nodes.is_empty() {
            let status = Self::unrunnable_status(instance);
            tracing::warn!(instance = %instance, status = %status, "No node matches task instance");
            return Ok(Some(status));
        }

        if forced {
            if results.is_empty() {
                return Ok(Some(Self::unrunnable_status(instance)));
            }
            return Ok(Some(roll_up(&nodes, &results)));
        }

        let done = nodes.iter().all(|node| {
            results
                .iter()
                .any(|r| &r.node == node && r.is_finished())
        });
        Ok(done.then(|| roll_up(&nodes, &results)))
    }

    /// Pop the head instance and persist its status. Error and timeout clear
    /// the rest of the queue; an empty queue closes the event.
    pub async fn finish_task(&self, instance: &EventTask, status: ResultStatus) -> Result<()> {
        let mut task = self
            .ledger
            .task_or_new(&instance.id, instance.no, &instance.task)
            .await?;
        task.finish(status);
        self.ledger.save_task(&task).await?;

        if status.aborts_queue() {
            let removed = self.progress.clear().await?;
            tracing::warn!(
                instance = %instance,
                status = %status,
                removed,
                "Task instance failed, cleared progress queue"
            );
        } else {
            self.progress.dequeue().await?;
            tracing::info!(instance = %instance, status = %status, "Task instance finished");
        }

        if self.progress.is_empty().await? {
            if let Some(mut event) = self.ledger.event(&instance.id).await? {
                event.finish(status);
                self.ledger.save_event(&event).await?;
                tracing::info!(
                    id = %event.id,
                    event = %event.name,
                    status = %status,
                    "Event finished"
                );
            }
        }
        Ok(())
    }

    /// Run this node's copy of the instance and record the outcome.
    ///
    /// Step failures end up in the ledger, not in the returned error; only
    /// store failures are returned.
    pub async fn run_task(&self, instance: &EventTask) -> Result<ResultStatus> {
        let node = &self.config.node;
        self.ledger
            .write_start(&instance.id, instance.no, &instance.task, node)
            .await?;

        let (status, log) = match self.run_definition(&instance.pattern, &instance.task).await {
            Ok(log) => (ResultStatus::Success, log),
            Err((e, log)) => {
                tracing::error!(
                    instance = %instance,
                    error = %e,
                    "Task instance failed on this node"
                );
                (ResultStatus::Error, log)
            }
        };

        self.ledger
            .write_finish(&instance.id, instance.no, node, status, log)
            .await?;
        Ok(status)
    }

    /// Look up and run a task, returning its captured output either way.
    pub(crate) async fn run_definition(
        &self,
        pattern: &str,
        task: &str,
    ) -> std::result::Result<String, (ConvoyError, String)> {
        let Some(pattern) = self.schedule.pattern(pattern) else {
            let e = ConvoyError::Definition(format!("Pattern {pattern} is not loaded"));
            let log = format!("{e}\n");
            return Err((e, log));
        };
        let Some(definition) = pattern.tasks.get(task) else {
            let e = ConvoyError::Definition(format!(
                "Task {task} is not defined in {}",
                pattern.name
            ));
            let log = format!("{e}\n");
            return Err((e, log));
        };

        let mut ctx = self.context(pattern);
        match definition.run(&mut ctx).await {
            Ok(()) => Ok(ctx.output.contents()),
            Err(e) => {
                ctx.output.line(e.to_string());
                Err((e, ctx.output.contents()))
            }
        }
    }

    /// Step context for a task of `pattern` on this node
    pub fn context(&self, pattern: &Pattern) -> OperationContext {
        let mut variables = self.config.variables.clone();
        variables.extend(pattern.variables.clone());
        variables.insert("role".into(), self.config.roles.join(","));
        variables.insert("node".into(), self.config.node.clone());

        OperationContext {
            variables,
            store: self.store.clone(),
            events: self.events.clone(),
            service_manager: self.config.service_manager,
            pattern: pattern.name.clone(),
            pattern_dir: pattern.dir(),
            roles: self.config.roles.clone(),
            token: self.config.shared_secret.clone(),
            output: OutputLog::new(),
        }
    }
}
