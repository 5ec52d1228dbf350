use serde::{Deserialize, Serialize};

use crate::catalog::NodeFilter;
use crate::error::{ConvoyError, Result};

/// One entry of an ordered task list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedTask {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub tag: String,
    pub task: String,
}

impl OrderedTask {
    /// The entry's own filter, if it names a service
    pub fn filter(&self) -> Option<NodeFilter> {
        if self.service.is_empty() {
            None
        } else {
            Some(NodeFilter::new(&self.service, &self.tag))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    Single(String),
    Ordered(Vec<OrderedTask>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct EventDefinition {
    pub description: String,
    pub priority: i64,
    pub task: Option<String>,
    pub ordered_tasks: Vec<OrderedTask>,
}

/// Named, prioritized unit of work. Lower priority sorts first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub pattern: String,
    pub name: String,
    pub description: String,
    pub priority: i64,
    pub body: EventBody,
}

impl Event {
    pub(crate) fn from_definition(pattern: &str, name: &str, def: EventDefinition) -> Result<Self> {
        let body = match (def.task, def.ordered_tasks.is_empty()) {
            (Some(task), true) => EventBody::Single(task),
            (None, false) => EventBody::Ordered(def.ordered_tasks),
            (Some(_), false) => {
                return Err(ConvoyError::Definition(format!(
                    "Event {name} in {pattern} has both task and ordered_tasks"
                )))
            }
            (None, true) => {
                return Err(ConvoyError::Definition(format!(
                    "Event {name} in {pattern} has no task"
                )))
            }
        };

        Ok(Self {
            pattern: pattern.to_string(),
            name: name.to_string(),
            description: def.description,
            priority: def.priority,
            body,
        })
    }

    /// Every task name the event refers to, in declared order
    pub fn task_names(&self) -> Vec<&str> {
        match &self.body {
            EventBody::Single(task) => vec![task.as_str()],
            EventBody::Ordered(entries) => entries.iter().map(|e| e.task.as_str()).collect(),
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} (priority {})", self.pattern, self.name, self.priority)
    }
}
