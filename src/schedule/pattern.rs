use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use super::event::{Event, EventDefinition};
use super::task::{Task, TaskDefinition};
use crate::error::{ConvoyError, Result};
use crate::operation::OperationRegistry;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PatternDefault {
    /// Seconds, inherited by tasks without their own timeout
    pub timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PatternDefinition {
    name: Option<String>,
    variables: BTreeMap<String, Value>,
    default: PatternDefault,
    events: BTreeMap<String, EventDefinition>,
    tasks: BTreeMap<String, TaskDefinition>,
}

/// A named configuration source owning its events, tasks and variables.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub name: String,
    /// File the pattern was loaded from
    pub path: PathBuf,
    pub variables: HashMap<String, String>,
    pub default: PatternDefault,
    pub events: BTreeMap<String, Event>,
    pub tasks: BTreeMap<String, Task>,
}

impl Pattern {
    /// Load a pattern file. The pattern is named after the file's directory
    /// unless the file sets `name`.
    pub fn load(path: &Path, registry: &OperationRegistry) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConvoyError::Config(format!("Failed to read pattern {}: {e}", path.display()))
        })?;
        Self::parse(&text, path, registry)
    }

    /// Parse YAML (or JSON) pattern text and link it.
    pub fn parse(text: &str, path: &Path, registry: &OperationRegistry) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(text)?;
        let def: PatternDefinition = if raw.is_null() {
            PatternDefinition::default()
        } else {
            serde_json::from_value(raw).map_err(|e| {
                ConvoyError::Definition(format!("Invalid pattern {}: {e}", path.display()))
            })?
        };

        let name = match def.name {
            Some(name) if !name.is_empty() => name,
            _ => dir_name(path),
        };

        let variables = def
            .variables
            .into_iter()
            .map(|(k, v)| (k, scalar_to_string(v)))
            .collect();

        let events = def
            .events
            .into_iter()
            .map(|(event, d)| Ok((event.clone(), Event::from_definition(&name, &event, d)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let tasks = def
            .tasks
            .into_iter()
            .map(|(task, d)| {
                let task_def =
                    Task::from_definition(&name, &task, d, def.default.timeout, registry)?;
                Ok((task, task_def))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let pattern = Self {
            name,
            path: path.to_path_buf(),
            variables,
            default: def.default,
            events,
            tasks,
        };
        pattern.validate()?;
        Ok(pattern)
    }

    /// Every task an event refers to must exist in this pattern.
    fn validate(&self) -> Result<()> {
        for event in self.events.values() {
            for task in event.task_names() {
                if !self.tasks.contains_key(task) {
                    return Err(ConvoyError::Definition(format!(
                        "Event {} refers to task {task} which is not defined in {}",
                        event.name, self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Directory the pattern file lives in
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn dir_name(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "default".to_string())
}

fn scalar_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
