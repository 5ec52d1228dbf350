//! Task steps.
//!
//! A task is an ordered list of [`Operation`]s. Each step is declared in a
//! pattern file as a single-key map whose key names the step type:
//!
//! ```yaml
//! operations:
//!   - execute:
//!       script: systemctl reload nginx
//!   - echo: "deployed {{version}}"
//! ```
//!
//! [`OperationRegistry`] maps step-type names to constructors, so new step
//! types can be registered without touching dispatch or execution.

pub mod chef;
pub mod echo;
pub mod event;
pub mod execute;
pub mod kvs;
pub mod service;
pub mod template;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ServiceManager;
use crate::dispatch::EventSink;
use crate::error::{ConvoyError, Result};
use crate::store::KvStore;

pub use template::render;

/// Output captured while a task runs on this node. Every line is also
/// emitted through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    buf: Arc<Mutex<String>>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::info!("{}", line);
        if let Ok(mut buf) = self.buf.lock() {
            buf.push_str(line);
            if !line.ends_with('\n') {
                buf.push('\n');
            }
        }
    }

    /// Append raw process output without re-logging every line.
    pub fn raw(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        tracing::debug!(bytes = text.len(), "Captured process output");
        if let Ok(mut buf) = self.buf.lock() {
            buf.push_str(text);
            if !text.ends_with('\n') {
                buf.push('\n');
            }
        }
    }

    pub fn contents(&self) -> String {
        self.buf.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

/// Everything a step may touch while running.
#[derive(Clone)]
pub struct OperationContext {
    /// Variables for `{{name}}` substitution; steps may add to them
    pub variables: HashMap<String, String>,
    pub store: Arc<dyn KvStore>,
    pub events: Arc<dyn EventSink>,
    pub service_manager: ServiceManager,
    pub pattern: String,
    /// Directory holding the pattern file
    pub pattern_dir: PathBuf,
    pub roles: Vec<String>,
    /// Shared secret forwarded to steps that need it
    pub token: Option<String>,
    pub output: OutputLog,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("pattern", &self.pattern)
            .field("variables", &self.variables)
            .finish()
    }
}

impl OperationContext {
    pub fn render(&self, s: &str) -> String {
        render(s, &self.variables)
    }
}

#[async_trait]
pub trait Operation: Send + Sync + std::fmt::Debug {
    /// Step type name, used in logs
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut OperationContext) -> Result<()>;
}

pub type OperationFactory = fn(Value) -> Result<Arc<dyn Operation>>;

/// Decode a step payload into its typed form, naming the step on failure.
pub fn decode_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| ConvoyError::Definition(format!("Invalid {kind} operation: {e}")))
}

#[derive(Clone)]
pub struct OperationRegistry {
    factories: HashMap<String, OperationFactory>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("OperationRegistry").field("types", &names).finish()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl OperationRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in step type
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("echo", echo::EchoOperation::build);
        registry.register("execute", execute::ExecuteOperation::build);
        registry.register("service", service::ServiceOperation::build);
        registry.register("kvs", kvs::KvsOperation::build);
        registry.register("event", event::EventOperation::build);
        registry.register("chef", chef::ChefOperation::build);
        registry
    }

    pub fn register(&mut self, name: &str, factory: OperationFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build one step from its `{type: payload}` declaration.
    pub fn build(&self, declaration: Value) -> Result<Arc<dyn Operation>> {
        let Value::Object(map) = declaration else {
            return Err(ConvoyError::Definition(
                "Operation must be a map of {type: parameters}".into(),
            ));
        };
        if map.len() != 1 {
            return Err(ConvoyError::Definition(format!(
                "Operation has {} types, expected exactly one",
                map.len()
            )));
        }
        let Some((kind, payload)) = map.into_iter().next() else {
            return Err(ConvoyError::Definition("Operation is empty".into()));
        };
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| ConvoyError::Definition(format!("Operation {kind} is not defined")))?;
        factory(payload)
    }

    pub fn build_all(&self, declarations: Vec<Value>) -> Result<Vec<Arc<dyn Operation>>> {
        declarations.into_iter().map(|d| self.build(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_registry_knows_every_step() {
        let registry = OperationRegistry::builtin();
        for name in ["echo", "execute", "service", "kvs", "event", "chef"] {
            assert!(registry.contains(name), "missing {name}");
        }
    }

    #[test]
    fn build_rejects_unknown_type() {
        let err = OperationRegistry::builtin()
            .build(json!({"teleport": {}}))
            .unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn build_rejects_multiple_types() {
        let err = OperationRegistry::builtin()
            .build(json!({"echo": "a", "execute": "b"}))
            .unwrap_err();
        assert!(matches!(err, ConvoyError::Definition(_)));
    }

    #[test]
    fn build_rejects_non_map() {
        assert!(OperationRegistry::builtin().build(json!("echo")).is_err());
    }

    #[test]
    fn custom_step_can_be_registered() {
        #[derive(Debug)]
        struct Noop;

        #[async_trait]
        impl Operation for Noop {
            fn name(&self) -> &'static str {
                "noop"
            }
            async fn run(&self, _ctx: &mut OperationContext) -> Result<()> {
                Ok(())
            }
        }

        fn build(_: Value) -> Result<Arc<dyn Operation>> {
            Ok(Arc::new(Noop))
        }

        let mut registry = OperationRegistry::empty();
        registry.register("noop", build);
        let op = registry.build(json!({"noop": null})).unwrap();
        assert_eq!(op.name(), "noop");
    }

    #[test]
    fn output_log_appends_lines() {
        let log = OutputLog::new();
        log.line("first");
        log.raw("second\n");
        log.raw("");
        assert_eq!(log.contents(), "first\nsecond\n");
    }
}
