use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConvoyError, Result};
use crate::operation::{decode_payload, Operation, OperationContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvsAction {
    Get,
    Put,
    Delete,
}

/// Get, put or delete a key on the shared store.
///
/// `get` stores the value into the variable named by `name`, so later steps
/// of the same task can reference it.
#[derive(Debug, Clone, Deserialize)]
pub struct KvsOperation {
    pub action: KvsAction,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub name: String,
}

impl KvsOperation {
    pub fn build(payload: Value) -> Result<Arc<dyn Operation>> {
        let op: Self = decode_payload("kvs", payload)?;
        if op.action == KvsAction::Get && op.name.is_empty() {
            return Err(ConvoyError::Definition(
                "kvs get needs a variable name to store into".into(),
            ));
        }
        Ok(Arc::new(op))
    }
}

#[async_trait]
impl Operation for KvsOperation {
    fn name(&self) -> &'static str {
        "kvs"
    }

    async fn run(&self, ctx: &mut OperationContext) -> Result<()> {
        let key = ctx.render(&self.key);
        match self.action {
            KvsAction::Get => {
                let value = ctx
                    .store
                    .get(&key)
                    .await?
                    .map(|pair| pair.value_str())
                    .ok_or_else(|| ConvoyError::operation("kvs", format!("{key} does not exist")))?;
                ctx.output
                    .line(format!("Get {value} from {key} and store to {}", self.name));
                ctx.variables.insert(self.name.clone(), value);
            }
            KvsAction::Put => {
                let value = ctx.render(&self.value);
                ctx.store.put(&key, value.clone().into_bytes()).await?;
                ctx.output.line(format!("Put {value} to {key}"));
            }
            KvsAction::Delete => {
                ctx.store.delete(&key).await?;
                ctx.output.line(format!("Delete {key}"));
            }
        }
        Ok(())
    }
}
