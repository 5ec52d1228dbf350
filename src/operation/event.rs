use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::catalog::NodeFilter;
use crate::error::Result;
use crate::operation::{decode_payload, Operation, OperationContext};

/// Fire an outbound event so other nodes (or this cluster again) react to it
#[derive(Debug, Clone, Deserialize)]
pub struct EventOperation {
    pub name: String,
    #[serde(default)]
    pub filter: NodeFilter,
}

impl EventOperation {
    pub fn build(payload: Value) -> Result<Arc<dyn Operation>> {
        Ok(Arc::new(decode_payload::<Self>("event", payload)?))
    }
}

#[async_trait]
impl Operation for EventOperation {
    fn name(&self) -> &'static str {
        "event"
    }

    async fn run(&self, ctx: &mut OperationContext) -> Result<()> {
        let name = ctx.render(&self.name);
        let id = ctx
            .events
            .fire(&name, &self.filter, ctx.token.as_deref())
            .await?;
        ctx.output
            .line(format!("Fire {name} event(ID: {id}, Filter: {})", self.filter));
        Ok(())
    }
}
