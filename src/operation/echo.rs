use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::operation::{decode_payload, Operation, OperationContext};

/// Write a templated message to the task output
#[derive(Debug, Clone)]
pub struct EchoOperation {
    pub message: String,
}

impl EchoOperation {
    pub fn build(payload: Value) -> Result<Arc<dyn Operation>> {
        let message: String = decode_payload("echo", payload)?;
        Ok(Arc::new(Self { message }))
    }
}

#[async_trait]
impl Operation for EchoOperation {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn run(&self, ctx: &mut OperationContext) -> Result<()> {
        ctx.output.line(ctx.render(&self.message));
        Ok(())
    }
}
