use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::config::ServiceManager;
use crate::error::{ConvoyError, Result};
use crate::operation::{decode_payload, Operation, OperationContext};

/// Start, stop, restart or any other action on a system service
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceOperation {
    pub name: String,
    pub action: String,
}

impl ServiceOperation {
    pub fn build(payload: Value) -> Result<Arc<dyn Operation>> {
        Ok(Arc::new(decode_payload::<Self>("service", payload)?))
    }

    /// Program and arguments for the configured service manager
    pub fn command_line(
        manager: ServiceManager,
        name: &str,
        action: &str,
    ) -> (String, Vec<String>) {
        match manager {
            ServiceManager::Init => (
                "/sbin/service".to_string(),
                vec![name.to_string(), action.to_string()],
            ),
            ServiceManager::Systemd => (
                "systemctl".to_string(),
                vec![action.to_string(), name.to_string()],
            ),
        }
    }
}

#[async_trait]
impl Operation for ServiceOperation {
    fn name(&self) -> &'static str {
        "service"
    }

    async fn run(&self, ctx: &mut OperationContext) -> Result<()> {
        let name = ctx.render(&self.name);
        let action = ctx.render(&self.action);
        let (program, args) = Self::command_line(ctx.service_manager, &name, &action);

        tracing::info!(service = %name, action = %action, "Controlling service");
        let output = Command::new(&program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConvoyError::operation("service", format!("{program}: {e}")))?;
        ctx.output.raw(&String::from_utf8_lossy(&output.stdout));
        ctx.output.raw(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(())
        } else {
            Err(ConvoyError::operation(
                "service",
                format!("{action} {name} exited with {:?}", output.status.code()),
            ))
        }
    }
}
