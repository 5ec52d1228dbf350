use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{ConvoyError, Result};
use crate::operation::{decode_payload, Operation, OperationContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExecutePayload {
    Script(String),
    Detailed {
        #[serde(default)]
        script: Option<String>,
        #[serde(default)]
        file: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteTarget {
    /// Fed to the user's shell on stdin
    Script(String),
    /// Executed directly, relative to the pattern directory
    File(String),
}

/// Run a shell script or an executable file, capturing combined output
#[derive(Debug, Clone)]
pub struct ExecuteOperation {
    pub target: ExecuteTarget,
}

impl ExecuteOperation {
    pub fn build(payload: Value) -> Result<Arc<dyn Operation>> {
        let target = match decode_payload::<ExecutePayload>("execute", payload)? {
            ExecutePayload::Script(script) => ExecuteTarget::Script(script),
            ExecutePayload::Detailed {
                script: Some(script),
                file: None,
            } => ExecuteTarget::Script(script),
            ExecutePayload::Detailed {
                script: None,
                file: Some(file),
            } => ExecuteTarget::File(file),
            ExecutePayload::Detailed { .. } => {
                return Err(ConvoyError::Definition(
                    "execute operation needs exactly one of script or file".into(),
                ))
            }
        };
        Ok(Arc::new(Self { target }))
    }

    fn shell() -> String {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    fn process_output(
        ctx: &OperationContext,
        result: std::io::Result<std::process::Output>,
    ) -> Result<()> {
        let output = result.map_err(|e| ConvoyError::operation("execute", e.to_string()))?;
        ctx.output.raw(&String::from_utf8_lossy(&output.stdout));
        ctx.output.raw(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(())
        } else {
            Err(ConvoyError::operation(
                "execute",
                format!("Exit code: {:?}", output.status.code()),
            ))
        }
    }
}

#[async_trait]
impl Operation for ExecuteOperation {
    fn name(&self) -> &'static str {
        "execute"
    }

    async fn run(&self, ctx: &mut OperationContext) -> Result<()> {
        let result = match &self.target {
            ExecuteTarget::Script(script) => {
                let script = ctx.render(script);
                let mut child = Command::new(Self::shell())
                    .current_dir(&ctx.pattern_dir)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| ConvoyError::operation("execute", e.to_string()))?;
                if let Some(mut stdin) = child.stdin.take() {
                    if let Err(e) = stdin.write_all(script.as_bytes()).await {
                        drop(stdin);
                        if let Err(kill) = child.kill().await {
                            tracing::warn!(error = %kill, "Failed to kill shell");
                        }
                        return Err(ConvoyError::operation(
                            "execute",
                            format!("writing script to shell: {e}"),
                        ));
                    }
                }
                child.wait_with_output().await
            }
            ExecuteTarget::File(file) => {
                let file = ctx.render(file);
                tracing::info!(file = %file, "Executing file");
                Command::new(ctx.pattern_dir.join(&file))
                    .current_dir(&ctx.pattern_dir)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .output()
                    .await
            }
        };
        Self::process_output(ctx, result)
    }
}
