use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::error::{ConvoyError, Result};
use crate::operation::template::render_value;
use crate::operation::{decode_payload, Operation, OperationContext};

/// `berks vendor` exits with this when cookbooks were vendored but it
/// crashed on the way out
const BERKS_VENDOR_TOLERATED_EXIT: i32 = 139;

/// Converge the node with chef-solo
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChefOperation {
    pub run_list: Vec<String>,
    pub attributes: Map<String, Value>,
    /// Store prefixes whose JSON values are merged into the node attributes
    pub attribute_keys: Vec<String>,
    /// Overrides for solo.rb settings
    pub configurations: Map<String, Value>,
}

impl ChefOperation {
    pub fn build(payload: Value) -> Result<Arc<dyn Operation>> {
        Ok(Arc::new(decode_payload::<Self>("chef", payload)?))
    }

    /// Expand `{{role}}` into `all` plus every node role, then render the rest.
    pub fn expand_run_list(&self, ctx: &OperationContext) -> Vec<String> {
        let mut roles = vec!["all".to_string()];
        roles.extend(ctx.roles.iter().cloned());

        let mut expanded = Vec::new();
        for entry in &self.run_list {
            if entry.contains("{{role}}") {
                for role in &roles {
                    expanded.push(entry.replace("{{role}}", role));
                }
            } else {
                expanded.push(entry.clone());
            }
        }
        expanded.iter().map(|e| ctx.render(e)).collect()
    }

    /// Drop `role[x]` entries that have no `roles/x.json` in the pattern.
    pub fn filter_run_list(run_list: Vec<String>, pattern_dir: &Path) -> Vec<String> {
        run_list
            .into_iter()
            .filter(|entry| match role_name(entry) {
                Some(role) => pattern_dir.join("roles").join(format!("{role}.json")).exists(),
                None => true,
            })
            .collect()
    }

    async fn attributes(&self, ctx: &OperationContext) -> Result<Value> {
        let mut merged = Value::Object(Map::new());
        for prefix in &self.attribute_keys {
            let prefix = ctx.render(prefix);
            for pair in ctx.store.list(&prefix).await? {
                let value: Value = serde_json::from_slice(&pair.value).map_err(|e| {
                    ConvoyError::operation("chef", format!("{}: invalid attributes: {e}", pair.key))
                })?;
                merge(&mut merged, value);
            }
        }
        let overrides = render_value(&Value::Object(self.attributes.clone()), &ctx.variables);
        merge(&mut merged, overrides);
        Ok(merged)
    }

    fn solo_config(&self, ctx: &OperationContext) -> BTreeMap<String, Value> {
        let dir = &ctx.pattern_dir;
        let path = |p: PathBuf| Value::String(p.to_string_lossy().into_owned());

        let mut config = BTreeMap::from([
            ("ssl_verify_mode".to_string(), Value::String(":verify_peer".into())),
            ("log_level".to_string(), Value::String(":info".into())),
            (
                "log_location".to_string(),
                path(dir.join("logs").join(format!("{}_chef-solo.log", ctx.pattern))),
            ),
            ("file_cache_path".to_string(), path(dir.join("tmp").join("cache"))),
            ("role_path".to_string(), Value::Array(vec![path(dir.join("roles"))])),
            (
                "cookbook_path".to_string(),
                Value::Array(vec![
                    path(dir.join("cookbooks")),
                    path(dir.join("site-cookbooks")),
                ]),
            ),
        ]);
        for (key, value) in &self.configurations {
            config.insert(key.clone(), render_value(value, &ctx.variables));
        }
        config
    }

    async fn berks_vendor(&self, ctx: &OperationContext) -> Result<()> {
        if !ctx.pattern_dir.join("Berksfile").exists() {
            tracing::debug!("Skip berkshelf, no Berksfile in pattern directory");
            return Ok(());
        }

        tracing::info!("Running berks vendor");
        let output = Command::new("berks")
            .args(["vendor", "cookbooks"])
            .current_dir(&ctx.pattern_dir)
            .env("HOME", "/root")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConvoyError::operation("chef", format!("berks: {e}")))?;
        ctx.output.raw(&String::from_utf8_lossy(&output.stdout));

        match output.status.code() {
            Some(0) | Some(BERKS_VENDOR_TOLERATED_EXIT) => Ok(()),
            code => {
                ctx.output.raw(&String::from_utf8_lossy(&output.stderr));
                Err(ConvoyError::operation(
                    "chef",
                    format!("berks vendor exited with {code:?}"),
                ))
            }
        }
    }
}

#[async_trait]
impl Operation for ChefOperation {
    fn name(&self) -> &'static str {
        "chef"
    }

    async fn run(&self, ctx: &mut OperationContext) -> Result<()> {
        let run_list = Self::filter_run_list(self.expand_run_list(ctx), &ctx.pattern_dir);

        let mut attributes = self.attributes(ctx).await?;
        if let Value::Object(map) = &mut attributes {
            map.insert("run_list".into(), Value::from(run_list.clone()));
        }
        let mut json_file = NamedTempFile::new()?;
        json_file.write_all(&serde_json::to_vec(&attributes)?)?;

        let mut conf_file = NamedTempFile::new()?;
        for (key, value) in self.solo_config(ctx) {
            writeln!(conf_file, "{key} {}", ruby_literal(&value))?;
        }

        self.berks_vendor(ctx).await?;

        tracing::info!(
            run_list = ?run_list,
            conf = %conf_file.path().display(),
            json = %json_file.path().display(),
            "Running chef-solo"
        );
        let output = Command::new("chef-solo")
            .arg("-c")
            .arg(conf_file.path())
            .arg("-j")
            .arg(json_file.path())
            .current_dir(&ctx.pattern_dir)
            .env("HOME", "/root")
            .env("CONSUL_SECRET_KEY", ctx.token.clone().unwrap_or_default())
            .env("ROLE", ctx.roles.join(","))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ConvoyError::operation("chef", format!("chef-solo: {e}")))?;
        ctx.output.raw(&String::from_utf8_lossy(&output.stdout));
        ctx.output.raw(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(())
        } else {
            Err(ConvoyError::operation(
                "chef",
                format!("chef-solo exited with {:?}", output.status.code()),
            ))
        }
    }
}

fn role_name(entry: &str) -> Option<&str> {
    entry.strip_prefix("role[")?.strip_suffix(']')
}

/// Deep merge `overlay` into `base`; maps merge recursively, anything else
/// replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Format a value as a solo.rb literal. Strings starting with `:` are symbols.
fn ruby_literal(value: &Value) -> String {
    match value {
        Value::String(s) if s.starts_with(':') => s.clone(),
        Value::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(ruby_literal).collect();
            format!("[{}]", items.join(","))
        }
        Value::Null => "nil".to_string(),
        other => other.to_string(),
    }
}
