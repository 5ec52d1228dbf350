use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConvoyError, Result};

/// Connection settings for the Consul-backed shared store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// host:port of the Consul HTTP API
    pub address: String,
    /// "http" or "https"
    pub scheme: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
    /// Accept invalid certificates (development only)
    pub insecure_skip_verify: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            scheme: "http".to_string(),
            token: None,
            insecure_skip_verify: false,
        }
    }
}

impl StoreConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }
}

/// Budgets for the two watchdog phases.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// How long a head instance may wait for any node to start it.
    pub start: Duration,
    /// How long a started head instance may run before it is force-finished.
    pub run: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(120),
            run: Duration::from_secs(3600),
        }
    }
}

/// Randomized backoff used after a lost compare-and-swap.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_ms: 1000,
            max_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    Init,
    Systemd,
}

impl std::str::FromStr for ServiceManager {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(ServiceManager::Init),
            "systemd" => Ok(ServiceManager::Systemd),
            other => Err(ConvoyError::Config(format!(
                "Unknown service manager({other}), expected init or systemd"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name of this node in the cluster catalog
    pub node: String,
    /// Root under which queues, locks and results are stored
    pub key_prefix: String,
    pub roles: Vec<String>,
    pub pattern_files: Vec<PathBuf>,
    /// User variables referenced from task files as `{{name}}`
    pub variables: HashMap<String, String>,
    /// Skippable flag stamped onto instances that don't set one
    pub skippable: bool,
    pub service_manager: ServiceManager,
    pub poll_interval: Duration,
    pub timeouts: TimeoutConfig,
    pub backoff: BackoffConfig,
    /// Shared secret that pushed triggers must carry as payload
    pub shared_secret: Option<String>,
    pub status_addr: Option<SocketAddr>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node: "localhost".to_string(),
            key_prefix: "convoy".to_string(),
            roles: Vec::new(),
            pattern_files: Vec::new(),
            variables: HashMap::new(),
            skippable: true,
            service_manager: ServiceManager::Init,
            poll_interval: Duration::from_secs(1),
            timeouts: TimeoutConfig::default(),
            backoff: BackoffConfig::default(),
            shared_secret: None,
            status_addr: None,
        }
    }
}

impl AgentConfig {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_pattern_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pattern_files.push(path.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}/{}", self.key_prefix, suffix)
    }

    pub fn progress_queue_key(&self) -> String {
        self.key("queue/progress")
    }

    pub fn event_queue_key(&self) -> String {
        self.key("queue/events")
    }

    pub fn lock_key(&self) -> String {
        self.key("lock")
    }

    pub fn results_prefix(&self) -> String {
        self.key("results")
    }

    pub fn server_key(&self) -> String {
        self.key(&format!("servers/{}", self.node))
    }
}

/// Resolve this host's node name, falling back to "localhost".
pub fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Parse a single `key=value` variable assignment.
pub fn parse_variable(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(ConvoyError::Config(format!(
            "Invalid variable '{s}', expected key=value"
        ))),
    }
}

/// Load a flat string map of user variables from a YAML or JSON file.
///
/// A missing file yields an empty map; a malformed one is an error.
pub fn load_variables(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(HashMap::new());
    }
    Ok(serde_yaml::from_str(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_default() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.key_prefix, "convoy");
        assert!(cfg.skippable);
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.timeouts.start, Duration::from_secs(120));
        assert_eq!(cfg.timeouts.run, Duration::from_secs(3600));
        assert_eq!(cfg.backoff.min_ms, 1000);
        assert_eq!(cfg.backoff.max_ms, 2000);
        assert_eq!(cfg.service_manager, ServiceManager::Init);
    }

    #[test]
    fn agent_config_keys() {
        let cfg = AgentConfig::new("web-1");
        assert_eq!(cfg.progress_queue_key(), "convoy/queue/progress");
        assert_eq!(cfg.event_queue_key(), "convoy/queue/events");
        assert_eq!(cfg.lock_key(), "convoy/lock");
        assert_eq!(cfg.results_prefix(), "convoy/results");
        assert_eq!(cfg.server_key(), "convoy/servers/web-1");
    }

    #[test]
    fn agent_config_builders() {
        let cfg = AgentConfig::new("n1")
            .with_role("web")
            .with_role("ap")
            .with_variable("env", "prod")
            .with_pattern_file("/etc/convoy/task.yml");
        assert_eq!(cfg.roles, vec!["web", "ap"]);
        assert_eq!(cfg.variables.get("env").map(String::as_str), Some("prod"));
        assert_eq!(cfg.pattern_files.len(), 1);
    }

    #[test]
    fn store_config_base_url() {
        let cfg = StoreConfig {
            scheme: "https".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.base_url(), "https://127.0.0.1:8500");
    }

    #[test]
    fn parse_variable_assignments() {
        assert_eq!(
            parse_variable("key=a=b").unwrap(),
            ("key".to_string(), "a=b".to_string())
        );
        assert!(parse_variable("novalue").is_err());
        assert!(parse_variable("=x").is_err());
    }

    #[test]
    fn service_manager_from_str() {
        assert_eq!("systemd".parse::<ServiceManager>().unwrap(), ServiceManager::Systemd);
        assert!("upstart".parse::<ServiceManager>().is_err());
    }

    #[test]
    fn load_variables_missing_file_is_empty() {
        let vars = load_variables(Path::new("/nonexistent/convoy/variables.yml")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn load_variables_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.yml");
        std::fs::write(&path, "region: tokyo\nsize: \"3\"\n").unwrap();
        let vars = load_variables(&path).unwrap();
        assert_eq!(vars.get("region").map(String::as_str), Some("tokyo"));
        assert_eq!(vars.get("size").map(String::as_str), Some("3"));
    }
}
