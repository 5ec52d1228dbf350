use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use convoy::agent::Agent;
use convoy::config::{
    default_node_name, load_variables, parse_variable, AgentConfig, ServiceManager, StoreConfig,
    TimeoutConfig,
};
use convoy::dispatch::{PushOutcome, Trigger, UpstreamEvent};
use convoy::operation::OperationRegistry;
use convoy::schedule::Schedule;
use convoy::shutdown::install_shutdown_handler;
use convoy::store::ConsulStore;

#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(version)]
#[command(about = "Fleet-wide task orchestrator coordinated through a shared KV store")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    store: StoreArgs,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true, env = "CONVOY_DEBUG")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the polling loop and watchdog on this node
    Agent(AgentArgs),

    /// Push an upstream trigger onto the event queue
    Push(PushArgs),

    /// Run every event with this name on this node right now
    Dispatch {
        /// Event name
        name: String,

        #[command(flatten)]
        node: NodeArgs,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Consul HTTP API address
    #[arg(long, global = true, env = "CONVOY_CONSUL_ADDRESS", default_value = "127.0.0.1:8500")]
    consul_address: String,

    /// http or https
    #[arg(long, global = true, env = "CONVOY_CONSUL_SCHEME", default_value = "http")]
    consul_scheme: String,

    /// Consul ACL token
    #[arg(long, global = true, env = "CONVOY_CONSUL_TOKEN")]
    consul_token: Option<String>,

    /// Accept invalid TLS certificates from Consul
    #[arg(long, global = true, env = "CONVOY_INSECURE_SKIP_VERIFY")]
    insecure_skip_verify: bool,

    /// Key prefix for queues, locks and results
    #[arg(long, global = true, env = "CONVOY_PREFIX", default_value = "convoy")]
    prefix: String,

    /// Shared secret triggers must carry as payload
    #[arg(long, global = true, env = "CONVOY_SECRET")]
    secret: Option<String>,
}

impl StoreArgs {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            address: self.consul_address.clone(),
            scheme: self.consul_scheme.clone(),
            token: self.consul_token.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
        }
    }
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Node name as registered in the catalog (default: hostname)
    #[arg(long, env = "CONVOY_NODE")]
    node: Option<String>,

    /// Roles of this node, comma separated
    #[arg(long, env = "CONVOY_ROLE", value_delimiter = ',')]
    role: Vec<String>,

    /// Pattern files to load
    #[arg(long = "pattern", short = 'p', env = "CONVOY_PATTERNS", value_delimiter = ',')]
    patterns: Vec<PathBuf>,

    /// User variable as key=value, may be repeated
    #[arg(long = "var")]
    vars: Vec<String>,

    /// YAML or JSON file of user variables
    #[arg(long, env = "CONVOY_VARS_FILE")]
    vars_file: Option<PathBuf>,

    /// init or systemd
    #[arg(long, env = "CONVOY_SERVICE_MANAGER", default_value = "init")]
    service_manager: String,
}

#[derive(Parser, Debug)]
struct AgentArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Skip task instances no node matches instead of timing them out
    #[arg(long, env = "CONVOY_SKIPPABLE", default_value_t = true, action = clap::ArgAction::Set)]
    skippable: bool,

    /// Polling interval in milliseconds
    #[arg(long, env = "CONVOY_INTERVAL_MS", default_value = "1000")]
    interval_ms: u64,

    /// Seconds a head instance may wait for any node to start it
    #[arg(long, env = "CONVOY_START_TIMEOUT", default_value = "120")]
    start_timeout: u64,

    /// Seconds a started head instance may run
    #[arg(long, env = "CONVOY_RUN_TIMEOUT", default_value = "3600")]
    run_timeout: u64,

    /// Port for the read-only status API (optional)
    #[arg(long, env = "CONVOY_STATUS_PORT")]
    status_port: Option<u16>,
}

#[derive(Parser, Debug)]
struct PushArgs {
    /// Event name
    #[arg(required_unless_present = "stdin")]
    name: Option<String>,

    /// Upstream ID (default: random)
    #[arg(long)]
    id: Option<String>,

    /// Payload carried with the trigger
    #[arg(long)]
    payload: Option<String>,

    /// Read a JSON array of Consul events from stdin
    #[arg(long, conflicts_with_all = ["name", "id", "payload"])]
    stdin: bool,
}

// =============================================================================
// Configuration
// =============================================================================

fn agent_config(
    args: &NodeArgs,
    store: &StoreArgs,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    let mut config = AgentConfig::new(args.node.clone().unwrap_or_else(default_node_name));
    config.key_prefix = store.prefix.clone();
    config.roles = args.role.iter().filter(|r| !r.is_empty()).cloned().collect();
    config.pattern_files = args.patterns.clone();
    config.service_manager = args.service_manager.parse::<ServiceManager>()?;
    config.shared_secret = store.secret.clone();

    if let Some(path) = &args.vars_file {
        config.variables = load_variables(path)?;
    }
    for var in &args.vars {
        let (key, value) = parse_variable(var)?;
        config.variables.insert(key, value);
    }
    Ok(config)
}

fn build_agent(
    config: AgentConfig,
    store: &StoreArgs,
) -> Result<Agent, Box<dyn std::error::Error>> {
    let schedule = Schedule::load(&config.pattern_files, &OperationRegistry::builtin())?;
    let consul = Arc::new(ConsulStore::new(&store.store_config())?);
    Ok(Agent::new(
        config,
        consul.clone(),
        consul.clone(),
        consul,
        Arc::new(schedule),
    ))
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_agent(args: AgentArgs, store: StoreArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = agent_config(&args.node, &store)?;
    config.skippable = args.skippable;
    config.poll_interval = Duration::from_millis(args.interval_ms.max(1));
    config.timeouts = TimeoutConfig {
        start: Duration::from_secs(args.start_timeout),
        run: Duration::from_secs(args.run_timeout),
    };
    config.status_addr = match args.status_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse::<SocketAddr>()?),
        None => None,
    };

    tracing::info!(
        node = %config.node,
        roles = ?config.roles,
        patterns = ?config.pattern_files,
        consul = %store.consul_address,
        status_addr = ?config.status_addr,
        "Starting convoy agent"
    );

    let agent = Arc::new(build_agent(config, &store)?);
    let shutdown = install_shutdown_handler()?;
    agent.run(shutdown).await?;
    Ok(())
}

async fn run_push(args: PushArgs, store: StoreArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig {
        key_prefix: store.prefix.clone(),
        shared_secret: store.secret.clone(),
        ..AgentConfig::default()
    };
    let agent = build_agent(config, &store)?;

    let triggers = if args.stdin {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input)?;
        if input.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str::<Vec<UpstreamEvent>>(&input)?
                .into_iter()
                .map(UpstreamEvent::into_trigger)
                .collect::<Result<Vec<_>, _>>()?
        }
    } else {
        let name = args.name.ok_or("Event name is required")?;
        let mut trigger = Trigger::new(name);
        if let Some(id) = args.id {
            trigger = trigger.with_id(id);
        }
        if let Some(payload) = args.payload.or_else(|| store.secret.clone()) {
            trigger = trigger.with_payload(payload);
        }
        vec![trigger]
    };

    for trigger in triggers {
        match agent.dispatcher().push(trigger.clone()).await? {
            PushOutcome::Queued => println!("Pushed event {} (ID: {})", trigger.name, trigger.id),
            PushOutcome::Duplicate => println!("Event was already registered (ID: {})", trigger.id),
            PushOutcome::Rejected => println!("Event was rejected (ID: {})", trigger.id),
        }
    }
    Ok(())
}

async fn run_dispatch(
    name: String,
    node: NodeArgs,
    store: StoreArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = agent_config(&node, &store)?;
    let agent = build_agent(config, &store)?;
    agent.dispatch_local(&name).await?;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match args.command {
        Commands::Agent(agent_args) => run_agent(agent_args, args.store).await?,
        Commands::Push(push_args) => run_push(push_args, args.store).await?,
        Commands::Dispatch { name, node } => run_dispatch(name, node, args.store).await?,
    }

    Ok(())
}
