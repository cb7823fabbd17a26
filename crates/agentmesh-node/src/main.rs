//! agentmesh: run a mesh node or talk to the mesh from the command line.
//!
//! `agentmesh start` runs a long-lived node until Ctrl+C. `send` and `peers`
//! start a short-lived node, join through the configured bootstrap list, do
//! one thing and exit.

mod config;
mod daemon;
mod supervisor;

use agentmesh_types::config::BootstrapNode;
use agentmesh_types::MeshConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentmesh", version, about = "Secure peer-to-peer transport for agents")]
struct Cli {
    /// Config file (default: ~/.agentmesh/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `node.listen_addr`.
    #[arg(long, global = true)]
    listen: Option<String>,

    /// Extra bootstrap node as host:port (repeatable).
    #[arg(long = "bootstrap", global = true)]
    bootstrap: Vec<String>,

    /// Identity key file (default: ~/.agentmesh/identity.key).
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Use a throwaway identity instead of the key file.
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Emit JSON logs.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted (default).
    Start {
        /// Capability advertised in the directory (repeatable).
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Print this node's peer id.
    Id,
    /// Print the effective configuration as TOML.
    Config,
    /// List peers known to the directory.
    Peers {
        /// Only peers advertising this capability.
        #[arg(long)]
        capability: Option<String>,
    },
    /// Send one message and print the delivery report.
    Send {
        /// Target peer id. Omit to broadcast.
        #[arg(long)]
        to: Option<String>,
        /// Multicast to every peer with this capability.
        #[arg(long, conflicts_with = "to")]
        capability: Option<String>,
        /// With --capability: deliver to the first peer that accepts.
        #[arg(long, requires = "capability")]
        anycast: bool,
        /// Application message type.
        #[arg(long = "type")]
        msg_type: String,
        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,
    },
}

impl Cli {
    /// Fold command-line overrides into the loaded config.
    fn apply(&self, config: &mut MeshConfig) -> Result<(), String> {
        if let Some(listen) = &self.listen {
            config.node.listen_addr = listen.clone();
        }
        for entry in &self.bootstrap {
            config.dht.bootstrap.push(parse_bootstrap(entry)?);
        }
        if self.ephemeral {
            config.node.key_path = None;
        } else if let Some(key) = &self.key {
            config.node.key_path = Some(key.clone());
        } else if config.node.key_path.is_none() {
            config.node.key_path = Some(config::default_key_path());
        }
        if self.json_logs {
            config.log_json = true;
        }
        if let Some(Commands::Start { capabilities }) = &self.command {
            config.node.capabilities.extend(capabilities.iter().cloned());
        }
        Ok(())
    }
}

fn parse_bootstrap(entry: &str) -> Result<BootstrapNode, String> {
    let (host, port) = entry
        .rsplit_once(':')
        .ok_or_else(|| format!("bootstrap '{entry}' must be host:port"))?;
    let port = port
        .parse()
        .map_err(|e| format!("bootstrap '{entry}' has a bad port: {e}"))?;
    Ok(BootstrapNode {
        host: host.to_string(),
        port,
        priority: 0,
    })
}

fn init_tracing(config: &MeshConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref());
    if let Err(e) = cli.apply(&mut config) {
        eprintln!("error: {e}");
        std::process::exit(2);
    }
    init_tracing(&config);

    let result = match cli.command.unwrap_or(Commands::Start {
        capabilities: Vec::new(),
    }) {
        Commands::Start { .. } => daemon::run_daemon(config).await,
        Commands::Id => daemon::print_id(&config),
        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(text) => {
                println!("{text}");
                Ok(())
            }
            Err(e) => Err(agentmesh_types::MeshError::Serialization(e.to_string())),
        },
        Commands::Peers { capability } => daemon::list_peers(config, capability).await,
        Commands::Send {
            to,
            capability,
            anycast,
            msg_type,
            payload,
        } => daemon::send_once(config, to, capability, anycast, msg_type, &payload).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, code = e.code(), "agentmesh failed");
        std::process::exit(1);
    }
}
