use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use hna_core::config::AgentConfig;
use hna_core::db::{Database, MemoryDb};
use hna_core::logging::{self, LogFormat};

#[derive(Parser)]
#[command(
    name = "hnad",
    version,
    about = "Hypervisor node agent: reconciles declared cluster state against this host"
)]
struct Cli {
    /// Agent configuration file.
    #[arg(short, long, default_value = "/etc/hna/hna.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation pipelines until terminated.
    Run,
    /// Validate the configuration file and exit.
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run(&cli.config),
        Commands::Check => cmd_check(&cli.config),
    }
}

fn cmd_run(path: &PathBuf) -> Result<()> {
    let config = AgentConfig::load(path)?;

    logging::init(if config.log_json {
        LogFormat::Json
    } else {
        LogFormat::Human
    });

    if !config.database_uri.is_empty() {
        anyhow::bail!(
            "External document store drivers are not linked into this build; \
             leave database_uri empty to run against the in-process store",
        );
    }

    let memory = Arc::new(MemoryDb::new());
    seed_standalone_node(&memory, &config);
    let db: Arc<dyn Database> = memory;

    let provider = Arc::new(hna_deploy::virt::StubVirtProvider::new());
    let agent = hna_agent::loops::Agent::new(config, db, provider);
    agent.run()
}

/// Standalone runs have no scheduler placing records; give the agent
/// its own node document so the pipelines have something to read.
fn seed_standalone_node(db: &MemoryDb, config: &AgentConfig) {
    if db.get_node(config.node_id).is_ok() {
        return;
    }

    db.insert_node(hna_core::node::Node {
        id: config.node_id,
        name: "standalone".to_string(),
        zone: None,
        hypervisor: false,
        firewall: false,
        network_roles: vec![],
        network_mode: Default::default(),
        network_mode6: Default::default(),
        pools: vec![],
        host_block: None,
        external_iface: String::new(),
        external_iface_bridge: false,
        system_iface_mtu: None,
        space_iface_mtu: None,
    });
}

fn cmd_check(path: &PathBuf) -> Result<()> {
    let config = AgentConfig::load(path)?;
    println!("config ok: node {}", config.node_id);
    Ok(())
}
