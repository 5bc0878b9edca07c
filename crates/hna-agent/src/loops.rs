use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use hna_core::config::AgentConfig;
use hna_core::db::Database;
use hna_core::firewall::merge_ingress;
use hna_core::node::Node;
use hna_core::retry::retry;
use hna_core::time;
use hna_deploy::deploy::Deployer;
use hna_deploy::state::Snapshot;
use hna_deploy::virt::VirtProvider;
use hna_net::iptables::{self, StateInput, TableState};
use hna_plan::planner::Planner;
use hna_storage::s3::S3Store;
use hna_storage::sync;

const HYPERVISOR_TICK: Duration = Duration::from_millis(2500);
const FIREWALL_TICK: Duration = Duration::from_secs(1);
const PLANNER_TICK: Duration = Duration::from_secs(3);

/// One sync-node tick: snapshot and deploy on hypervisors, host
/// firewall only otherwise.
pub fn sync_node_tick(
    config: &AgentConfig,
    db: &dyn Database,
    provider: &dyn VirtProvider,
) -> Result<()> {
    let node = db.get_node(config.node_id)?;

    if node.is_hypervisor() {
        let stat = Snapshot::load(db, node.id, provider, &config.run_dir)?;
        let deployer = Deployer::new(config.data_dir.clone(), config.run_dir.clone());
        deployer.deploy(&stat, db, provider)
    } else {
        sync_node_firewall(db, &node)
    }
}

/// Apply the host ruleset alone. Non-firewall nodes converge to an
/// empty managed state.
fn sync_node_firewall(db: &dyn Database, node: &Node) -> Result<()> {
    let firewalls = BTreeMap::new();

    if !node.firewall {
        return iptables::update_state(TableState::default());
    }

    let matched = db.firewalls_for_roles(&node.network_roles)?;
    let ingress = merge_ingress(&matched);

    let input = StateInput {
        node,
        vpcs: &[],
        instances: &[],
        node_firewall: Some(&ingress),
        firewalls: &firewalls,
    };
    iptables::update_state(iptables::load_state(&input)?)
}

/// One planner tick over every deployment.
pub fn planner_tick(db: &dyn Database) -> Result<()> {
    Planner::new().apply_plans(db, time::now())
}

/// One storage tick: sync each configured store. A transient failure
/// gets one retry; a store that keeps failing is logged and skipped
/// so one bad endpoint does not halt the rest.
pub fn storage_sync_tick(db: &dyn Database) -> Result<()> {
    for store in db.storages()? {
        if store.endpoint.is_empty() {
            continue;
        }

        let result = retry(2, Duration::from_millis(250), "storage sync", || {
            let client = S3Store::connect(&store)?;
            sync::sync(db, &store, &client)
        });
        if let Err(err) = result {
            error!(
                storage = %store.id,
                bucket = %store.bucket,
                error = %err,
                "agent: Failed to sync storage",
            );
        }
    }

    Ok(())
}

/// The node agent: three independent tick-driven pipelines on OS
/// threads. Each pipeline logs and continues at its boundary; a tick
/// never observes another tick's intermediate state.
pub struct Agent {
    config: AgentConfig,
    db: Arc<dyn Database>,
    provider: Arc<dyn VirtProvider>,
    shutdown: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(config: AgentConfig, db: Arc<dyn Database>, provider: Arc<dyn VirtProvider>) -> Self {
        Self {
            config,
            db,
            provider,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for requesting shutdown from another thread.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run all pipelines until shutdown is requested.
    pub fn run(&self) -> Result<()> {
        info!(node = %self.config.node_id, "agent: Starting node agent");

        let sync_handle = {
            let config = self.config.clone();
            let db = self.db.clone();
            let provider = self.provider.clone();
            let shutdown = self.shutdown.clone();
            thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let hypervisor = db
                        .get_node(config.node_id)
                        .map(|node| node.is_hypervisor())
                        .unwrap_or(false);

                    thread::sleep(if hypervisor {
                        HYPERVISOR_TICK
                    } else {
                        FIREWALL_TICK
                    });
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }

                    if let Err(err) = sync_node_tick(&config, db.as_ref(), provider.as_ref()) {
                        error!(error = %err, "agent: Failed to deploy state");
                    }
                }
            })
        };

        let planner_handle = {
            let db = self.db.clone();
            let shutdown = self.shutdown.clone();
            thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(PLANNER_TICK);
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }

                    if let Err(err) = planner_tick(db.as_ref()) {
                        error!(error = %err, "agent: Failed to apply plans");
                    }
                }
            })
        };

        let storage_handle = {
            let db = self.db.clone();
            let shutdown = self.shutdown.clone();
            let interval = Duration::from_secs(self.config.storage_sync_secs.max(1));
            thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }

                    if let Err(err) = storage_sync_tick(db.as_ref()) {
                        error!(error = %err, "agent: Failed to sync storages");
                    }
                }
            })
        };

        for handle in [sync_handle, planner_handle, storage_handle] {
            if handle.join().is_err() {
                error!("agent: Pipeline thread panicked");
            }
        }

        Ok(())
    }
}
