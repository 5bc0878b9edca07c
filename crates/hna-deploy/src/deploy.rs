use std::path::PathBuf;

use anyhow::Result;

use hna_core::db::Database;

use crate::disks::DisksPhase;
use crate::domains::DomainsPhase;
use crate::instances::InstancesPhase;
use crate::ipset::IpsetPhase;
use crate::iptables::IptablesPhase;
use crate::namespaces::NamespacesPhase;
use crate::network::NetworkPhase;
use crate::state::Snapshot;
use crate::virt::VirtProvider;

/// Runs the reconciliation phases in strict order against one
/// snapshot, stopping on the first error. A network-phase failure
/// leaves the node inconsistent; the caller re-derives state on the
/// next tick.
pub struct Deployer {
    data_dir: PathBuf,
    run_dir: PathBuf,
}

impl Deployer {
    pub fn new(data_dir: PathBuf, run_dir: PathBuf) -> Self {
        Self { data_dir, run_dir }
    }

    pub fn deploy(
        &self,
        stat: &Snapshot,
        db: &dyn Database,
        provider: &dyn VirtProvider,
    ) -> Result<()> {
        NetworkPhase::new(stat).deploy()?;

        let ipset = IpsetPhase::new(stat);
        ipset.deploy()?;

        IptablesPhase::new(stat).deploy()?;

        ipset.clean()?;

        DisksPhase::new(stat, &self.data_dir).deploy(db)?;

        InstancesPhase::new(stat).deploy(db, provider)?;

        NamespacesPhase::new(stat, &self.run_dir).deploy(db)?;

        DomainsPhase::new(stat).deploy(db)?;

        Ok(())
    }
}
