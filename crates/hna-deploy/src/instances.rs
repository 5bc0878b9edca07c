use anyhow::Result;
use tracing::info;

use hna_core::db::Database;
use hna_core::instance::{Instance, InstanceState, VirtState};

use crate::state::Snapshot;
use crate::virt::VirtProvider;

/// Phase 6: converge running guests to each instance's desired state.
pub struct InstancesPhase<'a> {
    stat: &'a Snapshot,
}

impl<'a> InstancesPhase<'a> {
    pub fn new(stat: &'a Snapshot) -> Self {
        Self { stat }
    }

    pub fn deploy(&self, db: &dyn Database, provider: &dyn VirtProvider) -> Result<()> {
        for inst in self.stat.instances() {
            self.deploy_instance(db, provider, inst)?;
        }

        Ok(())
    }

    fn start(&self, provider: &dyn VirtProvider, inst: &Instance) -> Result<()> {
        info!(instance = %inst.id, "instances: Starting instance");
        provider.start(inst, self.stat.instance_disks(inst.id))
    }

    fn deploy_instance(
        &self,
        db: &dyn Database,
        provider: &dyn VirtProvider,
        inst: &Instance,
    ) -> Result<()> {
        let virt = self.stat.virt(inst.id);
        let running = matches!(
            virt.map(|v| v.state),
            Some(VirtState::Running) | Some(VirtState::Starting) | Some(VirtState::Provisioning),
        );

        match inst.state {
            InstanceState::Provision | InstanceState::Start => {
                if !running {
                    self.start(provider, inst)?;
                    if inst.state == InstanceState::Provision {
                        db.commit_instance_state(inst.id, InstanceState::Start)?;
                    }
                }
            }
            InstanceState::Stop => {
                if let Some(virt) = virt {
                    if running {
                        info!(instance = %inst.id, "instances: Stopping instance");
                        provider.stop(virt)?;
                    }
                }
            }
            InstanceState::Restart => {
                if let Some(virt) = virt {
                    if running {
                        info!(instance = %inst.id, "instances: Restarting instance");
                        provider.stop(virt)?;
                    }
                }
                self.start(provider, inst)?;
                db.commit_instance_state(inst.id, InstanceState::Start)?;
            }
            InstanceState::Destroy => {
                if let Some(virt) = virt {
                    info!(instance = %inst.id, "instances: Destroying instance");
                    provider.destroy(virt)?;
                }
                db.remove_instance(inst.id)?;
            }
            InstanceState::Snapshot | InstanceState::Backup => {
                // Realized by the disk phase; settle back to running.
                db.commit_instance_state(inst.id, InstanceState::Start)?;
            }
        }

        Ok(())
    }
}
