use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use uuid::Uuid;

use hna_core::disk::Disk;
use hna_core::instance::{Instance, Virt, VirtDisk, VirtState};

/// The hypervisor process boundary. Launching and tearing down guest
/// processes is an external integration; the deployer converges
/// through this trait only.
pub trait VirtProvider: Send + Sync {
    /// Guests currently running on this host.
    fn running_virts(&self) -> Result<Vec<Virt>>;
    fn start(&self, instance: &Instance, disks: &[Disk]) -> Result<()>;
    fn stop(&self, virt: &Virt) -> Result<()>;
    fn destroy(&self, virt: &Virt) -> Result<()>;
}

/// In-process provider used by tests and standalone runs: tracks
/// guest state without launching anything.
#[derive(Default)]
pub struct StubVirtProvider {
    virts: Mutex<BTreeMap<Uuid, Virt>>,
}

impl StubVirtProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an observed guest, as if it had been found running.
    pub fn seed(&self, virt: Virt) {
        self.virts.lock().unwrap().insert(virt.id, virt);
    }

    pub fn virt(&self, id: Uuid) -> Option<Virt> {
        self.virts.lock().unwrap().get(&id).cloned()
    }
}

impl VirtProvider for StubVirtProvider {
    fn running_virts(&self) -> Result<Vec<Virt>> {
        Ok(self.virts.lock().unwrap().values().cloned().collect())
    }

    fn start(&self, instance: &Instance, disks: &[Disk]) -> Result<()> {
        let virt = Virt {
            id: instance.id,
            state: VirtState::Running,
            disks: disks
                .iter()
                .filter_map(|d| {
                    d.index.parse::<u32>().ok().map(|index| VirtDisk {
                        id: d.id,
                        index,
                    })
                })
                .collect(),
        };
        self.virts.lock().unwrap().insert(virt.id, virt);
        Ok(())
    }

    fn stop(&self, virt: &Virt) -> Result<()> {
        if let Some(stored) = self.virts.lock().unwrap().get_mut(&virt.id) {
            stored.state = VirtState::Stopped;
        }
        Ok(())
    }

    fn destroy(&self, virt: &Virt) -> Result<()> {
        self.virts.lock().unwrap().remove(&virt.id);
        Ok(())
    }
}
