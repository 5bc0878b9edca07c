use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use hna_core::db::Database;
use hna_core::disk::{Disk, DiskState};
use hna_core::time;

use hna_net::exec::exec;

use crate::state::Snapshot;

/// Phase 5: drive each disk toward its desired state with the
/// storage backend's CLI.
pub struct DisksPhase<'a> {
    stat: &'a Snapshot,
    data_dir: &'a Path,
}

impl<'a> DisksPhase<'a> {
    pub fn new(stat: &'a Snapshot, data_dir: &'a Path) -> Self {
        Self { stat, data_dir }
    }

    fn disk_path(&self, disk: &Disk) -> PathBuf {
        self.data_dir.join(format!("{}.qcow2", disk.id.simple()))
    }

    fn image_path(&self, image: uuid::Uuid) -> PathBuf {
        self.data_dir
            .join("images")
            .join(format!("{}.qcow2", image.simple()))
    }

    pub fn deploy(&self, db: &dyn Database) -> Result<()> {
        for disk in self.stat.disks() {
            let mut disk = disk.clone();
            match disk.state {
                DiskState::Provision => self.provision(db, &mut disk)?,
                DiskState::Expand => self.expand(db, &mut disk)?,
                DiskState::Snapshot => self.copy_out(db, &mut disk, "snapshots")?,
                DiskState::Backup => self.copy_out(db, &mut disk, "backups")?,
                DiskState::Restore => self.restore(db, &mut disk)?,
                DiskState::Destroy => self.destroy(db, &mut disk)?,
                DiskState::Available => {}
            }
        }

        Ok(())
    }

    fn commit_state(&self, db: &dyn Database, disk: &mut Disk, state: DiskState) -> Result<()> {
        disk.state = state;
        db.commit_disk(disk)
    }

    fn provision(&self, db: &dyn Database, disk: &mut Disk) -> Result<()> {
        let path = self.disk_path(disk);

        if !path.exists() {
            let path_str = path.to_string_lossy().to_string();
            let size = format!("{}G", disk.size);

            if disk.backing_image.is_empty() {
                exec(
                    &[],
                    &[
                        "qemu-img",
                        "create",
                        "-f",
                        "qcow2",
                        path_str.as_str(),
                        size.as_str(),
                    ],
                )?;
            } else {
                exec(
                    &[],
                    &[
                        "qemu-img",
                        "create",
                        "-f",
                        "qcow2",
                        "-b",
                        disk.backing_image.as_str(),
                        "-F",
                        "qcow2",
                        path_str.as_str(),
                        size.as_str(),
                    ],
                )?;
            }

            info!(disk = %disk.id, path = %path.display(), "disks: Provisioned disk");
        }

        self.commit_state(db, disk, DiskState::Available)
    }

    fn expand(&self, db: &dyn Database, disk: &mut Disk) -> Result<()> {
        let path = self.disk_path(disk);
        let path_str = path.to_string_lossy().to_string();
        let size = format!("{}G", disk.new_size);

        exec(
            &[],
            &["qemu-img", "resize", path_str.as_str(), size.as_str()],
        )?;

        info!(
            disk = %disk.id,
            size = disk.new_size,
            "disks: Expanded disk",
        );

        disk.size = disk.new_size;
        disk.new_size = 0;
        self.commit_state(db, disk, DiskState::Available)
    }

    fn copy_out(&self, db: &dyn Database, disk: &mut Disk, kind: &str) -> Result<()> {
        let path = self.disk_path(disk);
        let path_str = path.to_string_lossy().to_string();

        let out_dir = self.data_dir.join(kind);
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| hna_core::errors::Error::Write(format!("disks: {}", e)))?;
        let stamp = time::rfc3339(time::now()).replace(':', "-");
        let out = out_dir.join(format!("{}-{}.qcow2", disk.id.simple(), stamp));
        let out_str = out.to_string_lossy().to_string();

        exec(
            &[],
            &[
                "qemu-img",
                "convert",
                "-f",
                "qcow2",
                "-O",
                "qcow2",
                path_str.as_str(),
                out_str.as_str(),
            ],
        )?;

        info!(disk = %disk.id, target = %out.display(), "disks: Copied disk image");

        self.commit_state(db, disk, DiskState::Available)
    }

    fn restore(&self, db: &dyn Database, disk: &mut Disk) -> Result<()> {
        let Some(image) = disk.restore_image else {
            warn!(disk = %disk.id, "disks: Restore without image");
            return self.commit_state(db, disk, DiskState::Available);
        };

        if let Some(instance) = disk.instance {
            if self.stat.disk_in_use(instance, disk.id) {
                warn!(disk = %disk.id, "disks: Cannot restore disk in use");
                return Ok(());
            }
        }

        let path = self.disk_path(disk);
        let path_str = path.to_string_lossy().to_string();
        let image_path = self.image_path(image);
        let image_str = image_path.to_string_lossy().to_string();

        exec(
            &[],
            &[
                "qemu-img",
                "convert",
                "-f",
                "qcow2",
                "-O",
                "qcow2",
                image_str.as_str(),
                path_str.as_str(),
            ],
        )?;

        info!(disk = %disk.id, image = %image, "disks: Restored disk");

        disk.restore_image = None;
        self.commit_state(db, disk, DiskState::Available)
    }

    fn destroy(&self, db: &dyn Database, disk: &mut Disk) -> Result<()> {
        if disk.delete_protection {
            info!(disk = %disk.id, "disks: Delete protection ignore disk destroy");
            return self.commit_state(db, disk, DiskState::Available);
        }

        if let Some(instance) = disk.instance {
            if self.stat.disk_in_use(instance, disk.id) {
                warn!(disk = %disk.id, "disks: Cannot destroy disk in use");
                return Ok(());
            }
        }

        let path = self.disk_path(disk);
        info!(disk = %disk.id, path = %path.display(), "disks: Destroying disk");

        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(
                    hna_core::errors::Error::Write(format!("disks: {}", err)).into(),
                );
            }
        }

        db.remove_disk(disk.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Snapshot;
    use crate::virt::StubVirtProvider;
    use hna_core::db::MemoryDb;
    use hna_core::instance::{Virt, VirtDisk, VirtState};
    use hna_net::exec::mock;
    use uuid::Uuid;

    struct Fixture {
        db: MemoryDb,
        node: hna_core::node::Node,
        data_dir: tempfile::TempDir,
        run_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let db = MemoryDb::new();
        let node = crate::state::tests::seed_node(&db);
        Fixture {
            db,
            node,
            data_dir: tempfile::tempdir().unwrap(),
            run_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn snapshot(fx: &Fixture, provider: &StubVirtProvider) -> Snapshot {
        let _guard = mock::install(|argv| {
            if argv.join(" ").contains("netns list") {
                mock::MockResponse::ok("")
            } else {
                mock::MockResponse::ok("[]")
            }
        });
        Snapshot::load(&fx.db, fx.node.id, provider, fx.run_dir.path()).unwrap()
    }

    fn seed_disk(fx: &Fixture, state: DiskState) -> Disk {
        let mut disk = Disk::new(fx.node.id, None, "hold_x", 20);
        disk.state = state;
        fx.db.insert_disk(disk.clone());
        disk
    }

    #[test]
    fn test_provision_creates_and_commits() {
        let fx = fixture();
        let disk = seed_disk(&fx, DiskState::Provision);
        let provider = StubVirtProvider::new();
        let stat = snapshot(&fx, &provider);

        let (_guard, log) = mock::record();
        DisksPhase::new(&stat, fx.data_dir.path())
            .deploy(&fx.db)
            .unwrap();

        let texts: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv.join(" "))
            .collect();
        assert!(texts
            .iter()
            .any(|t| t.starts_with("qemu-img create -f qcow2") && t.ends_with("20G")));

        let stored = fx.db.node_disks(fx.node.id).unwrap();
        assert_eq!(stored[0].id, disk.id);
        assert_eq!(stored[0].state, DiskState::Available);
    }

    #[test]
    fn test_expand_resizes_and_clears_new_size() {
        let fx = fixture();
        let mut disk = seed_disk(&fx, DiskState::Expand);
        disk.new_size = 40;
        fx.db.insert_disk(disk.clone());

        let provider = StubVirtProvider::new();
        let stat = snapshot(&fx, &provider);

        let (_guard, log) = mock::record();
        DisksPhase::new(&stat, fx.data_dir.path())
            .deploy(&fx.db)
            .unwrap();

        let texts: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv.join(" "))
            .collect();
        assert!(texts
            .iter()
            .any(|t| t.starts_with("qemu-img resize") && t.ends_with("40G")));

        let stored = fx.db.node_disks(fx.node.id).unwrap();
        assert_eq!(stored[0].state, DiskState::Available);
        assert_eq!(stored[0].size, 40);
        assert_eq!(stored[0].new_size, 0);
    }

    #[test]
    fn test_delete_protection_downgrades_destroy() {
        let fx = fixture();
        let mut disk = seed_disk(&fx, DiskState::Destroy);
        disk.delete_protection = true;
        fx.db.insert_disk(disk.clone());

        let provider = StubVirtProvider::new();
        let stat = snapshot(&fx, &provider);

        let (_guard, _log) = mock::record();
        DisksPhase::new(&stat, fx.data_dir.path())
            .deploy(&fx.db)
            .unwrap();

        // Disk kept, state downgraded to available.
        let stored = fx.db.node_disks(fx.node.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, DiskState::Available);
    }

    #[test]
    fn test_destroy_removes_disk_and_file() {
        let fx = fixture();
        let disk = seed_disk(&fx, DiskState::Destroy);

        let path = fx
            .data_dir
            .path()
            .join(format!("{}.qcow2", disk.id.simple()));
        std::fs::write(&path, "qcow2").unwrap();

        let provider = StubVirtProvider::new();
        let stat = snapshot(&fx, &provider);

        let (_guard, _log) = mock::record();
        DisksPhase::new(&stat, fx.data_dir.path())
            .deploy(&fx.db)
            .unwrap();

        assert!(!path.exists());
        assert!(fx.db.node_disks(fx.node.id).unwrap().is_empty());
    }

    #[test]
    fn test_destroy_missing_file_still_removes_row() {
        let fx = fixture();
        seed_disk(&fx, DiskState::Destroy);

        let provider = StubVirtProvider::new();
        let stat = snapshot(&fx, &provider);

        let (_guard, _log) = mock::record();
        DisksPhase::new(&stat, fx.data_dir.path())
            .deploy(&fx.db)
            .unwrap();
        assert!(fx.db.node_disks(fx.node.id).unwrap().is_empty());
    }

    #[test]
    fn test_destroy_skips_disk_in_use() {
        let fx = fixture();
        let inst = crate::state::tests::seed_instance(&fx.db, &fx.node);

        let mut disk = Disk::new(fx.node.id, Some(inst.id), "2", 20);
        disk.state = DiskState::Destroy;
        fx.db.insert_disk(disk.clone());

        let provider = StubVirtProvider::new();
        provider.seed(Virt {
            id: inst.id,
            state: VirtState::Running,
            disks: vec![VirtDisk {
                id: disk.id,
                index: 2,
            }],
        });
        let stat = snapshot(&fx, &provider);

        let (_guard, _log) = mock::record();
        DisksPhase::new(&stat, fx.data_dir.path())
            .deploy(&fx.db)
            .unwrap();

        // Still present, still pending destroy.
        let stored = fx.db.node_disks(fx.node.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, DiskState::Destroy);
    }

    #[test]
    fn test_restore_converts_image_over_disk() {
        let fx = fixture();
        let image = Uuid::new_v4();
        let mut disk = seed_disk(&fx, DiskState::Restore);
        disk.restore_image = Some(image);
        fx.db.insert_disk(disk.clone());

        let provider = StubVirtProvider::new();
        let stat = snapshot(&fx, &provider);

        let (_guard, log) = mock::record();
        DisksPhase::new(&stat, fx.data_dir.path())
            .deploy(&fx.db)
            .unwrap();

        let texts: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv.join(" "))
            .collect();
        assert!(texts.iter().any(|t| {
            t.starts_with("qemu-img convert")
                && t.contains(&image.simple().to_string())
                && t.ends_with(&format!("{}.qcow2", disk.id.simple()))
        }));

        let stored = fx.db.node_disks(fx.node.id).unwrap();
        assert_eq!(stored[0].state, DiskState::Available);
        assert_eq!(stored[0].restore_image, None);
    }
}
