use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::errors::ValidationError;

/// Smallest disk size in GB; anything below is rounded up.
pub const MIN_SIZE: u32 = 10;

/// Highest attach index on an instance.
pub const MAX_INDEX: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Provision,
    Available,
    Snapshot,
    Backup,
    Expand,
    Restore,
    Destroy,
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Available => write!(f, "available"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Backup => write!(f, "backup"),
            Self::Expand => write!(f, "expand"),
            Self::Restore => write!(f, "restore"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// A qcow2-backed guest disk. Detached disks park under a `hold_<id>`
/// index so they never collide with an attach slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub id: Uuid,
    pub name: String,
    pub state: DiskState,
    pub node: Uuid,
    pub organization: Option<Uuid>,
    #[serde(default)]
    pub instance: Option<Uuid>,
    #[serde(default)]
    pub source_instance: Option<Uuid>,
    #[serde(default)]
    pub delete_protection: bool,
    #[serde(default)]
    pub image: Option<Uuid>,
    #[serde(default)]
    pub restore_image: Option<Uuid>,
    #[serde(default)]
    pub backing: bool,
    #[serde(default)]
    pub backing_image: String,
    pub index: String,
    pub size: u32,
    #[serde(default)]
    pub new_size: u32,
    #[serde(default)]
    pub backup: bool,
    #[serde(skip)]
    committed_index: String,
    #[serde(skip)]
    committed_instance: Option<Uuid>,
}

impl Disk {
    pub fn new(node: Uuid, instance: Option<Uuid>, index: &str, size: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            state: DiskState::Provision,
            node,
            organization: None,
            instance,
            source_instance: None,
            delete_protection: false,
            image: None,
            restore_image: None,
            backing: false,
            backing_image: String::new(),
            index: index.to_string(),
            size,
            new_size: 0,
            backup: false,
            committed_index: String::new(),
            committed_instance: None,
        }
    }

    /// Capture the currently-committed index and instance so a later
    /// `validate` can enforce delete-protection immutability.
    pub fn pre_commit(&mut self) {
        self.committed_index = self.index.clone();
        self.committed_instance = self.instance;
    }

    pub fn validate(&mut self, db: &dyn Database) -> Result<Option<ValidationError>> {
        if self.instance.is_some() && !self.index.is_empty() {
            let index: u32 = match self.index.parse() {
                Ok(idx) => idx,
                Err(_) => {
                    return Ok(Some(ValidationError::new(
                        "index_invalid",
                        "Disk index invalid",
                    )));
                }
            };

            if index > MAX_INDEX {
                return Ok(Some(ValidationError::new(
                    "index_out_of_range",
                    "Disk index out of range",
                )));
            }

            self.index = index.to_string();
        }

        if self.backup && !self.backing_image.is_empty() {
            return Ok(Some(ValidationError::new(
                "backing_image_backup",
                "Cannot enable backups with backing image",
            )));
        }

        if self.state == DiskState::Restore && self.restore_image.is_none() {
            return Ok(Some(ValidationError::new(
                "restore_missing_image",
                "Cannot restore without image set",
            )));
        }

        if self.instance.is_none() && !self.index.starts_with("hold") {
            self.index = format!("hold_{}", Uuid::new_v4().simple());
        }

        if let Some(inst) = self.instance {
            let disks = db.instance_disks(inst)?;
            for dsk in disks {
                if dsk.id != self.id && dsk.index == self.index {
                    return Ok(Some(ValidationError::new(
                        "disk_index_in_use",
                        "Disk index is already in use on instance",
                    )));
                }
            }
        }

        if self.size < MIN_SIZE {
            self.size = MIN_SIZE;
        }

        if self.state == DiskState::Expand {
            if self.new_size == 0 {
                return Ok(Some(ValidationError::new(
                    "new_size_missing",
                    "Cannot expand without new size",
                )));
            }

            if self.new_size < self.size {
                return Ok(Some(ValidationError::new(
                    "new_size_invalid",
                    "New size cannot be less than current size",
                )));
            }
        } else {
            self.new_size = 0;
        }

        if self.delete_protection && self.committed_instance != self.instance {
            return Ok(Some(ValidationError::new(
                "delete_protection_instance",
                "Cannot change instance with delete protection enabled",
            )));
        }

        if self.delete_protection && self.committed_index != self.index {
            return Ok(Some(ValidationError::new(
                "delete_protection_index",
                "Cannot change index with delete protection enabled",
            )));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;

    #[test]
    fn test_index_range() {
        let db = MemoryDb::new();
        let inst = Uuid::new_v4();

        let mut disk = Disk::new(Uuid::new_v4(), Some(inst), "10", 20);
        assert!(disk.validate(&db).unwrap().is_none());

        let mut disk = Disk::new(Uuid::new_v4(), Some(inst), "11", 20);
        let err = disk.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "index_out_of_range");

        let mut disk = Disk::new(Uuid::new_v4(), Some(inst), "two", 20);
        let err = disk.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "index_invalid");
    }

    #[test]
    fn test_detached_disk_gets_hold_index() {
        let db = MemoryDb::new();
        let mut disk = Disk::new(Uuid::new_v4(), None, "3", 20);
        assert!(disk.validate(&db).unwrap().is_none());
        assert!(disk.index.starts_with("hold_"));
    }

    #[test]
    fn test_index_conflict() {
        let db = MemoryDb::new();
        let inst = Uuid::new_v4();

        let mut first = Disk::new(Uuid::new_v4(), Some(inst), "2", 20);
        assert!(first.validate(&db).unwrap().is_none());
        db.insert_disk(first);

        let mut second = Disk::new(Uuid::new_v4(), Some(inst), "2", 20);
        let err = second.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "disk_index_in_use");

        let mut third = Disk::new(Uuid::new_v4(), Some(inst), "3", 20);
        assert!(third.validate(&db).unwrap().is_none());
    }

    #[test]
    fn test_minimum_size() {
        let db = MemoryDb::new();
        let mut disk = Disk::new(Uuid::new_v4(), None, "hold_x", 4);
        assert!(disk.validate(&db).unwrap().is_none());
        assert_eq!(disk.size, MIN_SIZE);
    }

    #[test]
    fn test_expand_requires_new_size() {
        let db = MemoryDb::new();

        let mut disk = Disk::new(Uuid::new_v4(), None, "hold_x", 20);
        disk.state = DiskState::Expand;
        let err = disk.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "new_size_missing");

        disk.new_size = 10;
        let err = disk.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "new_size_invalid");

        disk.new_size = 40;
        assert!(disk.validate(&db).unwrap().is_none());
    }

    #[test]
    fn test_new_size_cleared_outside_expand() {
        let db = MemoryDb::new();
        let mut disk = Disk::new(Uuid::new_v4(), None, "hold_x", 20);
        disk.new_size = 40;
        assert!(disk.validate(&db).unwrap().is_none());
        assert_eq!(disk.new_size, 0);
    }

    #[test]
    fn test_restore_requires_image() {
        let db = MemoryDb::new();
        let mut disk = Disk::new(Uuid::new_v4(), None, "hold_x", 20);
        disk.state = DiskState::Restore;
        let err = disk.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "restore_missing_image");

        disk.restore_image = Some(Uuid::new_v4());
        assert!(disk.validate(&db).unwrap().is_none());
    }

    #[test]
    fn test_backup_excludes_backing_image() {
        let db = MemoryDb::new();
        let mut disk = Disk::new(Uuid::new_v4(), None, "hold_x", 20);
        disk.backup = true;
        disk.backing_image = "base.qcow2".to_string();
        let err = disk.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "backing_image_backup");
    }

    #[test]
    fn test_delete_protection_freezes_placement() {
        let db = MemoryDb::new();
        let inst = Uuid::new_v4();

        let mut disk = Disk::new(Uuid::new_v4(), Some(inst), "2", 20);
        disk.delete_protection = true;
        disk.pre_commit();

        disk.index = "4".to_string();
        let err = disk.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "delete_protection_index");

        disk.index = "2".to_string();
        disk.instance = Some(Uuid::new_v4());
        let err = disk.validate(&db).unwrap().unwrap();
        assert_eq!(err.error, "delete_protection_instance");

        disk.instance = Some(inst);
        assert!(disk.validate(&db).unwrap().is_none());
    }
}
