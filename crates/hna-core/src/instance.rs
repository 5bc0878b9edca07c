use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::errors::ValidationError;

/// Desired instance state, requested by the planner or an operator
/// and realized by the instance deploy phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provision,
    Start,
    Stop,
    Restart,
    Destroy,
    Snapshot,
    Backup,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Restart => write!(f, "restart"),
            Self::Destroy => write!(f, "destroy"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// Observed state of a guest hypervisor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtState {
    Provisioning,
    Starting,
    Running,
    Stopped,
    Failed,
    Updating,
}

/// A running guest as observed on the host: the process view, not the
/// declared record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Virt {
    /// Matches the instance id the guest was launched for.
    pub id: Uuid,
    pub state: VirtState,
    #[serde(default)]
    pub disks: Vec<VirtDisk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtDisk {
    pub id: Uuid,
    pub index: u32,
}

/// A declared guest virtual machine. Addresses are assigned by the
/// VPC IP allocator and are unique within a VPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub organization: Option<Uuid>,
    pub zone: Option<Uuid>,
    pub vpc: Option<Uuid>,
    pub subnet: Option<Uuid>,
    pub node: Uuid,
    #[serde(default)]
    pub shape: Option<Uuid>,
    pub state: InstanceState,
    #[serde(default)]
    pub delete_protection: bool,
    #[serde(default)]
    pub network_roles: Vec<String>,
    #[serde(default)]
    pub skip_source_dest_check: bool,
    #[serde(default)]
    pub private_ips: Vec<String>,
    #[serde(default)]
    pub private_ips6: Vec<String>,
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub public_ips6: Vec<String>,
    #[serde(default)]
    pub oracle_private_ips: Vec<String>,
    #[serde(default)]
    pub oracle_public_ips: Vec<String>,
    #[serde(default)]
    pub processors: u32,
    #[serde(default)]
    pub memory: u32,
}

impl Instance {
    /// Whether the instance should have a namespace, uplink, and
    /// firewall state on this node.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Provision
                | InstanceState::Start
                | InstanceState::Restart
                | InstanceState::Snapshot
                | InstanceState::Backup
        )
    }

    /// First private v4 address, if assigned.
    pub fn private_ip(&self) -> Option<&str> {
        self.private_ips.first().map(String::as_str)
    }

    pub fn private_ip6(&self) -> Option<&str> {
        self.private_ips6.first().map(String::as_str)
    }

    pub fn public_ip(&self) -> Option<&str> {
        self.public_ips.first().map(String::as_str)
    }

    pub fn public_ip6(&self) -> Option<&str> {
        self.public_ips6.first().map(String::as_str)
    }

    pub fn oracle_private_ip(&self) -> Option<&str> {
        self.oracle_private_ips.first().map(String::as_str)
    }

    pub fn validate(&mut self, _db: &dyn Database) -> Result<Option<ValidationError>> {
        if self.state == InstanceState::Destroy && self.delete_protection {
            return Ok(Some(ValidationError::new(
                "instance_delete_protection",
                "Cannot destroy instance with delete protection enabled",
            )));
        }

        Ok(None)
    }
}
