use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Address-map kinds. Destination maps DNAT traffic from an instance
/// toward a rewritten target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpcMapKind {
    Destination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpcMap {
    pub kind: VpcMapKind,
    pub destination: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: Uuid,
    pub name: String,
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vpc {
    pub id: Uuid,
    pub name: String,
    pub organization: Option<Uuid>,
    pub datacenter: Uuid,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub maps: Vec<VpcMap>,
}

impl Vpc {
    pub fn subnet(&self, id: Uuid) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.id == id)
    }
}

/// One allocated address inside a VPC subnet. The stored value is an
/// index: the primary address lives at `2n`, its paired gateway at
/// `2n + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpcIp {
    pub id: Uuid,
    pub vpc: Uuid,
    pub subnet: Uuid,
    pub ip: i64,
    #[serde(default)]
    pub instance: Option<Uuid>,
}

fn index_to_addr(value: i64) -> Ipv4Addr {
    Ipv4Addr::from(value as u32)
}

impl VpcIp {
    /// Primary address for this allocation.
    pub fn address(&self) -> Ipv4Addr {
        index_to_addr(self.ip * 2)
    }

    /// Primary address and its paired gateway.
    pub fn address_pair(&self) -> (Ipv4Addr, Ipv4Addr) {
        (index_to_addr(self.ip * 2), index_to_addr(self.ip * 2 + 1))
    }
}
