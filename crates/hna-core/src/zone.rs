use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Zone-level overlay mode. VxlanVlan zones stretch VPC networks
/// across every net-capable node in the datacenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneNetworkMode {
    #[default]
    Default,
    VxlanVlan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
    pub datacenter: Uuid,
    #[serde(default)]
    pub network_mode: ZoneNetworkMode,
}
