use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-family uplink network mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Disabled,
    #[default]
    Dhcp,
    Slaac,
    DhcpSlaac,
    Static,
    Oracle,
}

impl NetworkMode {
    /// Whether this family routes through the standard external uplink.
    /// Disabled carries nothing; oracle traffic goes through the
    /// secondary oracle interface instead.
    pub fn routed(self) -> bool {
        !matches!(self, NetworkMode::Disabled | NetworkMode::Oracle)
    }

    /// Whether v6 addressing comes from router advertisements.
    pub fn slaac(self) -> bool {
        matches!(self, NetworkMode::Slaac | NetworkMode::DhcpSlaac)
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Dhcp => write!(f, "dhcp"),
            Self::Slaac => write!(f, "slaac"),
            Self::DhcpSlaac => write!(f, "dhcp_slaac"),
            Self::Static => write!(f, "static"),
            Self::Oracle => write!(f, "oracle"),
        }
    }
}

/// A hypervisor host. Read once per tick and never mutated by the
/// reconciliation core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub zone: Option<Uuid>,
    #[serde(default)]
    pub hypervisor: bool,
    #[serde(default)]
    pub firewall: bool,
    #[serde(default)]
    pub network_roles: Vec<String>,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub network_mode6: NetworkMode,
    #[serde(default)]
    pub pools: Vec<Uuid>,
    #[serde(default)]
    pub host_block: Option<Uuid>,
    /// Physical uplink device.
    #[serde(default)]
    pub external_iface: String,
    /// Uplink is a bridge (veth pair) rather than a flat device (macvlan).
    #[serde(default)]
    pub external_iface_bridge: bool,
    #[serde(default)]
    pub system_iface_mtu: Option<u32>,
    #[serde(default)]
    pub space_iface_mtu: Option<u32>,
}

impl Node {
    pub fn is_hypervisor(&self) -> bool {
        self.hypervisor
    }
}

/// Host network address block, attached to nodes that bridge
/// instances directly onto the host network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_routed() {
        assert!(NetworkMode::Dhcp.routed());
        assert!(NetworkMode::Static.routed());
        assert!(NetworkMode::Slaac.routed());
        assert!(!NetworkMode::Disabled.routed());
        assert!(!NetworkMode::Oracle.routed());
    }

    #[test]
    fn test_network_mode_slaac() {
        assert!(NetworkMode::Slaac.slaac());
        assert!(NetworkMode::DhcpSlaac.slaac());
        assert!(!NetworkMode::Dhcp.slaac());
    }

    #[test]
    fn test_network_mode_serde() {
        let mode: NetworkMode = serde_json::from_str("\"dhcp_slaac\"").unwrap();
        assert_eq!(mode, NetworkMode::DhcpSlaac);
        assert_eq!(serde_json::to_string(&NetworkMode::Oracle).unwrap(), "\"oracle\"");
    }

    #[test]
    fn test_node_defaults() {
        let json = r#"{
            "id": "5e1f9c7a-0b4d-4a5e-9c3f-2b8a6d4e1f0a",
            "name": "hv1",
            "zone": null
        }"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert!(!node.is_hypervisor());
        assert_eq!(node.network_mode, NetworkMode::Dhcp);
        assert_eq!(node.network_mode6, NetworkMode::Dhcp);
        assert!(node.pools.is_empty());
    }
}
