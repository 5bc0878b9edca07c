use uuid::Uuid;

// Interface name prefixes. The first letter carries the role: the
// rule synthesizer and hold construction dispatch on it for
// bridge-member matching.
//
//   p — guest-facing bridge port
//   e — namespace side of the external veth
//   h — host side of the external veth
//   i — namespace side of the host-block veth
//   o — namespace side of the oracle uplink

fn short(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Network namespace holding an instance's guest network.
pub fn namespace(instance: Uuid) -> String {
    format!("n{}", short(instance))
}

/// Guest-facing bridge port.
pub fn iface_virt(instance: Uuid) -> String {
    format!("p{}", short(instance))
}

/// Namespace side of the external uplink veth.
pub fn iface_external_space(instance: Uuid) -> String {
    format!("e{}", short(instance))
}

/// Host side of the external uplink veth.
pub fn iface_external_system(instance: Uuid) -> String {
    format!("h{}", short(instance))
}

/// Namespace side of the host-block veth.
pub fn iface_host_space(instance: Uuid) -> String {
    format!("i{}", short(instance))
}

/// Namespace side of the oracle uplink.
pub fn iface_oracle(instance: Uuid) -> String {
    format!("o{}", short(instance))
}

/// Deterministic locally-administered MAC for an instance interface.
pub fn mac_addr(instance: Uuid, index: u8) -> String {
    let bytes = instance.as_bytes();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], index,
    )
}
