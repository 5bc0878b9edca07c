use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use tracing::{error, warn};

use hna_core::firewall::FirewallRule;
use hna_core::instance::Instance;
use hna_core::node::Node;
use hna_core::vpc::Vpc;

use crate::naming;

use super::rules::{generate, NatTarget, Role, RuleParams, Rules, HOST_NAMESPACE};

/// Full desired packet-filter state for the node, keyed by
/// `<namespace>-<interface>`. BTreeMap keeps application order stable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableState {
    pub interfaces: BTreeMap<String, Rules>,
}

/// Inputs assembled by the snapshot for one tick.
pub struct StateInput<'a> {
    pub node: &'a Node,
    pub vpcs: &'a [Vpc],
    pub instances: &'a [Instance],
    /// Host ruleset; present only on firewall nodes.
    pub node_firewall: Option<&'a [FirewallRule]>,
    /// Per-namespace instance rulesets.
    pub firewalls: &'a BTreeMap<String, Vec<FirewallRule>>,
}

/// Build the desired table state from a snapshot's view.
pub fn load_state(input: &StateInput) -> Result<TableState> {
    let mut state = TableState::default();

    let vpcs: BTreeMap<_, _> = input.vpcs.iter().map(|v| (v.id, v)).collect();

    if let Some(node_firewall) = input.node_firewall {
        let params = RuleParams::new(HOST_NAMESPACE, "host", Role::Host, node_firewall);
        state
            .interfaces
            .insert(format!("{}-host", HOST_NAMESPACE), generate(&params)?);
    }

    let mode = input.node.network_mode;
    let mode6 = input.node.network_mode6;
    let host_network = input.node.host_block.is_some();

    for inst in input.instances {
        if !inst.is_active() {
            continue;
        }

        let namespace = naming::namespace(inst.id);
        let iface = naming::iface_virt(inst.id);
        let iface_external = naming::iface_external_space(inst.id);
        let iface_host = naming::iface_host_space(inst.id);
        let iface_oracle = naming::iface_oracle(inst.id);

        let addr = inst.private_ip();
        let addr6 = inst.private_ip6();
        let pub_addr = inst.public_ip();
        let pub_addr6 = inst.public_ip6();
        let oracle_addr = inst.oracle_private_ip();

        let virt_key = format!("{}-{}", namespace, iface);
        if state.interfaces.contains_key(&virt_key) {
            error!(
                namespace = %namespace,
                interface = %iface,
                "iptables: Virtual interface conflict",
            );
            continue;
        }

        let Some(ingress) = input.firewalls.get(&namespace) else {
            warn!(
                instance = %inst.id,
                namespace = %namespace,
                "iptables: Failed to load instance firewall rules",
            );
            continue;
        };

        let nat = |a: Option<&str>, p: Option<&str>| -> Option<NatTarget> {
            match (a, p) {
                (Some(addr), Some(pub_addr)) => Some(NatTarget {
                    addr: addr.to_string(),
                    pub_addr: pub_addr.to_string(),
                }),
                _ => None,
            }
        };

        if mode.routed() {
            let mut params =
                RuleParams::new(&namespace, &iface_external, Role::Internal, ingress);
            params.nat = nat(addr, pub_addr);
            if mode6.routed() {
                params.nat6 = nat(addr6, pub_addr6);
            }
            params.oracle_nat = nat(addr, oracle_addr);
            state
                .interfaces
                .insert(format!("{}-{}", namespace, iface_external), generate(&params)?);
        } else if mode6.routed() {
            let mut params =
                RuleParams::new(&namespace, &iface_external, Role::Internal, ingress);
            params.nat6 = nat(addr6, pub_addr6);
            state
                .interfaces
                .insert(format!("{}-{}", namespace, iface_external), generate(&params)?);
        }

        if mode == hna_core::node::NetworkMode::Oracle {
            let mut params = RuleParams::new(&namespace, &iface_oracle, Role::Internal, ingress);
            params.nat = nat(addr, pub_addr);
            state
                .interfaces
                .insert(format!("{}-{}", namespace, iface_oracle), generate(&params)?);
        }

        if host_network {
            let params = RuleParams::new(&namespace, &iface_host, Role::Internal, ingress);
            state
                .interfaces
                .insert(format!("{}-{}", namespace, iface_host), generate(&params)?);
        }

        let mut params = RuleParams::new(&namespace, &iface, Role::Virtual, ingress);
        params.vpc = inst.vpc.and_then(|id| vpcs.get(&id)).copied();
        params.addr = addr;
        params.addr6 = addr6;
        params.source_dest_check = !inst.skip_source_dest_check;
        state.interfaces.insert(virt_key, generate(&params)?);
    }

    Ok(state)
}

/// Drive the kernel from `old` to `new`: unchanged interfaces are
/// untouched, changed ones are rebuilt under a hold, removed ones are
/// torn down.
pub fn apply_diff(old: Option<&TableState>, new: &mut TableState) -> Result<()> {
    for (key, rules) in new.interfaces.iter_mut() {
        match old.and_then(|o| o.interfaces.get(key)) {
            None => {
                rules.hold()?;
                rules.apply()?;
                rules.apply_nat()?;
            }
            Some(old_rules) if old_rules != rules => {
                rules.hold()?;

                let mut stale = old_rules.clone();
                stale.remove()?;
                stale.remove_nat()?;

                rules.apply()?;
                rules.apply_nat()?;
            }
            Some(_) => {}
        }
    }

    if let Some(old) = old {
        for (key, old_rules) in &old.interfaces {
            if new.interfaces.contains_key(key) {
                continue;
            }
            let mut stale = old_rules.clone();
            stale.remove()?;
            stale.remove_nat()?;
        }
    }

    Ok(())
}

static CURRENT: Mutex<Option<TableState>> = Mutex::new(None);

/// Reconcile the kernel against the held per-process state and store
/// the new state on success.
pub fn update_state(mut new: TableState) -> Result<()> {
    let mut current = CURRENT.lock().unwrap_or_else(|p| p.into_inner());
    apply_diff(current.as_ref(), &mut new)?;
    *current = Some(new);
    Ok(())
}

/// Forget the held state. The next update reapplies everything.
pub fn reset_state() {
    let mut current = CURRENT.lock().unwrap_or_else(|p| p.into_inner());
    *current = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock;
    use hna_core::firewall::Protocol;
    use hna_core::instance::InstanceState;
    use hna_core::node::NetworkMode;
    use uuid::Uuid;

    fn node() -> Node {
        Node {
            id: Uuid::new_v4(),
            name: "hv1".to_string(),
            zone: None,
            hypervisor: true,
            firewall: true,
            network_roles: vec![],
            network_mode: NetworkMode::Dhcp,
            network_mode6: NetworkMode::Dhcp,
            pools: vec![],
            host_block: None,
            external_iface: "eth0".to_string(),
            external_iface_bridge: false,
            system_iface_mtu: None,
            space_iface_mtu: None,
        }
    }

    fn instance(node: &Node) -> Instance {
        Instance {
            id: Uuid::new_v4(),
            name: "web-0".to_string(),
            organization: None,
            zone: None,
            vpc: None,
            subnet: None,
            node: node.id,
            shape: None,
            state: InstanceState::Start,
            delete_protection: false,
            network_roles: vec![],
            skip_source_dest_check: false,
            private_ips: vec!["10.97.1.4".to_string()],
            private_ips6: vec!["fd00::4".to_string()],
            public_ips: vec!["203.0.113.9".to_string()],
            public_ips6: vec![],
            oracle_private_ips: vec![],
            oracle_public_ips: vec![],
            processors: 2,
            memory: 2048,
        }
    }

    fn ssh_ruleset() -> Vec<FirewallRule> {
        vec![FirewallRule {
            protocol: Protocol::Tcp,
            port: "22".to_string(),
            source_ips: vec!["0.0.0.0/0".to_string()],
        }]
    }

    #[test]
    fn test_load_state_keys() {
        let nde = node();
        let inst = instance(&nde);
        let namespace = naming::namespace(inst.id);

        let mut firewalls = BTreeMap::new();
        firewalls.insert(namespace.clone(), ssh_ruleset());

        let node_fw = ssh_ruleset();
        let input = StateInput {
            node: &nde,
            vpcs: &[],
            instances: &[inst.clone()],
            node_firewall: Some(&node_fw),
            firewalls: &firewalls,
        };
        let state = load_state(&input).unwrap();

        assert!(state.interfaces.contains_key("0-host"));
        assert!(state
            .interfaces
            .contains_key(&format!("{}-{}", namespace, naming::iface_virt(inst.id))));
        assert!(state.interfaces.contains_key(&format!(
            "{}-{}",
            namespace,
            naming::iface_external_space(inst.id)
        )));
        assert_eq!(state.interfaces.len(), 3);

        // The external interface carries the v4 and v6 NAT bindings.
        let external = &state.interfaces[&format!(
            "{}-{}",
            namespace,
            naming::iface_external_space(inst.id)
        )];
        let nat = external.nat.as_ref().unwrap();
        assert_eq!(nat.addr, "10.97.1.4");
        assert_eq!(nat.pub_addr, "203.0.113.9");
        // No public v6 address, so no v6 binding.
        assert!(external.nat6.is_none());
        assert!(external.oracle_nat.is_none());
    }

    #[test]
    fn test_load_state_skips_inactive_and_unknown_firewalls() {
        let nde = node();
        let mut stopped = instance(&nde);
        stopped.state = InstanceState::Stop;
        let unknown_fw = instance(&nde);

        let firewalls = BTreeMap::new();
        let input = StateInput {
            node: &nde,
            vpcs: &[],
            instances: &[stopped, unknown_fw],
            node_firewall: None,
            firewalls: &firewalls,
        };
        let state = load_state(&input).unwrap();
        assert!(state.interfaces.is_empty());
    }

    #[test]
    fn test_load_state_oracle_mode() {
        let mut nde = node();
        nde.network_mode = NetworkMode::Oracle;
        let mut inst = instance(&nde);
        inst.oracle_private_ips = vec!["10.200.1.4".to_string()];
        let namespace = naming::namespace(inst.id);

        let mut firewalls = BTreeMap::new();
        firewalls.insert(namespace.clone(), ssh_ruleset());

        let input = StateInput {
            node: &nde,
            vpcs: &[],
            instances: &[inst.clone()],
            node_firewall: None,
            firewalls: &firewalls,
        };
        let state = load_state(&input).unwrap();

        let oracle_key = format!("{}-{}", namespace, naming::iface_oracle(inst.id));
        assert!(state.interfaces.contains_key(&oracle_key));
        // Oracle mode does not route the standard external uplink.
        assert!(!state.interfaces.contains_key(&format!(
            "{}-{}",
            namespace,
            naming::iface_external_space(inst.id)
        )));
    }

    #[test]
    fn test_load_state_host_block() {
        let mut nde = node();
        nde.host_block = Some(Uuid::new_v4());
        let inst = instance(&nde);
        let namespace = naming::namespace(inst.id);

        let mut firewalls = BTreeMap::new();
        firewalls.insert(namespace.clone(), ssh_ruleset());

        let input = StateInput {
            node: &nde,
            vpcs: &[],
            instances: &[inst.clone()],
            node_firewall: None,
            firewalls: &firewalls,
        };
        let state = load_state(&input).unwrap();

        let host_key = format!("{}-{}", namespace, naming::iface_host_space(inst.id));
        let host_rules = &state.interfaces[&host_key];
        assert!(host_rules.nat.is_none());
        assert_eq!(host_rules.role, Role::Internal);
    }

    #[test]
    fn test_apply_diff_idempotent() {
        let nde = node();
        let inst = instance(&nde);
        let namespace = naming::namespace(inst.id);

        let mut firewalls = BTreeMap::new();
        firewalls.insert(namespace, ssh_ruleset());

        let node_fw = ssh_ruleset();
        let input = StateInput {
            node: &nde,
            vpcs: &[],
            instances: &[inst],
            node_firewall: Some(&node_fw),
            firewalls: &firewalls,
        };

        let (_guard, log) = mock::record();

        let mut first = load_state(&input).unwrap();
        apply_diff(None, &mut first).unwrap();
        let after_first = log.lock().unwrap().len();
        assert!(after_first > 0);

        // Second tick with the identical snapshot issues no commands.
        let mut second = load_state(&input).unwrap();
        apply_diff(Some(&first), &mut second).unwrap();
        assert_eq!(log.lock().unwrap().len(), after_first);
    }

    #[test]
    fn test_apply_diff_removes_stale_interfaces() {
        let nde = node();
        let inst = instance(&nde);
        let namespace = naming::namespace(inst.id);

        let mut firewalls = BTreeMap::new();
        firewalls.insert(namespace, ssh_ruleset());

        let input = StateInput {
            node: &nde,
            vpcs: &[],
            instances: &[inst],
            node_firewall: None,
            firewalls: &firewalls,
        };

        let (_guard, log) = mock::record();

        let mut first = load_state(&input).unwrap();
        apply_diff(None, &mut first).unwrap();
        log.lock().unwrap().clear();

        // Instance gone: every rule for it is deleted.
        let mut second = TableState::default();
        apply_diff(Some(&first), &mut second).unwrap();

        let log = log.lock().unwrap();
        assert!(!log.is_empty());
        for argv in log.iter() {
            assert!(argv.contains(&"-D".to_string()));
        }
    }

    #[test]
    fn test_apply_diff_rebuilds_changed_interface_under_hold() {
        let nde = node();
        let inst = instance(&nde);
        let namespace = naming::namespace(inst.id);

        let mut firewalls = BTreeMap::new();
        firewalls.insert(namespace.clone(), ssh_ruleset());
        let input = StateInput {
            node: &nde,
            vpcs: &[],
            instances: &[inst.clone()],
            node_firewall: None,
            firewalls: &firewalls,
        };

        let (_guard, log) = mock::record();
        let mut first = load_state(&input).unwrap();
        apply_diff(None, &mut first).unwrap();
        log.lock().unwrap().clear();

        // Policy changes: port 22 -> 2222.
        let mut changed = BTreeMap::new();
        changed.insert(
            namespace,
            vec![FirewallRule {
                protocol: Protocol::Tcp,
                port: "2222".to_string(),
                source_ips: vec!["0.0.0.0/0".to_string()],
            }],
        );
        let input = StateInput {
            node: &nde,
            vpcs: &[],
            instances: &[inst],
            node_firewall: None,
            firewalls: &changed,
        };
        let mut second = load_state(&input).unwrap();
        apply_diff(Some(&first), &mut second).unwrap();

        let log = log.lock().unwrap();
        let texts: Vec<String> = log.iter().map(|argv| argv.join(" ")).collect();
        // Hold goes in first, then the old policy is removed.
        assert!(texts[0].contains(COMMENT_HOLD_MARK));
        assert!(texts.iter().any(|t| t.contains("-D") && t.contains("--dport 22 ")));
        assert!(texts.iter().any(|t| t.contains("-A") && t.contains("--dport 2222")));
    }

    const COMMENT_HOLD_MARK: &str = "pritunl_cloud_hold";
}
