use anyhow::Result;

use hna_core::errors::Error;
use hna_core::firewall::{FirewallRule, Protocol};
use hna_core::vpc::{Vpc, VpcMapKind};

// Comment markers on every synthesized command. Orphaned rules are
// identified and removed in bulk by these markers.
pub const COMMENT_RULE: &str = "pritunl_cloud_rule";
pub const COMMENT_SDC: &str = "pritunl_cloud_sdc";
pub const COMMENT_MAP: &str = "pritunl_cloud_map";
pub const COMMENT_NAT: &str = "pritunl_cloud_nat";
pub const COMMENT_ORACLE_NAT: &str = "pritunl_cloud_oracle_nat";
pub const COMMENT_HOLD: &str = "pritunl_cloud_hold";

/// Kernel address set holding every instance v6 address, used by the
/// v6 source-destination check.
pub const SDC6_SET: &str = "pr6_sdc";

/// Namespace name for rules applied to the host's own tables.
pub const HOST_NAMESPACE: &str = "0";

/// What an interface is to the packet filter. Selects the chain and
/// the match expression for every synthesized command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The node itself: INPUT chain, loopback accepted.
    Host,
    /// Guest-facing bridge port: FORWARD chain, physdev matching for
    /// bridge members.
    Virtual,
    /// Host side of a veth into a namespace: FORWARD chain, input
    /// device matching.
    Internal,
    /// Uplink outbound: FORWARD chain, output device matching.
    External,
}

impl Role {
    fn chain(self) -> &'static str {
        match self {
            Role::Host => "INPUT",
            _ => "FORWARD",
        }
    }
}

/// One NAT binding: private address and the public address fronting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatTarget {
    pub addr: String,
    pub pub_addr: String,
}

/// Ordered command sets for one (namespace, interface). Applied in
/// exactly this order: SourceDestCheck, Ingress, Maps, then hold
/// removal.
#[derive(Debug, Clone, PartialEq)]
pub struct Rules {
    pub namespace: String,
    pub interface: String,
    pub role: Role,
    pub source_dest_check: Vec<Vec<String>>,
    pub source_dest_check6: Vec<Vec<String>>,
    pub ingress: Vec<Vec<String>>,
    pub ingress6: Vec<Vec<String>>,
    pub maps: Vec<Vec<String>>,
    pub maps6: Vec<Vec<String>>,
    pub holds: Vec<Vec<String>>,
    pub holds6: Vec<Vec<String>>,
    pub nat: Option<NatTarget>,
    pub nat6: Option<NatTarget>,
    pub oracle_nat: Option<NatTarget>,
}

impl Rules {
    fn new(namespace: &str, interface: &str, role: Role) -> Self {
        Self {
            namespace: namespace.to_string(),
            interface: interface.to_string(),
            role,
            source_dest_check: vec![],
            source_dest_check6: vec![],
            ingress: vec![],
            ingress6: vec![],
            maps: vec![],
            maps6: vec![],
            holds: vec![],
            holds6: vec![],
            nat: None,
            nat6: None,
            oracle_nat: None,
        }
    }

    fn chain_cmd(&self) -> Vec<String> {
        vec![self.role.chain().to_string()]
    }

    /// Match for traffic leaving toward this interface.
    pub(super) fn egress_match(&self) -> Result<Vec<String>> {
        match self.role {
            Role::Host => Ok(vec![]),
            Role::Virtual => match self.interface.chars().next() {
                Some('p') => Ok(physdev("--physdev-out", &self.interface)),
                Some('e') | Some('h') | Some('i') | Some('o') => {
                    Ok(vec!["-i".to_string(), self.interface.clone()])
                }
                _ => Err(Error::Parse(format!(
                    "iptables: Unknown interface type {}",
                    self.interface,
                ))
                .into()),
            },
            Role::Internal => Ok(vec!["-i".to_string(), self.interface.clone()]),
            Role::External => Ok(vec!["-o".to_string(), self.interface.clone()]),
        }
    }

    /// Match for traffic arriving from this interface.
    fn ingress_match(&self) -> Result<Vec<String>> {
        match self.role {
            Role::Host => Ok(vec![]),
            Role::Virtual => match self.interface.chars().next() {
                Some('p') => Ok(physdev("--physdev-in", &self.interface)),
                Some('e') | Some('h') | Some('i') | Some('o') => {
                    Ok(vec!["-i".to_string(), self.interface.clone()])
                }
                _ => Err(Error::Parse(format!(
                    "iptables: Unknown interface type {}",
                    self.interface,
                ))
                .into()),
            },
            Role::Internal => Ok(vec!["-i".to_string(), self.interface.clone()]),
            Role::External => Ok(vec!["-o".to_string(), self.interface.clone()]),
        }
    }
}

fn physdev(direction: &str, interface: &str) -> Vec<String> {
    vec![
        "-m".to_string(),
        "physdev".to_string(),
        direction.to_string(),
        interface.to_string(),
        "--physdev-is-bridged".to_string(),
    ]
}

fn comment(mut cmd: Vec<String>, marker: &str) -> Vec<String> {
    cmd.extend([
        "-m".to_string(),
        "comment".to_string(),
        "--comment".to_string(),
        marker.to_string(),
    ]);
    cmd
}

fn jump(mut cmd: Vec<String>, target: &str) -> Vec<String> {
    cmd.extend(["-j".to_string(), target.to_string()]);
    cmd
}

/// Synthesis inputs for one (namespace, interface).
pub struct RuleParams<'a> {
    pub namespace: &'a str,
    pub interface: &'a str,
    pub role: Role,
    pub vpc: Option<&'a Vpc>,
    /// Primary v4 address of the instance behind the interface.
    pub addr: Option<&'a str>,
    /// Primary v6 address of the instance behind the interface.
    pub addr6: Option<&'a str>,
    pub source_dest_check: bool,
    pub nat: Option<NatTarget>,
    pub nat6: Option<NatTarget>,
    pub oracle_nat: Option<NatTarget>,
    pub ingress: &'a [FirewallRule],
}

impl<'a> RuleParams<'a> {
    pub fn new(
        namespace: &'a str,
        interface: &'a str,
        role: Role,
        ingress: &'a [FirewallRule],
    ) -> Self {
        Self {
            namespace,
            interface,
            role,
            vpc: None,
            addr: None,
            addr6: None,
            source_dest_check: false,
            nat: None,
            nat6: None,
            oracle_nat: None,
            ingress,
        }
    }
}

/// Build the full ordered command sets for one interface. The output
/// is a stable function of the inputs.
pub fn generate(params: &RuleParams) -> Result<Rules> {
    let mut rules = Rules::new(params.namespace, params.interface, params.role);
    rules.nat = params.nat.clone();
    rules.nat6 = params.nat6.clone();
    rules.oracle_nat = params.oracle_nat.clone();

    let egress = rules.egress_match()?;
    let ingress_side = rules.ingress_match()?;

    // Anti-spoof drops fire before any other rule.
    if params.source_dest_check {
        if let Some(addr) = params.addr {
            let mut cmd = rules.chain_cmd();
            cmd.extend(["!".to_string(), "-s".to_string(), format!("{}/32", addr)]);
            cmd.extend(ingress_side.clone());
            let cmd = jump(comment(cmd, COMMENT_SDC), "DROP");
            rules.source_dest_check.push(cmd);
        }

        let mut cmd = rules.chain_cmd();
        cmd.extend([
            "-m".to_string(),
            "set".to_string(),
            "!".to_string(),
            "--match-set".to_string(),
            SDC6_SET.to_string(),
            "src".to_string(),
        ]);
        cmd.extend(ingress_side.clone());
        let cmd = jump(comment(cmd, COMMENT_SDC), "DROP");
        rules.source_dest_check6.push(cmd);

        if let Some(addr) = params.addr {
            let mut cmd = rules.chain_cmd();
            cmd.extend(["!".to_string(), "-d".to_string(), format!("{}/32", addr)]);
            cmd.extend(egress.clone());
            let cmd = jump(comment(cmd, COMMENT_SDC), "DROP");
            rules.source_dest_check.push(cmd);
        }

        let mut cmd = rules.chain_cmd();
        cmd.extend([
            "-m".to_string(),
            "set".to_string(),
            "!".to_string(),
            "--match-set".to_string(),
            SDC6_SET.to_string(),
            "dst".to_string(),
        ]);
        cmd.extend(egress.clone());
        let cmd = jump(comment(cmd, COMMENT_SDC), "DROP");
        rules.source_dest_check6.push(cmd);
    }

    // Loopback is unconditionally accepted on the host chain.
    if params.role == Role::Host {
        for family in [&mut rules.ingress, &mut rules.ingress6] {
            let mut cmd = vec![Role::Host.chain().to_string()];
            cmd.extend(["-i".to_string(), "lo".to_string()]);
            family.push(jump(comment(cmd, COMMENT_RULE), "ACCEPT"));
        }
    }

    // Multicast and broadcast accepts, both families.
    for pkt_type in ["multicast", "broadcast"] {
        for family in [false, true] {
            let mut cmd = rules.chain_cmd();
            cmd.extend(egress.clone());
            cmd.extend([
                "-m".to_string(),
                "pkttype".to_string(),
                "--pkt-type".to_string(),
                pkt_type.to_string(),
            ]);
            let cmd = jump(comment(cmd, COMMENT_RULE), "ACCEPT");
            if family {
                rules.ingress6.push(cmd);
            } else {
                rules.ingress.push(cmd);
            }
        }
    }

    // Established connections.
    for family in [false, true] {
        let mut cmd = rules.chain_cmd();
        cmd.extend(egress.clone());
        cmd.extend([
            "-m".to_string(),
            "conntrack".to_string(),
            "--ctstate".to_string(),
            "RELATED,ESTABLISHED".to_string(),
        ]);
        let cmd = jump(comment(cmd, COMMENT_RULE), "ACCEPT");
        if family {
            rules.ingress6.push(cmd);
        } else {
            rules.ingress.push(cmd);
        }
    }

    // Policy entries. Each distinct source is synthesized once per
    // family; the wildcard sources exactly once each.
    for rule in params.ingress {
        let mut all4 = false;
        let mut all6 = false;
        let mut set4 = false;
        let mut set6 = false;
        let set_name = rule.set_name(false);
        let set_name6 = rule.set_name(true);

        for source_ip in &rule.source_ips {
            let ipv6 = source_ip.contains(':');

            if source_ip == "0.0.0.0/0" {
                if all4 {
                    continue;
                }
                all4 = true;
            } else if source_ip == "::/0" {
                if all6 {
                    continue;
                }
                all6 = true;
            } else if ipv6 {
                if set6 {
                    continue;
                }
                set6 = true;
            } else {
                if set4 {
                    continue;
                }
                set4 = true;
            }

            let mut cmd = rules.chain_cmd();

            match rule.protocol {
                Protocol::All => {}
                Protocol::Icmp => {
                    let proto = if ipv6 { "ipv6-icmp" } else { "icmp" };
                    cmd.extend(["-p".to_string(), proto.to_string()]);
                }
                Protocol::Tcp | Protocol::Udp => {
                    cmd.extend(["-p".to_string(), rule.protocol.to_string()]);
                }
                Protocol::Multicast | Protocol::Broadcast => continue,
            }

            if source_ip != "0.0.0.0/0" && source_ip != "::/0" {
                let name = if ipv6 { &set_name6 } else { &set_name };
                cmd.extend([
                    "-m".to_string(),
                    "set".to_string(),
                    "--match-set".to_string(),
                    name.clone(),
                    "src".to_string(),
                ]);
            }

            cmd.extend(egress.clone());

            if matches!(rule.protocol, Protocol::Tcp | Protocol::Udp) {
                cmd.extend([
                    "-m".to_string(),
                    rule.protocol.to_string(),
                    "--dport".to_string(),
                    rule.port.replacen('-', ":", 1),
                    "-m".to_string(),
                    "conntrack".to_string(),
                    "--ctstate".to_string(),
                    "NEW".to_string(),
                ]);
            }

            let cmd = jump(comment(cmd, COMMENT_RULE), "ACCEPT");
            if ipv6 {
                rules.ingress6.push(cmd);
            } else {
                rules.ingress.push(cmd);
            }
        }
    }

    // Tail: invalid-state drop, then the catch-all drop.
    for family in [false, true] {
        let mut cmd = rules.chain_cmd();
        cmd.extend(egress.clone());
        cmd.extend([
            "-m".to_string(),
            "conntrack".to_string(),
            "--ctstate".to_string(),
            "INVALID".to_string(),
        ]);
        let cmd = jump(comment(cmd, COMMENT_RULE), "DROP");
        if family {
            rules.ingress6.push(cmd);
        } else {
            rules.ingress.push(cmd);
        }
    }

    for family in [false, true] {
        let mut cmd = rules.chain_cmd();
        cmd.extend(egress.clone());
        let cmd = jump(comment(cmd, COMMENT_RULE), "DROP");
        if family {
            rules.ingress6.push(cmd);
        } else {
            rules.ingress.push(cmd);
        }
    }

    // VPC destination maps: PREROUTING DNAT keyed by target family.
    if let Some(vpc) = params.vpc {
        for map in &vpc.maps {
            if map.kind != VpcMapKind::Destination {
                continue;
            }

            if map.target.contains(':') {
                if let Some(addr6) = params.addr6 {
                    let mut cmd = vec!["PREROUTING".to_string()];
                    cmd.extend([
                        "-s".to_string(),
                        format!("{}/128", addr6),
                        "-d".to_string(),
                        map.destination.clone(),
                    ]);
                    let mut cmd = comment(cmd, COMMENT_MAP);
                    cmd.extend([
                        "-j".to_string(),
                        "DNAT".to_string(),
                        "--to-destination".to_string(),
                        map.target.clone(),
                    ]);
                    rules.maps6.push(cmd);
                }
            } else if let Some(addr) = params.addr {
                let mut cmd = vec!["PREROUTING".to_string()];
                cmd.extend([
                    "-s".to_string(),
                    format!("{}/32", addr),
                    "-d".to_string(),
                    map.destination.clone(),
                ]);
                let mut cmd = comment(cmd, COMMENT_MAP);
                cmd.extend([
                    "-j".to_string(),
                    "DNAT".to_string(),
                    "--to-destination".to_string(),
                    map.target.clone(),
                ]);
                rules.maps.push(cmd);
            }
        }
    }

    Ok(rules)
}

impl Rules {
    /// Transient head-of-chain drop pair, installed while policy is
    /// being (re)built and removed as the last step of apply.
    pub(super) fn hold_command(&self) -> Result<Vec<String>> {
        let mut cmd = self.chain_cmd();
        cmd.extend(self.egress_match()?);
        Ok(jump(comment(cmd, COMMENT_HOLD), "DROP"))
    }
}
