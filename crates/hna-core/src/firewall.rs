use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    All,
    Icmp,
    Tcp,
    Udp,
    Multicast,
    Broadcast,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Icmp => write!(f, "icmp"),
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Multicast => write!(f, "multicast"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// One ingress allowance: protocol, optional port range, source CIDRs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub protocol: Protocol,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub source_ips: Vec<String>,
}

/// A named ingress policy matched to nodes and instances by network
/// role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Firewall {
    pub id: Uuid,
    pub name: String,
    pub organization: Option<Uuid>,
    #[serde(default)]
    pub network_roles: Vec<String>,
    #[serde(default)]
    pub ingress: Vec<FirewallRule>,
}

impl FirewallRule {
    /// Name of the kernel address set holding this rule's sources.
    /// Stable across restarts: derived from the rule content alone.
    pub fn set_name(&self, ipv6: bool) -> String {
        let mut sources = self.source_ips.clone();
        sources.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.protocol.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.port.as_bytes());
        for source in &sources {
            hasher.update(b"|");
            hasher.update(source.as_bytes());
        }
        let digest = hasher.finalize();

        let mut name = String::from("pr");
        for byte in &digest[..4] {
            name.push_str(&format!("{:02x}", byte));
        }
        name.push(if ipv6 { '6' } else { '4' });
        name
    }

    /// Members of the named set for one family: non-wildcard sources.
    pub fn set_members(&self, ipv6: bool) -> Vec<String> {
        self.source_ips
            .iter()
            .filter(|ip| *ip != "0.0.0.0/0" && *ip != "::/0")
            .filter(|ip| ip.contains(':') == ipv6)
            .cloned()
            .collect()
    }

    pub fn validate(&mut self) -> Option<ValidationError> {
        match self.protocol {
            Protocol::All | Protocol::Icmp => {
                self.port = String::new();
            }
            Protocol::Tcp | Protocol::Udp | Protocol::Multicast | Protocol::Broadcast => {
                let mut ports = self.port.splitn(2, '-');

                let low: u32 = match ports.next().unwrap_or("").parse() {
                    Ok(p) => p,
                    Err(_) => {
                        return Some(ValidationError::new(
                            "invalid_ingress_rule_port",
                            "Invalid ingress rule port",
                        ));
                    }
                };

                if !(1..=65535).contains(&low) {
                    return Some(ValidationError::new(
                        "invalid_ingress_rule_port",
                        "Invalid ingress rule port",
                    ));
                }

                let mut parsed = low.to_string();
                if let Some(high_str) = ports.next() {
                    let high: u32 = match high_str.parse() {
                        Ok(p) => p,
                        Err(_) => {
                            return Some(ValidationError::new(
                                "invalid_ingress_rule_port",
                                "Invalid ingress rule port",
                            ));
                        }
                    };

                    if high <= low || high > 65535 {
                        return Some(ValidationError::new(
                            "invalid_ingress_rule_port",
                            "Invalid ingress rule port",
                        ));
                    }

                    parsed = format!("{}-{}", low, high);
                }

                self.port = parsed;
            }
        }

        for source in self.source_ips.iter_mut() {
            if source.is_empty() {
                return Some(ValidationError::new(
                    "invalid_ingress_rule_source_ip",
                    "Empty ingress rule source IP",
                ));
            }

            let suffixed = if source.contains('/') {
                source.clone()
            } else if source.contains(':') {
                format!("{}/128", source)
            } else {
                format!("{}/32", source)
            };

            match canonical_cidr(&suffixed) {
                Some(cidr) => *source = cidr,
                None => {
                    return Some(ValidationError::new(
                        "invalid_ingress_rule_source_ip",
                        "Invalid ingress rule source IP",
                    ));
                }
            }
        }

        if self.protocol == Protocol::Multicast || self.protocol == Protocol::Broadcast {
            self.source_ips = vec![];
        }

        None
    }
}

impl Firewall {
    pub fn validate(&mut self) -> Option<ValidationError> {
        for rule in self.ingress.iter_mut() {
            if let Some(err) = rule.validate() {
                return Some(err);
            }
        }
        None
    }
}

/// Normalize a CIDR: mask the address down to its network and print
/// `network/len`. Returns None for malformed input.
pub fn canonical_cidr(value: &str) -> Option<String> {
    let (addr, len) = value.split_once('/')?;
    let len: u32 = len.parse().ok()?;

    if let Ok(v4) = addr.parse::<Ipv4Addr>() {
        if len > 32 {
            return None;
        }
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        let network = Ipv4Addr::from(u32::from(v4) & mask);
        return Some(format!("{}/{}", network, len));
    }

    if let Ok(v6) = addr.parse::<Ipv6Addr>() {
        if len > 128 {
            return None;
        }
        let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
        let network = Ipv6Addr::from(u128::from(v6) & mask);
        return Some(format!("{}/{}", network, len));
    }

    None
}

/// Merge several policies into one ordered ruleset: rules with the
/// same protocol and port union their sources. The output is a stable
/// function of the input set regardless of firewall ordering.
pub fn merge_ingress(firewalls: &[Firewall]) -> Vec<FirewallRule> {
    let mut merged: BTreeMap<(Protocol, String), Vec<String>> = BTreeMap::new();

    for firewall in firewalls {
        for rule in &firewall.ingress {
            let sources = merged
                .entry((rule.protocol, rule.port.clone()))
                .or_default();
            for source in &rule.source_ips {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }
    }

    merged
        .into_iter()
        .map(|((protocol, port), mut source_ips)| {
            source_ips.sort();
            FirewallRule {
                protocol,
                port,
                source_ips,
            }
        })
        .collect()
}
