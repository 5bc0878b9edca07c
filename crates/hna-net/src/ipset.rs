use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use hna_core::firewall::FirewallRule;
use hna_core::instance::Instance;

use crate::exec::{exec, TABLE_LOCK};
use crate::iptables::SDC6_SET;

/// All managed set names carry this prefix; `clean` only ever
/// destroys sets under it.
pub const SET_PREFIX: &str = "pr";

fn family(name: &str) -> &'static str {
    if name == SDC6_SET || name.ends_with('6') {
        "inet6"
    } else {
        "inet"
    }
}

/// Collect every named set the given rulesets reference, with their
/// members, plus the v6 anti-spoof set holding all instance v6
/// addresses.
pub fn build_sets(
    node_firewall: Option<&[FirewallRule]>,
    firewalls: &BTreeMap<String, Vec<FirewallRule>>,
    instances: &[Instance],
) -> BTreeMap<String, BTreeSet<String>> {
    let mut sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    let mut add_rules = |rules: &[FirewallRule]| {
        for rule in rules {
            for ipv6 in [false, true] {
                let members = rule.set_members(ipv6);
                if members.is_empty() {
                    continue;
                }
                sets.entry(rule.set_name(ipv6))
                    .or_default()
                    .extend(members);
            }
        }
    };

    if let Some(rules) = node_firewall {
        add_rules(rules);
    }
    for rules in firewalls.values() {
        add_rules(rules);
    }

    let sdc6 = sets.entry(SDC6_SET.to_string()).or_default();
    for inst in instances {
        if !inst.is_active() {
            continue;
        }
        for addr in inst.private_ips6.iter().chain(inst.public_ips6.iter()) {
            sdc6.insert(format!("{}/128", addr));
        }
    }

    sets
}

/// Materialize the named sets: create missing sets, then replace each
/// set's membership atomically through a temporary set and a swap.
pub fn deploy(sets: &BTreeMap<String, BTreeSet<String>>) -> Result<()> {
    let _guard = TABLE_LOCK.lock();

    for (name, members) in sets {
        let fam = family(name);
        exec(
            &[],
            &[
                "ipset",
                "create",
                name.as_str(),
                "hash:net",
                "family",
                fam,
                "-exist",
            ],
        )?;

        let tmp = format!("{}-t", name);
        exec(
            &[],
            &[
                "ipset",
                "create",
                tmp.as_str(),
                "hash:net",
                "family",
                fam,
                "-exist",
            ],
        )?;
        exec(&[], &["ipset", "flush", tmp.as_str()])?;

        for member in members {
            exec(
                &[],
                &["ipset", "add", tmp.as_str(), member.as_str(), "-exist"],
            )?;
        }

        exec(&[], &["ipset", "swap", tmp.as_str(), name.as_str()])?;
        exec(&["does not exist"], &["ipset", "destroy", tmp.as_str()])?;
    }

    Ok(())
}

/// Destroy managed sets no longer referenced by any applied rule.
/// Runs after the filter state is applied so no rule still points at
/// a set being destroyed.
pub fn clean(referenced: &BTreeSet<String>) -> Result<()> {
    let _guard = TABLE_LOCK.lock();

    let output = exec(&[], &["ipset", "list", "-name"])?;

    for line in output.lines() {
        let name = line.trim();
        if name.is_empty() || !name.starts_with(SET_PREFIX) {
            continue;
        }
        if name.ends_with("-t") {
            // Leftover temporary from an interrupted deploy.
            exec(&["does not exist"], &["ipset", "destroy", name])?;
            continue;
        }
        if referenced.contains(name) {
            continue;
        }
        exec(
            &["does not exist", "match by that name"],
            &["ipset", "destroy", name],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock;
    use hna_core::firewall::Protocol;
    use hna_core::instance::InstanceState;
    use uuid::Uuid;

    fn rule(sources: &[&str]) -> FirewallRule {
        FirewallRule {
            protocol: Protocol::Tcp,
            port: "22".to_string(),
            source_ips: sources.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn instance(v6: &[&str]) -> Instance {
        Instance {
            id: Uuid::new_v4(),
            name: "web-0".to_string(),
            organization: None,
            zone: None,
            vpc: None,
            subnet: None,
            node: Uuid::new_v4(),
            shape: None,
            state: InstanceState::Start,
            delete_protection: false,
            network_roles: vec![],
            skip_source_dest_check: false,
            private_ips: vec![],
            private_ips6: v6.iter().map(|s| s.to_string()).collect(),
            public_ips: vec![],
            public_ips6: vec![],
            oracle_private_ips: vec![],
            oracle_public_ips: vec![],
            processors: 1,
            memory: 512,
        }
    }

    #[test]
    fn test_build_sets() {
        let node_fw = vec![rule(&["10.0.0.0/8", "fd00::/8", "0.0.0.0/0"])];
        let mut firewalls = BTreeMap::new();
        firewalls.insert("n3f7b2c1a".to_string(), vec![rule(&["192.168.0.0/16"])]);
        let instances = vec![instance(&["fd00::4"])];

        let sets = build_sets(Some(&node_fw), &firewalls, &instances);

        let name4 = node_fw[0].set_name(false);
        assert_eq!(
            sets.get(&name4).unwrap(),
            &BTreeSet::from(["10.0.0.0/8".to_string()])
        );

        let name6 = node_fw[0].set_name(true);
        assert_eq!(
            sets.get(&name6).unwrap(),
            &BTreeSet::from(["fd00::/8".to_string()])
        );

        assert_eq!(
            sets.get(SDC6_SET).unwrap(),
            &BTreeSet::from(["fd00::4/128".to_string()])
        );
    }

    #[test]
    fn test_build_sets_skips_inactive_instances() {
        let firewalls = BTreeMap::new();
        let mut inst = instance(&["fd00::4"]);
        inst.state = InstanceState::Stop;

        let sets = build_sets(None, &firewalls, &[inst]);
        assert!(sets.get(SDC6_SET).unwrap().is_empty());
    }

    #[test]
    fn test_deploy_uses_temp_and_swap() {
        let (_guard, log) = mock::record();

        let mut sets = BTreeMap::new();
        sets.insert(
            "pr0a1b2c3d4".to_string(),
            BTreeSet::from(["10.0.0.0/8".to_string()]),
        );
        deploy(&sets).unwrap();

        let log = log.lock().unwrap();
        let texts: Vec<String> = log.iter().map(|argv| argv.join(" ")).collect();
        assert!(texts[0].contains("create pr0a1b2c3d4 hash:net family inet -exist"));
        assert!(texts[1].contains("create pr0a1b2c3d4-t"));
        assert!(texts.iter().any(|t| t.contains("add pr0a1b2c3d4-t 10.0.0.0/8")));
        assert!(texts.iter().any(|t| t.contains("swap pr0a1b2c3d4-t pr0a1b2c3d4")));
        assert!(texts.last().unwrap().contains("destroy pr0a1b2c3d4-t"));
    }

    #[test]
    fn test_deploy_v6_family() {
        let (_guard, log) = mock::record();

        let mut sets = BTreeMap::new();
        sets.insert(SDC6_SET.to_string(), BTreeSet::new());
        deploy(&sets).unwrap();

        let log = log.lock().unwrap();
        assert!(log[0].join(" ").contains("family inet6"));
    }

    #[test]
    fn test_clean_destroys_only_unreferenced_managed_sets() {
        let log: mock::CommandLog = Default::default();
        let log_ref = log.clone();
        let _guard = mock::install(move |argv| {
            log_ref.lock().unwrap().push(argv.to_vec());
            if argv[1] == "list" {
                mock::MockResponse::ok("pr0a1b2c3d4\npr9f8e7d6c4\npr6_sdc\nkube-proxy\n")
            } else {
                mock::MockResponse::empty()
            }
        });

        let referenced = BTreeSet::from(["pr0a1b2c3d4".to_string(), SDC6_SET.to_string()]);
        clean(&referenced).unwrap();

        let log = log.lock().unwrap();
        let destroys: Vec<String> = log
            .iter()
            .filter(|argv| argv[1] == "destroy")
            .map(|argv| argv[2].clone())
            .collect();
        assert_eq!(destroys, vec!["pr9f8e7d6c4"]);
    }
}
