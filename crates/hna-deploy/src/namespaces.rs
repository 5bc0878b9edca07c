use std::path::Path;

use anyhow::Result;
use tracing::debug;

use hna_core::db::Database;
use hna_core::instance::VirtState;
use hna_net::exec::exec;
use hna_net::iproute;
use hna_net::naming;
use hna_net::qga;

use crate::network::bridge_name;
use crate::state::Snapshot;

/// Phase 7: per-instance guest-network configuration inside each
/// namespace: neighbor entries for VPC peers, and collection of
/// guest-reported addresses into the owning deployment.
pub struct NamespacesPhase<'a> {
    stat: &'a Snapshot,
    run_dir: &'a Path,
}

impl<'a> NamespacesPhase<'a> {
    pub fn new(stat: &'a Snapshot, run_dir: &'a Path) -> Self {
        Self { stat, run_dir }
    }

    pub fn deploy(&self, db: &dyn Database) -> Result<()> {
        for inst in self.stat.instances() {
            if !inst.is_active() {
                continue;
            }

            let namespace = naming::namespace(inst.id);
            if !self.stat.has_namespace(&namespace) {
                continue;
            }

            self.sync_neighbors(inst.id, &namespace)?;
        }

        self.collect_guest_addresses(db)?;

        Ok(())
    }

    fn sync_neighbors(&self, instance: uuid::Uuid, namespace: &str) -> Result<()> {
        let Some(desired) = self.stat.arp_records(namespace) else {
            return Ok(());
        };

        let bridge = bridge_name(instance);

        for record in desired {
            exec(
                &[],
                &[
                    "ip",
                    "netns",
                    "exec",
                    namespace,
                    "ip",
                    "neigh",
                    "replace",
                    record.address.as_str(),
                    "lladdr",
                    record.mac.as_str(),
                    "dev",
                    bridge.as_str(),
                ],
            )?;
        }

        // Prune managed entries no longer desired. Only our
        // deterministic locally-administered MACs are touched.
        let current = iproute::neighbor_get_all(namespace)?;
        for neighbor in current {
            if neighbor.dev != bridge || !neighbor.mac.starts_with("02:") {
                continue;
            }
            let still_desired = desired
                .iter()
                .any(|r| r.address == neighbor.address && r.mac == neighbor.mac);
            if still_desired {
                continue;
            }
            exec(
                &["No such file"],
                &[
                    "ip",
                    "netns",
                    "exec",
                    namespace,
                    "ip",
                    "neigh",
                    "del",
                    neighbor.address.as_str(),
                    "dev",
                    bridge.as_str(),
                ],
            )?;
        }

        Ok(())
    }

    /// Query each running guest's agent for its interface addresses
    /// and record them on the owning deployment.
    fn collect_guest_addresses(&self, db: &dyn Database) -> Result<()> {
        for deployment in self.stat.instance_deployments() {
            let Some(instance_id) = deployment.instance else {
                continue;
            };
            let Some(virt) = self.stat.virt(instance_id) else {
                continue;
            };
            if virt.state != VirtState::Running {
                continue;
            }
            let Some(inst) = self.stat.instance(instance_id) else {
                continue;
            };

            let sock_path = self
                .run_dir
                .join(format!("qga-{}.sock", instance_id.simple()));
            if !sock_path.exists() {
                continue;
            }

            let ifaces = match qga::get_interfaces(&sock_path) {
                Ok(ifaces) => ifaces,
                Err(err) => {
                    // The agent may not be up yet.
                    debug!(
                        instance = %instance_id,
                        error = %err,
                        "namespaces: Guest agent query failed",
                    );
                    continue;
                }
            };

            let (guest_addr, guest_addr6) = ifaces.get_addr(&naming::mac_addr(inst.id, 0));

            let mut updated = deployment.clone();
            updated.private_ips = guest_addr.into_iter().collect();
            updated.private_ips6 = guest_addr6.into_iter().collect();
            updated.public_ips = inst.public_ips.clone();
            updated.public_ips6 = inst.public_ips6.clone();
            updated.oracle_private_ips = inst.oracle_private_ips.clone();
            updated.oracle_public_ips = inst.oracle_public_ips.clone();

            if updated.private_ips != deployment.private_ips
                || updated.private_ips6 != deployment.private_ips6
                || updated.public_ips != deployment.public_ips
                || updated.public_ips6 != deployment.public_ips6
                || updated.oracle_private_ips != deployment.oracle_private_ips
                || updated.oracle_public_ips != deployment.oracle_public_ips
            {
                db.commit_deployment_addresses(&updated)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Snapshot;
    use crate::virt::StubVirtProvider;
    use hna_core::db::MemoryDb;
    use hna_core::vpc::{Vpc, VpcIp};
    use hna_net::exec::mock;
    use uuid::Uuid;

    #[test]
    fn test_neighbors_replaced_and_pruned() {
        let db = MemoryDb::new();
        let node = crate::state::tests::seed_node(&db);

        // Two instances sharing a VPC resolve each other.
        let vpc_id = Uuid::new_v4();
        let mut a = crate::state::tests::seed_instance(&db, &node);
        a.vpc = Some(vpc_id);
        db.insert_instance(a.clone());
        let mut b = crate::state::tests::seed_instance(&db, &node);
        b.vpc = Some(vpc_id);
        db.insert_instance(b.clone());

        db.insert_vpc(Vpc {
            id: vpc_id,
            name: "main".to_string(),
            organization: None,
            datacenter: db.get_zone(node.zone.unwrap()).unwrap().datacenter,
            subnets: vec![],
            maps: vec![],
        });
        db.insert_vpc_ip(VpcIp {
            id: Uuid::new_v4(),
            vpc: vpc_id,
            subnet: Uuid::new_v4(),
            ip: 0x0500_0001,
            instance: Some(a.id),
        });
        db.insert_vpc_ip(VpcIp {
            id: Uuid::new_v4(),
            vpc: vpc_id,
            subnet: Uuid::new_v4(),
            ip: 0x0500_0002,
            instance: Some(b.id),
        });

        let namespace_a = naming::namespace(a.id);
        let namespace_b = naming::namespace(b.id);
        let namespaces = format!("{}\n{}", namespace_a, namespace_b);

        // Namespace A holds one stale managed neighbor to prune.
        let stale = format!(
            r#"[{{"dst":"10.0.0.99","lladdr":"02:de:ad:be:ef:00","dev":"{}"}}]"#,
            bridge_name(a.id),
        );

        let log: mock::CommandLog = Default::default();
        let log_ref = log.clone();
        let namespaces_clone = namespaces.clone();
        let namespace_a_clone = namespace_a.clone();
        let _guard = mock::install(move |argv| {
            let text = argv.join(" ");
            log_ref.lock().unwrap().push(argv.to_vec());
            if text.contains("netns list") {
                mock::MockResponse::ok(&namespaces_clone)
            } else if text.contains("neigh show") {
                if text.contains(&namespace_a_clone) {
                    mock::MockResponse::ok(&stale)
                } else {
                    mock::MockResponse::ok("[]")
                }
            } else {
                mock::MockResponse::ok("[]")
            }
        });

        let run_dir = tempfile::tempdir().unwrap();
        let provider = StubVirtProvider::new();
        let stat = Snapshot::load(&db, node.id, &provider, run_dir.path()).unwrap();

        NamespacesPhase::new(&stat, run_dir.path())
            .deploy(&db)
            .unwrap();

        let texts: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv.join(" "))
            .collect();

        // A resolves B through B's deterministic MAC.
        let mac_b = naming::mac_addr(b.id, 0);
        assert!(texts.iter().any(|t| {
            t.contains(&format!("netns exec {} ip neigh replace", namespace_a))
                && t.contains(&mac_b)
        }));
        // And vice versa.
        let mac_a = naming::mac_addr(a.id, 0);
        assert!(texts.iter().any(|t| {
            t.contains(&format!("netns exec {} ip neigh replace", namespace_b))
                && t.contains(&mac_a)
        }));
        // The stale managed entry is deleted.
        assert!(texts
            .iter()
            .any(|t| t.contains("ip neigh del 10.0.0.99")));
    }

    #[test]
    fn test_no_namespace_no_commands() {
        let db = MemoryDb::new();
        let node = crate::state::tests::seed_node(&db);
        crate::state::tests::seed_instance(&db, &node);

        let log: mock::CommandLog = Default::default();
        let log_ref = log.clone();
        let _guard = mock::install(move |argv| {
            log_ref.lock().unwrap().push(argv.to_vec());
            if argv.join(" ").contains("netns list") {
                mock::MockResponse::ok("")
            } else {
                mock::MockResponse::ok("[]")
            }
        });

        let run_dir = tempfile::tempdir().unwrap();
        let provider = StubVirtProvider::new();
        let stat = Snapshot::load(&db, node.id, &provider, run_dir.path()).unwrap();
        log.lock().unwrap().clear();

        NamespacesPhase::new(&stat, run_dir.path())
            .deploy(&db)
            .unwrap();

        assert!(log.lock().unwrap().is_empty());
    }
}
