use anyhow::Result;

use hna_core::instance::Instance;
use hna_core::node::Node;
use hna_net::exec::exec;
use hna_net::iproute;
use hna_net::naming;

use crate::state::Snapshot;

/// In-namespace bridge the guest tap and uplinks attach to.
pub fn bridge_name(instance: uuid::Uuid) -> String {
    format!("b{}", &instance.simple().to_string()[..8])
}

/// Phase 1: namespaces, in-namespace bridges, and external uplinks.
/// Any error here aborts the tick; the remaining phases assume the
/// plumbing exists.
pub struct NetworkPhase<'a> {
    stat: &'a Snapshot,
}

impl<'a> NetworkPhase<'a> {
    pub fn new(stat: &'a Snapshot) -> Self {
        Self { stat }
    }

    pub fn deploy(&self) -> Result<()> {
        for inst in self.stat.instances() {
            if !inst.is_active() {
                continue;
            }
            self.deploy_instance(inst)?;
        }

        Ok(())
    }

    fn deploy_instance(&self, inst: &Instance) -> Result<()> {
        let node = self.stat.node();
        let namespace = naming::namespace(inst.id);

        let namespace_existed = self.stat.has_namespace(&namespace);
        if !namespace_existed {
            exec(
                &["File exists"],
                &["ip", "netns", "add", namespace.as_str()],
            )?;
        }

        // Interfaces already inside the namespace are invisible in the
        // snapshot's host view; list them only for a pre-existing
        // namespace.
        let space_ifaces: Vec<String> = if namespace_existed {
            iproute::iface_get_all(Some(namespace.as_str()))?
                .into_iter()
                .map(|iface| iface.name)
                .collect()
        } else {
            vec![]
        };

        let bridge = bridge_name(inst.id);
        if !space_ifaces.contains(&bridge) {
            exec(
                &["File exists"],
                &[
                    "ip",
                    "netns",
                    "exec",
                    namespace.as_str(),
                    "ip",
                    "link",
                    "add",
                    bridge.as_str(),
                    "type",
                    "bridge",
                ],
            )?;
            exec(
                &[],
                &[
                    "ip",
                    "netns",
                    "exec",
                    namespace.as_str(),
                    "ip",
                    "link",
                    "set",
                    "dev",
                    bridge.as_str(),
                    "up",
                ],
            )?;
        }

        self.external(inst, node, &namespace, &space_ifaces)?;

        Ok(())
    }

    /// External uplink: veth pair into a bridged physical interface,
    /// or a macvlan directly on a flat one.
    fn external(
        &self,
        inst: &Instance,
        node: &Node,
        namespace: &str,
        space_ifaces: &[String],
    ) -> Result<()> {
        let routed = node.network_mode.routed() || node.network_mode6.routed();
        if !routed {
            return Ok(());
        }

        let system_iface = naming::iface_external_system(inst.id);
        let space_iface = naming::iface_external_space(inst.id);
        let mac = naming::mac_addr(inst.id, 0);

        let already_placed = space_ifaces.contains(&space_iface);

        if node.external_iface_bridge {
            if !self.stat.has_interface(&system_iface) && !already_placed {
                exec(
                    &["File exists"],
                    &[
                        "ip",
                        "link",
                        "add",
                        system_iface.as_str(),
                        "type",
                        "veth",
                        "peer",
                        "name",
                        space_iface.as_str(),
                        "addr",
                        mac.as_str(),
                    ],
                )?;
            }

            if let Some(mtu) = node.system_iface_mtu {
                let mtu = mtu.to_string();
                exec(
                    &[],
                    &[
                        "ip",
                        "link",
                        "set",
                        "dev",
                        system_iface.as_str(),
                        "mtu",
                        mtu.as_str(),
                    ],
                )?;
            }
        } else if !self.stat.has_interface(&space_iface) && !already_placed {
            exec(
                &["File exists"],
                &[
                    "ip",
                    "link",
                    "add",
                    space_iface.as_str(),
                    "addr",
                    mac.as_str(),
                    "link",
                    node.external_iface.as_str(),
                    "type",
                    "macvlan",
                    "mode",
                    "bridge",
                ],
            )?;
        }

        if let Some(mtu) = node.space_iface_mtu {
            if !already_placed {
                let mtu = mtu.to_string();
                exec(
                    &[],
                    &[
                        "ip",
                        "link",
                        "set",
                        "dev",
                        space_iface.as_str(),
                        "mtu",
                        mtu.as_str(),
                    ],
                )?;
            }
        }

        if node.external_iface_bridge {
            exec(
                &[],
                &["ip", "link", "set", "dev", system_iface.as_str(), "up"],
            )?;
        }

        // Router advertisements on the physical uplink; managed
        // address generation unless SLAAC assigns it.
        if node.network_mode6.routed() {
            let accept_ra = format!("net.ipv6.conf.{}.accept_ra=2", node.external_iface);
            exec(&[], &["sysctl", "-w", accept_ra.as_str()])?;

            if !node.network_mode6.slaac() {
                let addr_gen =
                    format!("net.ipv6.conf.{}.addr_gen_mode=1", node.external_iface);
                exec(&[], &["sysctl", "-w", addr_gen.as_str()])?;
            }
        }

        if node.external_iface_bridge {
            exec(
                &[],
                &[
                    "ip",
                    "link",
                    "set",
                    system_iface.as_str(),
                    "master",
                    node.external_iface.as_str(),
                ],
            )?;
        }

        if !already_placed {
            exec(
                &["File exists"],
                &[
                    "ip",
                    "link",
                    "set",
                    "dev",
                    space_iface.as_str(),
                    "netns",
                    namespace,
                ],
            )?;
        }

        exec(
            &[],
            &[
                "ip",
                "netns",
                "exec",
                namespace,
                "ip",
                "link",
                "set",
                "dev",
                space_iface.as_str(),
                "up",
            ],
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Snapshot;
    use crate::virt::StubVirtProvider;
    use hna_core::db::MemoryDb;
    use hna_net::exec::mock;

    fn load_snapshot(db: &MemoryDb, node_id: uuid::Uuid, namespaces: String) -> Snapshot {
        let _guard = mock::install(move |argv| {
            let text = argv.join(" ");
            if text.contains("netns list") {
                mock::MockResponse::ok(&namespaces)
            } else {
                mock::MockResponse::ok("[]")
            }
        });
        let run_dir = tempfile::tempdir().unwrap();
        let provider = StubVirtProvider::new();
        Snapshot::load(db, node_id, &provider, run_dir.path()).unwrap()
    }

    #[test]
    fn test_first_run_creates_plumbing() {
        let db = MemoryDb::new();
        let node = crate::state::tests::seed_node(&db);
        let inst = crate::state::tests::seed_instance(&db, &node);
        let stat = load_snapshot(&db, node.id, String::new());

        let (_guard, log) = mock::record();
        NetworkPhase::new(&stat).deploy().unwrap();

        let texts: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv.join(" "))
            .collect();

        let namespace = naming::namespace(inst.id);
        assert!(texts[0].contains(&format!("ip netns add {}", namespace)));
        assert!(texts.iter().any(|t| t.contains("type bridge")));
        // Flat uplink: macvlan on the physical interface.
        assert!(texts
            .iter()
            .any(|t| t.contains("type macvlan mode bridge") && t.contains("link eth0")));
        assert!(texts
            .iter()
            .any(|t| t.contains(&format!("netns {}", namespace))));
        // RA sysctls on the physical uplink.
        assert!(texts
            .iter()
            .any(|t| t.contains("net.ipv6.conf.eth0.accept_ra=2")));
        assert!(texts
            .iter()
            .any(|t| t.contains("net.ipv6.conf.eth0.addr_gen_mode=1")));
    }

    #[test]
    fn test_bridged_uplink_uses_veth() {
        let db = MemoryDb::new();
        let mut node = crate::state::tests::seed_node(&db);
        node.external_iface_bridge = true;
        node.system_iface_mtu = Some(9000);
        db.insert_node(node.clone());
        let inst = crate::state::tests::seed_instance(&db, &node);
        let stat = load_snapshot(&db, node.id, String::new());

        let (_guard, log) = mock::record();
        NetworkPhase::new(&stat).deploy().unwrap();

        let texts: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|argv| argv.join(" "))
            .collect();

        let system_iface = naming::iface_external_system(inst.id);
        assert!(texts
            .iter()
            .any(|t| t.contains("type veth peer name") && t.contains(&system_iface)));
        assert!(texts
            .iter()
            .any(|t| t.contains(&format!("set dev {} mtu 9000", system_iface))));
        assert!(texts
            .iter()
            .any(|t| t.contains(&format!("set {} master eth0", system_iface))));
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let db = MemoryDb::new();
        let node = crate::state::tests::seed_node(&db);
        let inst = crate::state::tests::seed_instance(&db, &node);

        // Kernel already holds everything from the prior tick.
        let namespace = naming::namespace(inst.id);
        let bridge = bridge_name(inst.id);
        let space_iface = naming::iface_external_space(inst.id);

        let guard = {
            let namespace = namespace.clone();
            let bridge = bridge.clone();
            let space_iface = space_iface.clone();
            mock::install(move |argv| {
                let text = argv.join(" ");
                if text.contains("netns list") {
                    mock::MockResponse::ok(&namespace)
                } else if text.contains("--json") {
                    mock::MockResponse::ok(&format!(
                        r#"[{{"ifname":"{}","operstate":"UP"}},{{"ifname":"{}","operstate":"UP"}}]"#,
                        bridge, space_iface,
                    ))
                } else {
                    mock::MockResponse::empty()
                }
            })
        };
        let run_dir = tempfile::tempdir().unwrap();
        let provider = StubVirtProvider::new();
        let stat = Snapshot::load(&db, node.id, &provider, run_dir.path()).unwrap();
        drop(guard);

        let log: mock::CommandLog = Default::default();
        let log_ref = log.clone();
        let bridge_clone = bridge.clone();
        let space_clone = space_iface.clone();
        let _guard = mock::install(move |argv| {
            let text = argv.join(" ");
            log_ref.lock().unwrap().push(argv.to_vec());
            if text.contains("--json") {
                mock::MockResponse::ok(&format!(
                    r#"[{{"ifname":"{}","operstate":"UP"}},{{"ifname":"{}","operstate":"UP"}}]"#,
                    bridge_clone, space_clone,
                ))
            } else {
                mock::MockResponse::empty()
            }
        });

        NetworkPhase::new(&stat).deploy().unwrap();

        // No creation or move commands on the second pass.
        for argv in log.lock().unwrap().iter() {
            let text = argv.join(" ");
            assert!(!text.contains(" add "), "unexpected mutation: {}", text);
            assert!(
                !text.contains(&format!("netns {}", namespace)),
                "unexpected move: {}",
                text,
            );
        }
    }

    #[test]
    fn test_disabled_modes_skip_uplink() {
        use hna_core::node::NetworkMode;

        let db = MemoryDb::new();
        let mut node = crate::state::tests::seed_node(&db);
        node.network_mode = NetworkMode::Disabled;
        node.network_mode6 = NetworkMode::Disabled;
        db.insert_node(node.clone());
        crate::state::tests::seed_instance(&db, &node);
        let stat = load_snapshot(&db, node.id, String::new());

        let (_guard, log) = mock::record();
        NetworkPhase::new(&stat).deploy().unwrap();

        for argv in log.lock().unwrap().iter() {
            let text = argv.join(" ");
            assert!(!text.contains("macvlan"));
            assert!(!text.contains("veth"));
            assert!(!text.contains("sysctl"));
        }
    }
}
