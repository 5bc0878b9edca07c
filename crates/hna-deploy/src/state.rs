use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use hna_core::db::Database;
use hna_core::deployment::{Deployment, DeploymentKind};
use hna_core::disk::Disk;
use hna_core::errors::Error;
use hna_core::firewall::{merge_ingress, FirewallRule};
use hna_core::instance::{Instance, Virt, VirtState};
use hna_core::node::{Block, Node};
use hna_core::pool::{Pool, Scheduler, Shape};
use hna_core::service::{Certificate, Service, Spec, Unit, UnitKind};
use hna_core::vpc::{Vpc, VpcIp};
use hna_core::zone::{Zone, ZoneNetworkMode};
use hna_net::arp::{self, ArpRecord};
use hna_net::iproute;

use crate::virt::VirtProvider;

/// Immutable per-tick view of the node: the declared state from the
/// document store joined with the observed kernel and hypervisor
/// state. Built once at tick start, discarded at tick end. No
/// component re-queries the database mid-tick.
#[derive(Debug)]
pub struct Snapshot {
    node: Node,
    nodes: Vec<Node>,
    zone: Option<Zone>,
    datacenter: Option<Uuid>,
    vxlan: bool,
    zones: BTreeMap<Uuid, Zone>,
    host_block: Option<Block>,
    namespaces: BTreeSet<String>,
    interfaces: BTreeSet<String>,
    node_firewall: Option<Vec<FirewallRule>>,
    firewalls: BTreeMap<String, Vec<FirewallRule>>,
    pools: Vec<Pool>,
    disks: Vec<Disk>,
    instance_disks: BTreeMap<Uuid, Vec<Disk>>,
    instances: Vec<Instance>,
    instances_map: BTreeMap<Uuid, Instance>,
    virts: BTreeMap<Uuid, Virt>,
    shapes: Vec<Shape>,
    vpcs: Vec<Vpc>,
    vpc_ips: BTreeMap<Uuid, Vec<VpcIp>>,
    arp_records: BTreeMap<String, BTreeSet<ArpRecord>>,
    deployments: BTreeMap<Uuid, Deployment>,
    services: BTreeMap<Uuid, Service>,
    units: BTreeMap<Uuid, Unit>,
    specs: BTreeMap<Uuid, Spec>,
    certificates: BTreeMap<Uuid, Certificate>,
    schedulers: Vec<Scheduler>,
    running: Vec<String>,
}

impl Snapshot {
    /// Build the snapshot. Each step aborts the tick on failure.
    pub fn load(
        db: &dyn Database,
        node_id: Uuid,
        provider: &dyn VirtProvider,
        run_dir: &Path,
    ) -> Result<Self> {
        // Node, zone, datacenter; overlay peers when the zone
        // stretches VPC networks.
        let node = db.get_node(node_id)?;

        let mut zone = None;
        let mut datacenter = None;
        if let Some(zone_id) = node.zone {
            let zne = db.get_zone(zone_id)?;
            datacenter = Some(zne.datacenter);
            zone = Some(zne);
        }

        let mut vxlan = false;
        let mut zones = BTreeMap::new();
        let mut nodes = Vec::new();
        if let Some(zne) = &zone {
            if zne.network_mode == ZoneNetworkMode::VxlanVlan {
                vxlan = true;
                for peer_zone in db.zones_in_datacenter(zne.datacenter)? {
                    zones.insert(peer_zone.id, peer_zone);
                }
                nodes = db.net_nodes()?;
            }
        }

        // Host block; a dangling reference is tolerated.
        let mut host_block = None;
        if let Some(block_id) = node.host_block {
            match db.get_block(block_id) {
                Ok(block) => host_block = Some(block),
                Err(err) if Error::is_not_found(&err) => {}
                Err(err) => return Err(err),
            }
        }

        // Kernel view.
        let namespaces: BTreeSet<String> =
            iproute::namespace_get_all()?.into_iter().collect();
        let interfaces: BTreeSet<String> = iproute::iface_get_all(None)?
            .into_iter()
            .map(|iface| iface.name)
            .collect();

        // Pools and disks.
        let pools = match node.zone {
            Some(zone_id) => db.pools_in_zone(zone_id)?,
            None => vec![],
        };
        let disks = db.node_disks(node.id)?;

        let mut instance_disks: BTreeMap<Uuid, Vec<Disk>> = BTreeMap::new();
        for disk in &disks {
            if let Some(instance) = disk.instance {
                instance_disks.entry(instance).or_default().push(disk.clone());
            }
        }

        // Instances.
        let instances = db.node_instances(node.id)?;
        let instances_map: BTreeMap<Uuid, Instance> =
            instances.iter().map(|i| (i.id, i.clone())).collect();

        // Observed guests.
        let mut virts = BTreeMap::new();
        for virt in provider.running_virts()? {
            if !instances_map.contains_key(&virt.id) {
                info!(id = %virt.id, "state: Unknown instance");
            }
            virts.insert(virt.id, virt);
        }

        // Ingress policy: host ruleset from node roles, per-namespace
        // rulesets from instance roles.
        let node_firewall = if node.firewall {
            Some(merge_ingress(&db.firewalls_for_roles(&node.network_roles)?))
        } else {
            None
        };

        let mut firewalls = BTreeMap::new();
        for inst in &instances {
            if !inst.is_active() {
                continue;
            }
            let matched = db.firewalls_for_roles(&inst.network_roles)?;
            if matched.is_empty() {
                continue;
            }
            firewalls.insert(hna_net::naming::namespace(inst.id), merge_ingress(&matched));
        }

        let shapes = db.shapes_for_roles(&node.network_roles)?;

        // VPCs and address maps.
        let mut vpcs = Vec::new();
        let mut vpc_ips = BTreeMap::new();
        if let Some(dc) = datacenter {
            vpcs = db.vpcs_in_datacenter(dc)?;
            for vpc in &vpcs {
                vpc_ips.insert(vpc.id, db.vpc_ips(vpc.id)?);
            }
        }

        let arp_records = arp::build_state(&instances, &vpc_ips);

        // Deployments with their services, units, specs, and certs.
        let mut deployments = BTreeMap::new();
        let mut service_ids = BTreeSet::new();
        let mut unit_ids = BTreeSet::new();
        for deployment in db.node_deployments(node.id)? {
            service_ids.insert(deployment.service);
            unit_ids.insert(deployment.unit);
            deployments.insert(deployment.id, deployment);
        }

        let service_ids: Vec<Uuid> = service_ids.into_iter().collect();
        let mut services = BTreeMap::new();
        let mut units = BTreeMap::new();
        let mut cert_ids = BTreeSet::new();
        for service in db.services_by_ids(&service_ids)? {
            for unit in &service.units {
                if !unit_ids.contains(&unit.id) || unit.kind != UnitKind::Instance {
                    continue;
                }
                units.insert(unit.id, unit.clone());
                cert_ids.extend(unit.certificates.iter().copied());
            }
            services.insert(service.id, service);
        }

        let mut specs = BTreeMap::new();
        for deployment in deployments.values() {
            match db.get_spec(deployment.spec) {
                Ok(spec) => {
                    specs.insert(spec.id, spec);
                }
                Err(err) if Error::is_not_found(&err) => {}
                Err(err) => return Err(err),
            }
        }

        let cert_ids: Vec<Uuid> = cert_ids.into_iter().collect();
        let certificates: BTreeMap<Uuid, Certificate> = db
            .certificates_by_ids(&cert_ids)?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        let schedulers = db.schedulers()?;

        // Running-instance markers.
        let entries = std::fs::read_dir(run_dir)
            .map_err(|e| Error::Read(format!("state: Failed to read run directory: {}", e)))
            .context("Failed to list running entries")?;
        let mut running = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Read(format!("state: Failed to read entry: {}", e)))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            running.push(entry.file_name().to_string_lossy().to_string());
        }
        running.sort();

        Ok(Self {
            node,
            nodes,
            zone,
            datacenter,
            vxlan,
            zones,
            host_block,
            namespaces,
            interfaces,
            node_firewall,
            firewalls,
            pools,
            disks,
            instance_disks,
            instances,
            instances_map,
            virts,
            shapes,
            vpcs,
            vpc_ips,
            arp_records,
            deployments,
            services,
            units,
            specs,
            certificates,
            schedulers,
            running,
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn zone(&self) -> Option<&Zone> {
        self.zone.as_ref()
    }

    pub fn datacenter(&self) -> Option<Uuid> {
        self.datacenter
    }

    pub fn vxlan(&self) -> bool {
        self.vxlan
    }

    pub fn get_zone(&self, id: Uuid) -> Option<&Zone> {
        self.zones.get(&id)
    }

    pub fn host_block(&self) -> Option<&Block> {
        self.host_block.as_ref()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains(name)
    }

    pub fn has_interface(&self, name: &str) -> bool {
        self.interfaces.contains(name)
    }

    pub fn node_firewall(&self) -> Option<&[FirewallRule]> {
        self.node_firewall.as_deref()
    }

    pub fn firewalls(&self) -> &BTreeMap<String, Vec<FirewallRule>> {
        &self.firewalls
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn disks(&self) -> &[Disk] {
        &self.disks
    }

    pub fn instance_disks(&self, instance: Uuid) -> &[Disk] {
        self.instance_disks
            .get(&instance)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance(&self, id: Uuid) -> Option<&Instance> {
        self.instances_map.get(&id)
    }

    pub fn virt(&self, instance: Uuid) -> Option<&Virt> {
        self.virts.get(&instance)
    }

    /// Whether a disk is attached to a live guest.
    pub fn disk_in_use(&self, instance: Uuid, disk: Uuid) -> bool {
        match self.virts.get(&instance) {
            Some(virt)
                if virt.state != VirtState::Stopped && virt.state != VirtState::Failed =>
            {
                virt.disks.iter().any(|d| d.id == disk)
            }
            _ => false,
        }
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn vpcs(&self) -> &[Vpc] {
        &self.vpcs
    }

    pub fn vpc(&self, id: Uuid) -> Option<&Vpc> {
        self.vpcs.iter().find(|v| v.id == id)
    }

    pub fn vpc_ips(&self) -> &BTreeMap<Uuid, Vec<VpcIp>> {
        &self.vpc_ips
    }

    pub fn arp_records(&self, namespace: &str) -> Option<&BTreeSet<ArpRecord>> {
        self.arp_records.get(namespace)
    }

    pub fn deployments(&self) -> &BTreeMap<Uuid, Deployment> {
        &self.deployments
    }

    pub fn instance_deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments
            .values()
            .filter(|d| d.kind == DeploymentKind::Instance)
    }

    pub fn service(&self, id: Uuid) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn unit(&self, id: Uuid) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn spec(&self, id: Uuid) -> Option<&Spec> {
        self.specs.get(&id)
    }

    pub fn certificate(&self, id: Uuid) -> Option<&Certificate> {
        self.certificates.get(&id)
    }

    pub fn schedulers(&self) -> &[Scheduler] {
        &self.schedulers
    }

    pub fn running(&self) -> &[String] {
        &self.running
    }
}
