use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use uuid::Uuid;

use crate::deployment::{Deployment, DeploymentAction};
use crate::disk::Disk;
use crate::domain::DomainRecord;
use crate::errors::Error;
use crate::firewall::Firewall;
use crate::image::Image;
use crate::instance::{Instance, InstanceState};
use crate::node::{Block, Node};
use crate::plan::Plan;
use crate::pool::{Pool, Scheduler, Shape};
use crate::service::{Certificate, Service, Spec};
use crate::storage::Storage;
use crate::vpc::{Vpc, VpcIp};
use crate::zone::Zone;

/// The document-store boundary. The driver is an external
/// integration; the reconciliation core reads and writes through this
/// trait only.
///
/// Deletes are idempotent: removing an absent document is not an
/// error. Reads of a single document return `Error::NotFound` when
/// missing.
pub trait Database: Send + Sync {
    fn get_node(&self, id: Uuid) -> Result<Node>;
    fn get_zone(&self, id: Uuid) -> Result<Zone>;
    fn zones_in_datacenter(&self, datacenter: Uuid) -> Result<Vec<Zone>>;
    /// All nodes participating in overlay networking.
    fn net_nodes(&self) -> Result<Vec<Node>>;
    fn get_block(&self, id: Uuid) -> Result<Block>;
    fn pools_in_zone(&self, zone: Uuid) -> Result<Vec<Pool>>;
    fn node_disks(&self, node: Uuid) -> Result<Vec<Disk>>;
    fn instance_disks(&self, instance: Uuid) -> Result<Vec<Disk>>;
    fn get_instance(&self, id: Uuid) -> Result<Instance>;
    fn node_instances(&self, node: Uuid) -> Result<Vec<Instance>>;
    fn firewalls_for_roles(&self, roles: &[String]) -> Result<Vec<Firewall>>;
    fn shapes_for_roles(&self, roles: &[String]) -> Result<Vec<Shape>>;
    fn vpcs_in_datacenter(&self, datacenter: Uuid) -> Result<Vec<Vpc>>;
    fn vpc_ips(&self, vpc: Uuid) -> Result<Vec<VpcIp>>;
    fn node_deployments(&self, node: Uuid) -> Result<Vec<Deployment>>;
    fn all_deployments(&self) -> Result<Vec<Deployment>>;
    fn all_services(&self) -> Result<Vec<Service>>;
    fn services_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Service>>;
    fn certificates_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Certificate>>;
    fn schedulers(&self) -> Result<Vec<Scheduler>>;
    fn get_spec(&self, id: Uuid) -> Result<Spec>;
    fn get_plan(&self, id: Uuid) -> Result<Plan>;
    fn storages(&self) -> Result<Vec<Storage>>;
    fn image_keys(&self, storage: Uuid) -> Result<Vec<String>>;
    fn deployment_records(&self, deployments: &[Uuid]) -> Result<Vec<DomainRecord>>;

    fn commit_instance_state(&self, id: Uuid, state: InstanceState) -> Result<()>;
    fn remove_instance(&self, id: Uuid) -> Result<()>;
    fn commit_disk(&self, disk: &Disk) -> Result<()>;
    fn remove_disk(&self, id: Uuid) -> Result<()>;
    fn remove_deployment(&self, id: Uuid) -> Result<()>;
    fn set_deployment_action(&self, deployment: Uuid, action: &DeploymentAction) -> Result<()>;
    fn unset_deployment_action(&self, deployment: Uuid, statement: Uuid) -> Result<()>;
    /// Commit only the collected address lists of a deployment.
    fn commit_deployment_addresses(&self, deployment: &Deployment) -> Result<()>;
    fn upsert_image(&self, image: &Image) -> Result<()>;
    fn remove_image_keys(&self, storage: Uuid, keys: &[String]) -> Result<()>;
    fn insert_record(&self, record: &DomainRecord) -> Result<()>;
    fn remove_record(&self, id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<Uuid, Node>,
    zones: HashMap<Uuid, Zone>,
    blocks: HashMap<Uuid, Block>,
    pools: HashMap<Uuid, Pool>,
    disks: HashMap<Uuid, Disk>,
    instances: HashMap<Uuid, Instance>,
    firewalls: HashMap<Uuid, Firewall>,
    shapes: HashMap<Uuid, Shape>,
    vpcs: HashMap<Uuid, Vpc>,
    vpc_ips: Vec<VpcIp>,
    deployments: HashMap<Uuid, Deployment>,
    services: HashMap<Uuid, Service>,
    certificates: HashMap<Uuid, Certificate>,
    schedulers: HashMap<Uuid, Scheduler>,
    specs: HashMap<Uuid, Spec>,
    plans: HashMap<Uuid, Plan>,
    storages: HashMap<Uuid, Storage>,
    images: HashMap<Uuid, Image>,
    records: HashMap<Uuid, DomainRecord>,
}

/// In-process document store used by tests and standalone runs.
#[derive(Default)]
pub struct MemoryDb {
    inner: RwLock<Inner>,
}

fn roles_intersect(a: &[String], b: &[String]) -> bool {
    a.iter().any(|role| b.contains(role))
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert_node(&self, node: Node) {
        self.write().nodes.insert(node.id, node);
    }

    pub fn insert_zone(&self, zone: Zone) {
        self.write().zones.insert(zone.id, zone);
    }

    pub fn insert_block(&self, block: Block) {
        self.write().blocks.insert(block.id, block);
    }

    pub fn insert_pool(&self, pool: Pool) {
        self.write().pools.insert(pool.id, pool);
    }

    pub fn insert_disk(&self, disk: Disk) {
        self.write().disks.insert(disk.id, disk);
    }

    pub fn insert_instance(&self, instance: Instance) {
        self.write().instances.insert(instance.id, instance);
    }

    pub fn insert_firewall(&self, firewall: Firewall) {
        self.write().firewalls.insert(firewall.id, firewall);
    }

    pub fn insert_shape(&self, shape: Shape) {
        self.write().shapes.insert(shape.id, shape);
    }

    pub fn insert_vpc(&self, vpc: Vpc) {
        self.write().vpcs.insert(vpc.id, vpc);
    }

    pub fn insert_vpc_ip(&self, ip: VpcIp) {
        self.write().vpc_ips.push(ip);
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        self.write().deployments.insert(deployment.id, deployment);
    }

    pub fn insert_service(&self, service: Service) {
        self.write().services.insert(service.id, service);
    }

    pub fn insert_certificate(&self, certificate: Certificate) {
        self.write().certificates.insert(certificate.id, certificate);
    }

    pub fn insert_scheduler(&self, scheduler: Scheduler) {
        self.write().schedulers.insert(scheduler.id, scheduler);
    }

    pub fn insert_spec(&self, spec: Spec) {
        self.write().specs.insert(spec.id, spec);
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.write().plans.insert(plan.id, plan);
    }

    pub fn insert_storage(&self, storage: Storage) {
        self.write().storages.insert(storage.id, storage);
    }

    pub fn insert_image(&self, image: Image) {
        self.write().images.insert(image.id, image);
    }

    pub fn insert_record(&self, record: DomainRecord) {
        self.write().records.insert(record.id, record);
    }

    /// All catalog entries for a store, for inspection in tests.
    pub fn storage_images(&self, storage: Uuid) -> Vec<Image> {
        let mut images: Vec<Image> = self
            .read()
            .images
            .values()
            .filter(|img| img.storage == storage)
            .cloned()
            .collect();
        images.sort_by(|a, b| a.key.cmp(&b.key));
        images
    }

    /// All stored records, for inspection in tests.
    pub fn records(&self) -> Vec<DomainRecord> {
        let mut records: Vec<DomainRecord> = self.read().records.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

impl Database for MemoryDb {
    fn get_node(&self, id: Uuid) -> Result<Node> {
        self.read()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {}", id)).into())
    }

    fn get_zone(&self, id: Uuid) -> Result<Zone> {
        self.read()
            .zones
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("zone {}", id)).into())
    }

    fn zones_in_datacenter(&self, datacenter: Uuid) -> Result<Vec<Zone>> {
        let mut zones: Vec<Zone> = self
            .read()
            .zones
            .values()
            .filter(|z| z.datacenter == datacenter)
            .cloned()
            .collect();
        zones.sort_by_key(|z| z.id);
        Ok(zones)
    }

    fn net_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self.read().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    fn get_block(&self, id: Uuid) -> Result<Block> {
        self.read()
            .blocks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("block {}", id)).into())
    }

    fn pools_in_zone(&self, zone: Uuid) -> Result<Vec<Pool>> {
        let mut pools: Vec<Pool> = self
            .read()
            .pools
            .values()
            .filter(|p| p.zone == zone)
            .cloned()
            .collect();
        pools.sort_by_key(|p| p.id);
        Ok(pools)
    }

    fn node_disks(&self, node: Uuid) -> Result<Vec<Disk>> {
        let mut disks: Vec<Disk> = self
            .read()
            .disks
            .values()
            .filter(|d| d.node == node)
            .cloned()
            .collect();
        disks.sort_by_key(|d| d.id);
        Ok(disks)
    }

    fn instance_disks(&self, instance: Uuid) -> Result<Vec<Disk>> {
        let mut disks: Vec<Disk> = self
            .read()
            .disks
            .values()
            .filter(|d| d.instance == Some(instance))
            .cloned()
            .collect();
        disks.sort_by_key(|d| d.id);
        Ok(disks)
    }

    fn get_instance(&self, id: Uuid) -> Result<Instance> {
        self.read()
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("instance {}", id)).into())
    }

    fn node_instances(&self, node: Uuid) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .read()
            .instances
            .values()
            .filter(|i| i.node == node)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.id);
        Ok(instances)
    }

    fn firewalls_for_roles(&self, roles: &[String]) -> Result<Vec<Firewall>> {
        let mut firewalls: Vec<Firewall> = self
            .read()
            .firewalls
            .values()
            .filter(|f| roles_intersect(&f.network_roles, roles))
            .cloned()
            .collect();
        firewalls.sort_by_key(|f| f.id);
        Ok(firewalls)
    }

    fn shapes_for_roles(&self, roles: &[String]) -> Result<Vec<Shape>> {
        let mut shapes: Vec<Shape> = self
            .read()
            .shapes
            .values()
            .filter(|s| roles_intersect(&s.roles, roles))
            .cloned()
            .collect();
        shapes.sort_by_key(|s| s.id);
        Ok(shapes)
    }

    fn vpcs_in_datacenter(&self, datacenter: Uuid) -> Result<Vec<Vpc>> {
        let mut vpcs: Vec<Vpc> = self
            .read()
            .vpcs
            .values()
            .filter(|v| v.datacenter == datacenter)
            .cloned()
            .collect();
        vpcs.sort_by_key(|v| v.id);
        Ok(vpcs)
    }

    fn vpc_ips(&self, vpc: Uuid) -> Result<Vec<VpcIp>> {
        let mut ips: Vec<VpcIp> = self
            .read()
            .vpc_ips
            .iter()
            .filter(|ip| ip.vpc == vpc)
            .cloned()
            .collect();
        ips.sort_by_key(|ip| ip.ip);
        Ok(ips)
    }

    fn node_deployments(&self, node: Uuid) -> Result<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> = self
            .read()
            .deployments
            .values()
            .filter(|d| d.node == Some(node))
            .cloned()
            .collect();
        deployments.sort_by_key(|d| d.id);
        Ok(deployments)
    }

    fn all_deployments(&self) -> Result<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> =
            self.read().deployments.values().cloned().collect();
        deployments.sort_by_key(|d| d.id);
        Ok(deployments)
    }

    fn all_services(&self) -> Result<Vec<Service>> {
        let mut services: Vec<Service> = self.read().services.values().cloned().collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    fn services_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Service>> {
        let inner = self.read();
        let mut services: Vec<Service> = ids
            .iter()
            .filter_map(|id| inner.services.get(id).cloned())
            .collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    fn certificates_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Certificate>> {
        let inner = self.read();
        let mut certs: Vec<Certificate> = ids
            .iter()
            .filter_map(|id| inner.certificates.get(id).cloned())
            .collect();
        certs.sort_by_key(|c| c.id);
        Ok(certs)
    }

    fn schedulers(&self) -> Result<Vec<Scheduler>> {
        let mut schedulers: Vec<Scheduler> = self.read().schedulers.values().cloned().collect();
        schedulers.sort_by_key(|s| s.id);
        Ok(schedulers)
    }

    fn get_spec(&self, id: Uuid) -> Result<Spec> {
        self.read()
            .specs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("spec {}", id)).into())
    }

    fn get_plan(&self, id: Uuid) -> Result<Plan> {
        self.read()
            .plans
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("plan {}", id)).into())
    }

    fn storages(&self) -> Result<Vec<Storage>> {
        let mut storages: Vec<Storage> = self.read().storages.values().cloned().collect();
        storages.sort_by_key(|s| s.id);
        Ok(storages)
    }

    fn image_keys(&self, storage: Uuid) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .read()
            .images
            .values()
            .filter(|img| img.storage == storage)
            .map(|img| img.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn deployment_records(&self, deployments: &[Uuid]) -> Result<Vec<DomainRecord>> {
        let mut records: Vec<DomainRecord> = self
            .read()
            .records
            .values()
            .filter(|r| r.deployment.map(|d| deployments.contains(&d)).unwrap_or(false))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    fn commit_instance_state(&self, id: Uuid, state: InstanceState) -> Result<()> {
        let mut inner = self.write();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or_else(|| anyhow::Error::from(Error::NotFound(format!("instance {}", id))))?;
        instance.state = state;
        Ok(())
    }

    fn remove_instance(&self, id: Uuid) -> Result<()> {
        self.write().instances.remove(&id);
        Ok(())
    }

    fn commit_disk(&self, disk: &Disk) -> Result<()> {
        let mut inner = self.write();
        if !inner.disks.contains_key(&disk.id) {
            return Err(Error::NotFound(format!("disk {}", disk.id)).into());
        }
        inner.disks.insert(disk.id, disk.clone());
        Ok(())
    }

    fn remove_disk(&self, id: Uuid) -> Result<()> {
        self.write().disks.remove(&id);
        Ok(())
    }

    fn remove_deployment(&self, id: Uuid) -> Result<()> {
        self.write().deployments.remove(&id);
        Ok(())
    }

    fn set_deployment_action(&self, deployment: Uuid, action: &DeploymentAction) -> Result<()> {
        let mut inner = self.write();
        let deply = inner.deployments.get_mut(&deployment).ok_or_else(|| {
            anyhow::Error::from(Error::NotFound(format!("deployment {}", deployment)))
        })?;
        deply.actions.insert(action.statement, action.clone());
        Ok(())
    }

    fn unset_deployment_action(&self, deployment: Uuid, statement: Uuid) -> Result<()> {
        let mut inner = self.write();
        if let Some(deply) = inner.deployments.get_mut(&deployment) {
            deply.actions.remove(&statement);
        }
        Ok(())
    }

    fn commit_deployment_addresses(&self, deployment: &Deployment) -> Result<()> {
        let mut inner = self.write();
        let deply = inner.deployments.get_mut(&deployment.id).ok_or_else(|| {
            anyhow::Error::from(Error::NotFound(format!("deployment {}", deployment.id)))
        })?;
        deply.public_ips = deployment.public_ips.clone();
        deply.public_ips6 = deployment.public_ips6.clone();
        deply.private_ips = deployment.private_ips.clone();
        deply.private_ips6 = deployment.private_ips6.clone();
        deply.oracle_private_ips = deployment.oracle_private_ips.clone();
        deply.oracle_public_ips = deployment.oracle_public_ips.clone();
        Ok(())
    }

    fn upsert_image(&self, image: &Image) -> Result<()> {
        let mut inner = self.write();
        let existing = inner
            .images
            .values()
            .find(|img| img.storage == image.storage && img.key == image.key)
            .map(|img| img.id);

        match existing {
            Some(id) => {
                let stored = inner.images.get_mut(&id).unwrap();
                stored.etag = image.etag.clone();
                stored.signed = image.signed;
                stored.firmware = image.firmware;
                stored.last_modified = image.last_modified;
                stored.storage_class = image.storage_class;
            }
            None => {
                inner.images.insert(image.id, image.clone());
            }
        }
        Ok(())
    }

    fn remove_image_keys(&self, storage: Uuid, keys: &[String]) -> Result<()> {
        let mut inner = self.write();
        inner
            .images
            .retain(|_, img| img.storage != storage || !keys.contains(&img.key));
        Ok(())
    }

    fn insert_record(&self, record: &DomainRecord) -> Result<()> {
        self.write().records.insert(record.id, record.clone());
        Ok(())
    }

    fn remove_record(&self, id: Uuid) -> Result<()> {
        self.write().records.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceState;

    fn node() -> Node {
        Node {
            id: Uuid::new_v4(),
            name: "hv1".to_string(),
            zone: None,
            hypervisor: true,
            firewall: true,
            network_roles: vec!["web".to_string()],
            network_mode: Default::default(),
            network_mode6: Default::default(),
            pools: vec![],
            host_block: None,
            external_iface: "eth0".to_string(),
            external_iface_bridge: false,
            system_iface_mtu: None,
            space_iface_mtu: None,
        }
    }

    #[test]
    fn test_not_found_on_missing_document() {
        let db = MemoryDb::new();
        let err = db.get_node(Uuid::new_v4()).unwrap_err();
        assert!(Error::is_not_found(&err));
    }

    #[test]
    fn test_idempotent_delete() {
        let db = MemoryDb::new();
        assert!(db.remove_disk(Uuid::new_v4()).is_ok());
        assert!(db.remove_deployment(Uuid::new_v4()).is_ok());
        assert!(db.remove_record(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_role_filters() {
        let db = MemoryDb::new();
        db.insert_firewall(Firewall {
            id: Uuid::new_v4(),
            name: "web".to_string(),
            organization: None,
            network_roles: vec!["web".to_string()],
            ingress: vec![],
        });
        db.insert_firewall(Firewall {
            id: Uuid::new_v4(),
            name: "db".to_string(),
            organization: None,
            network_roles: vec!["db".to_string()],
            ingress: vec![],
        });

        let matched = db.firewalls_for_roles(&["web".to_string()]).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "web");
    }

    #[test]
    fn test_commit_instance_state() {
        let db = MemoryDb::new();
        let nde = node();
        let inst = Instance {
            id: Uuid::new_v4(),
            name: "web-0".to_string(),
            organization: None,
            zone: None,
            vpc: None,
            subnet: None,
            node: nde.id,
            shape: None,
            state: InstanceState::Start,
            delete_protection: false,
            network_roles: vec![],
            skip_source_dest_check: false,
            private_ips: vec![],
            private_ips6: vec![],
            public_ips: vec![],
            public_ips6: vec![],
            oracle_private_ips: vec![],
            oracle_public_ips: vec![],
            processors: 1,
            memory: 512,
        };
        let id = inst.id;
        db.insert_instance(inst);

        db.commit_instance_state(id, InstanceState::Stop).unwrap();
        assert_eq!(db.get_instance(id).unwrap().state, InstanceState::Stop);
    }

    #[test]
    fn test_upsert_image_updates_by_key() {
        use crate::image::Firmware;
        use chrono::Utc;

        let db = MemoryDb::new();
        let storage = Uuid::new_v4();
        let image = Image {
            id: Uuid::new_v4(),
            name: "linux".to_string(),
            organization: None,
            storage,
            key: "linux.qcow2".to_string(),
            signed: false,
            firmware: Firmware::Unknown,
            etag: "aaa".to_string(),
            last_modified: Utc::now(),
            storage_class: Default::default(),
        };
        db.upsert_image(&image).unwrap();

        let mut updated = image.clone();
        updated.id = Uuid::new_v4();
        updated.etag = "bbb".to_string();
        updated.signed = true;
        db.upsert_image(&updated).unwrap();

        let images = db.storage_images(storage);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, image.id);
        assert_eq!(images[0].etag, "bbb");
        assert!(images[0].signed);
    }
}
