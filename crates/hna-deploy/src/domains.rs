use std::collections::BTreeSet;

use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use hna_core::db::Database;
use hna_core::domain::{filter_domain, DomainRecord, RecordKind};
use hna_core::time;

use crate::state::Snapshot;

/// Phase 8: emit the DNS records implied by deployed units and drop
/// the ones no longer backed by an address.
pub struct DomainsPhase<'a> {
    stat: &'a Snapshot,
}

type RecordKey = (Uuid, Uuid, String, RecordKind, String);

impl<'a> DomainsPhase<'a> {
    pub fn new(stat: &'a Snapshot) -> Self {
        Self { stat }
    }

    fn desired(&self) -> BTreeSet<RecordKey> {
        let mut desired = BTreeSet::new();

        for deployment in self.stat.instance_deployments() {
            let Some(unit) = self.stat.unit(deployment.unit) else {
                continue;
            };
            let Some(spec) = self.stat.spec(deployment.spec) else {
                continue;
            };
            let Some(spec_instance) = &spec.instance else {
                continue;
            };
            let Some(domain) = spec_instance.domain else {
                continue;
            };
            let Some(instance_id) = deployment.instance else {
                continue;
            };
            let Some(inst) = self.stat.instance(instance_id) else {
                continue;
            };

            let sub_domain = filter_domain(&unit.name);

            for addr in &inst.public_ips {
                desired.insert((
                    deployment.id,
                    domain,
                    sub_domain.clone(),
                    RecordKind::A,
                    addr.clone(),
                ));
            }
            for addr in &inst.public_ips6 {
                desired.insert((
                    deployment.id,
                    domain,
                    sub_domain.clone(),
                    RecordKind::Aaaa,
                    addr.clone(),
                ));
            }
        }

        desired
    }

    pub fn deploy(&self, db: &dyn Database) -> Result<()> {
        let desired = self.desired();

        let deployment_ids: Vec<Uuid> = self.stat.deployments().keys().copied().collect();
        let existing = db.deployment_records(&deployment_ids)?;

        let existing_keys: BTreeSet<RecordKey> = existing
            .iter()
            .filter_map(|record| {
                record.deployment.map(|deployment| {
                    (
                        deployment,
                        record.domain,
                        record.sub_domain.clone(),
                        record.kind,
                        record.value.clone(),
                    )
                })
            })
            .collect();

        for key in desired.difference(&existing_keys) {
            let (deployment, domain, sub_domain, kind, value) = key.clone();
            let mut record = DomainRecord {
                id: Uuid::new_v4(),
                domain,
                deployment: Some(deployment),
                timestamp: time::now(),
                sub_domain,
                kind,
                value,
            };

            if let Some(err_data) = record.validate()? {
                info!(
                    deployment = %deployment,
                    error_code = %err_data.error,
                    "domains: Skipping invalid record",
                );
                continue;
            }

            info!(
                deployment = %deployment,
                sub_domain = %record.sub_domain,
                kind = %record.kind,
                value = %record.value,
                "domains: Creating record",
            );
            db.insert_record(&record)?;
        }

        for record in &existing {
            let Some(deployment) = record.deployment else {
                continue;
            };
            let key = (
                deployment,
                record.domain,
                record.sub_domain.clone(),
                record.kind,
                record.value.clone(),
            );
            if desired.contains(&key) {
                continue;
            }

            info!(
                deployment = %deployment,
                sub_domain = %record.sub_domain,
                kind = %record.kind,
                value = %record.value,
                "domains: Removing record",
            );
            db.remove_record(record.id)?;
        }

        Ok(())
    }
}
