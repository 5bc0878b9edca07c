use std::collections::{BTreeMap, BTreeSet};

use hna_core::instance::Instance;
use hna_core::vpc::VpcIp;
use uuid::Uuid;

use crate::naming;

/// One desired neighbor entry inside an instance namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArpRecord {
    pub address: String,
    pub mac: String,
}

/// Desired neighbor entries per namespace: every peer allocation in
/// the instance's VPC resolves to the peer's deterministic MAC, so
/// guests reach VPC peers without waiting on discovery across the
/// overlay.
pub fn build_state(
    instances: &[Instance],
    vpc_ips: &BTreeMap<Uuid, Vec<VpcIp>>,
) -> BTreeMap<String, BTreeSet<ArpRecord>> {
    let mut state = BTreeMap::new();

    for inst in instances {
        if !inst.is_active() {
            continue;
        }
        let Some(vpc) = inst.vpc else {
            continue;
        };

        let mut records = BTreeSet::new();
        if let Some(allocations) = vpc_ips.get(&vpc) {
            for allocation in allocations {
                let Some(peer) = allocation.instance else {
                    continue;
                };
                if peer == inst.id {
                    continue;
                }
                records.insert(ArpRecord {
                    address: allocation.address().to_string(),
                    mac: naming::mac_addr(peer, 0),
                });
            }
        }

        state.insert(naming::namespace(inst.id), records);
    }

    state
}
