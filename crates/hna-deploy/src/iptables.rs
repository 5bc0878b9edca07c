use anyhow::Result;

use hna_net::iptables::{self, StateInput};

use crate::state::Snapshot;

/// Phase 3: build the full filter state for every (namespace,
/// interface) and reconcile the kernel against it.
pub struct IptablesPhase<'a> {
    stat: &'a Snapshot,
}

impl<'a> IptablesPhase<'a> {
    pub fn new(stat: &'a Snapshot) -> Self {
        Self { stat }
    }

    pub fn deploy(&self) -> Result<()> {
        let input = StateInput {
            node: self.stat.node(),
            vpcs: self.stat.vpcs(),
            instances: self.stat.instances(),
            node_firewall: self.stat.node_firewall(),
            firewalls: self.stat.firewalls(),
        };

        let state = iptables::load_state(&input)?;
        iptables::update_state(state)
    }
}
