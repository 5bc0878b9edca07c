use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use hna_net::ipset;

use crate::state::Snapshot;

/// Phases 2 and 4: materialize the address sets the filter rules
/// reference, and destroy orphans after the rules are applied.
pub struct IpsetPhase<'a> {
    stat: &'a Snapshot,
}

impl<'a> IpsetPhase<'a> {
    pub fn new(stat: &'a Snapshot) -> Self {
        Self { stat }
    }

    fn sets(&self) -> BTreeMap<String, BTreeSet<String>> {
        ipset::build_sets(
            self.stat.node_firewall(),
            self.stat.firewalls(),
            self.stat.instances(),
        )
    }

    pub fn deploy(&self) -> Result<()> {
        ipset::deploy(&self.sets())
    }

    pub fn clean(&self) -> Result<()> {
        let referenced: BTreeSet<String> = self.sets().into_keys().collect();
        ipset::clean(&referenced)
    }
}
