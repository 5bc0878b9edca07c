//! Translation of ingress policy into ordered, idempotent
//! filter-table and NAT-table command sets, and the per-node table
//! state that applies them.

mod apply;
mod rules;
mod state;

pub use rules::{
    generate, NatTarget, Role, RuleParams, Rules, COMMENT_HOLD, COMMENT_MAP, COMMENT_NAT,
    COMMENT_ORACLE_NAT, COMMENT_RULE, COMMENT_SDC, HOST_NAMESPACE, SDC6_SET,
};
pub use state::{apply_diff, load_state, reset_state, update_state, StateInput, TableState};
