use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::InstanceState;

/// Lifecycle action a plan statement can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Start,
    Stop,
    Restart,
    Destroy,
}

impl PlanAction {
    /// The desired instance state realized by this action.
    pub fn instance_state(self) -> InstanceState {
        match self {
            Self::Start => InstanceState::Start,
            Self::Stop => InstanceState::Stop,
            Self::Restart => InstanceState::Restart,
            Self::Destroy => InstanceState::Destroy,
        }
    }
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Restart => write!(f, "restart"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// One declarative rule inside a plan: when `condition` holds over the
/// deployment's telemetry for at least `threshold_secs`, request
/// `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStatement {
    pub id: Uuid,
    pub condition: String,
    pub action: PlanAction,
    #[serde(default)]
    pub threshold_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub organization: Option<Uuid>,
    #[serde(default)]
    pub statements: Vec<PlanStatement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_to_instance_state() {
        assert_eq!(PlanAction::Start.instance_state(), InstanceState::Start);
        assert_eq!(PlanAction::Stop.instance_state(), InstanceState::Stop);
        assert_eq!(PlanAction::Restart.instance_state(), InstanceState::Restart);
        assert_eq!(PlanAction::Destroy.instance_state(), InstanceState::Destroy);
    }

    #[test]
    fn test_action_serde() {
        let action: PlanAction = serde_json::from_str("\"restart\"").unwrap();
        assert_eq!(action, PlanAction::Restart);
        assert_eq!(PlanAction::Stop.to_string(), "stop");
    }
}
