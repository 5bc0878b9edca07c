use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::plan::PlanAction;

/// Smallest allowed statement dwell time.
pub const THRESHOLD_MIN_SECS: i64 = 10;

/// Minimum interval between two emissions of any action on the same
/// (deployment, statement).
pub const ACTION_LIMIT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Instance,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Reserved,
    Deployed,
    Destroy,
}

/// Pending or executed action for one plan statement. Present iff the
/// statement currently evaluates nonempty (or was executed within the
/// action limit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentAction {
    pub statement: Uuid,
    pub since: DateTime<Utc>,
    #[serde(default)]
    pub executed: Option<DateTime<Utc>>,
    pub action: PlanAction,
}

/// A placed unit: the binding between a service unit and the instance
/// realizing it on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub service: Uuid,
    pub unit: Uuid,
    pub spec: Uuid,
    pub kind: DeploymentKind,
    pub state: DeploymentState,
    #[serde(default)]
    pub node: Option<Uuid>,
    #[serde(default)]
    pub instance: Option<Uuid>,
    #[serde(default)]
    pub public_ips: Vec<String>,
    #[serde(default)]
    pub public_ips6: Vec<String>,
    #[serde(default)]
    pub private_ips: Vec<String>,
    #[serde(default)]
    pub private_ips6: Vec<String>,
    #[serde(default)]
    pub oracle_private_ips: Vec<String>,
    #[serde(default)]
    pub oracle_public_ips: Vec<String>,
    #[serde(default)]
    pub actions: BTreeMap<Uuid, DeploymentAction>,
}

impl Deployment {
    /// Debounce one statement evaluation and return the action to emit
    /// now, if any.
    ///
    /// Stored action state is committed through the database as it
    /// changes so the machine survives process restarts. Any action is
    /// emitted at most once per action-limit window, and only after the
    /// evaluation has held for the statement's threshold.
    pub fn handle_statement(
        &mut self,
        db: &dyn Database,
        statement_id: Uuid,
        threshold_secs: i64,
        action: Option<PlanAction>,
        now: DateTime<Utc>,
    ) -> Result<Option<PlanAction>> {
        let threshold = Duration::seconds(threshold_secs.max(THRESHOLD_MIN_SECS));
        let limit = Duration::seconds(ACTION_LIMIT_SECS);

        let Some(action) = action else {
            if let Some(cur) = self.actions.get(&statement_id).cloned() {
                if let Some(executed) = cur.executed {
                    if now - executed < limit {
                        return Ok(None);
                    }
                }

                db.unset_deployment_action(self.id, statement_id)?;
                self.actions.remove(&statement_id);
            }

            return Ok(None);
        };

        match self.actions.get(&statement_id).cloned() {
            None => {
                let stored = DeploymentAction {
                    statement: statement_id,
                    since: now,
                    executed: None,
                    action,
                };
                db.set_deployment_action(self.id, &stored)?;
                self.actions.insert(statement_id, stored);

                Ok(None)
            }
            Some(cur) if cur.action != action => {
                if let Some(executed) = cur.executed {
                    if now - executed < limit {
                        return Ok(None);
                    }
                }

                let stored = DeploymentAction {
                    statement: statement_id,
                    since: now,
                    executed: None,
                    action,
                };
                db.set_deployment_action(self.id, &stored)?;
                self.actions.insert(statement_id, stored);

                Ok(None)
            }
            Some(cur) if now - cur.since >= threshold => {
                if let Some(executed) = cur.executed {
                    if now - executed < limit {
                        return Ok(None);
                    }
                }

                let mut stored = cur;
                stored.executed = Some(now);
                db.set_deployment_action(self.id, &stored)?;
                self.actions.insert(statement_id, stored);

                Ok(Some(action))
            }
            Some(_) => Ok(None),
        }
    }
}
