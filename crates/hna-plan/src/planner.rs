use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use hna_core::db::Database;
use hna_core::deployment::{Deployment, DeploymentKind, DeploymentState};
use hna_core::errors::Error;
use hna_core::instance::Instance;
use hna_core::plan::PlanAction;
use hna_core::service::{Service, UnitKind};

use crate::eval::{build_eval_data, eval};

/// Evaluates every deployment's plan statements against telemetry and
/// issues debounced lifecycle actions by rewriting desired instance
/// state.
#[derive(Default)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Self
    }

    /// One planner tick: walk all deployments, evaluate, act. A
    /// failing deployment is logged and skipped so one bad record
    /// does not halt the pass.
    pub fn apply_plans(&self, db: &dyn Database, now: DateTime<Utc>) -> Result<()> {
        let deployments = db.all_deployments()?;
        let services = db.all_services()?;

        let services_map: HashMap<Uuid, Service> =
            services.into_iter().map(|s| (s.id, s)).collect();

        for deployment in deployments {
            match deployment.kind {
                DeploymentKind::Instance => {
                    let id = deployment.id;
                    if let Err(err) = self.check_instance(db, &services_map, deployment, now) {
                        error!(
                            deployment = %id,
                            error = %err,
                            "planner: Failed to check instance deployment",
                        );
                    }
                }
                DeploymentKind::Image => {}
            }
        }

        Ok(())
    }

    fn check_instance(
        &self,
        db: &dyn Database,
        services_map: &HashMap<Uuid, Service>,
        mut deployment: Deployment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if deployment.state == DeploymentState::Reserved {
            return Ok(());
        }

        let instance = match deployment.instance {
            Some(id) => match db.get_instance(id) {
                Ok(instance) => Some(instance),
                Err(err) if Error::is_not_found(&err) => None,
                Err(err) => return Err(err),
            },
            None => None,
        };

        let Some(mut instance) = instance else {
            info!(
                deployment = %deployment.id,
                service = %deployment.service,
                unit = %deployment.unit,
                "planner: Removing deployment for missing instance",
            );
            db.remove_deployment(deployment.id)?;
            return Ok(());
        };

        let Some(service) = services_map.get(&deployment.service) else {
            error!(
                deployment = %deployment.id,
                service = %deployment.service,
                unit = %deployment.unit,
                "planner: Failed to find service for deployment",
            );
            return Ok(());
        };

        let Some(unit) = service.unit(deployment.unit) else {
            error!(
                deployment = %deployment.id,
                service = %deployment.service,
                unit = %deployment.unit,
                "planner: Failed to find unit for deployment",
            );
            return Ok(());
        };

        let spec = db.get_spec(deployment.spec)?;

        if unit.kind != UnitKind::Instance {
            return Ok(());
        }
        let Some(spec_instance) = &spec.instance else {
            return Ok(());
        };

        let plan = match spec_instance.plan {
            Some(plan_id) => match db.get_plan(plan_id) {
                Ok(plan) => Some(plan),
                Err(err) if Error::is_not_found(&err) => None,
                Err(err) => return Err(err),
            },
            None => None,
        };

        let Some(plan) = plan else {
            info!(
                deployment = %deployment.id,
                service = %deployment.service,
                unit = %deployment.unit,
                "planner: Failed to find plan for deployment",
            );
            return Ok(());
        };

        let data = build_eval_data(service, unit, &instance, &deployment);

        let mut emitted: Option<PlanAction> = None;
        let mut matched_statement = None;
        for statement in &plan.statements {
            let action = if eval(&data, &statement.condition)? {
                Some(statement.action)
            } else {
                None
            };

            if let Some(action) = action {
                debug!(
                    deployment = %deployment.id,
                    statement = %statement.condition,
                    threshold = statement.threshold_secs,
                    action = %action,
                    "planner: Statement evaluated",
                );
            }

            let result = deployment.handle_statement(
                db,
                statement.id,
                statement.threshold_secs,
                action,
                now,
            )?;

            if result.is_some() {
                emitted = result;
                matched_statement = Some(statement);
                break;
            }
        }

        if let (Some(action), Some(statement)) = (emitted, matched_statement) {
            info!(
                deployment = %deployment.id,
                service = %deployment.service,
                unit = %deployment.unit,
                statement = %statement.condition,
                threshold = statement.threshold_secs,
                action = %action,
                "planner: Handling plan action",
            );

            self.set_instance_state(db, &deployment, &mut instance, action)?;
        }

        Ok(())
    }

    fn set_instance_state(
        &self,
        db: &dyn Database,
        deployment: &Deployment,
        instance: &mut Instance,
        action: PlanAction,
    ) -> Result<()> {
        instance.state = action.instance_state();

        if let Some(err_data) = instance.validate(db)? {
            error!(
                deployment = %deployment.id,
                instance = %instance.id,
                service = %deployment.service,
                unit = %deployment.unit,
                error_code = %err_data.error,
                error_message = %err_data.message,
                "planner: Validate instance failed",
            );
            return Ok(());
        }

        db.commit_instance_state(instance.id, instance.state)?;

        Ok(())
    }
}
