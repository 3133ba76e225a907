use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::{validate_soc, PowerProfileInput};
use crate::planner::{PlanRequest, PlanResponse, ScheduleEntry};
use crate::setup::SystemContext;

pub const SERVICE_CREATE_PLAN: &str = "create_plan";

/// Arguments of the create_plan action
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePlanCall {
    pub power_kw: PowerProfileInput,
    pub battery_current_soc: f64,
    pub allow_export: bool,
    /// Push the new plan into the sensors as well
    #[serde(default = "default_update_sensors")]
    pub update_sensors: bool,
}

fn default_update_sensors() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreatePlanResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Vec<ScheduleEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CreatePlanResult {
    fn from_plan(plan: &PlanResponse) -> Self {
        Self {
            success: true,
            baseline_cost: plan.baseline_cost,
            optimized_cost: plan.optimized_cost,
            schedule: Some(plan.schedule.clone()),
            error: None,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            baseline_cost: None,
            optimized_cost: None,
            schedule: None,
            error: Some(message.into()),
        }
    }
}

/// Request a plan on demand. Never fails: problems are reported in the result.
pub async fn create_plan(ctx: &SystemContext, call: CreatePlanCall) -> CreatePlanResult {
    let power_kw = match call.power_kw.parse() {
        Ok(values) => values,
        Err(e) => return CreatePlanResult::failure(e.to_string()),
    };
    let battery_current_soc = match validate_soc(call.battery_current_soc) {
        Ok(soc) => soc,
        Err(e) => return CreatePlanResult::failure(e.to_string()),
    };

    let request = PlanRequest {
        power_kw,
        battery_current_soc,
        allow_export: call.allow_export,
    };

    match ctx.client.request_plan(&request).await {
        Ok(plan) => {
            let result = CreatePlanResult::from_plan(&plan);
            if call.update_sensors {
                if ctx.coordinator.apply_external(plan).await.is_some() {
                    debug!("Sensors updated with new plan data");
                }
            }
            info!(
                "Created battery plan for {}: {} entries",
                ctx.entry.system_id,
                result.schedule.as_ref().map_or(0, Vec::len)
            );
            result
        }
        Err(e) => {
            error!("Error creating battery plan: {}", e);
            CreatePlanResult::failure(e.to_string())
        }
    }
}

/// Entry point for a raw command payload as received from the host
pub async fn handle_command(ctx: &SystemContext, payload: &[u8]) -> CreatePlanResult {
    match serde_json::from_slice::<CreatePlanCall>(payload) {
        Ok(call) => create_plan(ctx, call).await,
        Err(e) => {
            error!("Invalid {} call: {}", SERVICE_CREATE_PLAN, e);
            CreatePlanResult::failure(format!("Invalid {SERVICE_CREATE_PLAN} call: {e}"))
        }
    }
}
