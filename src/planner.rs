use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ApiToken;

const VALIDATE_TOKEN_PATH: &str = "/auth/api/validate-api-token";

/// Optimization input sent to the planning service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanRequest {
    /// Expected power per planning interval in kW
    pub power_kw: Vec<f64>,
    /// Current state of charge (0-100)
    pub battery_current_soc: f64,
    pub allow_export: bool,
}

/// Optimized plan as returned by the service. Costs the service leaves out (or
/// sends in an unusable form) are absent rather than failing the whole plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanResponse {
    #[serde(default, deserialize_with = "coerce_f64")]
    pub baseline_cost: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub optimized_cost: Option<f64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub schedule: Vec<ScheduleEntry>,
}

impl PlanResponse {
    /// Savings over the baseline, only known when both costs are
    pub fn cost_delta(&self) -> Option<f64> {
        Some(self.baseline_cost? - self.optimized_cost?)
    }

    /// The entry describing what the battery should do now
    pub fn first_entry(&self) -> Option<&ScheduleEntry> {
        self.schedule.first()
    }
}

/// One planning interval. The service owns the shape, so the entry is kept as raw
/// JSON and only the fields we surface are looked up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ScheduleEntry(Value);

impl ScheduleEntry {
    pub fn new(raw: Value) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    pub fn time(&self) -> Option<&Value> {
        self.0.get("time")
    }

    pub fn action_name(&self) -> Option<&str> {
        self.0.get("action")?.get("name")?.as_str()
    }

    pub fn action_power(&self) -> Option<&Value> {
        self.0.get("action")?.get("power")
    }

    pub fn cost(&self) -> Option<&Value> {
        self.0.get("cost")
    }

    pub fn price(&self) -> Option<&Value> {
        self.0.get("price")
    }

    pub fn soc(&self) -> Option<&Value> {
        self.0.get("soc")
    }
}

/// Costs may arrive as JSON numbers or as numeric strings; anything else is absent
fn coerce_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let cost = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Null => None,
        other => {
            debug!("Ignoring non-numeric cost {}", other);
            None
        }
    };
    Ok(cost.filter(|c| c.is_finite()))
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ScheduleEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ScheduleEntry>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("Invalid authentication for Battery Planner: HTTP {status}")]
    Auth { status: u16 },

    #[error("Failed to connect to Battery Planner: {0}")]
    Connection(#[source] reqwest::Error),

    #[error("Failed to create battery plan: HTTP {status}")]
    Http { status: u16, body: String },

    #[error("Error creating battery plan: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Unexpected battery plan response: {0}")]
    MalformedResponse(String),
}

/// Where the coordinator gets fresh plans from
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn request_plan(&self, request: &PlanRequest) -> Result<PlanResponse, PlannerError>;
}

/// Client for the Battery Planner REST API. One instance (and its connection pool)
/// serves a configured system from setup until teardown.
pub struct PlannerClient {
    base_url: String,
    system_id: String,
    api_token: ApiToken,
    http_client: reqwest::Client,
}

impl PlannerClient {
    pub fn new(base_url: &str, system_id: &str, api_token: ApiToken) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            system_id: system_id.to_string(),
            api_token,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.api_token.expose())
    }

    fn plan_url(&self) -> String {
        format!("{}/api/battery_planner/{}/plan", self.base_url, self.system_id)
    }

    /// Check the token against the service. Only used while setting up.
    pub async fn validate_token(&self) -> Result<(), PlannerError> {
        debug!("Validating API token {} against {}", self.api_token, self.base_url);

        let response = self
            .http_client
            .get(format!("{}{}", self.base_url, VALIDATE_TOKEN_PATH))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(PlannerError::Connection)?;

        if response.status() != StatusCode::OK {
            return Err(PlannerError::Auth {
                status: response.status().as_u16(),
            });
        }

        info!("API token accepted by Battery Planner");
        Ok(())
    }

    pub async fn request_plan(&self, request: &PlanRequest) -> Result<PlanResponse, PlannerError> {
        debug!("Requesting battery plan with payload: {:?}", request);

        let response = self
            .http_client
            .post(self.plan_url())
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(PlannerError::Transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(PlannerError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(PlannerError::Transport)?;
        let plan: PlanResponse = serde_json::from_str(&body)
            .map_err(|e| PlannerError::MalformedResponse(e.to_string()))?;

        debug!(
            "Received battery plan: baseline {:?}, optimized {:?}, {} entries",
            plan.baseline_cost,
            plan.optimized_cost,
            plan.schedule.len()
        );
        Ok(plan)
    }
}

#[async_trait]
impl PlanSource for PlannerClient {
    async fn request_plan(&self, request: &PlanRequest) -> Result<PlanResponse, PlannerError> {
        PlannerClient::request_plan(self, request).await
    }
}
