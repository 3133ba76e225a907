use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{validate_soc, ApiToken, ConfigError, PlannerConfig};
use crate::coordinator::PlanCoordinator;
use crate::planner::{PlanRequest, PlannerClient, PlannerError};
use crate::sensors::DeviceInfo;

/// Why the entered configuration was refused. `key` is the stable identifier shown
/// to the user, `field` the option it belongs to.
#[derive(Debug, Error)]
pub enum ConfigFlowError {
    #[error("Cannot connect to Battery Planner: {0}")]
    CannotConnect(#[source] PlannerError),
    #[error("Invalid authentication")]
    InvalidAuth,
    #[error(transparent)]
    InvalidPowerKw(ConfigError),
    #[error(transparent)]
    InvalidSoc(ConfigError),
    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl ConfigFlowError {
    pub fn key(&self) -> &'static str {
        match self {
            ConfigFlowError::CannotConnect(_) => "cannot_connect",
            ConfigFlowError::InvalidAuth => "invalid_auth",
            ConfigFlowError::InvalidPowerKw(_) => "invalid_power_kw",
            ConfigFlowError::InvalidSoc(_) => "invalid_soc",
            ConfigFlowError::Unknown(_) => "unknown",
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            ConfigFlowError::InvalidPowerKw(_) => "power_kw",
            ConfigFlowError::InvalidSoc(_) => "battery_current_soc",
            _ => "base",
        }
    }
}

impl From<ConfigError> for ConfigFlowError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidPowerKw(_) => ConfigFlowError::InvalidPowerKw(err),
            ConfigError::InvalidSoc(_) => ConfigFlowError::InvalidSoc(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    /// Needs new credentials, retrying will not help
    #[error("Invalid authentication for Battery Planner: {0}")]
    InvalidAuth(#[source] PlannerError),
    #[error("Battery Planner not ready: {0}")]
    NotReady(#[source] PlannerError),
}

impl SetupError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SetupError::NotReady(_))
    }
}

/// Validated, immutable settings for one configured battery system
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub title: String,
    pub base_url: String,
    pub system_id: String,
    pub api_token: ApiToken,
    pub request: PlanRequest,
}

fn entry_id_for(system_id: &str) -> String {
    system_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Check user input before anything is set up. The power profile is parsed first so
/// a malformed profile never reaches the network.
pub async fn validate_input(config: &PlannerConfig) -> Result<ConfigEntry, ConfigFlowError> {
    let power_kw = config.power_kw.parse()?;
    let battery_current_soc = validate_soc(config.battery_current_soc)?;
    let client = PlannerClient::new(&config.base_url, &config.system_id, config.api_token.clone());

    match client.validate_token().await {
        Ok(()) => {}
        Err(PlannerError::Auth { .. }) => return Err(ConfigFlowError::InvalidAuth),
        Err(e @ PlannerError::Connection(_)) => return Err(ConfigFlowError::CannotConnect(e)),
        Err(e) => return Err(ConfigFlowError::Unknown(e.to_string())),
    }

    Ok(ConfigEntry {
        entry_id: entry_id_for(&config.system_id),
        title: format!("Battery System {}", config.system_id),
        base_url: client.base_url().to_string(),
        system_id: config.system_id.clone(),
        api_token: config.api_token.clone(),
        request: PlanRequest {
            power_kw,
            battery_current_soc,
            allow_export: config.allow_export,
        },
    })
}

/// Everything that lives as long as one configured system: the shared HTTP client,
/// the coordinator and the device the sensors hang off. Dropping it tears the
/// system down.
pub struct SystemContext {
    pub entry: ConfigEntry,
    pub client: Arc<PlannerClient>,
    pub coordinator: Arc<PlanCoordinator>,
    pub device: DeviceInfo,
}

impl SystemContext {
    pub fn unload(self) {
        info!("Unloading {} ({})", self.entry.title, self.entry.entry_id);
    }
}

pub async fn setup_entry(entry: &ConfigEntry) -> Result<SystemContext, SetupError> {
    let client = Arc::new(PlannerClient::new(
        &entry.base_url,
        &entry.system_id,
        entry.api_token.clone(),
    ));

    match client.validate_token().await {
        Ok(()) => {}
        Err(e @ PlannerError::Auth { .. }) => return Err(SetupError::InvalidAuth(e)),
        Err(e) => return Err(SetupError::NotReady(e)),
    }

    let coordinator = Arc::new(PlanCoordinator::new(client.clone(), entry.request.clone()));
    if let Err(e) = coordinator.initial_refresh().await {
        warn!("Initial battery plan fetch failed: {}", e);
        return Err(SetupError::NotReady(e));
    }

    if let Some(update) = coordinator.last_update().await {
        info!(
            "Set up {} ({}), first plan received at {}",
            entry.title, entry.entry_id, update.received_at
        );
    }
    Ok(SystemContext {
        device: DeviceInfo::for_system(&entry.entry_id, &entry.system_id),
        entry: entry.clone(),
        client,
        coordinator,
    })
}
