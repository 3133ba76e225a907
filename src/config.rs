use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub planner: PlannerConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlannerConfig {
    pub api_token: ApiToken,
    /// Which battery installation the service should plan for
    pub system_id: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Expected power per planning interval in kW, either a list or comma-separated text
    pub power_kw: PowerProfileInput,
    /// Current state of charge (0-100)
    #[serde(default = "default_soc")]
    pub battery_current_soc: f64,
    #[serde(default = "default_allow_export")]
    pub allow_export: bool,
    /// How often to request a new plan (in seconds), 0 disables polling
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    /// Delay between setup attempts while the service is unreachable
    #[serde(default = "default_setup_retry")]
    pub setup_retry_secs: u64,
}

pub const DEFAULT_BASE_URL: &str = "https://bp.stenite.com";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_soc() -> f64 {
    50.0
}

fn default_allow_export() -> bool {
    true
}

fn default_update_interval() -> u64 {
    900 // 15 minutes
}

fn default_setup_retry() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Home Assistant MQTT discovery prefix
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// Root for state, attribute and command topics
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "battery-planner".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_topic_prefix() -> String {
    "battery_planner".to_string()
}

/// API token for the planning service. Formatting never reveals the full secret.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ApiToken(String);

impl ApiToken {
    #[cfg(test)]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

/// Tokens shorter than this are fully masked
const MIN_TOKEN_LEN_FOR_HINT: usize = 16;

impl fmt::Display for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() < MIN_TOKEN_LEN_FOR_HINT {
            return write!(f, "****");
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        write!(f, "…{tail}")
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiToken({self})")
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid power_kw format. Please provide comma-separated numbers (got '{0}')")]
    InvalidPowerKw(String),
    #[error("battery_current_soc must be between 0 and 100 (got {0})")]
    InvalidSoc(f64),
}

/// Power profile as entered by the user: add-on options may carry either form.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PowerProfileInput {
    Values(Vec<f64>),
    Text(String),
}

impl PowerProfileInput {
    pub fn parse(&self) -> Result<Vec<f64>, ConfigError> {
        match self {
            PowerProfileInput::Text(text) => parse_power_kw(text),
            PowerProfileInput::Values(values) => {
                if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
                    return Err(ConfigError::InvalidPowerKw(format!("{values:?}")));
                }
                Ok(values.clone())
            }
        }
    }
}

/// Convert comma-separated power values (kW) into a profile
pub fn parse_power_kw(text: &str) -> Result<Vec<f64>, ConfigError> {
    text.split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ConfigError::InvalidPowerKw(text.to_string()))
        })
        .collect()
}

pub fn validate_soc(soc: f64) -> Result<f64, ConfigError> {
    if (0.0..=100.0).contains(&soc) {
        Ok(soc)
    } else {
        Err(ConfigError::InvalidSoc(soc))
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_from_env_or_file() -> Result<Self> {
        // Home Assistant addons typically use /data/options.json
        let ha_options = Path::new("/data/options.json");
        if ha_options.exists() {
            let content = std::fs::read_to_string(ha_options)?;
            let config: Config = serde_json::from_str(&content)?;
            return Ok(config);
        }

        let paths = ["battery-planner.yaml", "/config/battery-planner.yaml"];
        for path in paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        anyhow::bail!("No configuration file found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_power_kw_text() {
        assert_eq!(parse_power_kw("1.5, -2.0, 0").unwrap(), vec![1.5, -2.0, 0.0]);
    }

    #[test]
    fn test_parse_power_kw_rejects_garbage() {
        assert_eq!(
            parse_power_kw("abc"),
            Err(ConfigError::InvalidPowerKw("abc".to_string()))
        );
        assert!(parse_power_kw("1.0,,2.0").is_err());
        assert!(parse_power_kw("").is_err());
    }

    #[test]
    fn test_power_profile_list_form() {
        let input = PowerProfileInput::Values(vec![0.5, 1.0]);
        assert_eq!(input.parse().unwrap(), vec![0.5, 1.0]);
        assert!(PowerProfileInput::Values(vec![]).parse().is_err());
    }

    #[test]
    fn test_validate_soc_bounds() {
        assert_eq!(validate_soc(0.0), Ok(0.0));
        assert_eq!(validate_soc(100.0), Ok(100.0));
        assert_eq!(validate_soc(100.5), Err(ConfigError::InvalidSoc(100.5)));
        assert!(validate_soc(-1.0).is_err());
    }

    #[test]
    fn test_yaml_defaults() {
        let yaml = r#"
planner:
  api_token: "secret-token-value"
  system_id: "home-1"
  power_kw: "1.0, 2.0"
mqtt:
  host: "core-mosquitto"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.planner.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.planner.battery_current_soc, 50.0);
        assert!(config.planner.allow_export);
        assert_eq!(config.planner.update_interval_secs, 900);
        assert_eq!(config.planner.power_kw.parse().unwrap(), vec![1.0, 2.0]);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "battery_planner");
    }

    #[test]
    fn test_options_json_with_list_profile() {
        let json = r#"{
            "planner": {"api_token": "t", "system_id": "s", "power_kw": [1.5, -2.0]},
            "mqtt": {"host": "localhost"}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.planner.power_kw,
            PowerProfileInput::Values(vec![1.5, -2.0])
        );
    }

    #[test]
    fn test_token_is_redacted() {
        let token = ApiToken::new("abcd1234efgh5678");
        assert_eq!(token.to_string(), "…5678");
        assert_eq!(format!("{token:?}"), "ApiToken(…5678)");
        assert_eq!(ApiToken::new("short").to_string(), "****");
        assert_eq!(ApiToken::new("abcdefghijkl").to_string(), "****");
        assert_eq!(token.expose(), "abcd1234efgh5678");
    }
}
