use anyhow::Result;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::planner::PlanResponse;
use crate::sensors::{DeviceInfo, ObservableValue};
use crate::service::{CreatePlanResult, SERVICE_CREATE_PLAN};

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";

/// Topic layout for one configured system
#[derive(Debug, Clone)]
pub struct Topics {
    discovery_prefix: String,
    base: String,
    entry_id: String,
}

impl Topics {
    pub fn new(config: &MqttConfig, entry_id: &str) -> Self {
        Self {
            discovery_prefix: config.discovery_prefix.trim_end_matches('/').to_string(),
            base: format!("{}/{}", config.topic_prefix.trim_end_matches('/'), entry_id),
            entry_id: entry_id.to_string(),
        }
    }

    pub fn availability(&self) -> String {
        format!("{}/availability", self.base)
    }

    pub fn state(&self, key: &str) -> String {
        format!("{}/{}/state", self.base, key)
    }

    pub fn attributes(&self, key: &str) -> String {
        format!("{}/{}/attributes", self.base, key)
    }

    pub fn discovery(&self, key: &str) -> String {
        format!("{}/sensor/{}/{}/config", self.discovery_prefix, self.entry_id, key)
    }

    pub fn command(&self) -> String {
        format!("{}/{}", self.base, SERVICE_CREATE_PLAN)
    }

    pub fn command_response(&self) -> String {
        format!("{}/{}/response", self.base, SERVICE_CREATE_PLAN)
    }
}

/// Home Assistant MQTT discovery config for one sensor
pub fn discovery_payload(
    topics: &Topics,
    sensor: &dyn ObservableValue,
    device: &DeviceInfo,
    entry_id: &str,
) -> Value {
    let descriptor = sensor.descriptor();
    let mut payload = json!({
        "name": descriptor.name,
        "unique_id": descriptor.unique_id(entry_id),
        "object_id": descriptor.key,
        "state_topic": topics.state(descriptor.key),
        "value_template": "{{ value_json.value }}",
        "json_attributes_topic": topics.attributes(descriptor.key),
        "availability_topic": topics.availability(),
        "has_entity_name": true,
        "device": {
            "identifiers": [device.identifier],
            "name": device.name,
            "manufacturer": device.manufacturer,
        },
    });

    let optional = [
        ("device_class", descriptor.device_class),
        ("state_class", descriptor.state_class),
        ("entity_category", descriptor.entity_category),
    ];
    for (field, value) in optional {
        if let Some(value) = value {
            payload[field] = Value::from(value);
        }
    }
    payload
}

/// State payload; a missing value is published as null so Home Assistant shows unknown
pub fn state_payload(sensor: &dyn ObservableValue, plan: Option<&PlanResponse>) -> Value {
    json!({ "value": sensor.state(plan).map(|s| s.to_json()) })
}

pub struct MqttBridge {
    client: AsyncClient,
    topics: Topics,
}

impl MqttBridge {
    /// Connect to the broker. Calls to create_plan arrive on the returned receiver.
    pub async fn connect(
        config: &MqttConfig,
        topics: Topics,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_last_will(LastWill::new(
            topics.availability(),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
        let (command_tx, command_rx) = mpsc::channel(16);
        let command_topic = topics.command();
        let subscriber = client.clone();

        // Spawn event loop handler
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == command_topic {
                            debug!("Received {} call ({} bytes)", SERVICE_CREATE_PLAN, publish.payload.len());
                            if command_tx.send(publish.payload.to_vec()).await.is_err() {
                                debug!("Command receiver dropped, stopping MQTT event loop");
                                break;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        // Subscriptions do not survive a reconnect with a clean session
                        if let Err(e) = subscriber.try_subscribe(&command_topic, QoS::AtLeastOnce) {
                            warn!("Failed to subscribe to {}: {}", command_topic, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!("Listening for {} calls on {}", SERVICE_CREATE_PLAN, topics.command());
        Ok((Self { client, topics }, command_rx))
    }

    pub async fn publish_discovery(
        &self,
        sensors: &[Box<dyn ObservableValue>],
        device: &DeviceInfo,
        entry_id: &str,
    ) -> Result<()> {
        for sensor in sensors {
            let key = sensor.descriptor().key;
            let payload = discovery_payload(&self.topics, sensor.as_ref(), device, entry_id);
            self.client
                .publish(self.topics.discovery(key), QoS::AtLeastOnce, true, payload.to_string())
                .await?;
            debug!("Published discovery config for {}", key);
        }
        Ok(())
    }

    pub async fn publish_availability(&self, online: bool) -> Result<()> {
        let payload = if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        self.client
            .publish(self.topics.availability(), QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }

    /// Re-publish state and attributes of every sensor from the given plan
    pub async fn publish_states(
        &self,
        sensors: &[Box<dyn ObservableValue>],
        plan: Option<&PlanResponse>,
    ) -> Result<()> {
        for sensor in sensors {
            let key = sensor.descriptor().key;
            let state = state_payload(sensor.as_ref(), plan);
            let attributes = Value::Object(sensor.attributes(plan));

            self.client
                .publish(self.topics.state(key), QoS::AtLeastOnce, true, state.to_string())
                .await?;
            self.client
                .publish(self.topics.attributes(key), QoS::AtLeastOnce, true, attributes.to_string())
                .await?;
        }
        debug!("Published {} sensor states", sensors.len());
        Ok(())
    }

    pub async fn publish_command_result(&self, result: &CreatePlanResult) -> Result<()> {
        let payload = serde_json::to_string(result)?;
        self.client
            .publish(self.topics.command_response(), QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{CostDeltaSensor, CurrentActionSensor, PlanStatusSensor};

    fn mqtt_config() -> MqttConfig {
        MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "battery-planner".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            topic_prefix: "battery_planner/".to_string(),
        }
    }

    #[test]
    fn test_topic_layout() {
        let topics = Topics::new(&mqtt_config(), "home_1");
        assert_eq!(topics.availability(), "battery_planner/home_1/availability");
        assert_eq!(
            topics.state("battery_plan_action"),
            "battery_planner/home_1/battery_plan_action/state"
        );
        assert_eq!(
            topics.discovery("battery_plan"),
            "homeassistant/sensor/home_1/battery_plan/config"
        );
        assert_eq!(topics.command(), "battery_planner/home_1/create_plan");
        assert_eq!(topics.command_response(), "battery_planner/home_1/create_plan/response");
    }

    #[test]
    fn test_discovery_payload_carries_metadata() {
        let topics = Topics::new(&mqtt_config(), "home_1");
        let device = DeviceInfo::for_system("home_1", "Home 1");

        let payload = discovery_payload(&topics, &CostDeltaSensor, &device, "home_1");
        assert_eq!(payload["unique_id"], "home_1_battery_plan_cost_delta");
        assert_eq!(payload["device_class"], "monetary");
        assert_eq!(payload["state_class"], "measurement");
        assert!(payload.get("entity_category").is_none());
        assert_eq!(payload["device"]["name"], "Battery System Home 1");

        let payload = discovery_payload(&topics, &PlanStatusSensor, &device, "home_1");
        assert_eq!(payload["entity_category"], "diagnostic");
        assert!(payload.get("device_class").is_none());
    }

    #[test]
    fn test_state_payload_without_plan() {
        assert_eq!(state_payload(&PlanStatusSensor, None), json!({"value": "unknown"}));
        assert_eq!(state_payload(&CostDeltaSensor, None), json!({"value": null}));
        assert_eq!(state_payload(&CurrentActionSensor, None), json!({"value": null}));
    }
}
