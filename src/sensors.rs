use serde_json::{json, Map, Value};

use crate::planner::PlanResponse;

pub const SENSOR_BATTERY_PLAN: &str = "battery_plan";
pub const SENSOR_BATTERY_PLAN_COST_DELTA: &str = "battery_plan_cost_delta";
pub const SENSOR_BATTERY_PLAN_ACTION: &str = "battery_plan_action";

pub type Attributes = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum SensorState {
    Text(String),
    Number(f64),
}

impl SensorState {
    pub fn to_json(&self) -> Value {
        match self {
            SensorState::Text(text) => Value::from(text.as_str()),
            SensorState::Number(n) => json!(n),
        }
    }
}

/// Static entity metadata, the parts Home Assistant needs to register a sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDescriptor {
    pub key: &'static str,
    pub name: &'static str,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub entity_category: Option<&'static str>,
}

impl SensorDescriptor {
    pub fn unique_id(&self, entry_id: &str) -> String {
        format!("{}_{}", entry_id, self.key)
    }
}

/// The device all sensors of one configured system belong to
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: &'static str,
}

impl DeviceInfo {
    pub fn for_system(entry_id: &str, system_id: &str) -> Self {
        Self {
            identifier: format!("battery_planner_{entry_id}"),
            name: format!("Battery System {system_id}"),
            manufacturer: "Battery Planner",
        }
    }
}

/// A read-only view derived from the cached plan. Implementations must be total:
/// missing data yields `None` or empty attributes, never a panic.
pub trait ObservableValue: Send + Sync {
    fn descriptor(&self) -> SensorDescriptor;

    fn state(&self, plan: Option<&PlanResponse>) -> Option<SensorState>;

    fn attributes(&self, plan: Option<&PlanResponse>) -> Attributes;
}

/// "active" once a plan has been received
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanStatusSensor;

impl ObservableValue for PlanStatusSensor {
    fn descriptor(&self) -> SensorDescriptor {
        SensorDescriptor {
            key: SENSOR_BATTERY_PLAN,
            name: "Status",
            device_class: None,
            state_class: None,
            entity_category: Some("diagnostic"),
        }
    }

    fn state(&self, plan: Option<&PlanResponse>) -> Option<SensorState> {
        let status = if plan.is_some() { "active" } else { "unknown" };
        Some(SensorState::Text(status.to_string()))
    }

    fn attributes(&self, plan: Option<&PlanResponse>) -> Attributes {
        let schedule: Vec<Value> = plan
            .map(|p| p.schedule.iter().map(|e| e.raw().clone()).collect())
            .unwrap_or_default();

        let mut attributes = Attributes::new();
        attributes.insert("schedule".to_string(), Value::Array(schedule));
        attributes
    }
}

/// Savings of the optimized plan over the baseline
#[derive(Debug, Clone, Copy, Default)]
pub struct CostDeltaSensor;

impl ObservableValue for CostDeltaSensor {
    fn descriptor(&self) -> SensorDescriptor {
        SensorDescriptor {
            key: SENSOR_BATTERY_PLAN_COST_DELTA,
            name: "Cost Delta",
            device_class: Some("monetary"),
            state_class: Some("measurement"),
            entity_category: None,
        }
    }

    fn state(&self, plan: Option<&PlanResponse>) -> Option<SensorState> {
        plan?.cost_delta().map(SensorState::Number)
    }

    fn attributes(&self, plan: Option<&PlanResponse>) -> Attributes {
        let mut attributes = Attributes::new();
        let Some(plan) = plan.filter(|p| !p.schedule.is_empty()) else {
            return attributes;
        };
        if let (Some(baseline), Some(optimized)) = (plan.baseline_cost, plan.optimized_cost) {
            attributes.insert("baseline_cost".to_string(), json!(baseline));
            attributes.insert("optimized_cost".to_string(), json!(optimized));
        }
        attributes
    }
}

/// What the first schedule entry tells the battery to do
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentActionSensor;

impl ObservableValue for CurrentActionSensor {
    fn descriptor(&self) -> SensorDescriptor {
        SensorDescriptor {
            key: SENSOR_BATTERY_PLAN_ACTION,
            name: "Current Action",
            device_class: None,
            state_class: None,
            entity_category: None,
        }
    }

    fn state(&self, plan: Option<&PlanResponse>) -> Option<SensorState> {
        let name = plan?.first_entry()?.action_name()?;
        Some(SensorState::Text(name.to_string()))
    }

    fn attributes(&self, plan: Option<&PlanResponse>) -> Attributes {
        let mut attributes = Attributes::new();
        let Some(entry) = plan.and_then(PlanResponse::first_entry) else {
            return attributes;
        };

        let or_null = |v: Option<&Value>| v.cloned().unwrap_or(Value::Null);
        let or_empty = |v: Option<&Value>| v.cloned().unwrap_or_else(|| json!({}));

        attributes.insert("power".to_string(), or_null(entry.action_power()));
        attributes.insert("cost".to_string(), or_empty(entry.cost()));
        attributes.insert("price".to_string(), or_empty(entry.price()));
        attributes.insert("soc".to_string(), or_empty(entry.soc()));
        attributes.insert("time".to_string(), or_null(entry.time()));
        attributes
    }
}

pub fn all_sensors() -> Vec<Box<dyn ObservableValue>> {
    vec![
        Box::new(PlanStatusSensor),
        Box::new(CostDeltaSensor),
        Box::new(CurrentActionSensor),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ScheduleEntry;

    fn sample_plan() -> PlanResponse {
        serde_json::from_value(json!({
            "baseline_cost": 120.0,
            "optimized_cost": 95.0,
            "schedule": [{
                "time": "00:00",
                "action": {"name": "charge", "power": 3.0},
                "cost": {}, "price": {}, "soc": {}
            }]
        }))
        .unwrap()
    }

    fn empty_plan() -> PlanResponse {
        PlanResponse {
            baseline_cost: Some(10.0),
            optimized_cost: Some(10.0),
            schedule: vec![],
        }
    }

    #[test]
    fn test_sample_plan_projections() {
        let plan = sample_plan();
        assert_eq!(
            PlanStatusSensor.state(Some(&plan)),
            Some(SensorState::Text("active".to_string()))
        );
        assert_eq!(CostDeltaSensor.state(Some(&plan)), Some(SensorState::Number(25.0)));
        assert_eq!(
            CurrentActionSensor.state(Some(&plan)),
            Some(SensorState::Text("charge".to_string()))
        );

        let attrs = CurrentActionSensor.attributes(Some(&plan));
        assert_eq!(attrs["power"], json!(3.0));
        assert_eq!(attrs["time"], json!("00:00"));
        assert_eq!(attrs["cost"], json!({}));
    }

    #[test]
    fn test_cost_delta_exact() {
        let plan = PlanResponse {
            baseline_cost: Some(100.0),
            optimized_cost: Some(72.5),
            schedule: vec![],
        };
        assert_eq!(CostDeltaSensor.state(Some(&plan)), Some(SensorState::Number(27.5)));
    }

    #[test]
    fn test_no_data() {
        assert_eq!(
            PlanStatusSensor.state(None),
            Some(SensorState::Text("unknown".to_string()))
        );
        assert_eq!(PlanStatusSensor.attributes(None)["schedule"], json!([]));
        assert_eq!(CostDeltaSensor.state(None), None);
        assert!(CostDeltaSensor.attributes(None).is_empty());
        assert_eq!(CurrentActionSensor.state(None), None);
        assert!(CurrentActionSensor.attributes(None).is_empty());
    }

    #[test]
    fn test_missing_cost_keeps_schedule_views() {
        let plan: PlanResponse = serde_json::from_value(json!({
            "optimized_cost": 95,
            "schedule": [{"time": "00:00", "action": {"name": "charge", "power": 3.0}}]
        }))
        .unwrap();

        assert_eq!(
            PlanStatusSensor.state(Some(&plan)),
            Some(SensorState::Text("active".to_string()))
        );
        assert_eq!(
            CurrentActionSensor.state(Some(&plan)),
            Some(SensorState::Text("charge".to_string()))
        );
        assert_eq!(CostDeltaSensor.state(Some(&plan)), None);
        assert!(CostDeltaSensor.attributes(Some(&plan)).is_empty());
    }

    #[test]
    fn test_empty_schedule() {
        let plan = empty_plan();
        assert_eq!(
            PlanStatusSensor.state(Some(&plan)),
            Some(SensorState::Text("active".to_string()))
        );
        assert_eq!(CurrentActionSensor.state(Some(&plan)), None);
        assert!(CurrentActionSensor.attributes(Some(&plan)).is_empty());
        assert!(CostDeltaSensor.attributes(Some(&plan)).is_empty());
    }

    #[test]
    fn test_first_entry_missing_nested_fields() {
        let plan = PlanResponse {
            baseline_cost: Some(5.0),
            optimized_cost: Some(4.0),
            schedule: vec![ScheduleEntry::new(json!({"action": {}}))],
        };
        assert_eq!(CurrentActionSensor.state(Some(&plan)), None);

        let attrs = CurrentActionSensor.attributes(Some(&plan));
        assert_eq!(attrs["power"], Value::Null);
        assert_eq!(attrs["time"], Value::Null);
        assert_eq!(attrs["soc"], json!({}));
    }

    #[test]
    fn test_schedule_order_preserved() {
        let plan = PlanResponse {
            baseline_cost: Some(1.0),
            optimized_cost: Some(1.0),
            schedule: vec![
                ScheduleEntry::new(json!({"time": "02:00"})),
                ScheduleEntry::new(json!({"time": "01:00"})),
            ],
        };
        let attrs = PlanStatusSensor.attributes(Some(&plan));
        assert_eq!(attrs["schedule"], json!([{"time": "02:00"}, {"time": "01:00"}]));
    }

    #[test]
    fn test_descriptors() {
        let keys: Vec<&str> = all_sensors().iter().map(|s| s.descriptor().key).collect();
        assert_eq!(
            keys,
            vec![SENSOR_BATTERY_PLAN, SENSOR_BATTERY_PLAN_COST_DELTA, SENSOR_BATTERY_PLAN_ACTION]
        );
        assert_eq!(
            CostDeltaSensor.descriptor().unique_id("entry1"),
            "entry1_battery_plan_cost_delta"
        );
        assert_eq!(DeviceInfo::for_system("entry1", "S").name, "Battery System S");
    }
}
