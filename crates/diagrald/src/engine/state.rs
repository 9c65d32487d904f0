use std::collections::BTreeMap;

use serde::Serialize;

use super::device::Device;
use super::entity::EntityDescriptor;
use super::entity::EntityKind;

/// Extra state attributes of an entity.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// State of an alarm control panel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlarmState {
    Disarmed,
    ArmedHome,
    ArmedAway,
    Arming,
    Triggered,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AlarmPanelState {
    pub state: AlarmState,

    /// Who last changed the arming state, when known.
    pub changed_by: Option<String>,
    pub attributes: Attributes,
}

/// State of a binary sensor entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BinarySensorState {
    /// Whether the sensor is active (meaning depends on device class)
    pub on: bool,
    pub attributes: Attributes,
}

/// State of a numeric or textual sensor.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SensorState {
    pub value: serde_json::Value,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityState {
    AlarmControlPanel(AlarmPanelState),
    BinarySensor(BinarySensorState),
    Sensor(SensorState),
}

impl EntityState {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityState::AlarmControlPanel(_) => EntityKind::AlarmControlPanel,
            EntityState::BinarySensor(_) => EntityKind::BinarySensor,
            EntityState::Sensor(_) => EntityKind::Sensor,
        }
    }

    /// Plain state value: the alarm state name, `ON`/`OFF`, or the sensor reading.
    pub fn value(&self) -> String {
        match self {
            EntityState::AlarmControlPanel(panel) => panel.state.to_string(),
            EntityState::BinarySensor(sensor) if sensor.on => "ON".to_string(),
            EntityState::BinarySensor(_) => "OFF".to_string(),
            EntityState::Sensor(sensor) => match &sensor.value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            },
        }
    }

    pub fn attributes(&self) -> &Attributes {
        match self {
            EntityState::AlarmControlPanel(panel) => &panel.attributes,
            EntityState::BinarySensor(sensor) => &sensor.attributes,
            EntityState::Sensor(sensor) => &sensor.attributes,
        }
    }
}

/// Centralized snapshot of the entire engine state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub entities: BTreeMap<String, EntityDescriptor>,
    pub states: BTreeMap<String, EntityState>,
    pub devices: BTreeMap<String, Device>,
}
