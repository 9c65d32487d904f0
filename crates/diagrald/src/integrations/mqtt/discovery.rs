use serde::Deserialize;
use serde::Serialize;

use super::MqttConfig;
use crate::engine::AlarmAction;
use crate::engine::Device;
use crate::engine::EntityDescriptor;
use crate::engine::EntityKind;
use crate::engine::deserialize_code;

/// Discovery message for one entity
///
/// Published retained on `{prefix}/{component}/{node_id}/{object_id}/config`
/// following Home Assistant's MQTT discovery protocol.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryMessage {
    /// Human-readable name of the entity
    pub name: Option<String>,

    /// Unique identifier for this entity
    pub unique_id: String,
    pub object_id: String,

    /// Topic carrying the plain state
    pub state_topic: String,

    /// Topic carrying the JSON attributes
    pub json_attributes_topic: String,
    pub availability_topic: String,

    /// Topic to send commands (alarm panels only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_template: Option<String>,

    /// `REMOTE_CODE` makes the front-end ask for a code and pass it on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_arm_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_disarm_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_features: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Device class (e.g., "safety") for binary sensors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    /// Device information
    pub device: DeviceInfo,
}

/// Device block of a discovery message
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// List of identifiers for this device
    pub identifiers: Vec<String>,

    /// Device name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            identifiers: vec![device.id()],
            name: device.name.clone(),
            manufacturer: device.manufacturer.clone(),
            model: device.model.clone(),
            sw_version: device.sw_version.clone(),
        }
    }
}

/// Keep topic levels to characters every broker and front-end accepts.
fn topic_level(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{base_topic}/status`
pub fn availability_topic(config: &MqttConfig) -> String {
    format!("{}/status", config.base_topic)
}

/// `{base_topic}/{node_id}/event`
pub fn event_topic(config: &MqttConfig, node_id: &str) -> String {
    format!("{}/{}/event", config.base_topic, topic_level(node_id))
}

/// Every topic used for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTopics {
    pub config: String,
    pub state: String,
    pub attributes: String,
    pub command: Option<String>,
}

impl EntityTopics {
    pub fn new(config: &MqttConfig, descriptor: &EntityDescriptor) -> Self {
        let node_id = topic_level(&descriptor.device.id());
        let object_id = topic_level(descriptor.object_id());
        let base = format!("{}/{}/{}", config.base_topic, node_id, object_id);

        Self {
            config: format!(
                "{}/{}/{}/{}/config",
                config.discovery_prefix, descriptor.kind, node_id, object_id
            ),
            state: format!("{}/state", base),
            attributes: format!("{}/attributes", base),
            command: (descriptor.kind == EntityKind::AlarmControlPanel)
                .then(|| format!("{}/set", base)),
        }
    }
}

impl DiscoveryMessage {
    pub fn new(config: &MqttConfig, descriptor: &EntityDescriptor, topics: &EntityTopics) -> Self {
        let is_panel = descriptor.kind == EntityKind::AlarmControlPanel;
        let needs_code = descriptor.code_arm_required || descriptor.code_disarm_required;

        Self {
            name: descriptor.name.clone(),
            unique_id: descriptor.unique_id.clone(),
            object_id: descriptor.object_id().to_string(),
            state_topic: topics.state.clone(),
            json_attributes_topic: topics.attributes.clone(),
            availability_topic: availability_topic(config),
            command_topic: topics.command.clone(),
            command_template: is_panel
                .then(|| r#"{"action": "{{ action }}", "code": "{{ code }}"}"#.to_string()),
            code: (is_panel && needs_code).then(|| "REMOTE_CODE".to_string()),
            code_arm_required: is_panel.then_some(descriptor.code_arm_required),
            code_disarm_required: is_panel.then_some(descriptor.code_disarm_required),
            supported_features: (!descriptor.supported_features.is_empty())
                .then(|| descriptor.supported_features.clone()),
            icon: descriptor.icon.clone(),
            device_class: descriptor.device_class.clone(),
            unit_of_measurement: descriptor.unit_of_measurement.clone(),
            device: DeviceInfo::from(&descriptor.device),
        }
    }
}

/// Parse a command topic to extract node_id and object_id
///
/// Topic format: {base_topic}/{node_id}/{object_id}/set
pub fn parse_command_topic(topic: &str, base_topic: &str) -> Option<(String, String)> {
    let without_base = topic.strip_prefix(base_topic)?.strip_prefix('/')?;

    let parts: Vec<&str> = without_base.split('/').collect();
    match parts.as_slice() {
        [node_id, object_id, "set"] => Some((node_id.to_string(), object_id.to_string())),
        _ => None,
    }
}

/// Payload received on an alarm panel command topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlarmCommandPayload {
    pub action: String,

    #[serde(default, deserialize_with = "deserialize_code")]
    pub code: Option<String>,
}

impl AlarmCommandPayload {
    /// Accepts `{"action": ..., "code": ...}` or a bare action such as `DISARM`.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if let Ok(command) = serde_json::from_slice::<Self>(payload) {
            return Some(command);
        }

        let action = std::str::from_utf8(payload).ok()?.trim();
        (!action.is_empty()).then(|| Self {
            action: action.to_string(),
            code: None,
        })
    }

    pub fn action(&self) -> Option<AlarmAction> {
        self.action.trim().parse().ok()
    }

    /// The code, with the empty string a template renders for "no code" as `None`.
    pub fn code(&self) -> Option<String> {
        self.code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty() && *c != "None")
            .map(str::to_string)
    }
}
