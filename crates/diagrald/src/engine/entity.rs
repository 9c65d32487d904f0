//! Entity abstraction for diagrald
//!
//! Integrations describe each entity once with an [`EntityDescriptor`] and then
//! report [`EntityState`]s for it.

use serde::Serialize;

use super::device::Device;
use super::state::EntityState;

/// Platform an entity belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    AlarmControlPanel,
    BinarySensor,
    Sensor,
}

/// Static description of an entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    /// `<platform>.<object_id>`
    pub entity_id: String,
    pub unique_id: String,

    /// Entity name; the device name is used when `None`
    pub name: Option<String>,
    pub kind: EntityKind,
    pub device: Device,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    /// Alarm panels only: actions offered, e.g. `arm_away`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supported_features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_format: Option<String>,
    pub code_arm_required: bool,
    pub code_disarm_required: bool,
}

impl EntityDescriptor {
    pub fn new(kind: EntityKind, object_id: &str, unique_id: String, device: Device) -> Self {
        Self {
            entity_id: format!("{}.{}", kind, object_id),
            unique_id,
            name: None,
            kind,
            device,
            icon: None,
            device_class: None,
            unit_of_measurement: None,
            supported_features: Vec::new(),
            code_format: None,
            code_arm_required: false,
            code_disarm_required: false,
        }
    }

    /// Object id part of the entity id.
    pub fn object_id(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(_, object_id)| object_id)
            .unwrap_or(&self.entity_id)
    }
}

/// Implemented by every entity an integration exposes.
pub trait Entity: Send + Sync {
    fn descriptor(&self) -> &EntityDescriptor;

    /// Current state, as stored by the engine
    fn state(&self) -> EntityState;

    fn entity_id(&self) -> &str {
        &self.descriptor().entity_id
    }
}
