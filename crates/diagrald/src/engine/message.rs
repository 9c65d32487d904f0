//! Type-safe message system for diagrald
//!
//! Messages are split by direction to enforce correct usage at compile time:
//! - `FromIntegrationMessage`: Events from integrations to the engine
//! - `ToIntegrationMessage`: Commands from the engine to integrations

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use super::device::Device;
use super::entity::EntityDescriptor;
use super::state::EntityState;

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug)]
pub enum FromIntegrationMessage {
    /// An entity was discovered and registered
    EntityDiscovered {
        descriptor: EntityDescriptor,
        integration_name: String,
    },

    EntityRemoved { entity_id: String },

    StateChanged {
        entity_id: String,
        state: EntityState,
    },

    /// Device metadata changed (e.g. firmware version)
    DeviceUpdated { device: Device },

    /// Fire a named event on the bus
    FireEvent {
        event_type: String,
        data: serde_json::Value,
    },

    /// A command for another integration (e.g. an MQTT command topic)
    Command(ToIntegrationMessage),
}

/// Alarm panel actions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum AlarmAction {
    Disarm,
    ArmAway,
    ArmHome,
}

/// Messages FROM the engine TO integrations (commands)
#[derive(Debug)]
pub enum ToIntegrationMessage {
    AlarmCommand {
        entity_id: String,
        action: AlarmAction,
        code: Option<String>,
    },

    /// Arm the given groups of an alarm
    ArmGroups { entity_id: String, groups: Vec<u8> },

    /// Disarm the given groups of an alarm
    DisarmGroups { entity_id: String, groups: Vec<u8> },

    /// (Re)negotiate the push webhook with the cloud
    RegisterWebhook,

    /// Tear the push webhook down
    UnregisterWebhook,

    /// Collect redacted diagnostics
    Diagnostics {
        reply: oneshot::Sender<serde_json::Value>,
    },
}

impl ToIntegrationMessage {
    /// Entity the command is addressed to, if it is entity-scoped.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            ToIntegrationMessage::AlarmCommand { entity_id, .. }
            | ToIntegrationMessage::ArmGroups { entity_id, .. }
            | ToIntegrationMessage::DisarmGroups { entity_id, .. } => Some(entity_id),
            ToIntegrationMessage::RegisterWebhook
            | ToIntegrationMessage::UnregisterWebhook
            | ToIntegrationMessage::Diagnostics { .. } => None,
        }
    }

    /// Build a command from a named service call and its JSON payload.
    pub fn from_service(service: &str, data: serde_json::Value) -> Result<Self, ServiceError> {
        match service {
            "alarm_disarm" | "alarm_arm_away" | "alarm_arm_home" => {
                let action = service
                    .trim_start_matches("alarm_")
                    .parse::<AlarmAction>()
                    .map_err(|_| ServiceError::UnknownService(service.to_string()))?;
                let call: AlarmServiceCall = serde_json::from_value(data)?;
                Ok(ToIntegrationMessage::AlarmCommand {
                    entity_id: call.entity_id,
                    action,
                    code: call.code,
                })
            }
            "arm_groups" => {
                let call: GroupServiceCall = serde_json::from_value(data)?;
                Ok(ToIntegrationMessage::ArmGroups {
                    entity_id: call.entity_id,
                    groups: call.groups,
                })
            }
            "disarm_groups" => {
                let call: GroupServiceCall = serde_json::from_value(data)?;
                Ok(ToIntegrationMessage::DisarmGroups {
                    entity_id: call.entity_id,
                    groups: call.groups,
                })
            }
            "register_webhook" => Ok(ToIntegrationMessage::RegisterWebhook),
            "unregister_webhook" => Ok(ToIntegrationMessage::UnregisterWebhook),
            other => Err(ServiceError::UnknownService(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("invalid service data: {0}")]
    InvalidData(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct AlarmServiceCall {
    entity_id: String,
    #[serde(default, deserialize_with = "deserialize_code")]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupServiceCall {
    entity_id: String,
    #[serde(deserialize_with = "deserialize_groups")]
    groups: Vec<u8>,
}

/// Accept a code given either as a string or as a number.
///
/// A keypad code of `0042` only survives as a string.
pub(crate) fn deserialize_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrInt;

    impl<'de> de::Visitor<'de> for StringOrInt {
        type Value = Option<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("string, integer, or null")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }
    }

    deserializer.deserialize_any(StringOrInt)
}

/// Accept a single group index or a list of them, numbers or numeric strings.
fn deserialize_groups<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    fn group<E: de::Error>(v: u64) -> Result<u8, E> {
        u8::try_from(v).map_err(|_| E::custom(format!("group index out of range: {v}")))
    }

    fn group_str<E: de::Error>(v: &str) -> Result<u8, E> {
        v.trim()
            .parse::<u8>()
            .map_err(|_| E::custom(format!("invalid group index: {v:?}")))
    }

    struct IntOrList;

    impl<'de> de::Visitor<'de> for IntOrList {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a group index or a list of group indexes")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(vec![group::<E>(v)?])
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            let v = u64::try_from(v).map_err(|_| E::custom(format!("negative group: {v}")))?;
            self.visit_u64(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(vec![group_str::<E>(v)?])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut groups = Vec::new();
            while let Some(value) = seq.next_element::<serde_json::Value>()? {
                let index = match value {
                    serde_json::Value::Number(n) => n
                        .as_u64()
                        .ok_or_else(|| de::Error::custom(format!("invalid group index: {n}")))
                        .and_then(group::<A::Error>)?,
                    serde_json::Value::String(s) => group_str::<A::Error>(&s)?,
                    other => {
                        return Err(de::Error::custom(format!("invalid group index: {other}")));
                    }
                };
                groups.push(index);
            }
            Ok(groups)
        }
    }

    deserializer.deserialize_any(IntOrList)
}
