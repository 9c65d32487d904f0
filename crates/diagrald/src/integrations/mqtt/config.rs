use crate::config::PartialMqttConfig;
use crate::config::ValidationError;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_CLIENT_ID: &str = "diagrald";
const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
const DEFAULT_BASE_TOPIC: &str = "diagrald";

/// Configuration for the MQTT bridge
#[derive(Debug, Clone)]
pub struct Config {
    /// MQTT broker hostname or IP address
    pub broker: String,

    pub port: u16,

    pub client_id: String,

    /// Prefix Home Assistant watches for discovery configs (default: "homeassistant")
    pub discovery_prefix: String,

    /// Root of the state, attribute, command and event topics (default: "diagrald")
    pub base_topic: String,

    pub username: Option<String>,

    pub password: Option<String>,
}

impl Config {
    pub fn from_partial(partial: PartialMqttConfig) -> Result<Self, Vec<ValidationError>> {
        let broker = match partial.broker {
            Some(b) if !b.get_ref().trim().is_empty() => b.into_inner(),
            Some(b) => {
                return Err(vec![ValidationError::new(
                    "integrations.mqtt.broker",
                    "broker must not be empty",
                )
                .at(b.span(), &partial.source)]);
            }
            None => {
                return Err(vec![ValidationError::new(
                    "integrations.mqtt.broker",
                    "broker is required",
                )]);
            }
        };

        let base_topic = partial
            .base_topic
            .map(|t| t.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_TOPIC.to_string());

        Ok(Self {
            broker,
            port: partial.port.unwrap_or(DEFAULT_PORT),
            client_id: partial
                .client_id
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            discovery_prefix: partial
                .discovery_prefix
                .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
            base_topic,
            username: partial.username,
            password: partial.password,
        })
    }
}
