use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::MqttConfig;
use super::client::MqttClient;
use super::client::MqttMessage;
use super::client::OFFLINE;
use super::client::ONLINE;
use super::discovery::AlarmCommandPayload;
use super::discovery::DiscoveryMessage;
use super::discovery::EntityTopics;
use super::discovery::availability_topic;
use super::discovery::event_topic;
use super::discovery::parse_command_topic;
use crate::engine::Device;
use crate::engine::EntityDescriptor;
use crate::engine::EntityState;
use crate::engine::Event;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::ToIntegrationMessage;
use crate::integrations::diagral::DOMAIN;
use crate::integrations::diagral::EVENT_TYPE;

/// An entity announced on the broker
#[derive(Debug, Clone)]
struct Published {
    descriptor: Arc<EntityDescriptor>,
    topics: EntityTopics,
}

/// Type alias for the shared map of announced entities, keyed by entity id
type PublishedMap = Arc<Mutex<HashMap<String, Published>>>;

fn invalid_data(message: impl Into<String>) -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message.into(),
    ))
}

/// MQTT bridge for diagrald
///
/// Mirrors the engine's entities to an MQTT broker using Home Assistant
/// discovery, and turns messages on the alarm panels' command topics back
/// into engine commands.
pub struct MqttIntegration<C: MqttClient> {
    client: Arc<Mutex<C>>,
    config: MqttConfig,
    published: PublishedMap,
    /// Bus listener and command poller
    tasks: Vec<JoinHandle<()>>,
}

impl<C: MqttClient + 'static> MqttIntegration<C> {
    /// Create a new MQTT integration
    pub fn new(client: C, config: &MqttConfig) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            config: config.clone(),
            published: Arc::new(Mutex::new(HashMap::new())),
            tasks: Vec::new(),
        }
    }

    /// Forward bus events to the broker until the bus closes
    async fn process_events_task(
        client: Arc<Mutex<C>>,
        config: MqttConfig,
        published: PublishedMap,
        mut events: broadcast::Receiver<Event>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) =
                        Self::handle_event_static(&event, &client, &config, &published).await
                    {
                        warn!("Error publishing bus event to MQTT: {}", e);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("MQTT bridge fell behind, {} bus events dropped", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("MQTT bus listener exiting");
    }

    /// Process incoming MQTT messages in a background task
    async fn process_messages_task(
        client: Arc<Mutex<C>>,
        config: MqttConfig,
        published: PublishedMap,
        to_engine: FromIntegrationSender,
    ) {
        loop {
            // Short lock hold time so the bus listener can publish in between
            let msg = {
                let mut client_guard = client.lock().await;
                tokio::time::timeout(
                    std::time::Duration::from_millis(100),
                    client_guard.poll_message(),
                )
                .await
                .unwrap_or_default()
            };

            match msg {
                Some(msg) => {
                    debug!("Received message on topic: {}", msg.topic);
                    if let Err(e) =
                        Self::handle_command_static(&msg, &config, &published, &to_engine).await
                    {
                        warn!("Ignoring MQTT command on {}: {}", msg.topic, e);
                    }
                }
                None => {
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn handle_event_static(
        event: &Event,
        client: &Arc<Mutex<C>>,
        config: &MqttConfig,
        published: &PublishedMap,
    ) -> Result<(), Box<dyn Error + Send>> {
        match event {
            Event::EntityDiscovered { descriptor } => {
                Self::publish_discovery_static(descriptor.clone(), client, config, published).await
            }
            Event::StateChanged { entity_id, state } => {
                Self::publish_state_static(entity_id, state, client, published).await
            }
            Event::DeviceUpdated { device } => {
                Self::handle_device_update_static(device, client, config, published).await
            }
            Event::EntityRemoved { entity_id } => {
                let removed = published.lock().await.remove(entity_id);
                if let Some(entity) = removed {
                    // An empty retained config removes the entity on the other side
                    let mut client_guard = client.lock().await;
                    client_guard.publish(&entity.topics.config, b"", true).await?;
                    info!("Withdrew {} from MQTT discovery", entity_id);
                }
                Ok(())
            }
            Event::Fired { event_type, data } if event_type == EVENT_TYPE => {
                Self::publish_alarm_event_static(data, client, config).await
            }
            Event::Fired { event_type, .. } => {
                debug!("Not forwarding bus event {}", event_type);
                Ok(())
            }
        }
    }

    /// Announce (or re-announce) an entity with a retained discovery config
    async fn publish_discovery_static(
        descriptor: Arc<EntityDescriptor>,
        client: &Arc<Mutex<C>>,
        config: &MqttConfig,
        published: &PublishedMap,
    ) -> Result<(), Box<dyn Error + Send>> {
        let topics = EntityTopics::new(config, &descriptor);
        let message = DiscoveryMessage::new(config, &descriptor, &topics);
        let payload = serde_json::to_vec(&message).map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

        // Insert before publishing so a command arriving right after the
        // config finds its entity.
        published.lock().await.insert(
            descriptor.entity_id.clone(),
            Published {
                descriptor: descriptor.clone(),
                topics: topics.clone(),
            },
        );

        {
            let mut client_guard = client.lock().await;
            client_guard.publish(&topics.config, &payload, true).await?;
        }

        info!(
            "Published discovery for {} on {}",
            descriptor.entity_id, topics.config
        );
        Ok(())
    }

    async fn publish_state_static(
        entity_id: &str,
        state: &EntityState,
        client: &Arc<Mutex<C>>,
        published: &PublishedMap,
    ) -> Result<(), Box<dyn Error + Send>> {
        let topics = match published.lock().await.get(entity_id) {
            Some(entity) => entity.topics.clone(),
            None => {
                debug!("State for unannounced entity {}", entity_id);
                return Ok(());
            }
        };

        let mut attributes = state.attributes().clone();
        if let EntityState::AlarmControlPanel(panel) = state {
            attributes.insert("changed_by".to_string(), json!(panel.changed_by));
        }
        let attributes =
            serde_json::to_vec(&attributes).map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

        let mut client_guard = client.lock().await;
        client_guard
            .publish(&topics.state, state.value().as_bytes(), true)
            .await?;
        client_guard
            .publish(&topics.attributes, &attributes, true)
            .await?;
        Ok(())
    }

    /// Re-announce every entity of a device whose metadata changed
    async fn handle_device_update_static(
        device: &Device,
        client: &Arc<Mutex<C>>,
        config: &MqttConfig,
        published: &PublishedMap,
    ) -> Result<(), Box<dyn Error + Send>> {
        let device_id = device.id();
        let updated: Vec<Arc<EntityDescriptor>> = published
            .lock()
            .await
            .values()
            .filter(|entity| entity.descriptor.device.id() == device_id)
            .map(|entity| {
                let mut descriptor = (*entity.descriptor).clone();
                descriptor.device = device.clone();
                Arc::new(descriptor)
            })
            .collect();

        for descriptor in updated {
            Self::publish_discovery_static(descriptor, client, config, published).await?;
        }
        Ok(())
    }

    /// `{"type": ..., "data": {...}}` as fired by the alarm integration
    async fn publish_alarm_event_static(
        data: &Value,
        client: &Arc<Mutex<C>>,
        config: &MqttConfig,
    ) -> Result<(), Box<dyn Error + Send>> {
        let node_id = match data
            .pointer("/data/transmitter_id")
            .and_then(Value::as_str)
        {
            Some(serial) => format!("{}_{}", DOMAIN, serial),
            None => DOMAIN.to_string(),
        };
        let topic = event_topic(config, &node_id);
        let payload = serde_json::to_vec(data).map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

        let mut client_guard = client.lock().await;
        client_guard.publish(&topic, &payload, false).await?;
        debug!("Forwarded {} to {}", EVENT_TYPE, topic);
        Ok(())
    }

    /// Turn a message on an alarm panel command topic into an engine command
    async fn handle_command_static(
        msg: &MqttMessage,
        config: &MqttConfig,
        published: &PublishedMap,
        to_engine: &FromIntegrationSender,
    ) -> Result<(), Box<dyn Error + Send>> {
        let (node_id, object_id) = parse_command_topic(&msg.topic, &config.base_topic)
            .ok_or_else(|| invalid_data("not a command topic"))?;

        let entity_id = published
            .lock()
            .await
            .values()
            .find(|entity| entity.topics.command.as_deref() == Some(msg.topic.as_str()))
            .map(|entity| entity.descriptor.entity_id.clone())
            .ok_or_else(|| invalid_data(format!("no alarm panel {}/{}", node_id, object_id)))?;

        let payload = AlarmCommandPayload::parse(&msg.payload)
            .ok_or_else(|| invalid_data("empty command payload"))?;
        let action = payload
            .action()
            .ok_or_else(|| invalid_data(format!("unknown action '{}'", payload.action)))?;

        info!("MQTT command {} for {}", action, entity_id);
        let command = ToIntegrationMessage::AlarmCommand {
            entity_id,
            action,
            code: payload.code(),
        };
        to_engine
            .send(FromIntegrationMessage::Command(command))
            .await
            .map_err(|e| invalid_data(e.to_string()))
    }

    async fn diagnostics(&self) -> Value {
        let mut entities: Vec<String> = self.published.lock().await.keys().cloned().collect();
        entities.sort();

        json!({
            "broker": self.config.broker,
            "port": self.config.port,
            "client_id": self.config.client_id,
            "discovery_prefix": self.config.discovery_prefix,
            "base_topic": self.config.base_topic,
            "entities": entities,
        })
    }
}

#[async_trait]
impl<C: MqttClient + 'static> Integration for MqttIntegration<C> {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn setup(
        &mut self,
        tx: FromIntegrationSender,
        events: broadcast::Receiver<Event>,
    ) -> Result<(), Box<dyn Error + Send>> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            self.config.broker, self.config.port
        );

        let command_topics = format!("{}/+/+/set", self.config.base_topic);
        {
            let mut client = self.client.lock().await;
            client.connect().await?;
            client
                .publish(&availability_topic(&self.config), ONLINE.as_bytes(), true)
                .await?;
            client.subscribe(&command_topics).await?;
        }
        info!("MQTT bridge online, listening on {}", command_topics);

        self.tasks.push(tokio::spawn(Self::process_events_task(
            self.client.clone(),
            self.config.clone(),
            self.published.clone(),
            events,
        )));
        self.tasks.push(tokio::spawn(Self::process_messages_task(
            self.client.clone(),
            self.config.clone(),
            self.published.clone(),
            tx,
        )));

        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        match msg {
            ToIntegrationMessage::Diagnostics { reply } => {
                let _ = reply.send(self.diagnostics().await);
            }
            other => {
                warn!("MQTT bridge does not handle {:?}", other);
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        info!("MQTT integration shutting down");
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let mut client = self.client.lock().await;
        client
            .publish(&availability_topic(&self.config), OFFLINE.as_bytes(), true)
            .await?;
        client.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio::sync::oneshot;

    use super::*;
    use crate::engine::AlarmAction;
    use crate::engine::AlarmPanelState;
    use crate::engine::AlarmState;
    use crate::engine::EntityKind;
    use crate::integrations::mqtt::client::MockMqttClient;

    type Bridge = MqttIntegration<MockMqttClient>;

    fn config() -> MqttConfig {
        MqttConfig {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "test".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            base_topic: "diagrald".to_string(),
            username: None,
            password: None,
        }
    }

    fn device(sw_version: &str) -> Device {
        let mut device = Device::new("Maison");
        device.identifiers = vec![("diagral".to_string(), "1A2B3C4D".to_string())];
        device.sw_version = Some(sw_version.to_string());
        device
    }

    fn panel() -> Arc<EntityDescriptor> {
        let mut descriptor = EntityDescriptor::new(
            EntityKind::AlarmControlPanel,
            "home",
            "home_diagral_1A2B3C4D_alarm_control_panel".to_string(),
            device("2.1.0"),
        );
        descriptor.code_disarm_required = true;
        Arc::new(descriptor)
    }

    async fn announce(bridge: &Bridge) {
        Bridge::handle_event_static(
            &Event::EntityDiscovered { descriptor: panel() },
            &bridge.client,
            &bridge.config,
            &bridge.published,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_setup_goes_online_and_subscribes() {
        let mut bridge = Bridge::new(MockMqttClient::new(), &config());
        let (tx, _rx) = mpsc::channel(8);
        let (_events_tx, events) = broadcast::channel(8);

        bridge.setup(tx, events).await.unwrap();

        {
            let client = bridge.client.lock().await;
            assert!(client.is_connected);
            assert_eq!(client.subscriptions, ["diagrald/+/+/set"]);
            assert_eq!(
                client.last_published("diagrald/status"),
                Some(("online".to_string(), true))
            );
        }

        bridge.shutdown().await.unwrap();
        let client = bridge.client.lock().await;
        assert!(!client.is_connected);
        assert_eq!(
            client.last_published("diagrald/status"),
            Some(("offline".to_string(), true))
        );
    }

    #[tokio::test]
    async fn test_discovery_and_state_are_retained() {
        let bridge = Bridge::new(MockMqttClient::new(), &config());
        announce(&bridge).await;

        let state = EntityState::AlarmControlPanel(AlarmPanelState {
            state: AlarmState::ArmedAway,
            changed_by: Some("Keypad".to_string()),
            ..Default::default()
        });
        Bridge::handle_event_static(
            &Event::StateChanged {
                entity_id: "alarm_control_panel.home".to_string(),
                state,
            },
            &bridge.client,
            &bridge.config,
            &bridge.published,
        )
        .await
        .unwrap();

        let client = bridge.client.lock().await;
        let (config, retained) = client
            .last_published("homeassistant/alarm_control_panel/diagral_1A2B3C4D/home/config")
            .unwrap();
        assert!(retained);
        let config: Value = serde_json::from_str(&config).unwrap();
        assert_eq!(config["code"], "REMOTE_CODE");

        assert_eq!(
            client.last_published("diagrald/diagral_1A2B3C4D/home/state"),
            Some(("armed_away".to_string(), true))
        );
        let (attributes, _) = client
            .last_published("diagrald/diagral_1A2B3C4D/home/attributes")
            .unwrap();
        assert_eq!(attributes, r#"{"changed_by":"Keypad"}"#);
    }

    #[tokio::test]
    async fn test_device_update_and_removal() {
        let bridge = Bridge::new(MockMqttClient::new(), &config());
        announce(&bridge).await;
        let topic = "homeassistant/alarm_control_panel/diagral_1A2B3C4D/home/config";

        Bridge::handle_event_static(
            &Event::DeviceUpdated {
                device: device("2.2.0"),
            },
            &bridge.client,
            &bridge.config,
            &bridge.published,
        )
        .await
        .unwrap();
        {
            let client = bridge.client.lock().await;
            let (config, _) = client.last_published(topic).unwrap();
            let config: Value = serde_json::from_str(&config).unwrap();
            assert_eq!(config["device"]["sw_version"], "2.2.0");
        }

        Bridge::handle_event_static(
            &Event::EntityRemoved {
                entity_id: "alarm_control_panel.home".to_string(),
            },
            &bridge.client,
            &bridge.config,
            &bridge.published,
        )
        .await
        .unwrap();
        let client = bridge.client.lock().await;
        assert_eq!(client.last_published(topic), Some((String::new(), true)));
        assert!(bridge.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_alarm_events_forwarded() {
        let bridge = Bridge::new(MockMqttClient::new(), &config());
        let data = json!({"type": "ALERT", "data": {"transmitter_id": "1A2B3C4D", "alarm_code": 1130}});

        Bridge::handle_event_static(
            &Event::Fired {
                event_type: EVENT_TYPE.to_string(),
                data: data.clone(),
            },
            &bridge.client,
            &bridge.config,
            &bridge.published,
        )
        .await
        .unwrap();
        Bridge::handle_event_static(
            &Event::Fired {
                event_type: "OTHER".to_string(),
                data: json!({}),
            },
            &bridge.client,
            &bridge.config,
            &bridge.published,
        )
        .await
        .unwrap();

        let client = bridge.client.lock().await;
        assert_eq!(client.published.len(), 1);
        let (payload, retained) = client
            .last_published("diagrald/diagral_1A2B3C4D/event")
            .unwrap();
        assert!(!retained);
        assert_eq!(serde_json::from_str::<Value>(&payload).unwrap(), data);
    }

    #[tokio::test]
    async fn test_command_topic_becomes_engine_command() {
        let bridge = Bridge::new(MockMqttClient::new(), &config());
        announce(&bridge).await;
        let (tx, mut rx) = mpsc::channel(8);

        let msg = MqttMessage {
            topic: "diagrald/diagral_1A2B3C4D/home/set".to_string(),
            payload: br#"{"action": "DISARM", "code": "1234"}"#.to_vec(),
        };
        Bridge::handle_command_static(&msg, &bridge.config, &bridge.published, &tx)
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            FromIntegrationMessage::Command(ToIntegrationMessage::AlarmCommand {
                entity_id,
                action,
                code,
            }) => {
                assert_eq!(entity_id, "alarm_control_panel.home");
                assert_eq!(action, AlarmAction::Disarm);
                assert_eq!(code.as_deref(), Some("1234"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let unknown = MqttMessage {
            topic: "diagrald/diagral_FFFF/home/set".to_string(),
            payload: b"DISARM".to_vec(),
        };
        assert!(
            Bridge::handle_command_static(&unknown, &bridge.config, &bridge.published, &tx)
                .await
                .is_err()
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_diagnostics_lists_entities() {
        let mut bridge = Bridge::new(MockMqttClient::new(), &config());
        announce(&bridge).await;

        let (reply, response) = oneshot::channel();
        bridge
            .handle_message(ToIntegrationMessage::Diagnostics { reply })
            .await
            .unwrap();
        let diagnostics = response.await.unwrap();
        assert_eq!(diagnostics["entities"], json!(["alarm_control_panel.home"]));
        assert_eq!(diagnostics["broker"], "localhost");
    }
}
