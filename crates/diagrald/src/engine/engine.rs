use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::event::Event;
use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Integration;
use super::integration::IntegrationContext;
use super::integration::ToIntegrationSender;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use super::state::State;

/// diagrald engine
///
/// Routes commands to the integration owning an entity, keeps a view of the
/// world in [`State`], and rebroadcasts everything integrations report on the
/// event bus.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: ArcSwap<State>,

    /// Map of entity_id -> integration name for routing messages
    entity_integration_map: std::sync::Mutex<HashMap<String, String>>,

    /// Communication channels to integrations (for commands)
    integration_channels: std::sync::Mutex<HashMap<String, ToIntegrationSender>>,

    /// Receive messages from integrations (events)
    message_rx: Mutex<FromIntegrationReceiver>,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    /// Event bus every integration listens on
    events: broadcast::Sender<Event>,

    /// Handles for integration tasks
    integration_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

/// Events a slow bus subscriber may fall behind by before it starts losing them
const EVENT_BUS_CAPACITY: usize = 256;

/// How long integrations get to tear down on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no integration found for entity: {0}")]
    UnknownEntity(String),

    #[error("integration not found: {0}")]
    UnknownIntegration(String),

    #[error("command is not addressed to an entity")]
    NotEntityScoped,

    #[error("integration {0} is no longer running")]
    Closed(String),
}

impl Engine {
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            state: ArcSwap::new(Arc::default()),
            entity_integration_map: std::sync::Mutex::new(HashMap::new()),
            integration_channels: std::sync::Mutex::new(HashMap::new()),
            message_rx: Mutex::new(message_rx),
            message_tx,
            events,
            integration_handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Build and register every integration enabled in the configuration.
    ///
    /// A factory failing is logged and does not stop the others.
    pub fn register_integrations_from_config(&mut self, ctx: &IntegrationContext) {
        for constr in super::integration::REGISTRY {
            let integrations = match constr(ctx) {
                Ok(integrations) => integrations,
                Err(e) => {
                    error!("failed to setup integration: {:#}", e);
                    continue;
                }
            };

            for integration in integrations {
                self.register_integration(integration);
            }
        }
    }

    /// Register an integration with the engine
    ///
    /// This spawns the integration in a background task, wires up channels,
    /// and starts its setup process.
    pub fn register_integration(&mut self, mut integration: Box<dyn Integration>) {
        let name = integration.name().to_string();
        let (to_integration_tx, mut to_integration_rx) = mpsc::unbounded_channel();
        let from_integration_tx = self.message_tx.clone();

        // Subscribe before spawning so nothing broadcast after registration is missed
        let events = self.events.subscribe();

        lock(&self.integration_channels).insert(name.clone(), to_integration_tx);

        let handle = tokio::spawn(async move {
            info!("[{}] Setting up", name);
            if let Err(e) = integration.setup(from_integration_tx, events).await {
                error!("[{}] Setup failed: {}", name, e);
                return;
            }

            while let Some(msg) = to_integration_rx.recv().await {
                if let Err(e) = integration.handle_message(msg).await {
                    warn!("[{}] Failed to handle message: {}", name, e);
                }
            }

            if let Err(e) = integration.shutdown().await {
                warn!("[{}] Shutdown failed: {}", name, e);
            }
            info!("[{}] Stopped", name);
        });

        lock(&self.integration_handles).push(handle);
    }

    /// Send a command to the integration owning the entity it targets.
    pub fn send_command(&self, msg: ToIntegrationMessage) -> Result<(), RoutingError> {
        let entity_id = msg.entity_id().ok_or(RoutingError::NotEntityScoped)?;

        let integration_name = lock(&self.entity_integration_map)
            .get(entity_id)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownEntity(entity_id.to_string()))?;

        self.send_to_integration(&integration_name, msg)
    }

    /// Send a command to an integration by name.
    pub fn send_to_integration(
        &self,
        name: &str,
        msg: ToIntegrationMessage,
    ) -> Result<(), RoutingError> {
        let channels = lock(&self.integration_channels);
        let tx = channels
            .get(name)
            .ok_or_else(|| RoutingError::UnknownIntegration(name.to_string()))?;

        tx.send(msg)
            .map_err(|_| RoutingError::Closed(name.to_string()))
    }

    /// Names of every registered integration.
    pub fn integration_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.integration_channels).keys().cloned().collect();
        names.sort();
        names
    }

    /// Listen on the event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Run the engine's main event loop
    ///
    /// Processes incoming messages from integrations until every sender is gone.
    pub async fn run(&self) {
        info!("Engine starting");

        let mut rx = self.message_rx.lock().await;
        while let Some(msg) = rx.recv().await {
            self.handle_event(msg);
        }

        info!("Engine shutting down");
    }

    /// Stop every integration and wait for their teardown.
    pub async fn shutdown(&self) {
        // Dropping the senders ends each integration's command loop
        lock(&self.integration_channels).clear();

        let handles: Vec<_> = lock(&self.integration_handles).drain(..).collect();
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Integration task failed: {}", e),
                Err(_) => warn!("Integration did not stop within {:?}", SHUTDOWN_TIMEOUT),
            }
        }
    }

    /// Get a snapshot of the current engine state.
    ///
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    fn update_state(&self, f: impl FnOnce(&mut State)) {
        let mut state = State::clone(&self.state.load());
        f(&mut state);
        self.state.store(Arc::new(state));
    }

    fn broadcast(&self, event: Event) {
        // No receivers is fine: nobody is listening yet
        let _ = self.events.send(event);
    }

    /// Handle a message from an integration
    fn handle_event(&self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::EntityDiscovered {
                descriptor,
                integration_name,
            } => {
                info!(
                    "Entity discovered: {} (from {})",
                    descriptor.entity_id, integration_name
                );

                lock(&self.entity_integration_map)
                    .insert(descriptor.entity_id.clone(), integration_name);

                let descriptor = Arc::new(descriptor);
                self.update_state(|state| {
                    state
                        .devices
                        .insert(descriptor.device.id(), descriptor.device.clone());
                    state
                        .entities
                        .insert(descriptor.entity_id.clone(), descriptor.as_ref().clone());
                });

                self.broadcast(Event::EntityDiscovered { descriptor });
            }
            FromIntegrationMessage::EntityRemoved { entity_id } => {
                info!("Entity removed: {}", entity_id);

                self.update_state(|state| {
                    state.entities.remove(&entity_id);
                    state.states.remove(&entity_id);
                });
                lock(&self.entity_integration_map).remove(&entity_id);

                self.broadcast(Event::EntityRemoved { entity_id });
            }
            FromIntegrationMessage::StateChanged { entity_id, state } => {
                let previous = self.state.load().states.get(&entity_id).cloned();
                if previous.as_ref() == Some(&state) {
                    debug!("State of {} unchanged", entity_id);
                    return;
                }

                info!("State changed: {} -> {}", entity_id, state.value());
                self.update_state(|s| {
                    s.states.insert(entity_id.clone(), state.clone());
                });

                self.broadcast(Event::StateChanged { entity_id, state });
            }
            FromIntegrationMessage::DeviceUpdated { device } => {
                info!(
                    "Device updated: {} (sw_version {:?})",
                    device.name, device.sw_version
                );

                self.update_state(|state| {
                    for descriptor in state.entities.values_mut() {
                        if descriptor.device.identifiers == device.identifiers {
                            descriptor.device = device.clone();
                        }
                    }
                    state.devices.insert(device.id(), device.clone());
                });

                self.broadcast(Event::DeviceUpdated { device });
            }
            FromIntegrationMessage::FireEvent { event_type, data } => {
                debug!("Event fired: {} {}", event_type, data);
                self.broadcast(Event::Fired { event_type, data });
            }
            FromIntegrationMessage::Command(msg) => {
                if let Err(e) = self.send_command(msg) {
                    warn!("Failed to route command: {}", e);
                }
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a std mutex, ignoring poisoning (the maps stay consistent per operation).
fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::AlarmAction;
    use crate::engine::Device;
    use crate::engine::EntityDescriptor;
    use crate::engine::EntityKind;
    use crate::engine::EntityState;
    use crate::engine::SensorState;

    /// Integration that discovers one sensor and forwards commands to the test.
    struct Fixture {
        commands: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Integration for Fixture {
        fn name(&self) -> &str {
            "fixture"
        }

        async fn setup(
            &mut self,
            tx: FromIntegrationSender,
            _events: broadcast::Receiver<Event>,
        ) -> Result<(), Box<dyn Error + Send>> {
            let descriptor = EntityDescriptor::new(
                EntityKind::Sensor,
                "fixture",
                "fixture_1".to_string(),
                Device::new("Fixture"),
            );
            tx.send(FromIntegrationMessage::EntityDiscovered {
                descriptor,
                integration_name: "fixture".to_string(),
            })
            .await
            .ok();
            Ok(())
        }

        async fn handle_message(
            &mut self,
            msg: ToIntegrationMessage,
        ) -> Result<(), Box<dyn Error + Send>> {
            self.commands.send(format!("{:?}", msg)).ok();
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
            self.commands.send("shutdown".to_string()).ok();
            Ok(())
        }
    }

    fn sensor(value: u32) -> EntityState {
        EntityState::Sensor(SensorState {
            value: serde_json::json!(value),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_state_changes_are_stored_and_broadcast() {
        let engine = Arc::new(Engine::new());
        let mut events = engine.subscribe();

        engine.handle_event(FromIntegrationMessage::StateChanged {
            entity_id: "sensor.anomalies".to_string(),
            state: sensor(2),
        });

        assert_eq!(
            engine.state_snapshot().states.get("sensor.anomalies"),
            Some(&sensor(2))
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::StateChanged { ref entity_id, .. } if entity_id == "sensor.anomalies"
        ));

        // Identical state is not rebroadcast
        engine.handle_event(FromIntegrationMessage::StateChanged {
            entity_id: "sensor.anomalies".to_string(),
            state: sensor(2),
        });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_commands_route_to_owning_integration() {
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new();
        engine.register_integration(Box::new(Fixture {
            commands: commands_tx,
        }));
        let engine = Arc::new(engine);

        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        // Wait for the discovery to be processed
        let mut events = engine.subscribe();
        loop {
            if engine.state_snapshot().entities.contains_key("sensor.fixture") {
                break;
            }
            tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .ok();
        }

        engine
            .send_command(ToIntegrationMessage::AlarmCommand {
                entity_id: "sensor.fixture".to_string(),
                action: AlarmAction::Disarm,
                code: None,
            })
            .unwrap();
        assert!(commands_rx.recv().await.unwrap().contains("Disarm"));

        assert!(matches!(
            engine.send_command(ToIntegrationMessage::ArmGroups {
                entity_id: "sensor.unknown".to_string(),
                groups: vec![1],
            }),
            Err(RoutingError::UnknownEntity(_))
        ));
        assert!(matches!(
            engine.send_command(ToIntegrationMessage::RegisterWebhook),
            Err(RoutingError::NotEntityScoped)
        ));

        engine.shutdown().await;
        assert_eq!(commands_rx.recv().await.as_deref(), Some("shutdown"));
        runner.abort();
    }
}
