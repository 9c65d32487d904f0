use std::error::Error;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::LastWill;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::MqttConfig;
use super::discovery::availability_topic;

/// Availability payloads on `{base_topic}/status`.
pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// A publish received on one of the bridge's command topics.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker connection used by the bridge.
///
/// Discovery configs, entity states and availability go out through
/// `publish`; commands come back through `poll_message`.
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Open the broker session with the offline last will armed.
    async fn connect(&mut self) -> Result<(), Box<dyn Error + Send>>;

    /// Listen on a command topic filter, kept across reconnects.
    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Next command publish, or `None` once the connection is gone.
    async fn poll_message(&mut self) -> Option<MqttMessage>;

    /// Close the session cleanly. The broker discards the last will, so
    /// callers publish [`OFFLINE`] first.
    async fn disconnect(&mut self) -> Result<(), Box<dyn Error + Send>>;
}

/// Records publishes and replays queued command messages.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub messages: Vec<MqttMessage>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>, bool)>,
    pub is_connected: bool,
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<(), Box<dyn Error + Send>> {
        self.is_connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), Box<dyn Error + Send>> {
        self.published
            .push((topic.to_string(), payload.to_vec(), retain));
        Ok(())
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        self.messages.pop()
    }

    async fn disconnect(&mut self) -> Result<(), Box<dyn Error + Send>> {
        self.is_connected = false;
        Ok(())
    }
}

#[cfg(test)]
impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command publish for `poll_message`.
    pub fn add_message(&mut self, topic: &str, payload: &[u8]) {
        self.messages.push(MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Last payload published on `topic`, as text
    pub fn last_published(&self, topic: &str) -> Option<(String, bool)> {
        self.published
            .iter()
            .rev()
            .find(|(t, _, _)| t == topic)
            .map(|(_, payload, retain)| (String::from_utf8_lossy(payload).into_owned(), *retain))
    }
}

/// Broker connection over rumqttc.
///
/// The event loop reconnects by itself; after every ConnAck the bridge
/// re-subscribes its command topics and marks itself online again, since
/// the broker published the last will when the old session dropped.
pub struct RumqttcClient {
    mqtt_options: MqttOptions,
    availability_topic: String,

    /// Set by `connect`
    client: Option<AsyncClient>,
    message_rx: Option<mpsc::UnboundedReceiver<MqttMessage>>,
    event_loop_task: Option<JoinHandle<()>>,

    subscriptions: Arc<Mutex<Vec<String>>>,
}

fn not_connected() -> Box<dyn Error + Send> {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "MQTT client not connected",
    ))
}

impl RumqttcClient {
    pub fn new(config: &MqttConfig) -> anyhow::Result<Self> {
        if config.client_id.is_empty() {
            anyhow::bail!("MQTT client id must not be empty");
        }

        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(30));

        // Anomaly attributes can get large on big installations
        mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

        // Subscribers see the bridge go offline if the connection drops
        let availability_topic = availability_topic(config);
        mqtt_options.set_last_will(LastWill::new(
            availability_topic.clone(),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        Ok(Self {
            mqtt_options,
            availability_topic,
            client: None,
            message_rx: None,
            event_loop_task: None,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<(), Box<dyn Error + Send>> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let resubscribe = client.clone();
        let subscriptions = self.subscriptions.clone();
        let availability_topic = self.availability_topic.clone();
        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                        };

                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("Connected to MQTT broker");
                        let topics = subscriptions
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        for topic in topics {
                            if let Err(e) = resubscribe.try_subscribe(&topic, QoS::AtLeastOnce) {
                                warn!("Failed to re-subscribe to {}: {}", topic, e);
                            }
                        }
                        if let Err(e) = resubscribe.try_publish(
                            &availability_topic,
                            QoS::AtLeastOnce,
                            true,
                            ONLINE,
                        ) {
                            warn!("Failed to publish availability: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            info!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        self.message_rx = Some(message_rx);
        self.event_loop_task = Some(task);

        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Box<dyn Error + Send>> {
        let client = self.client.as_ref().ok_or_else(not_connected)?;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), Box<dyn Error + Send>> {
        let client = self.client.as_ref().ok_or_else(not_connected)?;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;

        Ok(())
    }

    async fn poll_message(&mut self) -> Option<MqttMessage> {
        match &mut self.message_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn disconnect(&mut self) -> Result<(), Box<dyn Error + Send>> {
        if let Some(client) = self.client.take() {
            client
                .disconnect()
                .await
                .map_err(|e| Box::new(e) as Box<dyn Error + Send>)?;
        }
        Ok(())
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}
