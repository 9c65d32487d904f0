use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use super::event::Event;
use super::message::FromIntegrationMessage;
use super::message::ToIntegrationMessage;
use crate::config::Config;
use crate::webhooks::CloudRelay;
use crate::webhooks::WebhookRegistry;

/// Channel types for messages FROM integrations TO the engine
/// These are bounded channels to provide backpressure
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Channel types for messages FROM the engine TO integrations (unbounded - engine must not block)
pub type ToIntegrationSender = mpsc::UnboundedSender<ToIntegrationMessage>;

/// Result type for integration factory functions
///
/// A factory returns one integration per configured instance, or none.
pub type IntegrationFactoryResult = anyhow::Result<Vec<Box<dyn Integration>>>;

/// Everything a factory may need to build its integrations.
pub struct IntegrationContext<'a> {
    pub config: &'a Config,

    /// Handlers for `POST /api/webhook/{id}`
    pub webhooks: Arc<WebhookRegistry>,

    /// Relay service used when no direct external URL is configured
    pub cloud_relay: Option<Arc<dyn CloudRelay>>,
}

#[distributed_slice]
pub static REGISTRY: [fn(&IntegrationContext) -> IntegrationFactoryResult];

/// Integration trait that all integrations must implement
#[async_trait]
pub trait Integration: Send + Sync {
    /// Get the name/identifier of this integration
    fn name(&self) -> &str;

    /// Set up the integration: connect, create entities, start background tasks.
    ///
    /// `tx` reports discovery, state changes and bus events back to the engine.
    /// `events` receives everything the engine broadcasts.
    async fn setup(
        &mut self,
        tx: FromIntegrationSender,
        events: broadcast::Receiver<Event>,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Handle a command from the engine
    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>>;

    /// Shut down the integration gracefully
    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>>;
}
