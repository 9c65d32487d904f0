//! Push notifications from the Diagral cloud.
//!
//! [`WebhookManager`] keeps the vendor-side subscription pointed at this
//! daemon; [`NotificationHandler`] turns incoming bodies into dispatcher
//! signals, bus events and coordinator refreshes.

use std::sync::Arc;

use diagral_client::AlarmType;
use diagral_client::DiagralApi;
use diagral_client::DiagralError;
use diagral_client::Webhook;
use diagral_client::WebhookNotification;
use diagral_client::WebhookSubscription;
use reqwest::Url;
use serde_json::json;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::coordinator::CoordinatorData;
use super::coordinator::CoordinatorHandle;
use crate::config::HttpConfig;
use crate::engine::Dispatcher;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::webhooks::CloudRelay;
use crate::webhooks::RelayError;
use crate::webhooks::WebhookReceiver;
use crate::webhooks::WebhookRegistry;
use crate::webhooks::generate_webhook_id;
use crate::webhooks::resolve_external_url;
use crate::webhooks::webhook_url;

/// Bus event fired for every notification.
pub const EVENT_TYPE: &str = "DIAGRAL_EVENT";

/// Dispatcher signal carrying notifications of `alarm_type`.
pub fn signal_name(alarm_type: AlarmType) -> String {
    format!("signal-diagral-webhook-{}", alarm_type)
}

/// Payload of dispatcher signals.
#[derive(Debug, Clone)]
pub struct WebhookSignal {
    pub alarm_type: AlarmType,
    pub notification: WebhookNotification,
}

impl WebhookSignal {
    /// `{"type": ..., "data": ...}`
    pub fn to_value(&self) -> serde_json::Value {
        json!({
            "type": self.alarm_type,
            "data": self.notification.event_data(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("cloud relay selected but not available")]
    NoRelay,

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Api(#[from] DiagralError),
}

/// A webhook currently subscribed with the vendor.
#[derive(Debug, Clone)]
pub struct ActiveWebhook {
    pub webhook_id: String,
    pub url: Url,
    pub is_relay: bool,
}

fn same_origin(existing: &str, target: &Url) -> bool {
    Url::parse(existing)
        .map(|existing| {
            existing.scheme() == target.scheme()
                && existing.host_str() == target.host_str()
                && existing.port_or_known_default() == target.port_or_known_default()
        })
        .unwrap_or(false)
}

/// Point the vendor subscription at `target`, reusing an existing one.
pub async fn negotiate(api: &dyn DiagralApi, target: &Url) -> Result<Webhook, DiagralError> {
    match api.get_webhook().await {
        Ok(existing) => {
            if same_origin(&existing.webhook_url, target) {
                info!(
                    "Webhook already registered on {}, updating URL to {}",
                    existing.webhook_url, target
                );
            } else {
                warn!(
                    "A webhook subscription already exists for another URL ({}), overwriting with {}",
                    existing.webhook_url, target
                );
            }
            api.update_webhook(target.as_str(), WebhookSubscription::ALL)
                .await
        }
        Err(e) if e.is_no_subscription() => {
            let webhook = api
                .register_webhook(target.as_str(), WebhookSubscription::ALL)
                .await?;
            info!("Webhook created on {}", target);
            Ok(webhook)
        }
        Err(e) => Err(e),
    }
}

pub struct WebhookManager {
    name: String,
    api: Arc<dyn DiagralApi>,
    http: HttpConfig,
    registry: Arc<WebhookRegistry>,
    relay: Option<Arc<dyn CloudRelay>>,
}

impl WebhookManager {
    pub fn new(
        name: impl Into<String>,
        api: Arc<dyn DiagralApi>,
        http: HttpConfig,
        registry: Arc<WebhookRegistry>,
        relay: Option<Arc<dyn CloudRelay>>,
    ) -> Self {
        Self {
            name: name.into(),
            api,
            http,
            registry,
            relay,
        }
    }

    /// Subscribe a fresh webhook id with the vendor and start listening on it.
    ///
    /// `Ok(None)` when no usable external URL exists.
    pub async fn register(&self) -> Result<Option<(ActiveWebhook, WebhookReceiver)>, WebhookError> {
        let Some(external) = resolve_external_url(&self.http) else {
            error!(
                "[{}] No external https URL available, webhook will not be created",
                self.name
            );
            return Ok(None);
        };

        let webhook_id = generate_webhook_id();
        let url = if external.is_relay {
            let relay = self.relay.as_ref().ok_or(WebhookError::NoRelay)?;
            relay.get_or_create_hook(&webhook_id).await?
        } else {
            webhook_url(&external.url, &webhook_id)
        };
        debug!("[{}] Selected webhook URL {}", self.name, url);

        if let Err(e) = negotiate(self.api.as_ref(), &url).await {
            if external.is_relay {
                self.release_relay_hook(&webhook_id).await;
            }
            return Err(e.into());
        }

        let rx = self.registry.register(&webhook_id);
        info!("[{}] Webhook registered", self.name);

        Ok(Some((
            ActiveWebhook {
                webhook_id,
                url,
                is_relay: external.is_relay,
            },
            rx,
        )))
    }

    /// Delete the vendor subscription and stop listening.
    pub async fn unregister(&self, webhook: &ActiveWebhook) {
        match self.api.delete_webhook().await {
            Ok(()) => info!("[{}] Webhook deleted", self.name),
            Err(e) => error!("[{}] Failed to delete webhook: {}", self.name, e),
        }

        if webhook.is_relay {
            self.release_relay_hook(&webhook.webhook_id).await;
        }
        self.registry.unregister(&webhook.webhook_id);
    }

    async fn release_relay_hook(&self, webhook_id: &str) {
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.release_hook(webhook_id).await {
                warn!("[{}] Failed to release relay hook: {}", self.name, e);
            }
        }
    }
}

/// Fill in device label and group name from cached data.
pub fn enrich(notification: &mut WebhookNotification, data: &CoordinatorData) {
    if let (Some(device_type), Some(index)) = (
        notification.detail.device_type.as_deref(),
        notification.detail.device_index,
    ) {
        if let Some(label) = data.devices.label(device_type, index) {
            notification.detail.device_label = Some(label.to_string());
        }
    }

    if let Some(group) = notification.group_index {
        if let Some(name) = data.configuration.group_name(group) {
            notification.group_name = Some(name.to_string());
        }
    }
}

pub struct NotificationHandler {
    name: String,
    dispatcher: Arc<Dispatcher<WebhookSignal>>,
    coordinator: CoordinatorHandle,
    to_engine: FromIntegrationSender,
}

impl NotificationHandler {
    pub fn new(
        name: impl Into<String>,
        dispatcher: Arc<Dispatcher<WebhookSignal>>,
        coordinator: CoordinatorHandle,
        to_engine: FromIntegrationSender,
    ) -> Self {
        Self {
            name: name.into(),
            dispatcher,
            coordinator,
            to_engine,
        }
    }

    pub async fn handle(&self, body: &[u8]) {
        let mut notification = match WebhookNotification::from_slice(body) {
            Ok(notification) => notification,
            Err(e) => {
                error!("[{}] Received invalid JSON data from webhook: {}", self.name, e);
                return;
            }
        };
        let alarm_type = notification.alarm_type;
        debug!("[{}] Webhook notification: {:?}", self.name, notification);

        if matches!(alarm_type, AlarmType::Status | AlarmType::Anomaly) {
            self.coordinator.request_refresh();
        }

        if matches!(alarm_type, AlarmType::Alert | AlarmType::Anomaly) {
            if let Some(data) = self.coordinator.data() {
                enrich(&mut notification, &data);
            }
        }

        let signal = WebhookSignal {
            alarm_type,
            notification,
        };
        let event = FromIntegrationMessage::FireEvent {
            event_type: EVENT_TYPE.to_string(),
            data: signal.to_value(),
        };
        self.dispatcher.send(&signal_name(alarm_type), signal);

        if self.to_engine.send(event).await.is_err() {
            warn!("[{}] Engine gone, dropping event", self.name);
        }
    }

    /// Handle bodies until the webhook is unregistered.
    pub async fn run(self, mut rx: WebhookReceiver) {
        while let Some(body) = rx.recv().await {
            self.handle(&body).await;
        }
        debug!("[{}] Webhook listener stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::CloudRelayConfig;
    use crate::integrations::diagral::coordinator::Coordinator;
    use crate::integrations::diagral::mock::MockDiagralApi;
    use crate::webhooks::StaticCloudRelay;

    fn http(external: Option<&str>, relay: Option<&str>) -> HttpConfig {
        HttpConfig {
            external_url: external.map(|u| Url::parse(u).unwrap()),
            cloud_relay: CloudRelayConfig {
                url: relay.map(|u| Url::parse(u).unwrap()),
                active: relay.is_some(),
            },
            ..Default::default()
        }
    }

    /// Static relay that remembers which hooks were handed out and released.
    struct RecordingRelay {
        inner: StaticCloudRelay,
        created: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
    }

    impl RecordingRelay {
        fn new(base_url: &str) -> Self {
            Self {
                inner: StaticCloudRelay::new(Url::parse(base_url).unwrap(), true),
                created: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CloudRelay for RecordingRelay {
        fn base_url(&self) -> &Url {
            self.inner.base_url()
        }

        fn is_active(&self) -> bool {
            self.inner.is_active()
        }

        async fn get_or_create_hook(&self, webhook_id: &str) -> Result<Url, RelayError> {
            self.created.lock().unwrap().push(webhook_id.to_string());
            self.inner.get_or_create_hook(webhook_id).await
        }

        async fn release_hook(&self, webhook_id: &str) -> Result<(), RelayError> {
            self.released.lock().unwrap().push(webhook_id.to_string());
            self.inner.release_hook(webhook_id).await
        }
    }

    fn existing(url: &str) -> Option<Webhook> {
        Some(Webhook {
            transmitter_id: None,
            webhook_url: url.to_string(),
            subscriptions: WebhookSubscription::ALL,
        })
    }

    #[tokio::test]
    async fn test_register_when_no_subscription() {
        let api = Arc::new(MockDiagralApi::new());
        let registry = Arc::new(WebhookRegistry::new());
        let manager = WebhookManager::new(
            "test",
            api.clone(),
            http(Some("https://alarm.example.com"), None),
            registry.clone(),
            None,
        );

        let (webhook, _rx) = manager.register().await.unwrap().unwrap();
        assert!(!webhook.is_relay);
        assert_eq!(
            webhook.url.as_str(),
            format!("https://alarm.example.com/api/webhook/{}", webhook.webhook_id)
        );
        assert!(registry.is_registered(&webhook.webhook_id));
        assert_eq!(
            api.calls(),
            ["get_webhook".to_string(), format!("register_webhook({})", webhook.url)]
        );
    }

    #[tokio::test]
    async fn test_existing_subscription_is_updated() {
        let api = Arc::new(MockDiagralApi::new());
        *api.webhook.lock().unwrap() = existing("https://alarm.example.com/api/webhook/old");

        let url = Url::parse("https://alarm.example.com/api/webhook/new").unwrap();
        negotiate(api.as_ref(), &url).await.unwrap();
        assert_eq!(api.calls()[1], format!("update_webhook({})", url));

        // Another origin is overwritten too
        *api.webhook.lock().unwrap() = existing("https://elsewhere.example.org/hook");
        negotiate(api.as_ref(), &url).await.unwrap();
        assert_eq!(api.calls()[3], format!("update_webhook({})", url));
    }

    #[test]
    fn test_same_origin_compares_port() {
        let target = Url::parse("https://alarm.example.com/api/webhook/new").unwrap();
        assert!(same_origin("https://alarm.example.com/api/webhook/old", &target));
        assert!(same_origin("https://alarm.example.com:443/old", &target));
        assert!(!same_origin("https://alarm.example.com:8443/old", &target));
        assert!(!same_origin("http://alarm.example.com/old", &target));
        assert!(!same_origin("not a url", &target));
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts_registration() {
        let api = Arc::new(MockDiagralApi::new());
        api.webhook_unavailable.store(true, Ordering::SeqCst);
        let manager = WebhookManager::new(
            "test",
            api.clone(),
            http(Some("https://alarm.example.com"), None),
            Arc::new(WebhookRegistry::new()),
            None,
        );

        let Err(err) = manager.register().await else {
            panic!("registration should fail");
        };
        assert!(matches!(
            err,
            WebhookError::Api(DiagralError::Server { status: 500, .. })
        ));
        assert_eq!(api.calls(), ["get_webhook"]);
    }

    #[tokio::test]
    async fn test_relay_hook_released_when_negotiation_fails() {
        let api = Arc::new(MockDiagralApi::new());
        api.webhook_unavailable.store(true, Ordering::SeqCst);
        let relay = Arc::new(RecordingRelay::new("https://relay.example.net"));
        let manager = WebhookManager::new(
            "test",
            api.clone(),
            http(None, Some("https://relay.example.net")),
            Arc::new(WebhookRegistry::new()),
            Some(relay.clone()),
        );

        assert!(manager.register().await.is_err());
        let created = relay.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(*relay.released.lock().unwrap(), created);
        assert!(relay.inner.release_hook(&created[0]).await.is_err());
        assert!(!api.calls().iter().any(|c| c.starts_with("register_webhook(")));
    }

    #[tokio::test]
    async fn test_no_external_url() {
        let api = Arc::new(MockDiagralApi::new());
        let manager = WebhookManager::new(
            "test",
            api.clone(),
            http(Some("http://alarm.example.com"), None),
            Arc::new(WebhookRegistry::new()),
            None,
        );
        assert!(manager.register().await.unwrap().is_none());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_relay_hook_lifecycle() {
        let api = Arc::new(MockDiagralApi::new());
        let registry = Arc::new(WebhookRegistry::new());
        let relay = Arc::new(StaticCloudRelay::new(
            Url::parse("https://relay.example.net").unwrap(),
            true,
        ));
        let manager = WebhookManager::new(
            "test",
            api.clone(),
            http(None, Some("https://relay.example.net")),
            registry.clone(),
            Some(relay.clone()),
        );

        let (webhook, _rx) = manager.register().await.unwrap().unwrap();
        assert!(webhook.is_relay);
        assert_eq!(
            webhook.url.as_str(),
            format!("https://relay.example.net/{}", webhook.webhook_id)
        );

        manager.unregister(&webhook).await;
        assert!(api.calls().contains(&"delete_webhook".to_string()));
        assert!(!registry.is_registered(&webhook.webhook_id));
        assert!(relay.release_hook(&webhook.webhook_id).await.is_err());
    }

    #[tokio::test]
    async fn test_notification_fan_out() {
        let api = Arc::new(MockDiagralApi::new());
        let (coordinator, handle) = Coordinator::new("test", api.clone(), Duration::from_secs(300));
        coordinator.refresh().await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new());
        let mut alerts = dispatcher.connect(&signal_name(AlarmType::Alert));
        let (tx, mut rx) = mpsc::channel(8);
        let handler = NotificationHandler::new("test", dispatcher, handle, tx);

        handler
            .handle(
                br#"{
                    "transmitter_id": "1A2B3C4D",
                    "alarm_type": "ALERT",
                    "alarm_code": "1130",
                    "alarm_description": "Intrusion",
                    "group_index": "3",
                    "detail": {"device_type": "SENSOR", "device_index": "2"}
                }"#,
            )
            .await;

        let signal = alerts.recv().await.unwrap();
        assert_eq!(signal.notification.group_name.as_deref(), Some("Bedrooms"));
        assert_eq!(
            signal.notification.detail.device_label.as_deref(),
            Some("Living room")
        );

        match rx.recv().await.unwrap() {
            FromIntegrationMessage::FireEvent { event_type, data } => {
                assert_eq!(event_type, "DIAGRAL_EVENT");
                assert_eq!(data["type"], "ALERT");
                assert_eq!(data["data"]["alarm_code"], 1130);
                assert!(data["data"].get("alarm_type").is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_requested_for_status_and_anomaly() {
        let api = Arc::new(MockDiagralApi::new());
        let (mut coordinator, handle) = Coordinator::new("test", api, Duration::from_secs(300));
        let (tx, _rx) = mpsc::channel(8);
        let handler = NotificationHandler::new("test", Arc::new(Dispatcher::new()), handle, tx);

        for (body, refresh) in [
            (r#"{"alarm_type": "ALERT", "alarm_code": 1130}"#, false),
            (r#"{"alarm_type": "STATUS", "alarm_code": 3401}"#, true),
            (r#"{"alarm_type": "ANOMALY", "alarm_code": 1301}"#, true),
        ] {
            handler.handle(body.as_bytes()).await;
            assert_eq!(coordinator.take_refresh_request(), refresh, "{body}");
        }
    }

    #[tokio::test]
    async fn test_invalid_body_is_dropped() {
        let api = Arc::new(MockDiagralApi::new());
        let (_coordinator, handle) = Coordinator::new("test", api, Duration::from_secs(300));
        let (tx, mut rx) = mpsc::channel(8);
        let handler = NotificationHandler::new("test", Arc::new(Dispatcher::new()), handle, tx);

        handler.handle(b"not json").await;
        assert!(rx.try_recv().is_err());
    }
}
