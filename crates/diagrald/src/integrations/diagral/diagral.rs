use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use diagral_client::AlarmType;
use diagral_client::DiagralApi;
use diagral_client::WebhookNotification;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::DiagralEntryConfig;
use super::alarm_control_panel;
use super::alarm_control_panel::AlarmPanel;
use super::binary_sensor::AlarmTriggered;
use super::coordinator::Coordinator;
use super::coordinator::CoordinatorData;
use super::coordinator::CoordinatorHandle;
use super::diagnostics;
use super::entity;
use super::sensor::ActiveGroupsSensor;
use super::sensor::AnomaliesSensor;
use super::webhook::ActiveWebhook;
use super::webhook::NotificationHandler;
use super::webhook::WebhookManager;
use super::webhook::WebhookSignal;
use super::webhook::signal_name;
use crate::config::HttpConfig;
use crate::engine::AlarmAction;
use crate::engine::AlarmState;
use crate::engine::Device;
use crate::engine::Dispatcher;
use crate::engine::Entity;
use crate::engine::Event;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::Integration;
use crate::engine::ToIntegrationMessage;
use crate::webhooks::CloudRelay;
use crate::webhooks::WebhookRegistry;

fn boxed<E: Error + Send + 'static>(e: E) -> Box<dyn Error + Send> {
    Box::new(e)
}

/// The entities of one alarm system.
struct Entities {
    panel: AlarmPanel,
    triggered: AlarmTriggered,
    anomalies: AnomaliesSensor,
    active_groups: ActiveGroupsSensor,
    sw_version: String,
}

impl Entities {
    fn new(entry: &str, data: &CoordinatorData, config: &DiagralEntryConfig) -> Self {
        Self {
            panel: AlarmPanel::new(entry, data, config.alarmpanel_actiontype_code),
            triggered: AlarmTriggered::new(entry, data),
            anomalies: AnomaliesSensor::new(entry, data),
            active_groups: ActiveGroupsSensor::new(entry, data),
            sw_version: data.configuration.sw_version(),
        }
    }

    fn all(&self) -> [&dyn Entity; 4] {
        [
            &self.panel,
            &self.triggered,
            &self.anomalies,
            &self.active_groups,
        ]
    }

    /// Apply a new snapshot. Returns the central device when its firmware changed.
    fn apply_data(&mut self, data: &CoordinatorData) -> Option<Device> {
        self.panel.apply_status(&data.status);
        if self.panel.alarm_state() == AlarmState::Disarmed && self.triggered.reset() {
            debug!("Reset {}", self.triggered.entity_id());
        }
        self.anomalies.update(data);
        self.active_groups.update(data);

        let sw_version = data.configuration.sw_version();
        if sw_version == self.sw_version {
            return None;
        }
        info!("Updated sw_version to {}", sw_version);
        self.sw_version = sw_version;

        let device = entity::central_device(&data.configuration);
        self.panel.set_device(device.clone());
        self.triggered.set_device(device.clone());
        self.anomalies.set_device(device.clone());
        self.active_groups.set_device(device.clone());
        Some(device)
    }

    fn handle_alert(&mut self, notification: &WebhookNotification) {
        self.panel.handle_alert(notification);
        self.triggered.handle_alert(notification);
    }

    fn handle_status(&mut self, notification: &WebhookNotification) {
        self.panel.handle_status(notification);
    }

    async fn publish(&self, tx: &FromIntegrationSender) -> bool {
        for entity in self.all() {
            let msg = FromIntegrationMessage::StateChanged {
                entity_id: entity.entity_id().to_string(),
                state: entity.state(),
            };
            if tx.send(msg).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Keep the entities in step with coordinator data and webhook signals.
    async fn run(
        mut self,
        name: String,
        mut data: watch::Receiver<Option<Arc<CoordinatorData>>>,
        mut alerts: mpsc::UnboundedReceiver<WebhookSignal>,
        mut statuses: mpsc::UnboundedReceiver<WebhookSignal>,
        tx: FromIntegrationSender,
    ) {
        loop {
            tokio::select! {
                changed = data.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = data.borrow_and_update().clone();
                    let Some(snapshot) = snapshot else { continue };
                    if let Some(device) = self.apply_data(&snapshot) {
                        if tx.send(FromIntegrationMessage::DeviceUpdated { device }).await.is_err() {
                            break;
                        }
                    }
                }
                Some(signal) = alerts.recv() => self.handle_alert(&signal.notification),
                Some(signal) = statuses.recv() => self.handle_status(&signal.notification),
                else => break,
            }

            if !self.publish(&tx).await {
                break;
            }
        }
        debug!("[{}] Entity updates stopped", name);
    }
}

/// One Diagral alarm system.
pub struct DiagralIntegration {
    name: String,
    entry: String,
    config: DiagralEntryConfig,
    api: Arc<dyn DiagralApi>,
    webhooks: WebhookManager,
    dispatcher: Arc<Dispatcher<WebhookSignal>>,

    /// API key created for this run because none was configured
    session_key: Option<String>,
    coordinator: Option<CoordinatorHandle>,
    webhook: Option<ActiveWebhook>,
    to_engine: Option<FromIntegrationSender>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiagralIntegration {
    pub fn new(
        entry: &str,
        config: DiagralEntryConfig,
        api: Arc<dyn DiagralApi>,
        http: HttpConfig,
        registry: Arc<WebhookRegistry>,
        relay: Option<Arc<dyn CloudRelay>>,
    ) -> Self {
        let name = format!("diagral.{}", entry);
        Self {
            webhooks: WebhookManager::new(name.clone(), api.clone(), http, registry, relay),
            name,
            entry: entry.to_string(),
            config,
            api,
            dispatcher: Arc::new(Dispatcher::new()),
            session_key: None,
            coordinator: None,
            webhook: None,
            to_engine: None,
            tasks: Vec::new(),
        }
    }

    async fn start_webhook(&mut self) {
        let (Some(coordinator), Some(tx)) = (&self.coordinator, &self.to_engine) else {
            return;
        };

        match self.webhooks.register().await {
            Ok(Some((webhook, rx))) => {
                let handler = NotificationHandler::new(
                    self.name.clone(),
                    self.dispatcher.clone(),
                    coordinator.clone(),
                    tx.clone(),
                );
                // Ends by itself once the webhook is unregistered
                tokio::spawn(handler.run(rx));
                self.webhook = Some(webhook);
            }
            Ok(None) => {}
            Err(e) => error!("[{}] Failed to register webhook: {}", self.name, e),
        }
    }

    async fn stop_webhook(&mut self) {
        if let Some(webhook) = self.webhook.take() {
            self.webhooks.unregister(&webhook).await;
        }
    }

    async fn run_alarm_command(
        &self,
        action: AlarmAction,
        code: Option<&str>,
    ) -> Result<(), alarm_control_panel::CommandError> {
        alarm_control_panel::check_code(
            self.config.alarmpanel_actiontype_code,
            self.config.alarmpanel_code,
            action,
            code,
        )?;

        info!("[{}] {}", self.name, action);
        let result = alarm_control_panel::execute(self.api.as_ref(), action).await;
        self.after_command(result, &action.to_string());
        Ok(())
    }

    fn after_command(
        &self,
        result: diagral_client::Result<diagral_client::SystemStatus>,
        what: &str,
    ) {
        match result {
            Ok(status) => {
                if let Some(coordinator) = &self.coordinator {
                    coordinator.apply_status(status);
                    coordinator.request_refresh();
                }
            }
            Err(e) => error!("[{}] Failed to {}: {}", self.name, what, e),
        }
    }

    fn diagnostics(&self) -> serde_json::Value {
        let data = self.coordinator.as_ref().and_then(CoordinatorHandle::data);
        diagnostics::entry_diagnostics(
            &self.entry,
            &self.config,
            self.webhook.as_ref().map(|w| w.webhook_id.as_str()),
            self.webhook.as_ref().map(|w| w.url.as_str()),
            data.as_deref(),
        )
    }
}

#[async_trait]
impl Integration for DiagralIntegration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(
        &mut self,
        tx: FromIntegrationSender,
        _events: broadcast::Receiver<Event>,
    ) -> Result<(), Box<dyn Error + Send>> {
        if self.config.keys.is_none() {
            let keys = self.api.create_api_key().await.map_err(boxed)?;
            warn!(
                "[{}] No API keys configured, using temporary key {} (run `diagrald setup` to create permanent ones)",
                self.name, keys.api_key
            );
            self.session_key = Some(keys.api_key);
        }

        let (coordinator, handle) =
            Coordinator::new(self.name.clone(), self.api.clone(), self.config.scan_interval);
        let data = coordinator.refresh().await.map_err(boxed)?;
        info!(
            "[{}] Connected to {} ({})",
            self.name,
            data.configuration.alarm.name.as_deref().unwrap_or("Diagral"),
            data.serial()
        );

        self.coordinator = Some(handle.clone());
        self.to_engine = Some(tx.clone());

        // Subscribe before the webhook can deliver anything.
        let alerts = self.dispatcher.connect(&signal_name(AlarmType::Alert));
        let statuses = self.dispatcher.connect(&signal_name(AlarmType::Status));
        self.start_webhook().await;

        let entities = Entities::new(&self.entry, &data, &self.config);
        for entity in entities.all() {
            let msg = FromIntegrationMessage::EntityDiscovered {
                descriptor: entity.descriptor().clone(),
                integration_name: self.name.clone(),
            };
            tx.send(msg).await.map_err(boxed)?;
        }
        entities.publish(&tx).await;

        let data_rx = handle.subscribe();

        self.tasks.push(tokio::spawn(coordinator.run()));
        self.tasks.push(tokio::spawn(entities.run(
            self.name.clone(),
            data_rx,
            alerts,
            statuses,
            tx,
        )));

        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: ToIntegrationMessage,
    ) -> Result<(), Box<dyn Error + Send>> {
        match msg {
            ToIntegrationMessage::AlarmCommand { action, code, .. } => {
                self.run_alarm_command(action, code.as_deref())
                    .await
                    .map_err(boxed)?;
            }
            ToIntegrationMessage::ArmGroups { groups, .. } => {
                info!("[{}] Activating groups {:?}", self.name, groups);
                let result = self.api.activate_group(&groups).await;
                self.after_command(result, "activate groups");
            }
            ToIntegrationMessage::DisarmGroups { groups, .. } => {
                info!("[{}] Disabling groups {:?}", self.name, groups);
                let result = self.api.disable_group(&groups).await;
                self.after_command(result, "disable groups");
            }
            ToIntegrationMessage::RegisterWebhook => {
                debug!("[{}] Webhook registration requested by service", self.name);
                self.stop_webhook().await;
                self.start_webhook().await;
            }
            ToIntegrationMessage::UnregisterWebhook => {
                debug!("[{}] Webhook unregistration requested by service", self.name);
                self.stop_webhook().await;
            }
            ToIntegrationMessage::Diagnostics { reply } => {
                // The requester may have given up waiting
                let _ = reply.send(self.diagnostics());
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.stop_webhook().await;

        if let Some(api_key) = self.session_key.take() {
            if let Err(e) = self.api.delete_api_key(&api_key).await {
                warn!("[{}] Failed to delete temporary API key: {}", self.name, e);
            }
        }

        self.api.close().await.map_err(boxed)?;
        info!("[{}] Shut down", self.name);
        Ok(())
    }
}
