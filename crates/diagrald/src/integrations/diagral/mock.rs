//! Scripted Diagral cloud for tests.

use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use diagral_client::Alarm;
use diagral_client::AlarmConfiguration;
use diagral_client::Anomalies;
use diagral_client::AnomalyDetail;
use diagral_client::AnomalyName;
use diagral_client::ApiKeys;
use diagral_client::Central;
use diagral_client::DeviceInfo;
use diagral_client::DeviceInfos;
use diagral_client::DiagralApi;
use diagral_client::DiagralError;
use diagral_client::Firmwares;
use diagral_client::Group;
use diagral_client::Result;
use diagral_client::SystemStatus;
use diagral_client::TryConnectResult;
use diagral_client::Webhook;
use diagral_client::WebhookSubscription;

pub const SERIAL: &str = "1A2B3C4D";

/// Mock implementation of [`DiagralApi`] for testing
///
/// Records every call by name and answers from the fields below.
pub struct MockDiagralApi {
    calls: Mutex<Vec<String>>,
    pub configuration: Mutex<AlarmConfiguration>,
    pub devices: Mutex<DeviceInfos>,
    pub status: Mutex<SystemStatus>,
    pub anomalies: Mutex<Anomalies>,

    /// `None` answers `get_webhook` with "no subscription"
    pub webhook: Mutex<Option<Webhook>>,

    /// Make every data fetch fail with a server error
    pub failing: AtomicBool,

    /// Make `get_webhook` fail with a server error
    pub webhook_unavailable: AtomicBool,

    /// Runs inside `register_webhook`, before it answers
    pub on_register_webhook: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl MockDiagralApi {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            configuration: Mutex::new(configuration()),
            devices: Mutex::new(DeviceInfos {
                sensors: vec![
                    DeviceInfo {
                        index: 1,
                        label: "Front door".to_string(),
                    },
                    DeviceInfo {
                        index: 2,
                        label: "Living room".to_string(),
                    },
                ],
                commands: vec![DeviceInfo {
                    index: 1,
                    label: "Keypad".to_string(),
                }],
                ..Default::default()
            }),
            status: Mutex::new(SystemStatus {
                status: "OFF".to_string(),
                activated_groups: Vec::new(),
            }),
            anomalies: Mutex::new(Anomalies::default()),
            webhook: Mutex::new(None),
            failing: AtomicBool::new(false),
            webhook_unavailable: AtomicBool::new(false),
            on_register_webhook: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_status(&self, status: &str, groups: &[u8]) {
        *self.status.lock().unwrap() = SystemStatus {
            status: status.to_string(),
            activated_groups: groups.to_vec(),
        };
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DiagralError::Server {
                status: 503,
                message: "maintenance".to_string(),
            });
        }
        Ok(())
    }

    fn apply(&self, status: &str, groups: Vec<u8>) -> Result<SystemStatus> {
        self.check()?;
        let status = SystemStatus {
            status: status.to_string(),
            activated_groups: groups,
        };
        *self.status.lock().unwrap() = status.clone();
        Ok(status)
    }
}

pub fn configuration() -> AlarmConfiguration {
    AlarmConfiguration {
        alarm: Alarm {
            name: Some("maison principale".to_string()),
            central: Central {
                serial: SERIAL.to_string(),
                firmwares: Firmwares {
                    central: "2.1.0".to_string(),
                    centralradio: "1.4.2".to_string(),
                },
            },
        },
        groups: vec![
            Group {
                index: 1,
                name: "Ground floor".to_string(),
            },
            Group {
                index: 2,
                name: "Garage".to_string(),
            },
            Group {
                index: 3,
                name: "Bedrooms".to_string(),
            },
        ],
        presence_group: vec![1, 2],
    }
}

pub fn sensor_anomaly() -> AnomalyDetail {
    AnomalyDetail {
        serial: Some("S-0001".to_string()),
        index: Some(2),
        group: Some(3),
        label: Some("PIR".to_string()),
        anomaly_names: vec![AnomalyName {
            id: 1301,
            name: "batteryDefault".to_string(),
        }],
    }
}

#[async_trait]
impl DiagralApi for MockDiagralApi {
    async fn login(&self) -> Result<()> {
        self.record("login");
        Ok(())
    }

    async fn try_connection(&self, ephemeral: bool) -> Result<TryConnectResult> {
        self.record(format!("try_connection({})", ephemeral));
        Ok(TryConnectResult {
            result: true,
            keys: (!ephemeral).then(|| ApiKeys {
                api_key: "generated-key".to_string(),
                secret_key: "generated-secret".to_string(),
            }),
        })
    }

    async fn get_alarm_name(&self) -> Result<String> {
        self.record("get_alarm_name");
        Ok("Maison".to_string())
    }

    async fn create_api_key(&self) -> Result<ApiKeys> {
        self.record("create_api_key");
        Ok(ApiKeys {
            api_key: "session-key".to_string(),
            secret_key: "session-secret".to_string(),
        })
    }

    async fn delete_api_key(&self, api_key: &str) -> Result<()> {
        self.record(format!("delete_api_key({})", api_key));
        Ok(())
    }

    async fn get_configuration(&self) -> Result<AlarmConfiguration> {
        self.record("get_configuration");
        self.check()?;
        Ok(self.configuration.lock().unwrap().clone())
    }

    async fn get_devices_info(&self) -> Result<DeviceInfos> {
        self.record("get_devices_info");
        self.check()?;
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_system_status(&self) -> Result<SystemStatus> {
        self.record("get_system_status");
        self.check()?;
        Ok(self.status.lock().unwrap().clone())
    }

    async fn get_anomalies(&self) -> Result<Anomalies> {
        self.record("get_anomalies");
        self.check()?;
        Ok(self.anomalies.lock().unwrap().clone())
    }

    async fn start_system(&self) -> Result<SystemStatus> {
        self.record("start_system");
        self.apply("GROUP", vec![1, 2, 3])
    }

    async fn stop_system(&self) -> Result<SystemStatus> {
        self.record("stop_system");
        self.apply("OFF", Vec::new())
    }

    async fn presence(&self) -> Result<SystemStatus> {
        self.record("presence");
        self.apply("PRESENCE", vec![1, 2])
    }

    async fn activate_group(&self, groups: &[u8]) -> Result<SystemStatus> {
        self.record(format!("activate_group({:?})", groups));
        self.apply("GROUP", groups.to_vec())
    }

    async fn disable_group(&self, groups: &[u8]) -> Result<SystemStatus> {
        self.record(format!("disable_group({:?})", groups));
        self.apply("OFF", Vec::new())
    }

    async fn get_webhook(&self) -> Result<Webhook> {
        self.record("get_webhook");
        if self.webhook_unavailable.load(Ordering::SeqCst) {
            return Err(DiagralError::Server {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        self.webhook
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DiagralError::NoSubscription(format!("No subscription found for {SERIAL}")))
    }

    async fn register_webhook(
        &self,
        url: &str,
        subscription: WebhookSubscription,
    ) -> Result<Webhook> {
        self.record(format!("register_webhook({})", url));
        if let Some(hook) = self.on_register_webhook.lock().unwrap().as_ref() {
            hook();
        }
        let webhook = Webhook {
            transmitter_id: Some(SERIAL.to_string()),
            webhook_url: url.to_string(),
            subscriptions: subscription,
        };
        *self.webhook.lock().unwrap() = Some(webhook.clone());
        Ok(webhook)
    }

    async fn update_webhook(
        &self,
        url: &str,
        subscription: WebhookSubscription,
    ) -> Result<Webhook> {
        self.record(format!("update_webhook({})", url));
        let webhook = Webhook {
            transmitter_id: Some(SERIAL.to_string()),
            webhook_url: url.to_string(),
            subscriptions: subscription,
        };
        *self.webhook.lock().unwrap() = Some(webhook.clone());
        Ok(webhook)
    }

    async fn delete_webhook(&self) -> Result<()> {
        self.record("delete_webhook");
        *self.webhook.lock().unwrap() = None;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        Ok(())
    }
}
