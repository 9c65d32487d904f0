//! Typed payloads exchanged with the Diagral cloud.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Full alarm configuration as returned by `/systems/{serial}/configurations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmConfiguration {
    pub alarm: Alarm,

    #[serde(default)]
    pub groups: Vec<Group>,

    /// Group indexes armed by the "presence" (home) mode.
    #[serde(default)]
    pub presence_group: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub name: Option<String>,
    pub central: Central,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Central {
    pub serial: String,
    pub firmwares: Firmwares,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firmwares {
    pub central: String,
    pub centralradio: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub index: u8,
    pub name: String,
}

impl AlarmConfiguration {
    /// Software version string shown on the central's device entry.
    pub fn sw_version(&self) -> String {
        format!(
            "{} / Radio:{}",
            self.alarm.central.firmwares.central, self.alarm.central.firmwares.centralradio
        )
    }

    pub fn group_name(&self, index: u8) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.index == index)
            .map(|g| g.name.as_str())
    }
}

/// Current arming status of the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Vendor status string: `OFF`, `GROUP`, `TEMPO_GROUP`, `PRESENCE`, ...
    pub status: String,

    #[serde(default)]
    pub activated_groups: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u16,
    pub label: String,
}

/// Every enrolled peripheral, grouped by device type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfos {
    #[serde(default)]
    pub cameras: Vec<DeviceInfo>,
    #[serde(default)]
    pub commands: Vec<DeviceInfo>,
    #[serde(default)]
    pub sensors: Vec<DeviceInfo>,
    #[serde(default)]
    pub sirens: Vec<DeviceInfo>,
    #[serde(default)]
    pub transmitters: Vec<DeviceInfo>,
}

impl DeviceInfos {
    /// Device list for a notification device type such as `SENSOR` or `command`.
    pub fn by_type(&self, device_type: &str) -> Option<&[DeviceInfo]> {
        let plural = format!("{}s", device_type.to_lowercase());
        let list = match plural.as_str() {
            "cameras" => &self.cameras,
            "commands" => &self.commands,
            "sensors" => &self.sensors,
            "sirens" => &self.sirens,
            "transmitters" => &self.transmitters,
            _ => return None,
        };
        Some(list)
    }

    /// Label of the device of `device_type` with the given index.
    pub fn label(&self, device_type: &str, index: u16) -> Option<&str> {
        self.by_type(device_type)?
            .iter()
            .find(|d| d.index == index)
            .map(|d| d.label.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.cameras
            .iter()
            .chain(&self.commands)
            .chain(&self.sensors)
            .chain(&self.sirens)
            .chain(&self.transmitters)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyName {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyDetail {
    pub serial: Option<String>,
    pub index: Option<u16>,
    pub group: Option<u8>,
    pub label: Option<String>,
    #[serde(default)]
    pub anomaly_names: Vec<AnomalyName>,
}

/// Active anomalies; an empty body from the cloud means "none".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomalies {
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sensors: Vec<AnomalyDetail>,
    #[serde(default)]
    pub badges: Vec<AnomalyDetail>,
    #[serde(default)]
    pub sirens: Vec<AnomalyDetail>,
    #[serde(default)]
    pub cameras: Vec<AnomalyDetail>,
    #[serde(default)]
    pub commands: Vec<AnomalyDetail>,
    #[serde(default)]
    pub transmitters: Vec<AnomalyDetail>,
    #[serde(default)]
    pub central: Vec<AnomalyDetail>,
}

impl Anomalies {
    /// Anomaly lists in a stable order, paired with their category name.
    pub fn categories(&self) -> [(&'static str, &[AnomalyDetail]); 7] {
        [
            ("badges", &self.badges),
            ("cameras", &self.cameras),
            ("central", &self.central),
            ("commands", &self.commands),
            ("sensors", &self.sensors),
            ("sirens", &self.sirens),
            ("transmitters", &self.transmitters),
        ]
    }

    pub fn count(&self) -> usize {
        self.categories().iter().map(|(_, list)| list.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub anomaly: bool,
    pub alert: bool,
    pub state: bool,
}

impl WebhookSubscription {
    /// Subscribe to every notification category.
    pub const ALL: Self = Self {
        anomaly: true,
        alert: true,
        state: true,
    };
}

/// Webhook currently registered for a system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub transmitter_id: Option<String>,
    pub webhook_url: String,
    pub subscriptions: WebhookSubscription,
}

/// Body of webhook create/update requests.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct WebhookRequest<'a> {
    pub webhook_url: &'a str,
    pub subscribe_to_anomaly: bool,
    pub subscribe_to_alert: bool,
    pub subscribe_to_state: bool,
}

impl<'a> WebhookRequest<'a> {
    pub fn new(webhook_url: &'a str, subscription: WebhookSubscription) -> Self {
        Self {
            webhook_url,
            subscribe_to_anomaly: subscription.anomaly,
            subscribe_to_alert: subscription.alert,
            subscribe_to_state: subscription.state,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeys {
    pub api_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeys")
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Outcome of a connection test.
#[derive(Debug, Clone)]
pub struct TryConnectResult {
    pub result: bool,
    /// Keys created for the test; `None` when existing keys were reused or
    /// the ephemeral keys were already deleted.
    pub keys: Option<ApiKeys>,
}

/// Entry of `/users/systems`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SystemSummary {
    pub serial_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LoginResponse {
    pub access_token: String,
}
