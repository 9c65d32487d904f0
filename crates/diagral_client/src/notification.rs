//! Push notifications delivered by the Diagral cloud to a registered webhook.

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Alarm codes signalling an intrusion.
pub const INTRUSION_CODES: [u32; 2] = [1130, 1139];

const ALERT_CODES: [u32; 19] = [
    1110, 1111, 1117, 1120, 1122, 1130, 1139, 1140, 1141, 1142, 1143, 1150, 1152, 1154, 1158,
    1159, 1344, 1391, 3391,
];

const ANOMALY_CODES: [u32; 19] = [
    1137, 1144, 1301, 1302, 1351, 1352, 1355, 1381, 1384, 1570, 1573, 3137, 3144, 3301, 3351,
    3352, 3355, 3381, 3570,
];

const STATUS_CODES: [u32; 5] = [1306, 1401, 1407, 3401, 3407];

/// Notification category.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum AlarmType {
    Alert,
    Anomaly,
    Status,
    Unknown,
}

impl AlarmType {
    /// Classify a notification from its alarm code.
    pub fn from_code(code: u32) -> Self {
        if ALERT_CODES.contains(&code) {
            Self::Alert
        } else if ANOMALY_CODES.contains(&code) {
            Self::Anomaly
        } else if STATUS_CODES.contains(&code) {
            Self::Status
        } else {
            Self::Unknown
        }
    }
}

/// Deserialize a numeric field the cloud sends either as a string or a number.
///
/// Empty strings and `null` become `None`.
fn deserialize_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: TryFrom<u64> + std::str::FromStr,
{
    use serde::de;

    struct NumberOrString<T>(std::marker::PhantomData<T>);

    impl<'de, T> de::Visitor<'de> for NumberOrString<T>
    where
        T: TryFrom<u64> + std::str::FromStr,
    {
        type Value = Option<T>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("integer, numeric string, or null")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            deserializer.deserialize_any(self)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            T::try_from(v)
                .map(Some)
                .map_err(|_| E::custom(format!("number out of range: {v}")))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            let v = u64::try_from(v).map_err(|_| E::custom(format!("negative number: {v}")))?;
            self.visit_u64(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let v = v.trim();
            if v.is_empty() {
                return Ok(None);
            }
            v.parse::<T>()
                .map(Some)
                .map_err(|_| E::custom(format!("not a number: {v:?}")))
        }
    }

    deserializer.deserialize_option(NumberOrString(std::marker::PhantomData))
}

/// Timestamps arrive as RFC 3339 or as a naive date and time, which is taken
/// as UTC. Anything else is dropped rather than failing the notification.
fn deserialize_date_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    Ok(parse_date_time(&raw))
}

fn parse_date_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    tracing::warn!("Ignoring unparseable notification date_time {:?}", raw);
    None
}

/// Device that caused the notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDetail {
    #[serde(default)]
    pub device_type: Option<String>,

    #[serde(default, deserialize_with = "deserialize_number")]
    pub device_index: Option<u16>,

    /// Filled in locally from the cached device list.
    #[serde(default)]
    pub device_label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationUser {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub user_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNotification {
    transmitter_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_date_time")]
    date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    alarm_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_number")]
    alarm_code: Option<u32>,
    #[serde(default)]
    alarm_description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_number")]
    group_index: Option<u8>,
    #[serde(default)]
    detail: Option<NotificationDetail>,
    #[serde(default)]
    user: Option<NotificationUser>,
}

/// A parsed webhook notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookNotification {
    pub transmitter_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub alarm_type: AlarmType,
    pub alarm_code: Option<u32>,
    pub alarm_description: Option<String>,
    pub group_index: Option<u8>,

    /// Filled in locally from the cached group list.
    pub group_name: Option<String>,
    pub detail: NotificationDetail,
    pub user: Option<NotificationUser>,
}

impl WebhookNotification {
    /// Parse a raw webhook body.
    ///
    /// An explicit `alarm_type` in the payload wins; otherwise the type is
    /// derived from the alarm code.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawNotification = serde_json::from_slice(body)?;

        let alarm_type = raw
            .alarm_type
            .as_deref()
            .and_then(|t| t.parse::<AlarmType>().ok())
            .or_else(|| raw.alarm_code.map(AlarmType::from_code))
            .unwrap_or(AlarmType::Unknown);

        Ok(Self {
            transmitter_id: raw.transmitter_id,
            timestamp: raw.date_time,
            alarm_type,
            alarm_code: raw.alarm_code,
            alarm_description: raw.alarm_description,
            group_index: raw.group_index,
            group_name: None,
            detail: raw.detail.unwrap_or_default(),
            user: raw.user,
        })
    }

    pub fn is_intrusion(&self) -> bool {
        self.alarm_type == AlarmType::Alert
            && self
                .alarm_code
                .is_some_and(|code| INTRUSION_CODES.contains(&code))
    }

    /// Notification fields without the category, as carried by bus events.
    pub fn event_data(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("alarm_type");
        }
        value
    }
}
