use chrono::DateTime;
use chrono::Local;
use chrono::Utc;
use diagral_client::AnomalyDetail;
use serde_json::Value;
use serde_json::json;

use super::coordinator::CoordinatorData;
use super::entity;
use crate::engine::Attributes;
use crate::engine::Device;
use crate::engine::Entity;
use crate::engine::EntityDescriptor;
use crate::engine::EntityKind;
use crate::engine::EntityState;
use crate::engine::SensorState;

fn local_time(t: DateTime<Utc>) -> Value {
    json!(t.with_timezone(&Local).to_rfc3339())
}

/// Number of active anomalies, with their details as attributes.
pub struct AnomaliesSensor {
    descriptor: EntityDescriptor,
    state: SensorState,
}

impl AnomaliesSensor {
    pub fn new(entry: &str, data: &CoordinatorData) -> Self {
        let mut descriptor = entity::descriptor(
            entry,
            &data.configuration,
            EntityKind::Sensor,
            "anomalies",
            "Anomalies",
        );
        descriptor.icon = Some("mdi:alert-box".to_string());
        descriptor.unit_of_measurement = Some("anomalies".to_string());

        let mut sensor = Self {
            descriptor,
            state: SensorState::default(),
        };
        sensor.update(data);
        sensor
    }

    pub fn update(&mut self, data: &CoordinatorData) {
        let anomalies = &data.anomalies;

        let mut attributes = Attributes::new();
        if let Some(created_at) = anomalies.created_at {
            attributes.insert("created_at".to_string(), local_time(created_at));
        }
        attributes.insert("updated_at".to_string(), local_time(data.updated_at));

        let mut categories = serde_json::Map::new();
        for (category, details) in anomalies.categories() {
            if details.is_empty() {
                continue;
            }
            let details = details
                .iter()
                .map(|detail| describe_anomaly(category, detail, data))
                .collect();
            categories.insert(category.to_string(), Value::Array(details));
        }
        if !categories.is_empty() {
            attributes.insert("anomalies".to_string(), Value::Object(categories));
        }

        self.state = SensorState {
            value: json!(anomalies.count()),
            attributes,
        };
    }

    pub fn set_device(&mut self, device: Device) {
        self.descriptor.device = device;
    }
}

/// One anomaly with group and device indexes resolved to names.
///
/// Anomaly names are flattened into `id` and `name`; with several names the
/// last one wins.
fn describe_anomaly(category: &str, detail: &AnomalyDetail, data: &CoordinatorData) -> Value {
    let mut out = serde_json::Map::new();

    if let Some(serial) = &detail.serial {
        out.insert("serial".to_string(), json!(serial));
    }
    if let Some(index) = detail.index {
        let device_type = category.strip_suffix('s').unwrap_or(category);
        let value = match data.devices.label(device_type, index) {
            Some(label) => json!(label),
            None => json!(index),
        };
        out.insert("index".to_string(), value);
    }
    if let Some(group) = detail.group {
        let value = match data.configuration.group_name(group) {
            Some(name) => json!(name),
            None => json!(group),
        };
        out.insert("group".to_string(), value);
    }
    if let Some(label) = &detail.label {
        out.insert("label".to_string(), json!(label));
    }
    for anomaly in &detail.anomaly_names {
        out.insert("id".to_string(), json!(anomaly.id));
        out.insert("name".to_string(), json!(anomaly.name));
    }

    Value::Object(out)
}

impl Entity for AnomaliesSensor {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    fn state(&self) -> EntityState {
        EntityState::Sensor(self.state.clone())
    }
}

/// Number of armed groups.
pub struct ActiveGroupsSensor {
    descriptor: EntityDescriptor,
    state: SensorState,
}

impl ActiveGroupsSensor {
    pub fn new(entry: &str, data: &CoordinatorData) -> Self {
        let mut descriptor = entity::descriptor(
            entry,
            &data.configuration,
            EntityKind::Sensor,
            "active_groups",
            "Active groups",
        );
        descriptor.icon = Some("mdi:home-group".to_string());
        descriptor.unit_of_measurement = Some("active groups".to_string());

        let mut sensor = Self {
            descriptor,
            state: SensorState::default(),
        };
        sensor.update(data);
        sensor
    }

    pub fn update(&mut self, data: &CoordinatorData) {
        // Presence mode arms the configured presence groups
        let active: &[u8] = if data.status.status == "PRESENCE" {
            &data.configuration.presence_group
        } else {
            &data.status.activated_groups
        };

        let groups: Vec<Value> = data
            .configuration
            .groups
            .iter()
            .map(|group| {
                json!({
                    "index": group.index,
                    "name": group.name,
                    "active": active.contains(&group.index),
                })
            })
            .collect();

        let mut attributes = Attributes::new();
        attributes.insert("groups".to_string(), Value::Array(groups));
        attributes.insert("updated_at".to_string(), local_time(data.updated_at));

        self.state = SensorState {
            value: json!(active.len()),
            attributes,
        };
    }

    pub fn set_device(&mut self, device: Device) {
        self.descriptor.device = device;
    }
}

impl Entity for ActiveGroupsSensor {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    fn state(&self) -> EntityState {
        EntityState::Sensor(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use diagral_client::Anomalies;
    use diagral_client::AnomalyName;
    use diagral_client::DeviceInfo;
    use diagral_client::DeviceInfos;
    use diagral_client::SystemStatus;

    use super::*;
    use crate::integrations::diagral::mock;

    fn data(status: &str, groups: &[u8]) -> CoordinatorData {
        CoordinatorData {
            configuration: mock::configuration(),
            devices: DeviceInfos {
                sensors: vec![DeviceInfo {
                    index: 2,
                    label: "Living room".to_string(),
                }],
                ..Default::default()
            },
            status: SystemStatus {
                status: status.to_string(),
                activated_groups: groups.to_vec(),
            },
            anomalies: Anomalies::default(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_anomalies_resolved_and_flattened() {
        let mut data = data("OFF", &[]);
        let mut siren = mock::sensor_anomaly();
        siren.index = Some(9);
        siren.group = None;
        siren.anomaly_names = vec![
            AnomalyName {
                id: 1302,
                name: "powerSupplyDefault".to_string(),
            },
            AnomalyName {
                id: 1381,
                name: "tamper".to_string(),
            },
        ];
        data.anomalies.sensors = vec![mock::sensor_anomaly()];
        data.anomalies.sirens = vec![siren];

        let sensor = AnomaliesSensor::new("home", &data);
        let state = sensor.state();
        assert_eq!(state.value(), "2");

        let attributes = state.attributes();
        assert!(attributes.contains_key("updated_at"));
        assert!(!attributes.contains_key("created_at"));

        let anomalies = &attributes["anomalies"];
        insta::assert_json_snapshot!(anomalies, @r###"
        {
          "sensors": [
            {
              "group": "Bedrooms",
              "id": 1301,
              "index": "Living room",
              "label": "PIR",
              "name": "batteryDefault",
              "serial": "S-0001"
            }
          ],
          "sirens": [
            {
              "id": 1381,
              "index": 9,
              "label": "PIR",
              "name": "tamper",
              "serial": "S-0001"
            }
          ]
        }
        "###);
    }

    #[test]
    fn test_no_anomalies() {
        let sensor = AnomaliesSensor::new("home", &data("OFF", &[]));
        assert_eq!(sensor.state().value(), "0");
        assert!(!sensor.state().attributes().contains_key("anomalies"));
        assert_eq!(
            sensor.descriptor().unit_of_measurement.as_deref(),
            Some("anomalies")
        );
    }

    #[test]
    fn test_active_groups() {
        let mut sensor = ActiveGroupsSensor::new("home", &data("GROUP", &[3]));
        assert_eq!(sensor.state().value(), "1");
        assert_eq!(
            sensor.state().attributes()["groups"],
            json!([
                {"index": 1, "name": "Ground floor", "active": false},
                {"index": 2, "name": "Garage", "active": false},
                {"index": 3, "name": "Bedrooms", "active": true},
            ])
        );

        // Presence counts the configured presence groups, not activated_groups
        sensor.update(&data("PRESENCE", &[]));
        assert_eq!(sensor.state().value(), "2");
        assert_eq!(sensor.state().attributes()["groups"][0]["active"], json!(true));
    }
}
