use diagral_client::WebhookNotification;

use super::coordinator::CoordinatorData;
use super::entity;
use crate::engine::BinarySensorState;
use crate::engine::Device;
use crate::engine::Entity;
use crate::engine::EntityDescriptor;
use crate::engine::EntityKind;
use crate::engine::EntityState;

/// On while an intrusion is in progress; cleared when the panel is disarmed.
pub struct AlarmTriggered {
    descriptor: EntityDescriptor,
    on: bool,
}

impl AlarmTriggered {
    pub fn new(entry: &str, data: &CoordinatorData) -> Self {
        let mut descriptor = entity::descriptor(
            entry,
            &data.configuration,
            EntityKind::BinarySensor,
            "alarm_triggered",
            "Alarm triggered",
        );
        descriptor.device_class = Some("safety".to_string());
        descriptor.icon = Some("mdi:alarm-light".to_string());

        Self {
            descriptor,
            on: false,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Returns true when the alert turned the sensor on.
    pub fn handle_alert(&mut self, notification: &WebhookNotification) -> bool {
        if !notification.is_intrusion() || self.on {
            return false;
        }
        self.on = true;
        true
    }

    /// Returns true when the sensor was on.
    pub fn reset(&mut self) -> bool {
        std::mem::replace(&mut self.on, false)
    }

    pub fn set_device(&mut self, device: Device) {
        self.descriptor.device = device;
    }
}

impl Entity for AlarmTriggered {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    fn state(&self) -> EntityState {
        EntityState::BinarySensor(BinarySensorState {
            on: self.on,
            ..Default::default()
        })
    }
}
