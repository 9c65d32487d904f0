use diagral_client::DiagralApi;
use diagral_client::DiagralError;
use diagral_client::SystemStatus;
use diagral_client::WebhookNotification;
use serde_json::json;
use tracing::info;

use super::ActionCodePolicy;
use super::coordinator::CoordinatorData;
use super::entity;
use crate::engine::AlarmAction;
use crate::engine::AlarmPanelState;
use crate::engine::AlarmState;
use crate::engine::Attributes;
use crate::engine::Device;
use crate::engine::Entity;
use crate::engine::EntityDescriptor;
use crate::engine::EntityKind;
use crate::engine::EntityState;

/// Map a vendor status string to a panel state.
pub fn map_status(status: &str) -> AlarmState {
    match status.to_ascii_lowercase().as_str() {
        "off" => AlarmState::Disarmed,
        "group" => AlarmState::ArmedAway,
        "tempo_group" => AlarmState::Arming,
        "presence" => AlarmState::ArmedHome,
        _ => AlarmState::Unknown,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("a code is required to {0}")]
    CodeRequired(AlarmAction),

    #[error("invalid code")]
    InvalidCode,

    #[error(transparent)]
    Api(#[from] DiagralError),
}

/// The alarm central as a panel.
///
/// Triggered is sticky: once an intrusion alert arrives the panel stays
/// triggered until a disarmed status is seen.
pub struct AlarmPanel {
    descriptor: EntityDescriptor,
    state: AlarmState,
    changed_by: Option<String>,
    trigger: Option<Attributes>,
}

impl AlarmPanel {
    pub fn new(entry: &str, data: &CoordinatorData, policy: ActionCodePolicy) -> Self {
        let mut descriptor = entity::descriptor(
            entry,
            &data.configuration,
            EntityKind::AlarmControlPanel,
            "alarm_control_panel",
            "Central",
        );
        descriptor.supported_features = vec!["arm_away".to_string(), "arm_home".to_string()];
        if policy != ActionCodePolicy::Never {
            descriptor.code_format = Some("number".to_string());
        }
        descriptor.code_arm_required = policy.code_arm_required();
        descriptor.code_disarm_required = policy.requires_code(AlarmAction::Disarm);

        let mut panel = Self {
            descriptor,
            state: AlarmState::Unknown,
            changed_by: None,
            trigger: None,
        };
        panel.apply_status(&data.status);
        panel
    }

    pub fn alarm_state(&self) -> AlarmState {
        self.state
    }

    /// Apply a polled or command-returned status. Returns true on change.
    pub fn apply_status(&mut self, status: &SystemStatus) -> bool {
        let mapped = map_status(&status.status);
        let next = match mapped {
            AlarmState::Disarmed => {
                self.trigger = None;
                AlarmState::Disarmed
            }
            _ if self.trigger.is_some() => AlarmState::Triggered,
            other => other,
        };

        if next == self.state {
            return false;
        }
        info!(
            "Alarm state of {} changed from {} to {}",
            self.descriptor.entity_id, self.state, next
        );
        self.state = next;
        true
    }

    /// Intrusion alerts trigger the panel. Returns true when they do.
    pub fn handle_alert(&mut self, notification: &WebhookNotification) -> bool {
        if !notification.is_intrusion() {
            return false;
        }

        let mut trigger = Attributes::new();
        trigger.insert(
            "trigger_group_index".to_string(),
            json!(notification.group_index),
        );
        trigger.insert(
            "trigger_group_name".to_string(),
            json!(notification.group_name),
        );
        trigger.insert(
            "trigger_alarm_code".to_string(),
            json!(notification.alarm_code),
        );
        trigger.insert(
            "trigger_device_label".to_string(),
            json!(notification.detail.device_label),
        );

        info!(
            "Intrusion on {} (code {:?}, group {:?})",
            self.descriptor.entity_id, notification.alarm_code, notification.group_name
        );
        self.trigger = Some(trigger);
        self.state = AlarmState::Triggered;
        true
    }

    /// Status notifications tell who changed the arming state.
    pub fn handle_status(&mut self, notification: &WebhookNotification) -> bool {
        let user = notification
            .user
            .as_ref()
            .and_then(|user| user.username.clone());
        if user.is_none() || user == self.changed_by {
            return false;
        }
        self.changed_by = user;
        true
    }

    pub fn set_device(&mut self, device: Device) {
        self.descriptor.device = device;
    }
}

impl Entity for AlarmPanel {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    fn state(&self) -> EntityState {
        EntityState::AlarmControlPanel(AlarmPanelState {
            state: self.state,
            changed_by: self.changed_by.clone(),
            attributes: self.trigger.clone().unwrap_or_default(),
        })
    }
}

/// Check a user-supplied code against the configured policy.
pub fn check_code(
    policy: ActionCodePolicy,
    expected: Option<u32>,
    action: AlarmAction,
    code: Option<&str>,
) -> Result<(), CommandError> {
    if !policy.requires_code(action) {
        return Ok(());
    }

    let code = code
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(CommandError::CodeRequired(action))?;

    match (code.parse::<u32>(), expected) {
        (Ok(given), Some(expected)) if given == expected => Ok(()),
        _ => Err(CommandError::InvalidCode),
    }
}

/// Run an alarm action against the cloud.
pub async fn execute(
    api: &dyn DiagralApi,
    action: AlarmAction,
) -> Result<SystemStatus, DiagralError> {
    match action {
        AlarmAction::Disarm => api.stop_system().await,
        AlarmAction::ArmAway => api.start_system().await,
        AlarmAction::ArmHome => api.presence().await,
    }
}
