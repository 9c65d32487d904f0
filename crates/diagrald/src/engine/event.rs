use std::sync::Arc;

use super::device::Device;
use super::entity::EntityDescriptor;
use super::state::EntityState;

/// Events broadcast on the engine's bus.
///
/// Distinct from `FromIntegrationMessage` (transport-level). The engine converts
/// `FromIntegrationMessage` into `Event` after updating its state.
#[derive(Debug, Clone)]
pub enum Event {
    EntityDiscovered {
        descriptor: Arc<EntityDescriptor>,
    },
    EntityRemoved {
        entity_id: String,
    },
    StateChanged {
        entity_id: String,
        state: EntityState,
    },
    DeviceUpdated {
        device: Device,
    },

    /// A named bus event, e.g. `DIAGRAL_EVENT`
    Fired {
        event_type: String,
        data: serde_json::Value,
    },
}
