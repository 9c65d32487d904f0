mod device;
mod dispatcher;
mod engine;
mod entity;
mod event;
mod integration;
mod message;
pub mod state;

pub use device::Device;
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use engine::RoutingError;
pub use entity::Entity;
pub use entity::EntityDescriptor;
pub use entity::EntityKind;
pub use event::Event;
pub use integration::FromIntegrationSender;
pub use integration::Integration;
pub use integration::IntegrationContext;
pub use integration::IntegrationFactoryResult;
pub use integration::REGISTRY as INTEGRATION_REGISTRY;
pub use message::AlarmAction;
pub use message::FromIntegrationMessage;
pub use message::ServiceError;
pub use message::ToIntegrationMessage;
pub(crate) use message::deserialize_code;
pub use state::AlarmPanelState;
pub use state::AlarmState;
pub use state::Attributes;
pub use state::BinarySensorState;
pub use state::EntityState;
pub use state::SensorState;
pub use state::State;
