pub mod api;
pub mod config;
mod engine;
mod integrations;
pub mod webhooks;

pub use config::Config;
pub use config::Diagnostic;
pub use config::LogLevel;
pub use config::format_diagnostics;
pub use engine::Engine;
pub use engine::EntityState;
pub use engine::Event;
pub use engine::IntegrationContext;
pub use engine::State;
pub use integrations::diagral::setup;
