mod config;
mod diagnostics;
mod partial;

pub use config::*;
pub use diagnostics::Diagnostic;
pub use diagnostics::LoadError;
pub use diagnostics::SourceInfo;
pub use diagnostics::ValidationError;
pub use diagnostics::format_diagnostics;
pub use partial::PartialDiagralEntry;
pub use partial::PartialMqttConfig;
