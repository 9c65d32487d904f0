mod alarm_control_panel;
mod binary_sensor;
mod config;
mod coordinator;
// Private module - allowed by clippy.toml allow-private-module-inception
#[allow(clippy::module_inception)]
mod diagral;
mod diagnostics;
mod entity;
#[cfg(test)]
mod mock;
mod sensor;
pub mod setup;
mod webhook;

use std::sync::Arc;

use anyhow::Context;
pub use config::ActionCodePolicy;
pub use config::DiagralEntryConfig;
use diagral_client::DiagralClient;
pub use diagral::DiagralIntegration;
use linkme::distributed_slice;
pub use entity::DOMAIN;
pub use webhook::EVENT_TYPE;

use crate::engine;

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_diagral(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    ctx.config
        .integrations
        .diagral
        .iter()
        .map(|(entry, config)| {
            let client = DiagralClient::new(config.client_config())
                .with_context(|| format!("Failed to create Diagral client for '{}'", entry))?;

            let integration = DiagralIntegration::new(
                entry,
                config.clone(),
                Arc::new(client),
                ctx.config.http.clone(),
                ctx.webhooks.clone(),
                ctx.cloud_relay.clone(),
            );
            Ok(Box::new(integration) as Box<dyn engine::Integration>)
        })
        .collect()
}
