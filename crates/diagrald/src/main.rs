use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use diagral_client::DEFAULT_BASE_URL;
use diagral_client::DiagralClient;
use diagrald::Config;
use diagrald::Engine;
use diagrald::IntegrationContext;
use diagrald::config::LoggingConfig;
use diagrald::format_diagnostics;
use diagrald::setup;
use diagrald::webhooks::CloudRelay;
use diagrald::webhooks::StaticCloudRelay;
use diagrald::webhooks::WebhookRegistry;
use tokio::sync::oneshot;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "diagrald", version)]
#[command(about = "Bridge Diagral cloud alarm systems to MQTT and HTTP")]
struct Cli {
    /// Configuration files, merged in order
    #[arg(short, long = "config", default_value = "diagrald.toml", global = true)]
    config: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (the default)
    Run,

    /// Load and validate the configuration, then exit
    CheckConfig,

    /// Create permanent API keys and print the matching config block
    Setup {
        /// Name of the `[integrations.diagral.<entry>]` table
        #[arg(long, default_value = "home")]
        entry: String,

        /// Diagral account e-mail address
        #[arg(long)]
        username: String,

        /// Diagral account password
        #[arg(long, env = "DIAGRAL_PASSWORD", hide_env_values = true)]
        password: String,

        /// Serial number of the central
        #[arg(long)]
        serial: String,

        /// Master PIN code
        #[arg(long, env = "DIAGRAL_PIN", hide_env_values = true)]
        pin: String,

        #[arg(long, default_value = DEFAULT_BASE_URL)]
        api_base_url: String,
    },

    /// Delete the API key stored for an entry from the Diagral cloud
    RemoveApiKey {
        /// Entry name under `[integrations.diagral]`
        entry: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = load_config(&cli.config)?;
            init_tracing(&config.logging);
            run(config).await
        }
        Command::CheckConfig => {
            load_config(&cli.config)?;
            println!("Configuration OK");
            Ok(())
        }
        Command::Setup {
            entry,
            username,
            password,
            serial,
            pin,
            api_base_url,
        } => {
            init_tracing(&LoggingConfig::default());
            let request = setup::SetupRequest {
                entry,
                username,
                password,
                serial_id: serial,
                pin_code: pin,
                api_base_url,
            };
            let client = DiagralClient::new(request.validate()?)?;
            let outcome = setup::run_setup(&client, &request).await?;
            println!("{}", outcome.config);
            Ok(())
        }
        Command::RemoveApiKey { entry } => {
            let config = load_config(&cli.config)?;
            init_tracing(&config.logging);
            let entry_config = config
                .integrations
                .diagral
                .get(&entry)
                .with_context(|| format!("No Diagral entry named '{}'", entry))?;

            let client = DiagralClient::new(entry_config.client_config())?;
            let api_key = entry_config.keys.as_ref().map(|k| k.api_key.as_str());
            setup::remove_api_key(&client, api_key).await?;
            Ok(())
        }
    }
}

/// Load the config files, printing warnings and failing on errors.
fn load_config(paths: &[PathBuf]) -> anyhow::Result<Config> {
    let (config, diagnostics) = Config::from_files(paths)?;
    if !diagnostics.is_empty() {
        eprint!("{}", format_diagnostics(&diagnostics));
    }
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(logging.targets())
        .init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("diagrald {} starting", env!("CARGO_PKG_VERSION"));

    let webhooks = Arc::new(WebhookRegistry::new());
    let cloud_relay = StaticCloudRelay::from_config(&config.http)
        .map(|relay| Arc::new(relay) as Arc<dyn CloudRelay>);

    let mut engine = Engine::new();
    engine.register_integrations_from_config(&IntegrationContext {
        config: &config,
        webhooks: webhooks.clone(),
        cloud_relay,
    });
    let engine = Arc::new(engine);
    tracing::info!("Integrations: {:?}", engine.integration_names());

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut server = tokio::spawn({
        let http = config.http.clone();
        let engine = engine.clone();
        async move { diagrald::api::serve(&http, engine, webhooks, shutdown_rx).await }
    });

    let server_result = tokio::select! {
        _ = engine.run() => None,
        result = &mut server => Some(result),
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("Received shutdown signal"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
            None
        }
    };

    tracing::info!("Shutting down integrations");
    engine.shutdown().await;

    let server_result = match server_result {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(());
            server.await
        }
    };
    server_result.context("HTTP server task panicked")??;

    tracing::info!("diagrald shutdown complete");
    Ok(())
}
