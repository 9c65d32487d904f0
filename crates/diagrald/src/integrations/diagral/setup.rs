//! `diagrald setup` and `diagrald remove-api-key`.

use diagral_client::ClientConfig;
use diagral_client::DiagralApi;
use diagral_client::DiagralError;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::config::is_valid_email;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("'{0}' is not a valid e-mail address")]
    InvalidEmail(String),

    #[error("the PIN code must be a number")]
    InvalidPin,

    #[error("the cloud did not return API keys")]
    NoKeys,

    #[error(transparent)]
    Api(#[from] DiagralError),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Answers collected by the wizard.
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub entry: String,
    pub username: String,
    pub password: String,
    pub serial_id: String,
    pub pin_code: String,
    pub api_base_url: String,
}

impl SetupRequest {
    /// Check the inputs and build the client settings for them.
    pub fn validate(&self) -> Result<ClientConfig, SetupError> {
        if !is_valid_email(&self.username) {
            return Err(SetupError::InvalidEmail(self.username.clone()));
        }
        let pin_code = self.pin_code()?;

        Ok(ClientConfig {
            base_url: self.api_base_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            serial_id: self.serial_id.trim().to_string(),
            pin_code: Some(pin_code),
            keys: None,
        })
    }

    fn pin_code(&self) -> Result<u32, SetupError> {
        self.pin_code
            .trim()
            .parse()
            .map_err(|_| SetupError::InvalidPin)
    }
}

#[derive(Serialize)]
struct EntryBlock<'a> {
    serial_id: &'a str,
    username: &'a str,
    password: &'a str,
    pin_code: u32,
    api_key: &'a str,
    secret_key: &'a str,
}

/// Result of a successful setup.
#[derive(Debug)]
pub struct SetupOutcome {
    /// `"{alarm name} ({serial})"`
    pub title: String,

    /// Ready-to-paste `[integrations.diagral.<entry>]` table
    pub config: String,
}

/// Create permanent API keys and render the matching config block.
pub async fn run_setup(
    api: &dyn DiagralApi,
    request: &SetupRequest,
) -> Result<SetupOutcome, SetupError> {
    let pin_code = request.pin_code()?;
    let serial_id = request.serial_id.trim();

    let keys = api
        .try_connection(false)
        .await?
        .keys
        .ok_or(SetupError::NoKeys)?;
    let name = api.get_alarm_name().await?;
    let title = format!("{} ({})", name, serial_id);
    info!("Connected to {}", title);

    let block = toml::to_string(&EntryBlock {
        serial_id,
        username: &request.username,
        password: &request.password,
        pin_code,
        api_key: &keys.api_key,
        secret_key: &keys.secret_key,
    })?;

    let config = format!(
        "# {}\n[integrations.diagral.{}]\n{}",
        title,
        table_key(&request.entry),
        block
    );
    Ok(SetupOutcome { title, config })
}

/// Delete a stored API key. Returns false when there was none.
pub async fn remove_api_key(api: &dyn DiagralApi, api_key: Option<&str>) -> Result<bool, SetupError> {
    let Some(api_key) = api_key else {
        warn!("No API key found, skipping deletion");
        return Ok(false);
    };

    api.login().await?;
    api.delete_api_key(api_key).await?;
    info!("API key {} deleted", api_key);
    Ok(true)
}

fn table_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        key.to_string()
    } else {
        format!("\"{}\"", key.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
