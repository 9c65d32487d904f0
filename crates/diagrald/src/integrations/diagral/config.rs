use std::sync::LazyLock;
use std::time::Duration;

use diagral_client::ApiKeys;
use diagral_client::ClientConfig;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::config::PartialDiagralEntry;
use crate::config::ValidationError;
use crate::engine::AlarmAction;

const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;

/// When the alarm panel asks for `alarmpanel_code`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ActionCodePolicy {
    #[default]
    Never,
    Disarm,
    Always,
}

impl ActionCodePolicy {
    pub fn requires_code(self, action: AlarmAction) -> bool {
        match self {
            ActionCodePolicy::Never => false,
            ActionCodePolicy::Disarm => action == AlarmAction::Disarm,
            ActionCodePolicy::Always => true,
        }
    }

    /// Whether arming actions need a code, as advertised to front-ends.
    pub fn code_arm_required(self) -> bool {
        self == ActionCodePolicy::Always
    }
}

/// Validated `[integrations.diagral.<entry>]` table.
#[derive(Clone)]
pub struct DiagralEntryConfig {
    pub serial_id: String,
    pub username: String,
    pub password: String,
    pub pin_code: u32,
    pub keys: Option<ApiKeys>,
    pub alarmpanel_code: Option<u32>,
    pub alarmpanel_actiontype_code: ActionCodePolicy,
    pub scan_interval: Duration,
    pub api_base_url: String,
}

impl std::fmt::Debug for DiagralEntryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagralEntryConfig")
            .field("serial_id", &self.serial_id)
            .field("keys", &self.keys.as_ref().map(|k| &k.api_key))
            .field("alarmpanel_actiontype_code", &self.alarmpanel_actiontype_code)
            .field("scan_interval", &self.scan_interval)
            .field("api_base_url", &self.api_base_url)
            .finish_non_exhaustive()
    }
}

impl DiagralEntryConfig {
    pub fn from_partial(
        entry: &str,
        partial: PartialDiagralEntry,
    ) -> Result<Self, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let source = partial.source.clone();
        let path = |field: &str| format!("integrations.diagral.{}.{}", entry, field);

        let serial_id = match partial.serial_id {
            Some(s) if !s.get_ref().trim().is_empty() => s.into_inner().trim().to_string(),
            Some(s) => {
                errors.push(
                    ValidationError::new(path("serial_id"), "serial_id must not be empty")
                        .at(s.span(), &source),
                );
                String::new()
            }
            None => {
                errors.push(ValidationError::new(path("serial_id"), "serial_id is required"));
                String::new()
            }
        };

        let username = match partial.username {
            Some(s) if is_valid_email(s.get_ref()) => s.into_inner(),
            Some(s) => {
                errors.push(
                    ValidationError::new(path("username"), "username must be an e-mail address")
                        .at(s.span(), &source),
                );
                String::new()
            }
            None => {
                errors.push(ValidationError::new(path("username"), "username is required"));
                String::new()
            }
        };

        let password = partial.password.unwrap_or_else(|| {
            errors.push(ValidationError::new(path("password"), "password is required"));
            String::new()
        });

        let pin_code = match partial.pin_code {
            Some(pin) => match u32::try_from(*pin.get_ref()) {
                Ok(value) => value,
                Err(_) => {
                    errors.push(
                        ValidationError::new(
                            path("pin_code"),
                            "pin_code must be a non-negative integer",
                        )
                        .at(pin.span(), &source),
                    );
                    0
                }
            },
            None => {
                errors.push(ValidationError::new(path("pin_code"), "pin_code is required"));
                0
            }
        };

        let alarmpanel_code = match partial.alarmpanel_code {
            Some(code) => match u32::try_from(*code.get_ref()) {
                Ok(value) => Some(value),
                Err(_) => {
                    errors.push(
                        ValidationError::new(
                            path("alarmpanel_code"),
                            "alarmpanel_code must be a non-negative integer",
                        )
                        .at(code.span(), &source),
                    );
                    None
                }
            },
            None => None,
        };

        let alarmpanel_actiontype_code = partial.alarmpanel_actiontype_code.unwrap_or_default();
        if alarmpanel_actiontype_code != ActionCodePolicy::Never && alarmpanel_code.is_none() {
            errors.push(ValidationError::new(
                path("alarmpanel_code"),
                format!(
                    "alarmpanel_code is required when alarmpanel_actiontype_code is '{}'",
                    alarmpanel_actiontype_code
                ),
            ));
        }

        let keys = match (partial.api_key, partial.secret_key) {
            (Some(api_key), Some(secret_key)) => Some(ApiKeys {
                api_key: api_key.into_inner(),
                secret_key: secret_key.into_inner(),
            }),
            (None, None) => None,
            (Some(api_key), None) => {
                errors.push(
                    ValidationError::new(path("secret_key"), "api_key requires secret_key")
                        .at(api_key.span(), &source),
                );
                None
            }
            (None, Some(secret_key)) => {
                errors.push(
                    ValidationError::new(path("api_key"), "secret_key requires api_key")
                        .at(secret_key.span(), &source),
                );
                None
            }
        };

        let scan_interval = match partial.scan_interval_secs {
            Some(secs) => match u64::try_from(*secs.get_ref()) {
                Ok(value) if value > 0 => Duration::from_secs(value),
                _ => {
                    errors.push(
                        ValidationError::new(
                            path("scan_interval_secs"),
                            "scan_interval_secs must be greater than zero",
                        )
                        .at(secs.span(), &source),
                    );
                    Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS)
                }
            },
            None => Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
        };

        let api_base_url = match partial.api_base_url {
            Some(url) => match reqwest::Url::parse(url.get_ref()) {
                Ok(_) => url.into_inner(),
                Err(e) => {
                    errors.push(
                        ValidationError::new(path("api_base_url"), format!("invalid URL: {}", e))
                            .at(url.span(), &source),
                    );
                    String::new()
                }
            },
            None => diagral_client::DEFAULT_BASE_URL.to_string(),
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            serial_id,
            username,
            password,
            pin_code,
            keys,
            alarmpanel_code,
            alarmpanel_actiontype_code,
            scan_interval,
            api_base_url,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.api_base_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            serial_id: self.serial_id.clone(),
            pin_code: Some(self.pin_code),
            keys: self.keys.clone(),
        }
    }
}

/// Addresses the vendor accepts for an account.
static EMAIL: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$"));

pub fn is_valid_email(email: &str) -> bool {
    EMAIL.as_ref().is_ok_and(|re| re.is_match(email))
}
