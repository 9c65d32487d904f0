use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::DiagralError;
use crate::models::AlarmConfiguration;
use crate::models::Anomalies;
use crate::models::ApiKeys;
use crate::models::DeviceInfos;
use crate::models::LoginResponse;
use crate::models::SystemStatus;
use crate::models::SystemSummary;
use crate::models::TryConnectResult;
use crate::models::Webhook;
use crate::models::WebhookRequest;
use crate::models::WebhookSubscription;
use crate::signing;

/// Production endpoint of the Diagral cloud.
pub const DEFAULT_BASE_URL: &str = "https://api.diagral.fr/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, DiagralError>;

/// Operations offered by the Diagral cloud.
///
/// The daemon only talks to the cloud through this trait so tests can swap in
/// a scripted implementation.
#[async_trait]
pub trait DiagralApi: Send + Sync {
    /// Authenticate with username and password to obtain an account token.
    async fn login(&self) -> Result<()>;

    /// Check that the credentials work end to end, creating API keys if none
    /// are configured. Ephemeral keys are deleted again before returning.
    async fn try_connection(&self, ephemeral: bool) -> Result<TryConnectResult>;

    /// Name the user gave to the alarm system.
    async fn get_alarm_name(&self) -> Result<String>;

    async fn create_api_key(&self) -> Result<ApiKeys>;

    async fn delete_api_key(&self, api_key: &str) -> Result<()>;

    async fn get_configuration(&self) -> Result<AlarmConfiguration>;

    async fn get_devices_info(&self) -> Result<DeviceInfos>;

    async fn get_system_status(&self) -> Result<SystemStatus>;

    async fn get_anomalies(&self) -> Result<Anomalies>;

    /// Arm every group (away mode).
    async fn start_system(&self) -> Result<SystemStatus>;

    /// Disarm.
    async fn stop_system(&self) -> Result<SystemStatus>;

    /// Arm the presence groups (home mode).
    async fn presence(&self) -> Result<SystemStatus>;

    async fn activate_group(&self, groups: &[u8]) -> Result<SystemStatus>;

    async fn disable_group(&self, groups: &[u8]) -> Result<SystemStatus>;

    /// Webhook registered for this system. Fails with
    /// [`DiagralError::NoSubscription`] when there is none.
    async fn get_webhook(&self) -> Result<Webhook>;

    async fn register_webhook(&self, url: &str, subscription: WebhookSubscription)
        -> Result<Webhook>;

    async fn update_webhook(&self, url: &str, subscription: WebhookSubscription)
        -> Result<Webhook>;

    async fn delete_webhook(&self) -> Result<()>;

    /// Drop the session.
    async fn close(&self) -> Result<()>;
}

/// Connection settings for [`DiagralClient`].
#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub serial_id: String,
    pub pin_code: Option<u32>,
    pub keys: Option<ApiKeys>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("serial_id", &self.serial_id)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// `reqwest` based implementation of [`DiagralApi`].
pub struct DiagralClient {
    http: reqwest::Client,
    config: ClientConfig,
    access_token: Mutex<Option<String>>,
    keys: Mutex<Option<ApiKeys>>,
}

impl DiagralClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.serial_id.trim().is_empty() {
            return Err(DiagralError::Configuration(
                "serial_id must not be empty".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("diagral_client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let keys = config.keys.clone();
        Ok(Self {
            http,
            config,
            access_token: Mutex::new(None),
            keys: Mutex::new(keys),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn system_path(&self, suffix: &str) -> String {
        format!("systems/{}/{}", self.config.serial_id, suffix)
    }

    /// Request authenticated with the account token, logging in first if needed.
    async fn bearer(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = {
            let guard = self.access_token.lock().await;
            guard.clone()
        };

        let token = match token {
            Some(token) => token,
            None => {
                self.login().await?;
                self.access_token
                    .lock()
                    .await
                    .clone()
                    .ok_or_else(|| DiagralError::Session("login returned no token".to_string()))?
            }
        };

        Ok(self
            .http
            .request(method, self.url(path))
            .bearer_auth(token))
    }

    /// Request authenticated with the API key signature.
    async fn signed(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let keys = self.keys.lock().await.clone().ok_or_else(|| {
            DiagralError::Configuration("API key and secret key are required".to_string())
        })?;

        Ok(self.signed_with(&keys, method, path, chrono::Utc::now().timestamp()))
    }

    fn signed_with(
        &self,
        keys: &ApiKeys,
        method: Method,
        path: &str,
        timestamp: i64,
    ) -> RequestBuilder {
        let headers = signing::sign(
            &self.config.serial_id,
            &keys.api_key,
            &keys.secret_key,
            timestamp,
        );

        let mut request = self
            .http
            .request(method, self.url(path))
            .header("X-HMAC", headers.hmac)
            .header("X-TIMESTAMP", headers.timestamp)
            .header("X-APIKEY", headers.api_key);

        if let Some(pin) = self.config.pin_code {
            request = request.header("X-PIN-CODE", pin.to_string());
        }

        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<String> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            debug!("Diagral cloud answered {}: {}", status, body);
            return Err(DiagralError::from_response(status, &body));
        }

        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let body = self.send(request).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn systems(&self) -> Result<Vec<SystemSummary>> {
        let request = self.bearer(Method::GET, "users/systems").await?;
        self.send_json(request).await
    }
}

#[async_trait]
impl DiagralApi for DiagralClient {
    async fn login(&self) -> Result<()> {
        debug!("Logging in to the Diagral cloud as {}", self.config.username);

        let request = self
            .http
            .post(self.url("users/authenticate/login"))
            .query(&[("vendor", "DIAGRAL")])
            .json(&serde_json::json!({
                "username": self.config.username,
                "password": self.config.password,
            }));

        let response: LoginResponse = self.send_json(request).await.map_err(|e| match e {
            DiagralError::Client { message, .. } => DiagralError::Authentication(message),
            other => other,
        })?;

        *self.access_token.lock().await = Some(response.access_token);
        Ok(())
    }

    async fn try_connection(&self, ephemeral: bool) -> Result<TryConnectResult> {
        let existing = self.keys.lock().await.clone();

        let created = match existing {
            Some(_) => None,
            None => Some(self.create_api_key().await?),
        };

        let status = self.get_system_status().await;

        if ephemeral {
            if let Some(keys) = &created {
                if let Err(e) = self.delete_api_key(&keys.api_key).await {
                    warn!("Failed to delete ephemeral API key: {}", e);
                }
                *self.keys.lock().await = None;
            }
        }

        status?;

        Ok(TryConnectResult {
            result: true,
            keys: if ephemeral { None } else { created },
        })
    }

    async fn get_alarm_name(&self) -> Result<String> {
        let systems = self.systems().await?;
        let system = systems
            .into_iter()
            .find(|s| s.serial_id == self.config.serial_id)
            .ok_or_else(|| {
                DiagralError::Configuration(format!(
                    "system {} is not attached to this account",
                    self.config.serial_id
                ))
            })?;

        Ok(system.name.unwrap_or_else(|| "Diagral".to_string()))
    }

    async fn create_api_key(&self) -> Result<ApiKeys> {
        let request = self
            .bearer(Method::POST, "users/api_key")
            .await?
            .json(&serde_json::json!({ "serial_id": self.config.serial_id }));

        let keys: ApiKeys = self.send_json(request).await?;
        info!("Created API key {} for {}", keys.api_key, self.config.serial_id);

        *self.keys.lock().await = Some(keys.clone());
        Ok(keys)
    }

    async fn delete_api_key(&self, api_key: &str) -> Result<()> {
        let request = self
            .bearer(Method::DELETE, &format!("users/api_key/{}", api_key))
            .await?;
        self.send(request).await?;

        let mut keys = self.keys.lock().await;
        if keys.as_ref().is_some_and(|k| k.api_key == api_key) {
            *keys = None;
        }
        Ok(())
    }

    async fn get_configuration(&self) -> Result<AlarmConfiguration> {
        let request = self
            .signed(Method::GET, &self.system_path("configurations"))
            .await?;
        self.send_json(request).await
    }

    async fn get_devices_info(&self) -> Result<DeviceInfos> {
        let request = self
            .signed(Method::GET, &self.system_path("devices_infos"))
            .await?;
        self.send_json(request).await
    }

    async fn get_system_status(&self) -> Result<SystemStatus> {
        let request = self.signed(Method::POST, &self.system_path("status")).await?;
        self.send_json(request).await
    }

    async fn get_anomalies(&self) -> Result<Anomalies> {
        let request = self
            .signed(Method::GET, &self.system_path("anomalies"))
            .await?;
        let body = self.send(request).await?;
        if body.trim().is_empty() {
            return Ok(Anomalies::default());
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn start_system(&self) -> Result<SystemStatus> {
        let request = self.signed(Method::POST, &self.system_path("start")).await?;
        self.send_json(request).await
    }

    async fn stop_system(&self) -> Result<SystemStatus> {
        let request = self.signed(Method::POST, &self.system_path("stop")).await?;
        self.send_json(request).await
    }

    async fn presence(&self) -> Result<SystemStatus> {
        let request = self
            .signed(Method::POST, &self.system_path("presence"))
            .await?;
        self.send_json(request).await
    }

    async fn activate_group(&self, groups: &[u8]) -> Result<SystemStatus> {
        let request = self
            .signed(Method::POST, &self.system_path("activate_group"))
            .await?
            .json(&serde_json::json!({ "groups": groups }));
        self.send_json(request).await
    }

    async fn disable_group(&self, groups: &[u8]) -> Result<SystemStatus> {
        let request = self
            .signed(Method::POST, &self.system_path("disable_group"))
            .await?
            .json(&serde_json::json!({ "groups": groups }));
        self.send_json(request).await
    }

    async fn get_webhook(&self) -> Result<Webhook> {
        let path = format!("webhooks/{}/subscription", self.config.serial_id);
        let request = self.signed(Method::GET, &path).await?;
        self.send_json(request).await
    }

    async fn register_webhook(
        &self,
        url: &str,
        subscription: WebhookSubscription,
    ) -> Result<Webhook> {
        let path = format!("webhooks/{}/subscription", self.config.serial_id);
        let request = self
            .signed(Method::POST, &path)
            .await?
            .json(&WebhookRequest::new(url, subscription));
        self.send_json(request).await
    }

    async fn update_webhook(
        &self,
        url: &str,
        subscription: WebhookSubscription,
    ) -> Result<Webhook> {
        let path = format!("webhooks/{}/subscription", self.config.serial_id);
        let request = self
            .signed(Method::PUT, &path)
            .await?
            .json(&WebhookRequest::new(url, subscription));
        self.send_json(request).await
    }

    async fn delete_webhook(&self) -> Result<()> {
        let path = format!("webhooks/{}/subscription", self.config.serial_id);
        let request = self.signed(Method::DELETE, &path).await?;
        self.send(request).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.access_token.lock().await = None;
        Ok(())
    }
}
