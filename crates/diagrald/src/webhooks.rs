//! Inbound webhooks
//!
//! The HTTP server hands every `POST /api/webhook/{id}` body to the handler
//! registered for `id`. Integrations pick the URL the outside world should
//! call with [`resolve_external_url`], going through a [`CloudRelay`] when
//! the daemon has no public address of its own.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::Url;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::HttpConfig;

/// Raw request bodies delivered to a webhook handler.
pub type WebhookReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Webhook id → handler channel.
#[derive(Default)]
pub struct WebhookRegistry {
    handlers: RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `webhook_id`, replacing any previous one.
    pub fn register(&self, webhook_id: &str) -> WebhookReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(webhook_id.to_string(), tx);
        if previous.is_some() {
            warn!("Replacing an existing webhook handler");
        }
        debug!("Registered webhook handler");
        rx
    }

    pub fn unregister(&self, webhook_id: &str) -> bool {
        let removed = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(webhook_id)
            .is_some();
        if removed {
            debug!("Unregistered webhook handler");
        }
        removed
    }

    pub fn is_registered(&self, webhook_id: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(webhook_id)
    }

    /// Hand `body` to the handler for `webhook_id`.
    ///
    /// Returns false when no live handler exists.
    pub fn dispatch(&self, webhook_id: &str, body: Vec<u8>) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        match handlers.get(webhook_id) {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }
}

/// A fresh webhook id: 32 lowercase hex characters.
pub fn generate_webhook_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Base URL under which this daemon is reachable from the internet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalUrl {
    pub url: Url,

    /// The URL belongs to the cloud relay, hooks must be requested from it
    pub is_relay: bool,
}

/// Pick the best externally reachable URL.
///
/// A configured `external_url` wins over the cloud relay, both must use
/// https, and `internal_url` is never considered.
pub fn resolve_external_url(http: &HttpConfig) -> Option<ExternalUrl> {
    if let Some(url) = &http.external_url {
        if url.scheme() == "https" {
            return Some(ExternalUrl {
                url: url.clone(),
                is_relay: false,
            });
        }
        debug!("Ignoring external_url {}: not https", url);
    }

    let relay = &http.cloud_relay;
    match &relay.url {
        Some(url) if relay.active && url.scheme() == "https" => Some(ExternalUrl {
            url: url.clone(),
            is_relay: true,
        }),
        Some(url) if relay.active => {
            debug!("Ignoring cloud relay {}: not https", url);
            None
        }
        _ => None,
    }
}

/// `{base}/api/webhook/{id}`
pub fn webhook_url(base: &Url, webhook_id: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments
            .pop_if_empty()
            .extend(["api", "webhook", webhook_id]);
    }
    url
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("cloud relay is not active")]
    Inactive,

    #[error("no relay hook for webhook {0}")]
    UnknownHook(String),
}

/// A relay that forwards public requests to this daemon's webhook endpoint.
#[async_trait]
pub trait CloudRelay: Send + Sync {
    fn base_url(&self) -> &Url;

    fn is_active(&self) -> bool;

    /// Public URL forwarding to the local handler for `webhook_id`.
    async fn get_or_create_hook(&self, webhook_id: &str) -> Result<Url, RelayError>;

    async fn release_hook(&self, webhook_id: &str) -> Result<(), RelayError>;
}

/// Relay with a fixed public base URL: hook `id` lives at `{base}/{id}`.
pub struct StaticCloudRelay {
    base_url: Url,
    active: bool,
    hooks: RwLock<HashMap<String, Url>>,
}

impl StaticCloudRelay {
    pub fn new(base_url: Url, active: bool) -> Self {
        Self {
            base_url,
            active,
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Build the relay described by `[http.cloud_relay]`, if any.
    pub fn from_config(http: &HttpConfig) -> Option<Self> {
        let url = http.cloud_relay.url.clone()?;
        Some(Self::new(url, http.cloud_relay.active))
    }
}

#[async_trait]
impl CloudRelay for StaticCloudRelay {
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn is_active(&self) -> bool {
        self.active
    }

    async fn get_or_create_hook(&self, webhook_id: &str) -> Result<Url, RelayError> {
        if !self.active {
            return Err(RelayError::Inactive);
        }

        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        let url = hooks.entry(webhook_id.to_string()).or_insert_with(|| {
            let mut url = self.base_url.clone();
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(webhook_id);
            }
            info!("Created cloud relay hook {}", url);
            url
        });
        Ok(url.clone())
    }

    async fn release_hook(&self, webhook_id: &str) -> Result<(), RelayError> {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(webhook_id)
            .map(|url| info!("Released cloud relay hook {}", url))
            .ok_or_else(|| RelayError::UnknownHook(webhook_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudRelayConfig;

    fn http(external: Option<&str>, relay: Option<&str>, active: bool) -> HttpConfig {
        HttpConfig {
            external_url: external.map(|u| Url::parse(u).unwrap()),
            internal_url: Some(Url::parse("http://192.168.1.10:8565").unwrap()),
            cloud_relay: CloudRelayConfig {
                url: relay.map(|u| Url::parse(u).unwrap()),
                active,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_external_url_preferred_over_relay() {
        let resolved = resolve_external_url(&http(
            Some("https://alarm.example.com"),
            Some("https://relay.example.net"),
            true,
        ))
        .unwrap();
        assert_eq!(resolved.url.as_str(), "https://alarm.example.com/");
        assert!(!resolved.is_relay);
    }

    #[test]
    fn test_plain_http_falls_back_to_relay() {
        let resolved = resolve_external_url(&http(
            Some("http://alarm.example.com"),
            Some("https://relay.example.net"),
            true,
        ))
        .unwrap();
        assert!(resolved.is_relay);
        assert_eq!(resolved.url.host_str(), Some("relay.example.net"));
    }

    #[test]
    fn test_no_usable_url() {
        // Internal URL alone never qualifies
        assert_eq!(resolve_external_url(&http(None, None, true)), None);
        // Inactive relay is not eligible
        assert_eq!(
            resolve_external_url(&http(None, Some("https://relay.example.net"), false)),
            None
        );
    }

    #[test]
    fn test_webhook_url() {
        let base = Url::parse("https://alarm.example.com/").unwrap();
        assert_eq!(
            webhook_url(&base, "0123abcd").as_str(),
            "https://alarm.example.com/api/webhook/0123abcd"
        );

        let prefixed = Url::parse("https://example.com/home/").unwrap();
        assert_eq!(
            webhook_url(&prefixed, "id").as_str(),
            "https://example.com/home/api/webhook/id"
        );
    }

    #[test]
    fn test_generated_ids() {
        let id = generate_webhook_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_webhook_id());
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let registry = WebhookRegistry::new();
        let mut rx = registry.register("abc");

        assert!(registry.dispatch("abc", b"{}".to_vec()));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"{}"[..]));
        assert!(!registry.dispatch("other", Vec::new()));

        assert!(registry.unregister("abc"));
        assert!(!registry.is_registered("abc"));
        assert!(!registry.dispatch("abc", Vec::new()));
    }

    #[tokio::test]
    async fn test_relay_hooks() {
        let relay =
            StaticCloudRelay::new(Url::parse("https://relay.example.net/hooks").unwrap(), true);

        let url = relay.get_or_create_hook("abc").await.unwrap();
        assert_eq!(url.as_str(), "https://relay.example.net/hooks/abc");
        assert_eq!(relay.get_or_create_hook("abc").await.unwrap(), url);

        relay.release_hook("abc").await.unwrap();
        assert!(matches!(
            relay.release_hook("abc").await,
            Err(RelayError::UnknownHook(_))
        ));

        let inactive = StaticCloudRelay::new(Url::parse("https://relay.example.net").unwrap(), false);
        assert!(matches!(
            inactive.get_or_create_hook("abc").await,
            Err(RelayError::Inactive)
        ));
    }
}
