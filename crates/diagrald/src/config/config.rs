use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use reqwest::Url;
use serde::Deserialize;
use toml::Spanned;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::SourceInfo;
use super::diagnostics::ValidationError;
use super::diagnostics::Warning;
use super::diagnostics::format_diagnostics;
use super::partial::PartialConfig;
use super::partial::PartialHttpConfig;
use crate::integrations::diagral::DiagralEntryConfig;
use crate::integrations::mqtt::MqttConfig;

const DEFAULT_LISTEN: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8565;

#[derive(Debug, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub http: HttpConfig,
    pub integrations: IntegrationsConfig,
}

// LogLevel needs Deserialize because it's used in PartialLoggingConfig with toml::Spanned
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"diagrald::integrations::mqtt" = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Filter applying the default level and every per-target override.
    pub fn targets(&self) -> Targets {
        self.overrides.iter().fold(
            Targets::new().with_default(LevelFilter::from(self.level)),
            |targets, (target, level)| targets.with_target(target.clone(), *level),
        )
    }
}

/// Where the daemon listens and how the outside world reaches it.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub listen: String,
    pub port: u16,

    /// Publicly reachable base URL of this daemon.
    pub external_url: Option<Url>,

    /// URL only reachable from the local network. Never handed to the cloud.
    pub internal_url: Option<Url>,

    pub cloud_relay: CloudRelayConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            port: DEFAULT_PORT,
            external_url: None,
            internal_url: None,
            cloud_relay: CloudRelayConfig::default(),
        }
    }
}

/// A relay service forwarding public webhook calls to this daemon.
#[derive(Debug, Clone, Default)]
pub struct CloudRelayConfig {
    pub url: Option<Url>,

    /// Defaults to true when `url` is set.
    pub active: bool,
}

#[derive(Debug, Default)]
pub struct IntegrationsConfig {
    pub mqtt: Option<MqttConfig>,

    /// Diagral systems keyed by entry name
    pub diagral: BTreeMap<String, DiagralEntryConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] LoadError),

    /// One or more diagnostics were errors; the payload is the rendered report.
    #[error("{0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from multiple TOML files with import resolution
    ///
    /// Supports a base file plus secrets, `imports` inside files, conflict
    /// detection across all sources, and validation with every error and
    /// warning reported together.
    ///
    /// Only returns Err if there are actual errors (not just warnings).
    pub fn from_files(paths: &[PathBuf]) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let configs = PartialConfig::load_with_imports(paths)?;
        let (partial, diagnostics) = PartialConfig::merge(configs);
        Self::from_partial(partial, diagnostics)
    }

    /// Convert a merged PartialConfig to a Config, validating all fields
    pub fn from_partial(
        partial: PartialConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let mut errors = Vec::new();

        let logging = if let Some(partial_logging) = partial.logging {
            LoggingConfig {
                level: partial_logging
                    .level
                    .map(|s| *s.get_ref())
                    .unwrap_or_default(),
                overrides: partial_logging
                    .overrides
                    .map(|hm| hm.into_iter().map(|(k, v)| (k, *v.get_ref())).collect())
                    .unwrap_or_default(),
            }
        } else {
            LoggingConfig::default()
        };

        let http = partial
            .http
            .map(|h| Self::http_from_partial(h, &mut errors))
            .unwrap_or_default();

        let mut integrations = IntegrationsConfig::default();
        if let Some(partial_integrations) = partial.integrations {
            if let Some(mqtt) = partial_integrations.mqtt {
                match MqttConfig::from_partial(mqtt) {
                    Ok(config) => integrations.mqtt = Some(config),
                    Err(e) => errors.extend(e),
                }
            }

            for (entry, partial_entry) in partial_integrations.diagral {
                match DiagralEntryConfig::from_partial(&entry, partial_entry) {
                    Ok(config) => {
                        integrations.diagral.insert(entry, config);
                    }
                    Err(e) => errors.extend(e),
                }
            }
        }

        errors.sort_by(|a, b| a.field_path.cmp(&b.field_path));
        diagnostics.extend(
            errors
                .into_iter()
                .map(|e| Diagnostic::Error(Error::Validation(e))),
        );

        if integrations.diagral.is_empty() && integrations.mqtt.is_none() {
            diagnostics.push(Diagnostic::Warning(Warning::NothingToRun));
        }

        let config = Config {
            logging,
            http,
            integrations,
        };

        if diagnostics.iter().any(|d| d.is_error()) {
            Err(ConfigError::Invalid(format_diagnostics(&diagnostics)))
        } else {
            Ok((config, diagnostics))
        }
    }

    fn http_from_partial(partial: PartialHttpConfig, errors: &mut Vec<ValidationError>) -> HttpConfig {
        let source = &partial.source;
        let defaults = HttpConfig::default();

        let (relay_url, relay_active) = match partial.cloud_relay {
            Some(relay) => (relay.url, relay.active.map(|a| *a.get_ref())),
            None => (None, None),
        };
        let relay_url = parse_url("http.cloud_relay.url", relay_url, source, errors);

        HttpConfig {
            listen: partial
                .listen
                .map(Spanned::into_inner)
                .unwrap_or(defaults.listen),
            port: partial.port.map(|p| *p.get_ref()).unwrap_or(defaults.port),
            external_url: parse_url("http.external_url", partial.external_url, source, errors),
            internal_url: parse_url("http.internal_url", partial.internal_url, source, errors),
            cloud_relay: CloudRelayConfig {
                active: relay_active.unwrap_or(relay_url.is_some()),
                url: relay_url,
            },
        }
    }
}

fn parse_url(
    field_path: &str,
    value: Option<Spanned<String>>,
    source: &Option<SourceInfo>,
    errors: &mut Vec<ValidationError>,
) -> Option<Url> {
    let value = value?;
    match Url::parse(value.get_ref()) {
        Ok(url) => Some(url),
        Err(e) => {
            errors.push(
                ValidationError::new(field_path, format!("invalid URL: {}", e))
                    .at(value.span(), source),
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const ENTRY: &str = r#"
[integrations.diagral.home]
serial_id = "1A2B3C"
username = "jane@example.com"
password = "hunter2"
pin_code = 1234
"#;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_merge_non_overlapping_configs() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            &dir,
            "base.toml",
            &format!("[logging]\nlevel = \"info\"\n{}", ENTRY),
        );
        let extra = write(
            &dir,
            "extra.toml",
            r#"
[logging.overrides]
"diagrald::api" = "debug"

[http]
external_url = "https://alarm.example.org"
"#,
        );

        let (config, diagnostics) = Config::from_files(&[base, extra]).unwrap();
        assert!(diagnostics.is_empty(), "unexpected: {:?}", diagnostics);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(
            config.logging.overrides.get("diagrald::api"),
            Some(&LogLevel::Debug)
        );
        assert_eq!(
            config.http.external_url.as_ref().map(Url::as_str),
            Some("https://alarm.example.org/")
        );
        assert_eq!(config.http.port, 8565);
        assert!(config.integrations.diagral.contains_key("home"));
    }

    #[test]
    fn test_conflict_detection() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(&dir, "base.toml", &format!("[logging]\nlevel = \"info\"\n{}", ENTRY));
        let conflict = write(&dir, "conflict.toml", "[logging]\nlevel = \"debug\"\n");

        let err = Config::from_files(&[base, conflict]).unwrap_err().to_string();
        assert!(err.contains("Merge conflict"));
        assert!(err.contains("logging.level"));
    }

    #[test]
    fn test_duplicate_entry_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(&dir, "a.toml", ENTRY);
        let b = write(&dir, "b.toml", ENTRY);

        let err = Config::from_files(&[a, b]).unwrap_err().to_string();
        assert!(err.contains("integrations.diagral.home"));
    }

    #[test]
    fn test_secrets_in_separate_entry() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = write(
            &dir,
            "secrets/diagral.toml",
            &format!("{}api_key = \"key\"\nsecret_key = \"secret\"\n", ENTRY),
        );
        let main = write(
            &dir,
            "main.toml",
            "imports = [\"secrets/diagral.toml\"]\n\n[http]\nport = 9000\n",
        );
        assert!(secrets.exists());

        let (config, _) = Config::from_files(&[main]).unwrap();
        assert_eq!(config.http.port, 9000);
        let entry = &config.integrations.diagral["home"];
        assert_eq!(entry.keys.as_ref().map(|k| k.api_key.as_str()), Some("key"));
    }

    #[test]
    fn test_import_cycle_detection() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(&dir, "a.toml", "imports = [\"b.toml\"]\n[logging]\nlevel = \"info\"\n");
        write(&dir, "b.toml", "imports = [\"a.toml\"]\n");

        let err = Config::from_files(&[a]).unwrap_err();
        assert!(matches!(err, ConfigError::Load(LoadError::ImportCycle { .. })));
        assert!(err.to_string().contains("Import cycle"));
    }

    #[test]
    fn test_validation_errors_point_at_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "bad.toml",
            "[http]\nexternal_url = \"not a url\"\n\n[integrations.diagral.home]\nserial_id = \"X\"\nusername = \"nope\"\npassword = \"pw\"\npin_code = 1\n",
        );

        let err = Config::from_files(&[path]).unwrap_err().to_string();
        assert!(err.contains("http.external_url"));
        assert!(err.contains("integrations.diagral.home.username"));
        assert!(err.contains("must be an e-mail address"));
    }

    #[test]
    fn test_empty_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write(&dir, "empty.toml", "");

        let (config, diagnostics) = Config::from_files(&[empty]).unwrap();
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics.iter().all(Diagnostic::is_warning));
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.integrations.diagral.is_empty());
    }

    #[test]
    fn test_cloud_relay_active_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "relay.toml",
            &format!("[http.cloud_relay]\nurl = \"https://relay.example.net/hooks\"\n{}", ENTRY),
        );

        let (config, _) = Config::from_files(&[path]).unwrap();
        assert!(config.http.cloud_relay.active);
        assert!(config.http.cloud_relay.url.is_some());
    }

    #[test]
    fn test_logging_targets() {
        let logging = LoggingConfig {
            level: LogLevel::Warn,
            overrides: HashMap::from([("diagrald::engine".to_string(), LogLevel::Trace)]),
        };
        let targets = logging.targets();
        assert!(targets.would_enable("diagrald::engine", &tracing::Level::TRACE));
        assert!(!targets.would_enable("diagrald::api", &tracing::Level::INFO));
    }

    #[test]
    fn test_missing_file_error() {
        let err = Config::from_files(&[PathBuf::from("/nonexistent/config.toml")])
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read"));
        assert!(err.contains("/nonexistent/config.toml"));
    }
}
