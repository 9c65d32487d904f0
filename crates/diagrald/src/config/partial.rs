use std::collections::HashMap;
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use toml::Spanned;

use super::LogLevel;
use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::MergeConflictLocation;
use super::diagnostics::MergeError;
use super::diagnostics::SourceInfo;
use super::diagnostics::Warning;
use crate::integrations::diagral::ActionCodePolicy;

#[derive(Debug, Default, Deserialize)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub http: Option<PartialHttpConfig>,
    pub integrations: Option<PartialIntegrationsConfig>,

    /// Source information for error reporting (not serialized)
    #[serde(skip)]
    pub source: Option<SourceInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialLoggingConfig {
    pub level: Option<Spanned<LogLevel>>,
    pub overrides: Option<HashMap<String, Spanned<LogLevel>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialHttpConfig {
    pub listen: Option<Spanned<String>>,
    pub port: Option<Spanned<u16>>,
    pub external_url: Option<Spanned<String>>,
    pub internal_url: Option<Spanned<String>>,
    pub cloud_relay: Option<PartialCloudRelayConfig>,

    #[serde(skip)]
    pub source: Option<SourceInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialCloudRelayConfig {
    pub url: Option<Spanned<String>>,
    pub active: Option<Spanned<bool>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialIntegrationsConfig {
    pub mqtt: Option<PartialMqttConfig>,

    #[serde(default)]
    pub diagral: HashMap<String, PartialDiagralEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialMqttConfig {
    pub broker: Option<Spanned<String>>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub discovery_prefix: Option<String>,
    pub base_topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(skip)]
    pub source: Option<SourceInfo>,
}

/// One `[integrations.diagral.<entry>]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialDiagralEntry {
    pub serial_id: Option<Spanned<String>>,
    pub username: Option<Spanned<String>>,
    pub password: Option<String>,
    pub pin_code: Option<Spanned<i64>>,
    pub api_key: Option<Spanned<String>>,
    pub secret_key: Option<Spanned<String>>,
    pub alarmpanel_code: Option<Spanned<i64>>,
    pub alarmpanel_actiontype_code: Option<ActionCodePolicy>,
    pub scan_interval_secs: Option<Spanned<i64>>,
    pub api_base_url: Option<Spanned<String>>,

    #[serde(skip)]
    pub source: Option<SourceInfo>,
}

impl PartialConfig {
    /// Load a single config file without processing imports
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        let mut config: PartialConfig = toml::from_str(&content).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e,
        })?;

        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        });

        Ok(config)
    }

    /// Load config files with import resolution
    ///
    /// Each config file is loaded, then its imports are recursively processed.
    /// Returns all loaded configs in order (imports first, then parent).
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut visited = HashSet::new();
        let mut all_configs = Vec::new();

        for path in paths {
            Self::load_recursive(path, &mut visited, &mut all_configs)?;
        }

        Ok(all_configs)
    }

    fn load_recursive(
        path: &Path,
        visited: &mut HashSet<PathBuf>,
        configs: &mut Vec<Self>,
    ) -> Result<(), LoadError> {
        let canonical_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        if visited.contains(&canonical_path) {
            return Err(LoadError::ImportCycle {
                path: canonical_path.clone(),
                cycle: visited.iter().cloned().collect(),
            });
        }

        visited.insert(canonical_path.clone());

        let config = Self::from_file(path)?;

        for import_path in &config.imports {
            let import_path_buf = PathBuf::from(import_path);

            // Relative imports resolve from the importing file's directory
            let resolved_path = if import_path_buf.is_absolute() {
                import_path_buf
            } else {
                let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
                parent_dir.join(import_path_buf)
            };

            Self::load_recursive(&resolved_path, visited, configs)?;
        }

        configs.push(config);

        // Sibling branches may import the same file
        visited.remove(&canonical_path);

        Ok(())
    }

    /// Merge multiple partial configs together
    ///
    /// Uses first-wins semantics: the first occurrence of a field is kept.
    /// Every later definition of the same field is reported as a conflict, and
    /// merging carries on so all conflicts are reported at once.
    pub fn merge<I>(configs: I) -> (Self, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut result = PartialConfig::default();
        let mut merger = Merger::default();
        let mut imports = Vec::new();

        for config in configs {
            imports.extend(config.imports.clone());

            let source_info = config.source.clone().unwrap_or_else(|| SourceInfo {
                file_path: PathBuf::from("<unknown>"),
                content: String::new(),
            });

            let is_empty = config.logging.is_none()
                && config.http.is_none()
                && config.integrations.is_none()
                && config.imports.is_empty();

            if is_empty {
                merger
                    .diagnostics
                    .push(Diagnostic::Warning(Warning::EmptyConfig {
                        file_path: source_info.file_path.clone(),
                    }));
            }

            if let Some(logging) = config.logging {
                let target = result.logging.get_or_insert_with(Default::default);
                merger.spanned("logging.level", &mut target.level, logging.level, &source_info);

                if let Some(overrides) = logging.overrides {
                    let target_overrides = target.overrides.get_or_insert_with(HashMap::new);
                    for (key, value) in overrides {
                        let path = format!("logging.overrides.{}", key);
                        let loc = location(&source_info, value.span());
                        if merger.claim(path, loc) {
                            target_overrides.insert(key, value);
                        }
                    }
                }
            }

            if let Some(http) = config.http {
                let target = result.http.get_or_insert_with(Default::default);
                if target.source.is_none() {
                    target.source = Some(source_info.clone());
                }

                merger.spanned("http.listen", &mut target.listen, http.listen, &source_info);
                merger.spanned("http.port", &mut target.port, http.port, &source_info);
                merger.spanned(
                    "http.external_url",
                    &mut target.external_url,
                    http.external_url,
                    &source_info,
                );
                merger.spanned(
                    "http.internal_url",
                    &mut target.internal_url,
                    http.internal_url,
                    &source_info,
                );

                if let Some(relay) = http.cloud_relay {
                    let target_relay = target.cloud_relay.get_or_insert_with(Default::default);
                    merger.spanned(
                        "http.cloud_relay.url",
                        &mut target_relay.url,
                        relay.url,
                        &source_info,
                    );
                    merger.spanned(
                        "http.cloud_relay.active",
                        &mut target_relay.active,
                        relay.active,
                        &source_info,
                    );
                }
            }

            if let Some(integrations) = config.integrations {
                let target = result.integrations.get_or_insert_with(Default::default);

                if let Some(mut mqtt) = integrations.mqtt {
                    let loc = table_location(&source_info, "[integrations.mqtt]");
                    if merger.claim("integrations.mqtt".to_string(), loc) {
                        mqtt.source = Some(source_info.clone());
                        target.mqtt = Some(mqtt);
                    }
                }

                for (key, mut entry) in integrations.diagral {
                    let header = format!("[integrations.diagral.{}]", key);
                    let loc = table_location(&source_info, &header);
                    if merger.claim(format!("integrations.diagral.{}", key), loc) {
                        entry.source = Some(source_info.clone());
                        target.diagral.insert(key, entry);
                    }
                }
            }
        }

        result.imports = imports;

        (result, merger.diagnostics)
    }
}

/// First-wins bookkeeping for [`PartialConfig::merge`].
#[derive(Default)]
struct Merger {
    diagnostics: Vec<Diagnostic>,
    seen: HashMap<String, MergeConflictLocation>,
}

impl Merger {
    /// Returns true if this is the first definition of `field_path`.
    fn claim(&mut self, field_path: String, location: MergeConflictLocation) -> bool {
        if let Some(prev) = self.seen.get(&field_path) {
            self.diagnostics.push(Diagnostic::Error(Error::Merge(MergeError {
                message: format!("'{}' is defined in multiple config files", field_path),
                conflicts: vec![prev.clone(), location],
                field_path,
            })));
            false
        } else {
            self.seen.insert(field_path, location);
            true
        }
    }

    fn spanned<T>(
        &mut self,
        field_path: &str,
        slot: &mut Option<Spanned<T>>,
        incoming: Option<Spanned<T>>,
        source: &SourceInfo,
    ) {
        let Some(value) = incoming else {
            return;
        };

        if self.claim(field_path.to_string(), location(source, value.span())) {
            *slot = Some(value);
        }
    }
}

fn location(source: &SourceInfo, span: Range<usize>) -> MergeConflictLocation {
    MergeConflictLocation {
        file_path: source.file_path.clone(),
        span,
        content: source.content.clone(),
    }
}

/// Location of a table header, or the start of the file if it cannot be found.
fn table_location(source: &SourceInfo, header: &str) -> MergeConflictLocation {
    let span = source
        .content
        .find(header)
        .map(|start| start..(start + header.len()))
        .unwrap_or(0..0);
    location(source, span)
}
