//! Declarative import configuration: which resources to watch and how to map them.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// The only config schema version this build understands.
pub const CONFIG_VERSION: &str = "1.3.0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config version '{found}' is not supported (expected '{expected}')")]
    Version { found: String, expected: &'static str },
    #[error("import #{index}: {message}")]
    Invalid { index: usize, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub import: Vec<ImportConfig>,
}

/// One watched resource stream and the mapping applied to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportConfig {
    pub selector: Selector,
    #[serde(rename = "opslevel", default)]
    pub registration: RegistrationConfig,
}

/// Identifies which cluster resources a controller watches and which are excluded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    pub api_version: String,
    pub kind: String,
    /// Namespaces to watch; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Expressions; an object is dropped when any evaluates to `true`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
}

impl Selector {
    /// `group/version/Kind` or `version/Kind` for core resources.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }

    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Some(parts.join(","))
    }

    pub fn field_selector(&self) -> Option<String> {
        if self.exclude_namespaces.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .exclude_namespaces
            .iter()
            .map(|ns| format!("metadata.namespace!={}", ns))
            .collect();
        Some(parts.join(","))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TagsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assign: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub create: Vec<String>,
}

/// Per-field expression mapping from resource JSON to a service registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub lifecycle: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Property definition alias -> expression.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Config {
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(yaml)?;
        if cfg.version != CONFIG_VERSION {
            return Err(ConfigError::Version { found: cfg.version, expected: CONFIG_VERSION });
        }
        for (index, import) in cfg.service.import.iter().enumerate() {
            if import.selector.api_version.is_empty() || import.selector.kind.is_empty() {
                return Err(ConfigError::Invalid { index, message: "selector needs apiVersion and kind".into() });
            }
            if import.registration.name.is_empty() {
                return Err(ConfigError::Invalid { index, message: "opslevel.name expression is required".into() });
            }
        }
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::parse(&yaml)
    }

    pub fn imports(&self) -> &[ImportConfig] {
        &self.service.import
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.3.0"
service:
  import:
    - selector:
        apiVersion: apps/v1
        kind: Deployment
        excludeNamespaces: [kube-system]
        labels:
          app.kubernetes.io/managed-by: helm
        excludes:
          - .metadata.namespace == "local-path-storage"
      opslevel:
        name: .metadata.name
        owner: .metadata.annotations."opslevel.com/owner"
        aliases:
          - '"k8s:\(.metadata.name)-\(.metadata.namespace)"'
        tags:
          assign:
            - '{"imported": "kubecat"}'
        properties:
          replicas: .spec.replicas
"#;

    #[test]
    fn parses_import_blocks() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.imports().len(), 1);
        let import = &cfg.imports()[0];
        assert_eq!(import.selector.gvk_key(), "apps/v1/Deployment");
        assert_eq!(import.selector.field_selector().as_deref(), Some("metadata.namespace!=kube-system"));
        assert_eq!(import.selector.label_selector().as_deref(), Some("app.kubernetes.io/managed-by=helm"));
        assert_eq!(import.registration.name, ".metadata.name");
        assert_eq!(import.registration.aliases.len(), 1);
        assert_eq!(import.registration.tags.assign.len(), 1);
        assert!(import.registration.tags.create.is_empty());
        assert_eq!(import.registration.properties.get("replicas").map(String::as_str), Some(".spec.replicas"));
        assert!(import.registration.description.is_empty());
    }

    #[test]
    fn rejects_unknown_version() {
        let err = Config::parse("version: \"1.0.0\"\n").unwrap_err().to_string();
        assert!(err.contains("1.0.0") && err.contains(CONFIG_VERSION), "err={}", err);
    }

    #[test]
    fn rejects_import_without_name_expression() {
        let yaml = "version: \"1.3.0\"\nservice:\n  import:\n    - selector: { apiVersion: v1, kind: Service }\n";
        let err = Config::parse(yaml).unwrap_err().to_string();
        assert!(err.contains("opslevel.name"), "err={}", err);
    }
}
