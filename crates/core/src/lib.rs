//! kubecat core types: watch events, selectors and the canonical service registration.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{Config, ConfigError, ImportConfig, RegistrationConfig, Selector, TagsConfig, CONFIG_VERSION};

/// Kind of change the controller observed for a resource key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Queued notification. Carries only the key; the object is read from the cache at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Event {
    pub key: String,
    pub kind: EventType,
}

impl Event {
    pub fn new(key: impl Into<String>, kind: EventType) -> Self {
        Self { key: key.into(), kind }
    }
}

/// Raw change coming off a cluster watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(serde_json::Value),
    Deleted(serde_json::Value),
    /// Full relist after the watch was (re)established.
    Restarted(Vec<serde_json::Value>),
}

/// `namespace/name` for namespaced objects, `name` for cluster-scoped ones.
pub fn resource_key(v: &serde_json::Value) -> Option<String> {
    let meta = v.get("metadata")?;
    let name = meta.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty())?;
    match meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
        Some(ns) => Some(format!("{}/{}", ns, name)),
        None => Some(name.to_string()),
    }
}

/// Catalog tag as a key/value pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Tool declared on a resource. `environment` is needed to deduplicate against the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolInput {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl ToolInput {
    pub fn has_environment(&self) -> bool {
        self.environment.as_deref().map(|e| !e.is_empty()).unwrap_or(false)
    }
}

/// Repository attachment: `repository` is the catalog alias of the repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInput {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Canonical, schema-normalized view of one cluster resource destined for the catalog.
///
/// Aliases and tags keep the order and duplicates produced by the expressions;
/// deduplication happens when the registration is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_assigns: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_creates: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepositoryInput>,
    /// Property definition alias -> JSON-encoded value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Pick `n` random elements of `data`, keeping their original relative order.
///
/// `n == 0` or `n >= data.len()` returns a copy of `data`.
pub fn sample<T: Clone>(n: usize, data: &[T]) -> Vec<T> {
    if n == 0 || n >= data.len() {
        return data.to_vec();
    }
    let mut rng = rand::thread_rng();
    let mut picked = rand::seq::index::sample(&mut rng, data.len(), n).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| data[i].clone()).collect()
}

pub mod prelude {
    pub use super::{
        resource_key, sample, Event, EventType, RepositoryInput, ServiceRegistration, Tag, ToolInput, WatchEvent,
    };
}
