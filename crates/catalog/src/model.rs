//! Catalog records and mutation inputs.

use serde::{Deserialize, Serialize};

pub use kubecat_core::Tag;

/// Reference to a catalog entity by id or by alias.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Identifier {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Identifier {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()), alias: None }
    }

    pub fn by_alias(alias: impl Into<String>) -> Self {
        Self { id: None, alias: Some(alias.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EntityRef {
    pub id: String,
    pub alias: Option<String>,
}

/// Parent system; matched by any of its aliases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SystemRef {
    pub id: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Tier {
    pub id: String,
    pub alias: String,
    pub name: String,
    pub index: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Lifecycle {
    pub id: String,
    pub alias: String,
    pub name: String,
    pub index: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Team {
    pub id: String,
    pub alias: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub category: String,
    pub display_name: String,
    pub url: String,
    pub environment: Option<String>,
}

impl Tool {
    /// Tools are matched on (category, display name, environment).
    pub fn matches(&self, category: &str, display_name: &str, environment: Option<&str>) -> bool {
        self.category == category && self.display_name == display_name && self.environment.as_deref() == environment
    }
}

/// Attachment of a repository to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRepository {
    pub id: String,
    pub service_id: String,
    pub repository_id: String,
    pub base_directory: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub default_alias: String,
    pub display_name: String,
    pub services: Vec<ServiceRepository>,
}

impl Repository {
    pub fn attachment_for(&self, service_id: &str) -> Option<&ServiceRepository> {
        self.services.iter().find(|s| s.service_id == service_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub definition_alias: String,
    pub owner_id: String,
    /// Raw JSON text.
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub product: Option<String>,
    pub language: Option<String>,
    pub framework: Option<String>,
    pub owner: Option<EntityRef>,
    pub tier: Option<Tier>,
    pub lifecycle: Option<Lifecycle>,
    pub parent: Option<SystemRef>,
    pub aliases: Vec<String>,
    pub tags: Vec<Tag>,
    pub tools: Vec<Tool>,
}

impl Service {
    pub fn has_alias(&self, alias: &str) -> bool {
        self.aliases.iter().any(|a| a == alias)
    }

    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.iter().any(|t| t.key == key && t.value == value)
    }

    pub fn owner_alias(&self) -> Option<&str> {
        self.owner.as_ref().and_then(|o| o.alias.as_deref())
    }

    pub fn tier_alias(&self) -> Option<&str> {
        self.tier.as_ref().map(|t| t.alias.as_str())
    }

    pub fn lifecycle_alias(&self) -> Option<&str> {
        self.lifecycle.as_ref().map(|l| l.alias.as_str())
    }

    pub fn parent_alias(&self) -> Option<&str> {
        self.parent.as_ref().and_then(|p| p.aliases.first()).map(String::as_str)
    }

    pub fn parent_has_alias(&self, alias: &str) -> bool {
        self.parent.as_ref().map_or(false, |p| p.aliases.iter().any(|a| a == alias))
    }
}

// ----------------- Inputs -----------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCreateInput {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_input: Option<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Identifier>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUpdateInput {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_input: Option<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Identifier>,
}

impl ServiceUpdateInput {
    pub fn for_service(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    /// True when nothing besides the identity is set.
    pub fn is_noop(&self) -> bool {
        *self == Self::for_service(self.id.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AliasCreateInput {
    pub alias: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TagCreateInput {
    /// Id of the tagged service.
    pub id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCreateInput {
    pub category: String,
    pub display_name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRepositoryCreateInput {
    pub service: Identifier,
    pub repository: Identifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRepositoryUpdateInput {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PropertyInput {
    pub owner: Identifier,
    pub definition: Identifier,
    /// Raw JSON text.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_input_noop_ignores_identity() {
        let mut input = ServiceUpdateInput::for_service("svc-1");
        assert!(input.is_noop());
        input.product = Some("shop".into());
        assert!(!input.is_noop());
    }

    #[test]
    fn inputs_serialize_in_camel_case_without_nulls() {
        let input = ServiceCreateInput {
            name: "web".into(),
            owner_input: Some(Identifier::by_alias("velero")),
            ..Default::default()
        };
        let v = serde_json::to_value(&input).unwrap();
        assert_eq!(v, serde_json::json!({ "name": "web", "ownerInput": { "alias": "velero" } }));
    }

    #[test]
    fn tool_matching_includes_environment() {
        let t = Tool { category: "logs".into(), display_name: "Kibana".into(), environment: Some("prod".into()), ..Default::default() };
        assert!(t.matches("logs", "Kibana", Some("prod")));
        assert!(!t.matches("logs", "Kibana", Some("dev")));
        assert!(!t.matches("logs", "Kibana", None));
    }
}
