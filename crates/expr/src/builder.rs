//! Turn one resource into a `ServiceRegistration`.

use kubecat_core::{RegistrationConfig, ServiceRegistration};
use metrics::counter;
use serde_json::Value as Json;

use crate::composite::{AliasParser, PropertyParser, RepositoryParser, TagParser, ToolParser};
use crate::evaluator::{Evaluator, ExprError};
use crate::field::FieldParser;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("field '{field}': {source}")]
    Field {
        field: &'static str,
        #[source]
        source: ExprError,
    },
    #[error("repositories: {0}")]
    Repositories(#[source] ExprError),
}

/// Compiled form of a `RegistrationConfig`; compile once, build many.
#[derive(Debug, Clone)]
pub struct RegistrationBuilder {
    name: FieldParser,
    description: FieldParser,
    owner: FieldParser,
    lifecycle: FieldParser,
    tier: FieldParser,
    product: FieldParser,
    language: FieldParser,
    framework: FieldParser,
    system: FieldParser,
    aliases: AliasParser,
    tag_assigns: TagParser,
    tag_creates: TagParser,
    tools: ToolParser,
    repositories: RepositoryParser,
    properties: PropertyParser,
}

impl RegistrationBuilder {
    pub fn new(evaluator: &dyn Evaluator, cfg: &RegistrationConfig) -> Result<Self, BuildError> {
        let scalar = |field: &'static str, expr: &str| {
            FieldParser::new(evaluator, expr).map_err(|source| BuildError::Field { field, source })
        };
        let family = |field: &'static str| move |source: ExprError| BuildError::Field { field, source };
        Ok(Self {
            name: scalar("name", &cfg.name)?,
            description: scalar("description", &cfg.description)?,
            owner: scalar("owner", &cfg.owner)?,
            lifecycle: scalar("lifecycle", &cfg.lifecycle)?,
            tier: scalar("tier", &cfg.tier)?,
            product: scalar("product", &cfg.product)?,
            language: scalar("language", &cfg.language)?,
            framework: scalar("framework", &cfg.framework)?,
            system: scalar("system", &cfg.system)?,
            aliases: AliasParser::new(evaluator, &cfg.aliases).map_err(family("aliases"))?,
            tag_assigns: TagParser::new(evaluator, &cfg.tags.assign).map_err(family("tags.assign"))?,
            tag_creates: TagParser::new(evaluator, &cfg.tags.create).map_err(family("tags.create"))?,
            tools: ToolParser::new(evaluator, &cfg.tools).map_err(family("tools"))?,
            repositories: RepositoryParser::new(evaluator, &cfg.repositories).map_err(BuildError::Repositories)?,
            properties: PropertyParser::new(evaluator, &cfg.properties).map_err(family("properties"))?,
        })
    }

    /// Scalar failures and malformed repositories fail the resource; the other
    /// families drop only their broken expressions.
    pub fn build(&self, obj: &Json) -> Result<ServiceRegistration, BuildError> {
        let res = self.build_inner(obj);
        match &res {
            Ok(_) => {
                counter!("registrations_built", 1u64);
            }
            Err(_) => {
                counter!("registration_build_errors", 1u64);
            }
        }
        res
    }

    fn build_inner(&self, obj: &Json) -> Result<ServiceRegistration, BuildError> {
        let scalar = |field: &'static str, p: &FieldParser| {
            p.evaluate_string(obj).map_err(|source| BuildError::Field { field, source })
        };
        Ok(ServiceRegistration {
            name: scalar("name", &self.name)?.unwrap_or_default(),
            description: scalar("description", &self.description)?,
            owner: scalar("owner", &self.owner)?,
            lifecycle: scalar("lifecycle", &self.lifecycle)?,
            tier: scalar("tier", &self.tier)?,
            product: scalar("product", &self.product)?,
            language: scalar("language", &self.language)?,
            framework: scalar("framework", &self.framework)?,
            system: scalar("system", &self.system)?,
            aliases: self.aliases.run(obj),
            tag_assigns: self.tag_assigns.run(obj),
            tag_creates: self.tag_creates.run(obj),
            tools: self.tools.run(obj),
            repositories: self.repositories.run(obj).map_err(BuildError::Repositories)?,
            properties: self.properties.run(obj),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticEvaluator;
    use kubecat_core::TagsConfig;

    fn deployment() -> Json {
        serde_json::json!({
            "metadata": {
                "name": "web",
                "namespace": "self-hosted",
                "annotations": { "opslevel.com/owner": "velero" }
            }
        })
    }

    fn evaluator() -> StaticEvaluator {
        StaticEvaluator::default()
            .with_fn(".metadata.name", |o| Ok(o["metadata"]["name"].to_string()))
            .with_fn(".metadata.annotations.\"opslevel.com/owner\"", |o| {
                Ok(o["metadata"]["annotations"]["opslevel.com/owner"].to_string())
            })
            .with_fn("\"k8s:\\(.metadata.name)-\\(.metadata.namespace)\"", |o| {
                let name = o["metadata"]["name"].as_str().unwrap_or_default();
                let ns = o["metadata"]["namespace"].as_str().unwrap_or_default();
                Ok(format!("\"k8s:{}-{}\"", name, ns))
            })
            .with("dup", "{\"env\":\"prod\"}")
            .with("bad-repo", "{\"name\":\"missing repo\"}")
            .failing("boom")
    }

    #[test]
    fn builds_registration_from_deployment() {
        let cfg = RegistrationConfig {
            name: ".metadata.name".into(),
            owner: ".metadata.annotations.\"opslevel.com/owner\"".into(),
            aliases: vec!["\"k8s:\\(.metadata.name)-\\(.metadata.namespace)\"".into()],
            tags: TagsConfig { assign: vec!["dup".into(), "dup".into()], create: vec![] },
            ..Default::default()
        };
        let builder = RegistrationBuilder::new(&evaluator(), &cfg).unwrap();
        let reg = builder.build(&deployment()).unwrap();
        assert_eq!(reg.name, "web");
        assert_eq!(reg.owner.as_deref(), Some("velero"));
        assert_eq!(reg.aliases, vec!["k8s:web-self-hosted".to_string()]);
        assert_eq!(reg.tag_assigns.len(), 2, "builder must not deduplicate tags");
        assert!(reg.description.is_none());
        assert!(reg.tools.is_empty() && reg.repositories.is_empty() && reg.properties.is_empty());
    }

    #[test]
    fn scalar_failure_is_fatal() {
        let cfg = RegistrationConfig { name: ".metadata.name".into(), tier: "boom".into(), ..Default::default() };
        let builder = RegistrationBuilder::new(&evaluator(), &cfg).unwrap();
        let err = builder.build(&deployment()).unwrap_err();
        assert!(matches!(err, BuildError::Field { field: "tier", .. }), "err={}", err);
    }

    #[test]
    fn composite_failure_is_not_fatal_except_repositories() {
        let cfg = RegistrationConfig {
            name: ".metadata.name".into(),
            aliases: vec!["boom".into()],
            tools: vec!["boom".into()],
            ..Default::default()
        };
        let builder = RegistrationBuilder::new(&evaluator(), &cfg).unwrap();
        let reg = builder.build(&deployment()).unwrap();
        assert!(reg.aliases.is_empty());

        let cfg = RegistrationConfig {
            name: ".metadata.name".into(),
            repositories: vec!["bad-repo".into()],
            ..Default::default()
        };
        let builder = RegistrationBuilder::new(&evaluator(), &cfg).unwrap();
        assert!(matches!(builder.build(&deployment()), Err(BuildError::Repositories(_))));
    }

    #[test]
    fn unknown_expression_fails_at_compile_time() {
        let cfg = RegistrationConfig { name: ".metadata.name".into(), product: ".nope".into(), ..Default::default() };
        let err = RegistrationBuilder::new(&evaluator(), &cfg).unwrap_err();
        assert!(matches!(err, BuildError::Field { field: "product", source: ExprError::BadFilter { .. } }));
    }
}
