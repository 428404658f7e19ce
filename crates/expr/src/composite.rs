//! Multi-expression field families (aliases, tags, tools, repositories, properties).
//!
//! Every family consumes the same `EvaluatedResult` produced by `FieldParser`
//! and only adds its own acceptance rules on top.

use std::collections::BTreeMap;

use kubecat_core::{RepositoryInput, Tag, ToolInput};
use serde_json::{Map, Value as Json};
use tracing::{debug, warn};

use crate::evaluator::{Evaluator, ExprError};
use crate::field::{EvaluatedResult, FieldParser};

fn compile_all(evaluator: &dyn Evaluator, expressions: &[String]) -> Result<Vec<FieldParser>, ExprError> {
    expressions.iter().map(|e| FieldParser::new(evaluator, e)).collect()
}

fn json_to_text(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Run each parser, logging and skipping expressions that fail or have the wrong shape.
fn collect_lenient<T>(
    family: &str,
    parsers: &[FieldParser],
    obj: &Json,
    accept: impl Fn(&FieldParser, EvaluatedResult) -> Result<Vec<T>, ExprError>,
) -> Vec<T> {
    let mut out = Vec::new();
    for p in parsers {
        match p.evaluate(obj).and_then(|res| accept(p, res)) {
            Ok(items) => out.extend(items),
            Err(e) => warn!(family, expression = %p.expression(), error = %e, "skipping expression"),
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct AliasParser {
    parsers: Vec<FieldParser>,
}

impl AliasParser {
    pub fn new(evaluator: &dyn Evaluator, expressions: &[String]) -> Result<Self, ExprError> {
        Ok(Self { parsers: compile_all(evaluator, expressions)? })
    }

    pub fn run(&self, obj: &Json) -> Vec<String> {
        collect_lenient("aliases", &self.parsers, obj, |p, res| match res {
            EvaluatedResult::Empty => Ok(Vec::new()),
            EvaluatedResult::String(s) => Ok(vec![s]),
            EvaluatedResult::ListOfMaps(maps) if maps.is_empty() => Ok(Vec::new()),
            EvaluatedResult::List(items) => items
                .into_iter()
                .filter(|v| !matches!(v, Json::String(s) if s.is_empty()))
                .map(|v| match v {
                    Json::String(s) => Ok(s),
                    other => Err(ExprError::shape(p.expression(), format!("alias list item {} is not a string", other))),
                })
                .collect(),
            other => Err(ExprError::shape(p.expression(), format!("expected string or []string, got {:?}", other))),
        })
    }
}

fn tags_from_map(map: Map<String, Json>) -> impl Iterator<Item = Tag> {
    map.into_iter().map(|(k, v)| Tag::new(k, json_to_text(&v)))
}

/// Tag expressions for one of the tag lists (assign or create).
#[derive(Debug, Clone, Default)]
pub struct TagParser {
    parsers: Vec<FieldParser>,
}

impl TagParser {
    pub fn new(evaluator: &dyn Evaluator, expressions: &[String]) -> Result<Self, ExprError> {
        Ok(Self { parsers: compile_all(evaluator, expressions)? })
    }

    pub fn run(&self, obj: &Json) -> Vec<Tag> {
        collect_lenient("tags", &self.parsers, obj, |p, res| match res {
            EvaluatedResult::Empty => Ok(Vec::new()),
            EvaluatedResult::Map(m) => Ok(tags_from_map(m).collect()),
            EvaluatedResult::ListOfMaps(maps) => Ok(maps.into_iter().flat_map(tags_from_map).collect()),
            other => Err(ExprError::shape(p.expression(), format!("expected map or []map, got {:?}", other))),
        })
    }
}

fn tool_from_map(p: &FieldParser, map: Map<String, Json>) -> Result<ToolInput, ExprError> {
    serde_json::from_value(Json::Object(map)).map_err(|e| ExprError::shape(p.expression(), format!("invalid tool: {}", e)))
}

#[derive(Debug, Clone, Default)]
pub struct ToolParser {
    parsers: Vec<FieldParser>,
}

impl ToolParser {
    pub fn new(evaluator: &dyn Evaluator, expressions: &[String]) -> Result<Self, ExprError> {
        Ok(Self { parsers: compile_all(evaluator, expressions)? })
    }

    pub fn run(&self, obj: &Json) -> Vec<ToolInput> {
        let tools = collect_lenient("tools", &self.parsers, obj, |p, res| match res {
            EvaluatedResult::Empty => Ok(Vec::new()),
            EvaluatedResult::Map(m) => Ok(vec![tool_from_map(p, m)?]),
            EvaluatedResult::ListOfMaps(maps) => maps.into_iter().map(|m| tool_from_map(p, m)).collect(),
            other => Err(ExprError::shape(p.expression(), format!("expected tool object or list, got {:?}", other))),
        });
        tools
            .into_iter()
            .filter(|t| {
                if !t.has_environment() {
                    debug!(category = %t.category, display_name = %t.display_name, "skipping tool without environment");
                }
                t.has_environment()
            })
            .collect()
    }
}

fn optional_text(map: &Map<String, Json>, key: &str) -> Option<String> {
    map.get(key).map(json_to_text).filter(|s| !s.is_empty())
}

fn repository_from_map(p: &FieldParser, map: &Map<String, Json>) -> Result<RepositoryInput, ExprError> {
    let repository = optional_text(map, "repo")
        .ok_or_else(|| ExprError::shape(p.expression(), "repository object needs a non-empty 'repo' alias"))?;
    Ok(RepositoryInput {
        repository,
        base_directory: optional_text(map, "directory"),
        display_name: optional_text(map, "name"),
    })
}

fn repository_from_alias(p: &FieldParser, alias: String) -> Result<RepositoryInput, ExprError> {
    if alias.is_empty() {
        return Err(ExprError::shape(p.expression(), "empty repository alias"));
    }
    Ok(RepositoryInput { repository: alias, ..Default::default() })
}

/// Repository expressions. Unlike the other families, any malformed
/// expression fails the whole resource.
#[derive(Debug, Clone, Default)]
pub struct RepositoryParser {
    parsers: Vec<FieldParser>,
}

impl RepositoryParser {
    pub fn new(evaluator: &dyn Evaluator, expressions: &[String]) -> Result<Self, ExprError> {
        Ok(Self { parsers: compile_all(evaluator, expressions)? })
    }

    pub fn run(&self, obj: &Json) -> Result<Vec<RepositoryInput>, ExprError> {
        let mut out = Vec::new();
        for p in &self.parsers {
            match p.evaluate(obj)? {
                EvaluatedResult::Empty => {}
                EvaluatedResult::String(alias) => out.push(repository_from_alias(p, alias)?),
                EvaluatedResult::Map(m) => out.push(repository_from_map(p, &m)?),
                EvaluatedResult::ListOfMaps(maps) => {
                    for m in &maps {
                        out.push(repository_from_map(p, m)?);
                    }
                }
                EvaluatedResult::List(items) => {
                    for item in items {
                        match item {
                            Json::String(alias) => out.push(repository_from_alias(p, alias)?),
                            Json::Object(m) => out.push(repository_from_map(p, &m)?),
                            other => {
                                return Err(ExprError::shape(
                                    p.expression(),
                                    format!("repository list item {} is neither alias nor object", other),
                                ))
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Property definition alias -> expression; values are kept as raw JSON text.
#[derive(Debug, Clone, Default)]
pub struct PropertyParser {
    parsers: BTreeMap<String, FieldParser>,
}

impl PropertyParser {
    pub fn new(evaluator: &dyn Evaluator, expressions: &BTreeMap<String, String>) -> Result<Self, ExprError> {
        let parsers = expressions
            .iter()
            .map(|(alias, expr)| Ok((alias.clone(), FieldParser::new(evaluator, expr)?)))
            .collect::<Result<BTreeMap<_, _>, ExprError>>()?;
        Ok(Self { parsers })
    }

    pub fn run(&self, obj: &Json) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (alias, p) in &self.parsers {
            match p.run(obj) {
                Ok(raw) if raw.trim().is_empty() => {}
                Ok(raw) => {
                    out.insert(alias.clone(), raw.trim().to_string());
                }
                Err(e) => warn!(property = %alias, expression = %p.expression(), error = %e, "skipping property"),
            }
        }
        out
    }
}
