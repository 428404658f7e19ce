//! Single-expression field parsing and result shape inference.

use std::sync::Arc;

use serde_json::{Map, Value as Json};
use tracing::warn;

use crate::evaluator::{Evaluator, ExprError, Program};

/// Shape of an expression's output.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluatedResult {
    Empty,
    String(String),
    Map(Map<String, Json>),
    ListOfMaps(Vec<Map<String, Json>>),
    List(Vec<Json>),
}

impl EvaluatedResult {
    pub fn is_empty(&self) -> bool {
        matches!(self, EvaluatedResult::Empty)
    }
}

/// Classify raw expression output. Order matters: string, object, array of
/// objects, then any array. `None` means the text has no usable shape.
pub fn classify(raw: &str) -> Option<EvaluatedResult> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(EvaluatedResult::Empty);
    }
    let parsed: Json = serde_json::from_str(raw).ok()?;
    match parsed {
        Json::String(s) if s.is_empty() => Some(EvaluatedResult::Empty),
        Json::String(s) => Some(EvaluatedResult::String(s)),
        Json::Object(m) => Some(EvaluatedResult::Map(m)),
        Json::Array(items) if items.iter().all(Json::is_object) => {
            let maps = items
                .into_iter()
                .filter_map(|v| match v {
                    Json::Object(m) => Some(m),
                    _ => None,
                })
                .collect();
            Some(EvaluatedResult::ListOfMaps(maps))
        }
        Json::Array(items) => Some(EvaluatedResult::List(items)),
        _ => None,
    }
}

/// One expression compiled once and run against many resources.
#[derive(Debug, Clone)]
pub struct FieldParser {
    expression: String,
    program: Option<Arc<dyn Program>>,
}

impl FieldParser {
    /// An empty expression becomes a parser that never produces output.
    pub fn new(evaluator: &dyn Evaluator, expression: &str) -> Result<Self, ExprError> {
        let program = if expression.trim().is_empty() { None } else { Some(evaluator.compile(expression)?) };
        Ok(Self { expression: expression.to_string(), program })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn is_noop(&self) -> bool {
        self.program.is_none()
    }

    /// Raw textual output.
    pub fn run(&self, input: &Json) -> Result<String, ExprError> {
        match &self.program {
            Some(p) => p.run(input),
            None => Ok(String::new()),
        }
    }

    /// Classified output; unknown shapes are logged and reported as `Empty`.
    pub fn evaluate(&self, input: &Json) -> Result<EvaluatedResult, ExprError> {
        let raw = self.run(input)?;
        match classify(&raw) {
            Some(res) => Ok(res),
            None => {
                warn!(expression = %self.expression, output = %raw, "discarding expression result of unknown shape");
                Ok(EvaluatedResult::Empty)
            }
        }
    }

    /// Scalar view: only string results count, anything else is absent.
    pub fn evaluate_string(&self, input: &Json) -> Result<Option<String>, ExprError> {
        match self.evaluate(input)? {
            EvaluatedResult::String(s) => Ok(Some(s)),
            EvaluatedResult::Empty => Ok(None),
            other => {
                warn!(expression = %self.expression, shape = ?other, "expected a string result; ignoring");
                Ok(None)
            }
        }
    }
}

/// Selector exclude predicates.
///
/// Evaluation stops at the first result that is not a boolean (or fails) and
/// treats the object as kept; predicates after that one are never run.
#[derive(Debug, Clone, Default)]
pub struct ExcludeFilter {
    predicates: Arc<Vec<FieldParser>>,
}

impl ExcludeFilter {
    pub fn new(evaluator: &dyn Evaluator, expressions: &[String]) -> Result<Self, ExprError> {
        let predicates = expressions
            .iter()
            .filter(|e| !e.trim().is_empty())
            .map(|e| FieldParser::new(evaluator, e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { predicates: Arc::new(predicates) })
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn is_excluded(&self, obj: &Json) -> bool {
        for p in self.predicates.iter() {
            match p.run(obj).as_deref().map(str::trim) {
                Ok("true") => return true,
                Ok("false") => continue,
                Ok(other) => {
                    warn!(expression = %p.expression(), output = %other, "exclude predicate did not return a boolean");
                    return false;
                }
                Err(e) => {
                    warn!(expression = %p.expression(), error = %e, "exclude predicate failed");
                    return false;
                }
            }
        }
        false
    }
}
