//! In-process evaluator for tests: each expression maps to canned output or a closure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::evaluator::{Evaluator, ExprError, Program};

type RunFn = dyn Fn(&Json) -> Result<String, ExprError> + Send + Sync;

#[derive(Default, Clone)]
pub struct StaticEvaluator {
    programs: HashMap<String, Arc<RunFn>>,
}

impl StaticEvaluator {
    /// `expression` always outputs `raw`.
    pub fn with(mut self, expression: &str, raw: &str) -> Self {
        let raw = raw.to_string();
        self.programs.insert(expression.to_string(), Arc::new(move |_: &Json| Ok(raw.clone())));
        self
    }

    /// `expression` is computed from the input document.
    pub fn with_fn<F>(mut self, expression: &str, f: F) -> Self
    where
        F: Fn(&Json) -> Result<String, ExprError> + Send + Sync + 'static,
    {
        self.programs.insert(expression.to_string(), Arc::new(f));
        self
    }

    /// `expression` compiles but fails at run time.
    pub fn failing(self, expression: &str) -> Self {
        let filter = expression.to_string();
        self.with_fn(expression, move |_| {
            Err(ExprError::BadExecution { filter: filter.clone(), message: "induced failure".into() })
        })
    }
}

impl Evaluator for StaticEvaluator {
    fn compile(&self, expression: &str) -> Result<Arc<dyn Program>, ExprError> {
        if expression.trim().is_empty() {
            return Err(ExprError::EmptyFilter);
        }
        let run = self.programs.get(expression).cloned().ok_or_else(|| ExprError::BadFilter {
            filter: expression.to_string(),
            message: "unknown expression".into(),
        })?;
        Ok(Arc::new(StaticProgram { expression: expression.to_string(), run }))
    }
}

struct StaticProgram {
    expression: String,
    run: Arc<RunFn>,
}

impl fmt::Debug for StaticProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticProgram").field("expression", &self.expression).finish()
    }
}

impl Program for StaticProgram {
    fn run(&self, input: &Json) -> Result<String, ExprError> {
        (self.run)(input)
    }
}
