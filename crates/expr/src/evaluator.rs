//! Expression evaluation seam and the `jq` process implementation.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::debug;

/// Classified evaluation failures. Distinct from an expression legitimately producing nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("empty filter")]
    EmptyFilter,
    #[error("bad options: {0}")]
    BadOptions(String),
    #[error("bad filter `{filter}`: {message}")]
    BadFilter { filter: String, message: String },
    #[error("bad json input for `{filter}`: {message}")]
    BadJson { filter: String, message: String },
    #[error("executing `{filter}` failed: {message}")]
    BadExecution { filter: String, message: String },
    #[error("jq executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("unexpected result shape for `{filter}`: {message}")]
    Shape { filter: String, message: String },
}

impl ExprError {
    pub fn shape(filter: &str, message: impl Into<String>) -> Self {
        ExprError::Shape { filter: filter.to_string(), message: message.into() }
    }
}

/// A compiled expression, reusable across any number of resources.
pub trait Program: Send + Sync + fmt::Debug {
    /// Run against one document, returning the raw textual output.
    fn run(&self, input: &Json) -> Result<String, ExprError>;
}

/// Compiles textual expressions into runnable programs.
pub trait Evaluator: Send + Sync {
    fn compile(&self, expression: &str) -> Result<Arc<dyn Program>, ExprError>;
}

/// Evaluator backed by an external `jq` binary.
#[derive(Debug, Clone)]
pub struct JqEvaluator {
    binary: PathBuf,
}

impl JqEvaluator {
    /// Use an explicit binary path (not checked until first use).
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Resolve `name` against `PATH` unless it already contains a path separator.
    pub fn locate(name: &str) -> Result<Self, ExprError> {
        let candidate = Path::new(name);
        if candidate.components().count() > 1 {
            return if candidate.is_file() {
                Ok(Self::new(candidate))
            } else {
                Err(ExprError::ExecutableNotFound(name.to_string()))
            };
        }
        let path = std::env::var_os("PATH").ok_or_else(|| ExprError::ExecutableNotFound(name.to_string()))?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(name))
            .find(|p| p.is_file())
            .map(Self::new)
            .ok_or_else(|| ExprError::ExecutableNotFound(name.to_string()))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl Evaluator for JqEvaluator {
    fn compile(&self, expression: &str) -> Result<Arc<dyn Program>, ExprError> {
        let filter = expression.trim();
        if filter.is_empty() {
            return Err(ExprError::EmptyFilter);
        }
        // `empty | (f)` makes jq parse and compile `f` without ever running it.
        let probe = format!("empty | ({})", filter);
        let output = Command::new(&self.binary)
            .arg("-n")
            .arg(&probe)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(&self.binary, e))?;
        if !output.status.success() {
            return Err(classify_exit(filter, output.status.code(), &output.stderr));
        }
        debug!(filter = %filter, "compiled jq filter");
        Ok(Arc::new(JqProgram { binary: self.binary.clone(), filter: filter.to_string() }))
    }
}

#[derive(Debug)]
struct JqProgram {
    binary: PathBuf,
    filter: String,
}

impl Program for JqProgram {
    fn run(&self, input: &Json) -> Result<String, ExprError> {
        let payload = serde_json::to_vec(input)
            .map_err(|e| ExprError::BadJson { filter: self.filter.clone(), message: e.to_string() })?;
        let mut child = Command::new(&self.binary)
            .arg("-c")
            .arg("-M")
            .arg(&self.filter)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .map_err(|e| ExprError::BadExecution { filter: self.filter.clone(), message: e.to_string() })?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| ExprError::BadExecution { filter: self.filter.clone(), message: e.to_string() })?;
        if !output.status.success() {
            return Err(classify_exit(&self.filter, output.status.code(), &output.stderr));
        }
        Ok(normalize_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// jq prints `null` for absent paths; treat it the same as no output.
fn normalize_output(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed == "null" {
        String::new()
    } else {
        trimmed.to_string()
    }
}

fn spawn_error(binary: &Path, e: std::io::Error) -> ExprError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ExprError::ExecutableNotFound(binary.display().to_string())
    } else {
        ExprError::BadExecution { filter: String::new(), message: format!("spawning {}: {}", binary.display(), e) }
    }
}

/// Map jq's exit status and stderr onto an error kind.
fn classify_exit(filter: &str, code: Option<i32>, stderr: &[u8]) -> ExprError {
    let message = String::from_utf8_lossy(stderr).trim().to_string();
    match code {
        Some(2) => ExprError::BadOptions(message),
        Some(3) => ExprError::BadFilter { filter: filter.to_string(), message },
        _ if message.contains("parse error") => ExprError::BadJson { filter: filter.to_string(), message },
        _ => ExprError::BadExecution { filter: filter.to_string(), message },
    }
}
