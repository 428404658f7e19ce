//! What a single reconciliation did.

use std::fmt;

use kubecat_catalog::CatalogError;
use serde::Serialize;

/// What happened to the service record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    /// No match and service creation is disabled.
    CreationDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubresourceAction {
    CreateAlias,
    AssignTags,
    CreateTag,
    CreateTool,
    GetRepository,
    CreateServiceRepository,
    UpdateServiceRepository,
    AssignProperty,
}

impl fmt::Display for SubresourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubresourceAction::CreateAlias => "create alias",
            SubresourceAction::AssignTags => "assign tags",
            SubresourceAction::CreateTag => "create tag",
            SubresourceAction::CreateTool => "create tool",
            SubresourceAction::GetRepository => "get repository",
            SubresourceAction::CreateServiceRepository => "create service repository",
            SubresourceAction::UpdateServiceRepository => "update service repository",
            SubresourceAction::AssignProperty => "assign property",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{action} '{target}': {source}")]
pub struct SubresourceError {
    pub action: SubresourceAction,
    pub target: String,
    #[source]
    pub source: CatalogError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Applied,
    Skipped(String),
    Failed(SubresourceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubresourceEntry {
    pub action: SubresourceAction,
    pub target: String,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub name: String,
    pub service_id: Option<String>,
    pub outcome: Outcome,
    pub entries: Vec<SubresourceEntry>,
}

impl SyncReport {
    pub fn new(name: impl Into<String>, service_id: Option<String>, outcome: Outcome) -> Self {
        Self { name: name.into(), service_id, outcome, entries: Vec::new() }
    }

    pub(crate) fn applied(&mut self, action: SubresourceAction, target: impl Into<String>) {
        self.entries.push(SubresourceEntry { action, target: target.into(), status: EntryStatus::Applied });
    }

    pub(crate) fn skipped(&mut self, action: SubresourceAction, target: impl Into<String>, reason: impl Into<String>) {
        self.entries.push(SubresourceEntry { action, target: target.into(), status: EntryStatus::Skipped(reason.into()) });
    }

    pub(crate) fn failed(&mut self, action: SubresourceAction, target: impl Into<String>, source: CatalogError) {
        let target = target.into();
        let error = SubresourceError { action, target: target.clone(), source };
        self.entries.push(SubresourceEntry { action, target, status: EntryStatus::Failed(error) });
    }

    /// Number of sub-resource mutations that went through.
    pub fn applied_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status == EntryStatus::Applied).count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &SubresourceError> {
        self.entries.iter().filter_map(|e| match &e.status {
            EntryStatus::Failed(err) => Some(err),
            _ => None,
        })
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn count(&self, action: SubresourceAction) -> usize {
        self.entries.iter().filter(|e| e.action == action && e.status == EntryStatus::Applied).count()
    }
}
