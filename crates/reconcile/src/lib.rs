//! kubecat reconcile: apply a `ServiceRegistration` to the catalog.
//!
//! Identity is resolved through the registration's aliases. The service is
//! created or updated, then aliases, tags, tools, repositories and properties
//! are brought in line. Sub-resource failures are recorded in the returned
//! `SyncReport` and never abort the reconciliation.

#![forbid(unsafe_code)]

pub mod identity;
pub mod pool;
pub mod reference;
pub mod report;
pub mod tags;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use kubecat_catalog::{
    AliasCreateInput, CatalogClient, CatalogError, Identifier, PropertyInput, Service, ServiceCreateInput,
    ServiceRepositoryCreateInput, ServiceRepositoryUpdateInput, ServiceUpdateInput, TagCreateInput, ToolCreateInput,
};
use kubecat_core::ServiceRegistration;
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

pub use identity::{resolve, ConflictPolicy, IdentityResolution};
pub use pool::{Emitter, PoolSummary, QueueClosed, RegistrationQueue, RegistrationReceiver, WorkerPool};
pub use reference::ReferenceCache;
pub use report::{EntryStatus, Outcome, SubresourceAction, SubresourceEntry, SubresourceError, SyncReport};
pub use tags::{contains_all_tags, tag_map};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("registration has an empty name")]
    MissingName,
    #[error("service '{name}' found 0 aliases; at least one alias is required to identify it")]
    NoAliases { name: String },
    #[error("service '{name}': looking up alias '{alias}': {source}")]
    Lookup {
        name: String,
        alias: String,
        #[source]
        source: CatalogError,
    },
    #[error("service '{name}': aliases {aliases:?} match more than one service {ids:?}")]
    Conflict { name: String, aliases: Vec<String>, ids: Vec<String> },
    #[error("service '{name}': create failed: {source}")]
    Create {
        name: String,
        #[source]
        source: CatalogError,
    },
    #[error("service '{name}': update failed: {source}")]
    Update {
        name: String,
        #[source]
        source: CatalogError,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    pub disable_service_create: bool,
    pub conflict_policy: ConflictPolicy,
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Desired value when it differs from the current one.
fn changed(desired: Option<&str>, current: Option<&str>) -> Option<String> {
    match desired {
        Some(d) if Some(d) != current => Some(d.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct Reconciler {
    client: Arc<dyn CatalogClient>,
    references: Arc<ReferenceCache>,
    opts: ReconcileOptions,
}

impl Reconciler {
    pub fn new(client: Arc<dyn CatalogClient>, references: Arc<ReferenceCache>, opts: ReconcileOptions) -> Self {
        Self { client, references, opts }
    }

    pub fn options(&self) -> ReconcileOptions {
        self.opts
    }

    pub async fn reconcile(&self, reg: &ServiceRegistration) -> Result<SyncReport, ReconcileError> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.reconcile_inner(reg).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(report) => {
                match report.outcome {
                    Outcome::Created => {
                        counter!("reconcile_created", 1u64);
                    }
                    Outcome::Updated => {
                        counter!("reconcile_updated", 1u64);
                    }
                    Outcome::Unchanged | Outcome::CreationDisabled => {}
                }
                let failed = report.errors().count();
                if failed > 0 {
                    counter!("subresource_errors", failed as u64);
                }
                info!(
                    name = %reg.name,
                    outcome = ?report.outcome,
                    applied = report.applied_count(),
                    failed,
                    took_ms = %t0.elapsed().as_millis(),
                    "reconciled"
                );
            }
            Err(e) => {
                counter!("reconcile_errors", 1u64);
                error!(name = %reg.name, error = %e, "reconcile failed");
            }
        }
        res
    }

    async fn reconcile_inner(&self, reg: &ServiceRegistration) -> Result<SyncReport, ReconcileError> {
        let name = reg.name.trim();
        if name.is_empty() {
            return Err(ReconcileError::MissingName);
        }
        if reg.aliases.is_empty() {
            return Err(ReconcileError::NoAliases { name: name.to_string() });
        }

        let (service, outcome) =
            match resolve(self.client.as_ref(), &reg.aliases, self.opts.conflict_policy).await {
                IdentityResolution::LookupError { alias, error } => {
                    return Err(ReconcileError::Lookup { name: name.to_string(), alias, source: error })
                }
                IdentityResolution::MultipleMatch { aliases, ids } => {
                    return Err(ReconcileError::Conflict { name: name.to_string(), aliases, ids })
                }
                IdentityResolution::SingleMatch(current) => self.update(reg, *current).await?,
                IdentityResolution::NoMatch if self.opts.disable_service_create => {
                    info!(name = %name, aliases = ?reg.aliases, "no matching service and creation is disabled");
                    return Ok(SyncReport::new(name, None, Outcome::CreationDisabled));
                }
                IdentityResolution::NoMatch => self.create(reg).await?,
            };

        let mut report = SyncReport::new(name, Some(service.id.clone()), outcome);
        self.sync_aliases(&service, reg, &mut report).await;
        self.sync_tag_assigns(&service, reg, &mut report).await;
        self.sync_tag_creates(&service, reg, &mut report).await;
        self.sync_tools(&service, reg, &mut report).await;
        self.sync_repositories(&service, reg, &mut report).await;
        self.sync_properties(&service, reg, &mut report).await;
        Ok(report)
    }

    fn owner_alias(&self, reg: &ServiceRegistration) -> Option<String> {
        let alias = non_empty(&reg.owner)?;
        if self.references.team(alias).is_some() {
            Some(alias.to_string())
        } else {
            warn!(name = %reg.name, owner = %alias, "unknown owner alias; leaving owner unset");
            None
        }
    }

    fn tier_alias(&self, reg: &ServiceRegistration) -> Option<String> {
        let alias = non_empty(&reg.tier)?;
        if self.references.tier(alias).is_some() {
            Some(alias.to_string())
        } else {
            warn!(name = %reg.name, tier = %alias, "unknown tier alias; leaving tier unset");
            None
        }
    }

    fn lifecycle_alias(&self, reg: &ServiceRegistration) -> Option<String> {
        let alias = non_empty(&reg.lifecycle)?;
        if self.references.lifecycle(alias).is_some() {
            Some(alias.to_string())
        } else {
            warn!(name = %reg.name, lifecycle = %alias, "unknown lifecycle alias; leaving lifecycle unset");
            None
        }
    }

    /// Only non-empty fields; references by alias, parent system by identifier.
    pub fn create_input(&self, reg: &ServiceRegistration) -> ServiceCreateInput {
        ServiceCreateInput {
            name: reg.name.trim().to_string(),
            description: non_empty(&reg.description).map(str::to_string),
            owner_input: self.owner_alias(reg).map(Identifier::by_alias),
            tier_alias: self.tier_alias(reg),
            lifecycle_alias: self.lifecycle_alias(reg),
            product: non_empty(&reg.product).map(str::to_string),
            language: non_empty(&reg.language).map(str::to_string),
            framework: non_empty(&reg.framework).map(str::to_string),
            parent: non_empty(&reg.system).map(Identifier::by_alias),
        }
    }

    /// Fields that differ from `current`; everything else stays unset.
    pub fn update_input(&self, reg: &ServiceRegistration, current: &Service) -> ServiceUpdateInput {
        let owner = self.owner_alias(reg);
        let tier = self.tier_alias(reg);
        let lifecycle = self.lifecycle_alias(reg);
        ServiceUpdateInput {
            id: current.id.clone(),
            name: changed(Some(reg.name.trim()), Some(current.name.as_str())),
            description: changed(non_empty(&reg.description), current.description.as_deref()),
            owner_input: changed(owner.as_deref(), current.owner_alias()).map(Identifier::by_alias),
            tier_alias: changed(tier.as_deref(), current.tier_alias()),
            lifecycle_alias: changed(lifecycle.as_deref(), current.lifecycle_alias()),
            product: changed(non_empty(&reg.product), current.product.as_deref()),
            language: changed(non_empty(&reg.language), current.language.as_deref()),
            framework: changed(non_empty(&reg.framework), current.framework.as_deref()),
            parent: non_empty(&reg.system).filter(|s| !current.parent_has_alias(s)).map(Identifier::by_alias),
        }
    }

    async fn create(&self, reg: &ServiceRegistration) -> Result<(Service, Outcome), ReconcileError> {
        let input = self.create_input(reg);
        let svc = self
            .client
            .create_service(input)
            .await
            .map_err(|source| ReconcileError::Create { name: reg.name.clone(), source })?;
        info!(name = %reg.name, id = %svc.id, "service created");
        Ok((svc, Outcome::Created))
    }

    async fn update(&self, reg: &ServiceRegistration, current: Service) -> Result<(Service, Outcome), ReconcileError> {
        let input = self.update_input(reg, &current);
        if input.is_noop() {
            debug!(name = %reg.name, id = %current.id, "service up to date");
            return Ok((current, Outcome::Unchanged));
        }
        let svc = self
            .client
            .update_service(input)
            .await
            .map_err(|source| ReconcileError::Update { name: reg.name.clone(), source })?;
        info!(name = %reg.name, id = %svc.id, "service updated");
        Ok((svc, Outcome::Updated))
    }

    async fn sync_aliases(&self, svc: &Service, reg: &ServiceRegistration, report: &mut SyncReport) {
        let mut seen = HashSet::new();
        for alias in &reg.aliases {
            if !seen.insert(alias.as_str()) || svc.has_alias(alias) {
                continue;
            }
            let input = AliasCreateInput { alias: alias.clone(), owner_id: svc.id.clone() };
            match self.client.create_alias(input).await {
                Ok(_) => report.applied(SubresourceAction::CreateAlias, alias.as_str()),
                Err(e) => self.fail(report, SubresourceAction::CreateAlias, alias, e),
            }
        }
    }

    async fn sync_tag_assigns(&self, svc: &Service, reg: &ServiceRegistration, report: &mut SyncReport) {
        if reg.tag_assigns.is_empty() || contains_all_tags(&reg.tag_assigns, &svc.tags) {
            return;
        }
        let tags = tag_map(&reg.tag_assigns);
        let target = tags.keys().cloned().collect::<Vec<_>>().join(",");
        match self.client.assign_tags(&svc.id, tags).await {
            Ok(_) => report.applied(SubresourceAction::AssignTags, target),
            Err(e) => self.fail(report, SubresourceAction::AssignTags, &target, e),
        }
    }

    async fn sync_tag_creates(&self, svc: &Service, reg: &ServiceRegistration, report: &mut SyncReport) {
        let mut seen = HashSet::new();
        for tag in &reg.tag_creates {
            if !seen.insert((tag.key.as_str(), tag.value.as_str())) || svc.has_tag(&tag.key, &tag.value) {
                continue;
            }
            let target = format!("{}:{}", tag.key, tag.value);
            let input = TagCreateInput { id: svc.id.clone(), key: tag.key.clone(), value: tag.value.clone() };
            match self.client.create_tag(input).await {
                Ok(_) => report.applied(SubresourceAction::CreateTag, target),
                Err(e) => self.fail(report, SubresourceAction::CreateTag, &target, e),
            }
        }
    }

    async fn sync_tools(&self, svc: &Service, reg: &ServiceRegistration, report: &mut SyncReport) {
        let mut created: Vec<(String, String, Option<String>)> = Vec::new();
        for tool in &reg.tools {
            let target = format!("{}/{}", tool.category, tool.display_name);
            if !tool.has_environment() {
                debug!(name = %reg.name, target = %target, "skipping tool without environment");
                report.skipped(SubresourceAction::CreateTool, target, "missing environment");
                continue;
            }
            let env = tool.environment.as_deref();
            let exists = svc.tools.iter().any(|t| t.matches(&tool.category, &tool.display_name, env))
                || created.iter().any(|(c, d, e)| c == &tool.category && d == &tool.display_name && e.as_deref() == env);
            if exists {
                continue;
            }
            let input = ToolCreateInput {
                category: tool.category.clone(),
                display_name: tool.display_name.clone(),
                url: tool.url.clone(),
                environment: tool.environment.clone(),
                service_id: svc.id.clone(),
            };
            match self.client.create_tool(input).await {
                Ok(_) => {
                    created.push((tool.category.clone(), tool.display_name.clone(), tool.environment.clone()));
                    report.applied(SubresourceAction::CreateTool, target);
                }
                Err(e) => self.fail(report, SubresourceAction::CreateTool, &target, e),
            }
        }
    }

    async fn sync_repositories(&self, svc: &Service, reg: &ServiceRegistration, report: &mut SyncReport) {
        for want in &reg.repositories {
            let alias = want.repository.as_str();
            let repo = match self.client.get_repository_with_alias(alias).await {
                Ok(Some(repo)) => repo,
                Ok(None) => {
                    warn!(name = %reg.name, repository = %alias, "repository not found; skipping");
                    report.skipped(SubresourceAction::GetRepository, alias, "not found");
                    continue;
                }
                Err(e) => {
                    self.fail(report, SubresourceAction::GetRepository, alias, e);
                    continue;
                }
            };
            match repo.attachment_for(&svc.id) {
                Some(existing) => {
                    let base_directory = want.base_directory.clone().or_else(|| existing.base_directory.clone());
                    let display_name = want.display_name.clone().or_else(|| existing.display_name.clone());
                    if base_directory == existing.base_directory && display_name == existing.display_name {
                        continue;
                    }
                    if base_directory.is_none() {
                        report.skipped(SubresourceAction::UpdateServiceRepository, alias, "base directory required");
                        continue;
                    }
                    let input = ServiceRepositoryUpdateInput { id: existing.id.clone(), base_directory, display_name };
                    match self.client.update_service_repository(input).await {
                        Ok(_) => report.applied(SubresourceAction::UpdateServiceRepository, alias),
                        Err(e) => self.fail(report, SubresourceAction::UpdateServiceRepository, alias, e),
                    }
                }
                None => {
                    let input = ServiceRepositoryCreateInput {
                        service: Identifier::by_id(svc.id.clone()),
                        repository: Identifier::by_id(repo.id.clone()),
                        base_directory: want.base_directory.clone(),
                        display_name: want.display_name.clone(),
                    };
                    match self.client.create_service_repository(input).await {
                        Ok(_) => report.applied(SubresourceAction::CreateServiceRepository, alias),
                        Err(e) => self.fail(report, SubresourceAction::CreateServiceRepository, alias, e),
                    }
                }
            }
        }
    }

    async fn sync_properties(&self, svc: &Service, reg: &ServiceRegistration, report: &mut SyncReport) {
        for (definition, value) in &reg.properties {
            let input = PropertyInput {
                owner: Identifier::by_id(svc.id.clone()),
                definition: Identifier::by_alias(definition.clone()),
                value: value.clone(),
            };
            match self.client.assign_property(input).await {
                Ok(_) => report.applied(SubresourceAction::AssignProperty, definition.as_str()),
                Err(e) => self.fail(report, SubresourceAction::AssignProperty, definition, e),
            }
        }
    }

    fn fail(&self, report: &mut SyncReport, action: SubresourceAction, target: &str, e: CatalogError) {
        warn!(name = %report.name, action = %action, target = %target, error = %e, "sub-resource sync failed");
        report.failed(action, target, e);
    }
}
