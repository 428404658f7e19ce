//! In-memory catalog for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::{
    AliasCreateInput, CatalogClient, CatalogError, CatalogResult, EntityRef, Identifier, Lifecycle, Property,
    PropertyInput, ReferenceSource, Repository, Service, ServiceCreateInput, ServiceRepository,
    ServiceRepositoryCreateInput, ServiceRepositoryUpdateInput, ServiceUpdateInput, SystemRef, Tag, TagCreateInput, Team,
    Tier, Tool, ToolCreateInput,
};

#[derive(Debug, Default)]
struct MockState {
    services: Vec<Service>,
    repositories: Vec<Repository>,
    tiers: Vec<Tier>,
    lifecycles: Vec<Lifecycle>,
    teams: Vec<Team>,
    properties: Vec<Property>,
    next_id: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn service_mut(&mut self, id: &str) -> CatalogResult<&mut Service> {
        self.services
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CatalogError::Api(format!("service '{}' not found", id)))
    }

    fn resolve_service_id(&self, ident: &Identifier) -> CatalogResult<String> {
        self.services
            .iter()
            .find(|s| match (&ident.id, &ident.alias) {
                (Some(id), _) => &s.id == id,
                (None, Some(alias)) => s.has_alias(alias),
                (None, None) => false,
            })
            .map(|s| s.id.clone())
            .ok_or_else(|| CatalogError::Api(format!("service {:?} not found", ident)))
    }

    fn team_ref(&self, ident: &Identifier) -> CatalogResult<EntityRef> {
        self.teams
            .iter()
            .find(|t| ident.alias.as_deref() == Some(t.alias.as_str()) || ident.id.as_deref() == Some(t.id.as_str()))
            .map(|t| EntityRef { id: t.id.clone(), alias: Some(t.alias.clone()) })
            .ok_or_else(|| CatalogError::Api(format!("team {:?} not found", ident)))
    }

    fn tier(&self, alias: &str) -> CatalogResult<Tier> {
        self.tiers
            .iter()
            .find(|t| t.alias == alias)
            .cloned()
            .ok_or_else(|| CatalogError::Api(format!("tier '{}' not found", alias)))
    }

    fn lifecycle(&self, alias: &str) -> CatalogResult<Lifecycle> {
        self.lifecycles
            .iter()
            .find(|l| l.alias == alias)
            .cloned()
            .ok_or_else(|| CatalogError::Api(format!("lifecycle '{}' not found", alias)))
    }
}

fn system_ref(ident: &Identifier) -> SystemRef {
    let alias = ident.alias.clone();
    let id = ident.id.clone().unwrap_or_else(|| format!("system-{}", alias.as_deref().unwrap_or_default()));
    SystemRef { id, aliases: alias.into_iter().collect() }
}

/// Catalog kept in memory. Records every call by operation name and can be
/// told to fail specific operations.
#[derive(Debug, Default)]
pub struct MockCatalog {
    state: Mutex<MockState>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, service: Service) -> Self {
        self.lock().services.push(service);
        self
    }

    pub fn with_repository(self, repository: Repository) -> Self {
        self.lock().repositories.push(repository);
        self
    }

    pub fn with_tiers(self, tiers: Vec<Tier>) -> Self {
        self.lock().tiers = tiers;
        self
    }

    pub fn with_lifecycles(self, lifecycles: Vec<Lifecycle>) -> Self {
        self.lock().lifecycles = lifecycles;
        self
    }

    pub fn with_teams(self, teams: Vec<Team>) -> Self {
        self.lock().teams = teams;
        self
    }

    /// Make `op` return `CatalogError::Api` until `recover` is called.
    pub fn fail(&self, op: &str) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).insert(op.to_string());
    }

    pub fn recover(&self, op: &str) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).remove(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).iter().filter(|c| c.as_str() == op).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn service(&self, alias: &str) -> Option<Service> {
        self.lock().services.iter().find(|s| s.has_alias(alias)).cloned()
    }

    pub fn services(&self) -> Vec<Service> {
        self.lock().services.clone()
    }

    pub fn repository(&self, alias: &str) -> Option<Repository> {
        self.lock().repositories.iter().find(|r| r.default_alias == alias).cloned()
    }

    pub fn properties(&self) -> Vec<Property> {
        self.lock().properties.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, op: &str) -> CatalogResult<MutexGuard<'_, MockState>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(op.to_string());
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(op) {
            return Err(CatalogError::Api(format!("{}: induced failure", op)));
        }
        Ok(self.lock())
    }
}

#[async_trait::async_trait]
impl CatalogClient for MockCatalog {
    async fn get_service(&self, alias: &str) -> CatalogResult<Option<Service>> {
        let st = self.enter("get_service")?;
        Ok(st.services.iter().find(|s| s.has_alias(alias)).cloned())
    }

    async fn create_service(&self, input: ServiceCreateInput) -> CatalogResult<Service> {
        let mut st = self.enter("create_service")?;
        let owner = input.owner_input.as_ref().map(|o| st.team_ref(o)).transpose()?;
        let tier = input.tier_alias.as_deref().map(|a| st.tier(a)).transpose()?;
        let lifecycle = input.lifecycle_alias.as_deref().map(|a| st.lifecycle(a)).transpose()?;
        let service = Service {
            id: st.next_id("svc"),
            name: input.name,
            description: input.description,
            product: input.product,
            language: input.language,
            framework: input.framework,
            owner,
            tier,
            lifecycle,
            parent: input.parent.as_ref().map(system_ref),
            ..Default::default()
        };
        st.services.push(service.clone());
        Ok(service)
    }

    async fn update_service(&self, input: ServiceUpdateInput) -> CatalogResult<Service> {
        let mut st = self.enter("update_service")?;
        let owner = input.owner_input.as_ref().map(|o| st.team_ref(o)).transpose()?;
        let tier = input.tier_alias.as_deref().map(|a| st.tier(a)).transpose()?;
        let lifecycle = input.lifecycle_alias.as_deref().map(|a| st.lifecycle(a)).transpose()?;
        let svc = st.service_mut(&input.id)?;
        if let Some(v) = input.name {
            svc.name = v;
        }
        if input.description.is_some() {
            svc.description = input.description;
        }
        if input.product.is_some() {
            svc.product = input.product;
        }
        if input.language.is_some() {
            svc.language = input.language;
        }
        if input.framework.is_some() {
            svc.framework = input.framework;
        }
        if owner.is_some() {
            svc.owner = owner;
        }
        if tier.is_some() {
            svc.tier = tier;
        }
        if lifecycle.is_some() {
            svc.lifecycle = lifecycle;
        }
        if let Some(p) = input.parent.as_ref() {
            svc.parent = Some(system_ref(p));
        }
        Ok(svc.clone())
    }

    async fn create_alias(&self, input: AliasCreateInput) -> CatalogResult<Vec<String>> {
        let mut st = self.enter("create_alias")?;
        if st.services.iter().any(|s| s.has_alias(&input.alias)) {
            return Err(CatalogError::Api(format!("alias '{}' is already taken", input.alias)));
        }
        let svc = st.service_mut(&input.owner_id)?;
        svc.aliases.push(input.alias);
        Ok(svc.aliases.clone())
    }

    async fn assign_tags(&self, service_id: &str, tags: BTreeMap<String, String>) -> CatalogResult<Vec<Tag>> {
        let mut st = self.enter("assign_tags")?;
        let svc = st.service_mut(service_id)?;
        let mut assigned = Vec::with_capacity(tags.len());
        for (key, value) in tags {
            svc.tags.retain(|t| t.key != key);
            let tag = Tag::new(key, value);
            svc.tags.push(tag.clone());
            assigned.push(tag);
        }
        Ok(assigned)
    }

    async fn create_tag(&self, input: TagCreateInput) -> CatalogResult<Tag> {
        let mut st = self.enter("create_tag")?;
        let svc = st.service_mut(&input.id)?;
        let tag = Tag::new(input.key, input.value);
        if !svc.has_tag(&tag.key, &tag.value) {
            svc.tags.push(tag.clone());
        }
        Ok(tag)
    }

    async fn create_tool(&self, input: ToolCreateInput) -> CatalogResult<Tool> {
        let mut st = self.enter("create_tool")?;
        let id = st.next_id("tool");
        let svc = st.service_mut(&input.service_id)?;
        let tool = Tool {
            id,
            category: input.category,
            display_name: input.display_name,
            url: input.url,
            environment: input.environment,
        };
        svc.tools.push(tool.clone());
        Ok(tool)
    }

    async fn get_repository_with_alias(&self, alias: &str) -> CatalogResult<Option<Repository>> {
        let st = self.enter("get_repository_with_alias")?;
        Ok(st.repositories.iter().find(|r| r.default_alias == alias).cloned())
    }

    async fn create_service_repository(&self, input: ServiceRepositoryCreateInput) -> CatalogResult<ServiceRepository> {
        let mut st = self.enter("create_service_repository")?;
        let service_id = st.resolve_service_id(&input.service)?;
        let id = st.next_id("svcrepo");
        let repo = st
            .repositories
            .iter_mut()
            .find(|r| {
                input.repository.id.as_deref() == Some(r.id.as_str())
                    || input.repository.alias.as_deref() == Some(r.default_alias.as_str())
            })
            .ok_or_else(|| CatalogError::Api(format!("repository {:?} not found", input.repository)))?;
        let attachment = ServiceRepository {
            id,
            service_id,
            repository_id: repo.id.clone(),
            base_directory: input.base_directory,
            display_name: input.display_name,
        };
        repo.services.push(attachment.clone());
        Ok(attachment)
    }

    async fn update_service_repository(&self, input: ServiceRepositoryUpdateInput) -> CatalogResult<ServiceRepository> {
        let mut st = self.enter("update_service_repository")?;
        let attachment = st
            .repositories
            .iter_mut()
            .flat_map(|r| r.services.iter_mut())
            .find(|s| s.id == input.id)
            .ok_or_else(|| CatalogError::Api(format!("service repository '{}' not found", input.id)))?;
        if input.base_directory.is_some() {
            attachment.base_directory = input.base_directory;
        }
        if input.display_name.is_some() {
            attachment.display_name = input.display_name;
        }
        Ok(attachment.clone())
    }

    async fn assign_property(&self, input: PropertyInput) -> CatalogResult<Property> {
        let mut st = self.enter("assign_property")?;
        let owner_id = st.resolve_service_id(&input.owner)?;
        let definition_alias = input
            .definition
            .alias
            .or(input.definition.id)
            .ok_or_else(|| CatalogError::Api("property definition identifier is empty".into()))?;
        serde_json::from_str::<serde_json::Value>(&input.value)
            .map_err(|e| CatalogError::Api(format!("property '{}' value is not JSON: {}", definition_alias, e)))?;
        let property = Property { definition_alias, owner_id, value: Some(input.value) };
        st.properties
            .retain(|p| !(p.definition_alias == property.definition_alias && p.owner_id == property.owner_id));
        st.properties.push(property.clone());
        Ok(property)
    }
}

#[async_trait::async_trait]
impl ReferenceSource for MockCatalog {
    async fn list_tiers(&self) -> CatalogResult<Vec<Tier>> {
        Ok(self.enter("list_tiers")?.tiers.clone())
    }

    async fn list_lifecycles(&self) -> CatalogResult<Vec<Lifecycle>> {
        Ok(self.enter("list_lifecycles")?.lifecycles.clone())
    }

    async fn list_teams(&self) -> CatalogResult<Vec<Team>> {
        Ok(self.enter("list_teams")?.teams.clone())
    }
}
