//! `CatalogClient` over a GraphQL HTTP endpoint.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::{
    AliasCreateInput, CatalogClient, CatalogError, CatalogResult, EntityRef, Lifecycle, Property, PropertyInput,
    ReferenceSource, Repository, Service, ServiceCreateInput, ServiceRepository, ServiceRepositoryCreateInput,
    ServiceRepositoryUpdateInput, ServiceUpdateInput, SystemRef, Tag, TagCreateInput, Team, Tier, Tool, ToolCreateInput,
};

pub const DEFAULT_API_URL: &str = "https://app.opslevel.com/graphql";

const SERVICE_FIELDS: &str = r#"
fragment ServiceFields on Service {
  id name description product language framework
  aliases
  owner { id alias }
  tier { id alias name index }
  lifecycle { id alias name index }
  parent { id aliases }
  tags { nodes { key value } }
  tools { nodes { id category displayName url environment } }
}"#;

const ERRORS: &str = "errors { message path }";

#[derive(Debug, Deserialize)]
struct GqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
    #[serde(default)]
    path: Vec<Json>,
}

fn join_errors(errors: &[GqlError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.path.is_empty() {
                e.message.clone()
            } else {
                let path: Vec<String> = e.path.iter().map(|p| p.as_str().map(str::to_string).unwrap_or_else(|| p.to_string())).collect();
                format!("{} ({})", e.message, path.join("."))
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParentNode {
    id: String,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceNode {
    id: String,
    #[serde(default)]
    name: String,
    description: Option<String>,
    product: Option<String>,
    language: Option<String>,
    framework: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    owner: Option<EntityRef>,
    tier: Option<Tier>,
    lifecycle: Option<Lifecycle>,
    parent: Option<ParentNode>,
    tags: Option<Nodes<Tag>>,
    tools: Option<Nodes<Tool>>,
}

impl From<ServiceNode> for Service {
    fn from(n: ServiceNode) -> Self {
        Service {
            id: n.id,
            name: n.name,
            description: n.description,
            product: n.product,
            language: n.language,
            framework: n.framework,
            owner: n.owner,
            tier: n.tier,
            lifecycle: n.lifecycle,
            parent: n.parent.map(|p| SystemRef { id: p.id, aliases: p.aliases }),
            aliases: n.aliases,
            tags: n.tags.map(|t| t.nodes).unwrap_or_default(),
            tools: n.tools.map(|t| t.nodes).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceRepositoryNode {
    id: String,
    base_directory: Option<String>,
    display_name: Option<String>,
    service: IdNode,
    repository: IdNode,
}

#[derive(Debug, Deserialize)]
struct IdNode {
    id: String,
}

impl From<ServiceRepositoryNode> for ServiceRepository {
    fn from(n: ServiceRepositoryNode) -> Self {
        ServiceRepository {
            id: n.id,
            service_id: n.service.id,
            repository_id: n.repository.id,
            base_directory: n.base_directory,
            display_name: n.display_name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryServiceEdge {
    #[serde(default)]
    service_repositories: Vec<ServiceRepositoryNode>,
}

#[derive(Debug, Deserialize)]
struct RepositoryServices {
    #[serde(default)]
    edges: Vec<RepositoryServiceEdge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    id: String,
    default_alias: String,
    #[serde(default)]
    display_name: String,
    services: Option<RepositoryServices>,
}

impl From<RepositoryNode> for Repository {
    fn from(n: RepositoryNode) -> Self {
        Repository {
            id: n.id,
            default_alias: n.default_alias,
            display_name: n.display_name,
            services: n
                .services
                .map(|s| s.edges.into_iter().flat_map(|e| e.service_repositories).map(Into::into).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertyNode {
    definition: PropertyDefinitionNode,
    owner: IdNode,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PropertyDefinitionNode {
    #[serde(default)]
    aliases: Vec<String>,
}

/// Mutation payloads report failures in a sibling `errors` list.
#[derive(Debug, Deserialize)]
struct Payload<T> {
    #[serde(flatten)]
    value: T,
    #[serde(default)]
    errors: Vec<GqlError>,
}

impl<T> Payload<T> {
    fn into_result(self, op: &str) -> CatalogResult<T> {
        if self.errors.is_empty() {
            Ok(self.value)
        } else {
            Err(CatalogError::Api(format!("{}: {}", op, join_errors(&self.errors))))
        }
    }
}

fn required<T>(v: Option<T>, op: &str, field: &str) -> CatalogResult<T> {
    v.ok_or_else(|| CatalogError::Decode(format!("{}: response has no {}", op, field)))
}

/// HTTP client for the catalog's GraphQL API, authenticated with a bearer token.
#[derive(Clone)]
pub struct GraphqlCatalog {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl GraphqlCatalog {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> CatalogResult<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(CatalogError::NotConfigured("API token is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("kubecat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        Ok(Self { http, url: url.into(), token })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn query<T: DeserializeOwned>(&self, op: &str, query: &str, variables: Json) -> CatalogResult<T> {
        let t0 = Instant::now();
        let res = self.send(op, query, variables).await;
        histogram!("catalog_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op.to_string());
        if res.is_err() {
            counter!("catalog_request_errors", 1u64, "op" => op.to_string());
        }
        debug!(op, took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "catalog request");
        res
    }

    async fn send<T: DeserializeOwned>(&self, op: &str, query: &str, variables: Json) -> CatalogResult<T> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| CatalogError::Transport(format!("{}: {}", op, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Transport(format!(
                "{}: HTTP {}: {}",
                op,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        let body: GqlResponse<T> =
            response.json().await.map_err(|e| CatalogError::Decode(format!("{}: {}", op, e)))?;
        if !body.errors.is_empty() {
            return Err(CatalogError::Api(format!("{}: {}", op, join_errors(&body.errors))));
        }
        required(body.data, op, "data")
    }
}

#[derive(Debug, Deserialize)]
struct Account<T> {
    account: T,
}

#[async_trait::async_trait]
impl CatalogClient for GraphqlCatalog {
    async fn get_service(&self, alias: &str) -> CatalogResult<Option<Service>> {
        #[derive(Deserialize)]
        struct R {
            service: Option<ServiceNode>,
        }
        let q = format!("query ($alias: String!) {{ account {{ service(alias: $alias) {{ ...ServiceFields }} }} }}{}", SERVICE_FIELDS);
        let r: Account<R> = self.query("get_service", &q, json!({ "alias": alias })).await?;
        Ok(r.account.service.map(Into::into))
    }

    async fn create_service(&self, input: ServiceCreateInput) -> CatalogResult<Service> {
        #[derive(Deserialize)]
        struct P {
            service: Option<ServiceNode>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            service_create: Payload<P>,
        }
        let q = format!(
            "mutation ($input: ServiceCreateInput!) {{ serviceCreate(input: $input) {{ service {{ ...ServiceFields }} {} }} }}{}",
            ERRORS, SERVICE_FIELDS
        );
        let r: R = self.query("create_service", &q, json!({ "input": input })).await?;
        let p = r.service_create.into_result("create_service")?;
        required(p.service, "create_service", "service").map(Into::into)
    }

    async fn update_service(&self, input: ServiceUpdateInput) -> CatalogResult<Service> {
        #[derive(Deserialize)]
        struct P {
            service: Option<ServiceNode>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            service_update: Payload<P>,
        }
        let q = format!(
            "mutation ($input: ServiceUpdateInput!) {{ serviceUpdate(input: $input) {{ service {{ ...ServiceFields }} {} }} }}{}",
            ERRORS, SERVICE_FIELDS
        );
        let r: R = self.query("update_service", &q, json!({ "input": input })).await?;
        let p = r.service_update.into_result("update_service")?;
        required(p.service, "update_service", "service").map(Into::into)
    }

    async fn create_alias(&self, input: AliasCreateInput) -> CatalogResult<Vec<String>> {
        #[derive(Deserialize)]
        struct P {
            #[serde(default)]
            aliases: Vec<String>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            alias_create: Payload<P>,
        }
        let q = format!("mutation ($input: AliasCreateInput!) {{ aliasCreate(input: $input) {{ aliases {} }} }}", ERRORS);
        let r: R = self.query("create_alias", &q, json!({ "input": input })).await?;
        Ok(r.alias_create.into_result("create_alias")?.aliases)
    }

    async fn assign_tags(&self, service_id: &str, tags: BTreeMap<String, String>) -> CatalogResult<Vec<Tag>> {
        #[derive(Deserialize)]
        struct P {
            #[serde(default)]
            tags: Vec<Tag>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            tag_assign: Payload<P>,
        }
        let tags: Vec<Json> = tags.into_iter().map(|(key, value)| json!({ "key": key, "value": value })).collect();
        let q = format!("mutation ($input: TagAssignInput!) {{ tagAssign(input: $input) {{ tags {{ key value }} {} }} }}", ERRORS);
        let r: R = self
            .query("assign_tags", &q, json!({ "input": { "id": service_id, "tags": tags } }))
            .await?;
        Ok(r.tag_assign.into_result("assign_tags")?.tags)
    }

    async fn create_tag(&self, input: TagCreateInput) -> CatalogResult<Tag> {
        #[derive(Deserialize)]
        struct P {
            tag: Option<Tag>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            tag_create: Payload<P>,
        }
        let q = format!("mutation ($input: TagCreateInput!) {{ tagCreate(input: $input) {{ tag {{ key value }} {} }} }}", ERRORS);
        let r: R = self.query("create_tag", &q, json!({ "input": input })).await?;
        required(r.tag_create.into_result("create_tag")?.tag, "create_tag", "tag")
    }

    async fn create_tool(&self, input: ToolCreateInput) -> CatalogResult<Tool> {
        #[derive(Deserialize)]
        struct P {
            tool: Option<Tool>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            tool_create: Payload<P>,
        }
        let q = format!(
            "mutation ($input: ToolCreateInput!) {{ toolCreate(input: $input) {{ tool {{ id category displayName url environment }} {} }} }}",
            ERRORS
        );
        let r: R = self.query("create_tool", &q, json!({ "input": input })).await?;
        required(r.tool_create.into_result("create_tool")?.tool, "create_tool", "tool")
    }

    async fn get_repository_with_alias(&self, alias: &str) -> CatalogResult<Option<Repository>> {
        #[derive(Deserialize)]
        struct R {
            repository: Option<RepositoryNode>,
        }
        let q = "query ($alias: String!) { account { repository(alias: $alias) { id defaultAlias displayName \
                 services { edges { serviceRepositories { id baseDirectory displayName service { id } repository { id } } } } } } }";
        let r: Account<R> = self.query("get_repository_with_alias", q, json!({ "alias": alias })).await?;
        Ok(r.account.repository.map(Into::into))
    }

    async fn create_service_repository(&self, input: ServiceRepositoryCreateInput) -> CatalogResult<ServiceRepository> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct P {
            service_repository: Option<ServiceRepositoryNode>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            service_repository_create: Payload<P>,
        }
        let q = format!(
            "mutation ($input: ServiceRepositoryCreateInput!) {{ serviceRepositoryCreate(input: $input) {{ \
             serviceRepository {{ id baseDirectory displayName service {{ id }} repository {{ id }} }} {} }} }}",
            ERRORS
        );
        let r: R = self.query("create_service_repository", &q, json!({ "input": input })).await?;
        let p = r.service_repository_create.into_result("create_service_repository")?;
        required(p.service_repository, "create_service_repository", "serviceRepository").map(Into::into)
    }

    async fn update_service_repository(&self, input: ServiceRepositoryUpdateInput) -> CatalogResult<ServiceRepository> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct P {
            service_repository: Option<ServiceRepositoryNode>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            service_repository_update: Payload<P>,
        }
        let q = format!(
            "mutation ($input: ServiceRepositoryUpdateInput!) {{ serviceRepositoryUpdate(input: $input) {{ \
             serviceRepository {{ id baseDirectory displayName service {{ id }} repository {{ id }} }} {} }} }}",
            ERRORS
        );
        let r: R = self.query("update_service_repository", &q, json!({ "input": input })).await?;
        let p = r.service_repository_update.into_result("update_service_repository")?;
        required(p.service_repository, "update_service_repository", "serviceRepository").map(Into::into)
    }

    async fn assign_property(&self, input: PropertyInput) -> CatalogResult<Property> {
        #[derive(Deserialize)]
        struct P {
            property: Option<PropertyNode>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct R {
            property_assign: Payload<P>,
        }
        let fallback_alias = input.definition.alias.clone().unwrap_or_default();
        let q = format!(
            "mutation ($input: PropertyInput!) {{ propertyAssign(input: $input) {{ \
             property {{ definition {{ aliases }} owner {{ ... on Service {{ id }} }} value }} {} }} }}",
            ERRORS
        );
        let r: R = self.query("assign_property", &q, json!({ "input": input })).await?;
        let node = required(r.property_assign.into_result("assign_property")?.property, "assign_property", "property")?;
        Ok(Property {
            definition_alias: node.definition.aliases.into_iter().next().unwrap_or(fallback_alias),
            owner_id: node.owner.id,
            value: node.value,
        })
    }
}

#[async_trait::async_trait]
impl ReferenceSource for GraphqlCatalog {
    async fn list_tiers(&self) -> CatalogResult<Vec<Tier>> {
        #[derive(Deserialize)]
        struct R {
            tiers: Vec<Tier>,
        }
        let r: Account<R> = self.query("list_tiers", "query { account { tiers { id alias name index } } }", json!({})).await?;
        Ok(r.account.tiers)
    }

    async fn list_lifecycles(&self) -> CatalogResult<Vec<Lifecycle>> {
        #[derive(Deserialize)]
        struct R {
            lifecycles: Vec<Lifecycle>,
        }
        let r: Account<R> = self
            .query("list_lifecycles", "query { account { lifecycles { id alias name index } } }", json!({}))
            .await?;
        Ok(r.account.lifecycles)
    }

    async fn list_teams(&self) -> CatalogResult<Vec<Team>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Page {
            nodes: Vec<Team>,
            page_info: PageInfo,
        }
        #[derive(Deserialize)]
        struct R {
            teams: Page,
        }
        let q = "query ($after: String) { account { teams(after: $after) { nodes { id alias name } pageInfo { hasNextPage endCursor } } } }";
        let mut out = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let r: Account<R> = self.query("list_teams", q, json!({ "after": after })).await?;
            out.extend(r.account.teams.nodes);
            match r.account.teams.page_info {
                PageInfo { has_next_page: true, end_cursor: Some(c) } => after = Some(c),
                _ => break,
            }
        }
        Ok(out)
    }
}
