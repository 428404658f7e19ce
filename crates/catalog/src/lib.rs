//! kubecat catalog API surface.
//!
//! `CatalogClient` is the narrow set of service-catalog operations the
//! reconciler needs. `GraphqlCatalog` talks to a remote GraphQL endpoint;
//! `MockCatalog` keeps everything in memory for tests and dry runs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

pub mod graphql;
pub mod mock;
pub mod model;

pub use graphql::{GraphqlCatalog, DEFAULT_API_URL};
pub use mock::MockCatalog;
pub use model::*;

/// Catalog errors; `Api` carries messages reported by the catalog itself.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("api: {0}")]
    Api(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Service catalog operations used by reconciliation.
#[async_trait::async_trait]
pub trait CatalogClient: Send + Sync {
    /// Look up a service by any of its aliases.
    async fn get_service(&self, alias: &str) -> CatalogResult<Option<Service>>;

    async fn create_service(&self, input: ServiceCreateInput) -> CatalogResult<Service>;

    async fn update_service(&self, input: ServiceUpdateInput) -> CatalogResult<Service>;

    async fn create_alias(&self, input: AliasCreateInput) -> CatalogResult<Vec<String>>;

    /// Bulk assign; an existing tag with the same key is overwritten.
    async fn assign_tags(&self, service_id: &str, tags: BTreeMap<String, String>) -> CatalogResult<Vec<Tag>>;

    async fn create_tag(&self, input: TagCreateInput) -> CatalogResult<Tag>;

    async fn create_tool(&self, input: ToolCreateInput) -> CatalogResult<Tool>;

    async fn get_repository_with_alias(&self, alias: &str) -> CatalogResult<Option<Repository>>;

    async fn create_service_repository(&self, input: ServiceRepositoryCreateInput) -> CatalogResult<ServiceRepository>;

    async fn update_service_repository(&self, input: ServiceRepositoryUpdateInput) -> CatalogResult<ServiceRepository>;

    async fn assign_property(&self, input: PropertyInput) -> CatalogResult<Property>;
}

/// Reference data the reconciler resolves aliases against.
#[async_trait::async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn list_tiers(&self) -> CatalogResult<Vec<Tier>>;

    async fn list_lifecycles(&self) -> CatalogResult<Vec<Lifecycle>>;

    async fn list_teams(&self) -> CatalogResult<Vec<Team>>;
}
