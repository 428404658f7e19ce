#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kubecat_catalog::{
    AliasCreateInput, CatalogClient, CatalogResult, Lifecycle, MockCatalog, Property, PropertyInput, Repository,
    Service, ServiceCreateInput, ServiceRepository, ServiceRepositoryCreateInput, ServiceRepositoryUpdateInput,
    ServiceUpdateInput, SystemRef, Tag, TagCreateInput, Team, Tier, Tool, ToolCreateInput,
};
use kubecat_core::{RepositoryInput, ServiceRegistration, ToolInput};
use kubecat_reconcile::{
    ConflictPolicy, EntryStatus, Outcome, ReconcileError, ReconcileOptions, Reconciler, ReferenceCache,
    RegistrationQueue, SubresourceAction, WorkerPool,
};

/// Fails the test on any catalog call.
struct PanicCatalog;

#[async_trait::async_trait]
impl CatalogClient for PanicCatalog {
    async fn get_service(&self, _alias: &str) -> CatalogResult<Option<Service>> {
        panic!("get_service called")
    }
    async fn create_service(&self, _input: ServiceCreateInput) -> CatalogResult<Service> {
        panic!("create_service called")
    }
    async fn update_service(&self, _input: ServiceUpdateInput) -> CatalogResult<Service> {
        panic!("update_service called")
    }
    async fn create_alias(&self, _input: AliasCreateInput) -> CatalogResult<Vec<String>> {
        panic!("create_alias called")
    }
    async fn assign_tags(&self, _service_id: &str, _tags: BTreeMap<String, String>) -> CatalogResult<Vec<Tag>> {
        panic!("assign_tags called")
    }
    async fn create_tag(&self, _input: TagCreateInput) -> CatalogResult<Tag> {
        panic!("create_tag called")
    }
    async fn create_tool(&self, _input: ToolCreateInput) -> CatalogResult<Tool> {
        panic!("create_tool called")
    }
    async fn get_repository_with_alias(&self, _alias: &str) -> CatalogResult<Option<Repository>> {
        panic!("get_repository_with_alias called")
    }
    async fn create_service_repository(&self, _input: ServiceRepositoryCreateInput) -> CatalogResult<ServiceRepository> {
        panic!("create_service_repository called")
    }
    async fn update_service_repository(&self, _input: ServiceRepositoryUpdateInput) -> CatalogResult<ServiceRepository> {
        panic!("update_service_repository called")
    }
    async fn assign_property(&self, _input: PropertyInput) -> CatalogResult<Property> {
        panic!("assign_property called")
    }
}

const REPO: &str = "github.com:org/web";

fn catalog() -> Arc<MockCatalog> {
    Arc::new(
        MockCatalog::new()
            .with_teams(vec![Team { id: "team-1".into(), alias: "velero".into(), name: "Velero".into() }])
            .with_tiers(vec![Tier { id: "tier-1".into(), alias: "tier_1".into(), name: "Tier 1".into(), index: 1 }])
            .with_lifecycles(vec![Lifecycle { id: "lc-1".into(), alias: "ga".into(), name: "GA".into(), index: 3 }])
            .with_repository(Repository { id: "repo-1".into(), default_alias: REPO.into(), display_name: "web".into(), services: vec![] }),
    )
}

async fn reconciler(cat: Arc<MockCatalog>, opts: ReconcileOptions) -> Reconciler {
    let refs = Arc::new(ReferenceCache::new(cat.clone()));
    refs.refresh().await.unwrap();
    Reconciler::new(cat, refs, opts)
}

fn registration() -> ServiceRegistration {
    ServiceRegistration {
        name: "web".into(),
        description: Some("storefront".into()),
        owner: Some("velero".into()),
        tier: Some("tier_1".into()),
        lifecycle: Some("ga".into()),
        aliases: vec!["k8s:web-self-hosted".into()],
        tag_assigns: vec![Tag::new("env", "prod")],
        tag_creates: vec![Tag::new("team", "platform"), Tag::new("team", "platform")],
        tools: vec![
            ToolInput { category: "logs".into(), display_name: "Kibana".into(), url: "https://kibana".into(), environment: Some("prod".into()) },
            ToolInput { category: "metrics".into(), display_name: "Grafana".into(), url: "https://grafana".into(), environment: None },
        ],
        repositories: vec![RepositoryInput { repository: REPO.into(), base_directory: Some("/".into()), display_name: None }],
        properties: BTreeMap::from([("replicas".to_string(), "3".to_string())]),
        ..Default::default()
    }
}

fn existing(id: &str, aliases: &[&str]) -> Service {
    Service {
        id: id.into(),
        name: "web".into(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}

const MUTATIONS: [&str; 9] = [
    "create_service",
    "update_service",
    "create_alias",
    "assign_tags",
    "create_tag",
    "create_tool",
    "create_service_repository",
    "update_service_repository",
    "assign_property",
];

fn mutations(cat: &MockCatalog) -> usize {
    MUTATIONS.iter().map(|op| cat.count(op)).sum()
}

#[tokio::test]
async fn no_aliases_touches_nothing() {
    let refs = Arc::new(ReferenceCache::new(Arc::new(MockCatalog::new())));
    let r = Reconciler::new(Arc::new(PanicCatalog), refs, ReconcileOptions::default());

    let reg = ServiceRegistration { name: "web".into(), ..Default::default() };
    let err = r.reconcile(&reg).await.unwrap_err();
    assert!(err.to_string().contains("found 0 aliases"), "err={}", err);

    let reg = ServiceRegistration { name: "  ".into(), aliases: vec!["a".into()], ..Default::default() };
    assert!(matches!(r.reconcile(&reg).await, Err(ReconcileError::MissingName)));
}

#[tokio::test]
async fn creates_service_and_sub_resources() {
    let cat = catalog();
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let report = r.reconcile(&registration()).await.unwrap();

    assert_eq!(report.outcome, Outcome::Created);
    assert!(!report.has_errors());
    assert_eq!(report.count(SubresourceAction::CreateAlias), 1);
    assert_eq!(report.count(SubresourceAction::AssignTags), 1);
    assert_eq!(report.count(SubresourceAction::CreateTag), 1, "duplicate declared tags create once");
    assert_eq!(report.count(SubresourceAction::CreateTool), 1);
    assert!(report
        .entries
        .iter()
        .any(|e| e.action == SubresourceAction::CreateTool && matches!(e.status, EntryStatus::Skipped(_))));
    assert_eq!(report.count(SubresourceAction::CreateServiceRepository), 1);
    assert_eq!(report.count(SubresourceAction::AssignProperty), 1);

    let svc = cat.service("k8s:web-self-hosted").unwrap();
    assert_eq!(svc.owner_alias(), Some("velero"));
    assert_eq!(svc.tier_alias(), Some("tier_1"));
    assert_eq!(svc.lifecycle_alias(), Some("ga"));
    assert!(svc.has_tag("env", "prod") && svc.has_tag("team", "platform"));
    let repo = cat.repository(REPO).unwrap();
    assert_eq!(repo.attachment_for(&svc.id).unwrap().base_directory.as_deref(), Some("/"));
    assert_eq!(cat.properties()[0].value.as_deref(), Some("3"));
}

#[tokio::test]
async fn second_pass_is_idempotent() {
    let cat = catalog();
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    r.reconcile(&registration()).await.unwrap();
    cat.clear_calls();

    let report = r.reconcile(&registration()).await.unwrap();
    assert_eq!(report.outcome, Outcome::Unchanged);
    assert_eq!(cat.count("update_service"), 0);
    assert_eq!(mutations(&cat), cat.count("assign_property"), "only properties are re-asserted");
}

#[tokio::test]
async fn updates_only_changed_fields_once() {
    let mut svc = existing("svc-1", &["k8s:web-self-hosted"]);
    svc.description = Some("old".into());
    let cat = Arc::new(MockCatalog::new().with_service(svc));
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let reg = ServiceRegistration {
        name: "web".into(),
        description: Some("new".into()),
        aliases: vec!["k8s:web-self-hosted".into()],
        ..Default::default()
    };

    assert_eq!(r.reconcile(&reg).await.unwrap().outcome, Outcome::Updated);
    assert_eq!(cat.service("k8s:web-self-hosted").unwrap().description.as_deref(), Some("new"));
    assert_eq!(r.reconcile(&reg).await.unwrap().outcome, Outcome::Unchanged);
    assert_eq!(cat.count("update_service"), 1);
}

#[tokio::test]
async fn update_input_carries_only_differences() {
    let cat = catalog();
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let mut current = existing("svc-1", &["a"]);
    current.description = Some("storefront".into());
    let input = r.update_input(&registration(), &current);
    assert_eq!(input.id, "svc-1");
    assert!(input.name.is_none() && input.description.is_none());
    assert_eq!(input.tier_alias.as_deref(), Some("tier_1"));
    assert_eq!(input.owner_input.and_then(|o| o.alias).as_deref(), Some("velero"));
}

#[tokio::test]
async fn same_service_under_several_aliases() {
    let cat = Arc::new(MockCatalog::new().with_service(existing("svc-1", &["a", "b"])));
    let reg = ServiceRegistration { name: "web".into(), aliases: vec!["a".into(), "b".into()], ..Default::default() };

    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    assert_eq!(r.reconcile(&reg).await.unwrap().outcome, Outcome::Unchanged);

    let strict = ReconcileOptions { conflict_policy: ConflictPolicy::AnyMatch, ..Default::default() };
    let r = reconciler(cat.clone(), strict).await;
    assert!(matches!(r.reconcile(&reg).await, Err(ReconcileError::Conflict { .. })));
    assert_eq!(mutations(&cat), 0);
}

#[tokio::test]
async fn distinct_services_conflict_without_mutation() {
    let cat = Arc::new(MockCatalog::new().with_service(existing("svc-1", &["a"])).with_service(existing("svc-2", &["b"])));
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let reg = ServiceRegistration { name: "web".into(), aliases: vec!["a".into(), "b".into()], ..Default::default() };
    let err = r.reconcile(&reg).await.unwrap_err();
    match err {
        ReconcileError::Conflict { ids, .. } => assert_eq!(ids, vec!["svc-1".to_string(), "svc-2".to_string()]),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(mutations(&cat), 0);
}

#[tokio::test]
async fn lookup_error_aborts_without_create() {
    let cat = catalog();
    cat.fail("get_service");
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    assert!(matches!(r.reconcile(&registration()).await, Err(ReconcileError::Lookup { .. })));
    assert_eq!(mutations(&cat), 0);
}

#[tokio::test]
async fn creation_disabled_succeeds_without_create() {
    let cat = catalog();
    let opts = ReconcileOptions { disable_service_create: true, ..Default::default() };
    let r = reconciler(cat.clone(), opts).await;
    let report = r.reconcile(&registration()).await.unwrap();
    assert_eq!(report.outcome, Outcome::CreationDisabled);
    assert!(report.service_id.is_none());
    assert_eq!(mutations(&cat), 0);
}

#[tokio::test]
async fn create_failure_is_an_error() {
    let cat = catalog();
    cat.fail("create_service");
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    assert!(matches!(r.reconcile(&registration()).await, Err(ReconcileError::Create { .. })));
    assert_eq!(cat.count("create_alias"), 0);
}

#[tokio::test]
async fn unknown_reference_aliases_are_omitted() {
    let cat = catalog();
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let reg = ServiceRegistration {
        name: "web".into(),
        owner: Some("nobody".into()),
        tier: Some("tier_9".into()),
        aliases: vec!["web".into()],
        ..Default::default()
    };
    let input = r.create_input(&reg);
    assert!(input.owner_input.is_none() && input.tier_alias.is_none());
    assert_eq!(r.reconcile(&reg).await.unwrap().outcome, Outcome::Created);
}

#[tokio::test]
async fn sub_resource_failures_are_recorded_not_fatal() {
    let cat = catalog();
    cat.fail("create_alias");
    cat.fail("get_repository_with_alias");
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let report = r.reconcile(&registration()).await.unwrap();
    assert_eq!(report.outcome, Outcome::Created);
    let failed: Vec<_> = report.errors().map(|e| e.action).collect();
    assert_eq!(failed, vec![SubresourceAction::CreateAlias, SubresourceAction::GetRepository]);
    assert_eq!(report.count(SubresourceAction::CreateTool), 1, "later families still run");
    assert_eq!(cat.count("create_service_repository"), 0);
}

#[tokio::test]
async fn existing_repository_attachment_is_updated_when_it_differs() {
    let cat = Arc::new(
        MockCatalog::new().with_service(existing("svc-1", &["web"])).with_repository(Repository {
            id: "repo-1".into(),
            default_alias: REPO.into(),
            display_name: "web".into(),
            services: vec![ServiceRepository {
                id: "sr-1".into(),
                service_id: "svc-1".into(),
                repository_id: "repo-1".into(),
                base_directory: Some("/".into()),
                display_name: None,
            }],
        }),
    );
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let mut reg = ServiceRegistration { name: "web".into(), aliases: vec!["web".into()], ..Default::default() };

    reg.repositories = vec![RepositoryInput { repository: REPO.into(), base_directory: Some("/".into()), display_name: None }];
    let report = r.reconcile(&reg).await.unwrap();
    assert!(report.entries.is_empty());

    reg.repositories[0].display_name = Some("web app".into());
    let report = r.reconcile(&reg).await.unwrap();
    assert_eq!(report.count(SubresourceAction::UpdateServiceRepository), 1);
    let repo = cat.repository(REPO).unwrap();
    assert_eq!(repo.attachment_for("svc-1").unwrap().display_name.as_deref(), Some("web app"));
}

#[tokio::test]
async fn repository_attachment_without_base_directory_is_skipped() {
    let cat = Arc::new(
        MockCatalog::new().with_service(existing("svc-1", &["web"])).with_repository(Repository {
            id: "repo-1".into(),
            default_alias: REPO.into(),
            display_name: "web".into(),
            services: vec![ServiceRepository {
                id: "sr-1".into(),
                service_id: "svc-1".into(),
                repository_id: "repo-1".into(),
                base_directory: None,
                display_name: None,
            }],
        }),
    );
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let mut reg = ServiceRegistration { name: "web".into(), aliases: vec!["web".into()], ..Default::default() };
    reg.repositories = vec![RepositoryInput { repository: REPO.into(), base_directory: None, display_name: Some("web app".into()) }];

    let report = r.reconcile(&reg).await.unwrap();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].action, SubresourceAction::UpdateServiceRepository);
    assert!(matches!(report.entries[0].status, EntryStatus::Skipped(_)));
    assert!(!report.has_errors());
    assert_eq!(cat.count("update_service_repository"), 0);
    assert_eq!(cat.count("create_service_repository"), 0);
}

#[tokio::test]
async fn unknown_repository_alias_is_skipped() {
    let cat = Arc::new(MockCatalog::new().with_service(existing("svc-1", &["web"])));
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let mut reg = ServiceRegistration { name: "web".into(), aliases: vec!["web".into()], ..Default::default() };
    reg.repositories = vec![RepositoryInput { repository: "github.com:org/missing".into(), base_directory: Some("/".into()), display_name: None }];

    let report = r.reconcile(&reg).await.unwrap();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].action, SubresourceAction::GetRepository);
    assert!(matches!(report.entries[0].status, EntryStatus::Skipped(_)));
    assert!(!report.has_errors());
    assert_eq!(cat.count("update_service_repository"), 0);
    assert_eq!(cat.count("create_service_repository"), 0);
}

#[tokio::test]
async fn parent_named_by_any_alias_is_unchanged() {
    let mut current = existing("svc-1", &["web"]);
    current.parent = Some(SystemRef { id: "sys-1".into(), aliases: vec!["shop".into(), "shop-system".into()] });
    let cat = Arc::new(MockCatalog::new().with_service(current.clone()));
    let r = reconciler(cat.clone(), ReconcileOptions::default()).await;
    let reg = ServiceRegistration {
        name: "web".into(),
        aliases: vec!["web".into()],
        system: Some("shop-system".into()),
        ..Default::default()
    };

    let input = r.update_input(&reg, &current);
    assert!(input.parent.is_none());
    assert!(input.is_noop());
    assert_eq!(r.reconcile(&reg).await.unwrap().outcome, Outcome::Unchanged);
    assert_eq!(cat.count("update_service"), 0);

    let moved = ServiceRegistration { system: Some("billing".into()), ..reg };
    assert_eq!(r.update_input(&moved, &current).parent.and_then(|p| p.alias).as_deref(), Some("billing"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_pool_drains_and_totals() {
    let cat = catalog();
    let refs = Arc::new(ReferenceCache::new(cat.clone()));
    refs.refresh().await.unwrap();
    let workers = (0..3)
        .map(|_| Reconciler::new(cat.clone(), refs.clone(), ReconcileOptions::default()))
        .collect();
    let (emitter, rx) = RegistrationQueue::bounded(2);
    let pool = WorkerPool::spawn(workers, rx);
    assert_eq!(pool.len(), 3);

    for name in ["a", "b"] {
        let reg = ServiceRegistration { name: name.into(), aliases: vec![format!("k8s:{}", name)], ..Default::default() };
        emitter.emit(reg).await.unwrap();
    }
    emitter.emit(ServiceRegistration { name: "c".into(), ..Default::default() }).await.unwrap();
    drop(emitter);

    let summary = pool.join().await;
    assert_eq!(summary.reconciled, 3);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(cat.services().len(), 2);
}
