//! Wiring between controllers, the registration queue and the worker pool.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use kubecat_controller::{ControllerOptions, ResourceController};
use kubecat_core::{Config, ServiceRegistration};
use kubecat_expr::{Evaluator, ExcludeFilter, RegistrationBuilder};
use kubecat_kubehub::ClusterSource;
use kubecat_catalog::CatalogClient;
use kubecat_reconcile::{
    PoolSummary, ReconcileOptions, Reconciler, ReferenceCache, RegistrationQueue, RegistrationReceiver, WorkerPool,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::handler::RegistrationHandler;

/// One controller per configured import, all emitting into a shared queue.
/// The queue closes when the last controller is dropped.
pub struct Pipeline {
    controllers: Vec<ResourceController>,
    receiver: RegistrationReceiver,
}

impl Pipeline {
    pub fn build(
        cfg: &Config,
        evaluator: &dyn Evaluator,
        source: Arc<dyn ClusterSource>,
        opts: ControllerOptions,
        queue_cap: usize,
    ) -> Result<Self> {
        let (emitter, receiver) = RegistrationQueue::bounded(queue_cap);
        let mut controllers = Vec::with_capacity(cfg.imports().len());
        for (i, imp) in cfg.imports().iter().enumerate() {
            let gvk = imp.selector.gvk_key();
            let excludes = ExcludeFilter::new(evaluator, &imp.selector.excludes)
                .with_context(|| format!("import #{} ({}): compiling excludes", i, gvk))?;
            let builder = RegistrationBuilder::new(evaluator, &imp.registration)
                .with_context(|| format!("import #{} ({}): compiling registration", i, gvk))?;
            let handler = RegistrationHandler::new(gvk, builder, emitter.clone());
            controllers.push(ResourceController::new(
                imp.selector.clone(),
                Arc::clone(&source),
                excludes,
                Arc::new(handler),
                opts.clone(),
            ));
        }
        info!(controllers = controllers.len(), "pipeline ready");
        Ok(Self { controllers, receiver })
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// List every selector once and return the built registrations without
    /// touching the catalog.
    pub async fn preview(self) -> Result<Vec<ServiceRegistration>> {
        let Self { controllers, receiver } = self;
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(reg) = receiver.recv().await {
                out.push(reg);
            }
            out
        });
        let listed = futures::future::try_join_all(controllers.iter().map(|c| c.run_once())).await;
        drop(controllers);
        let regs = collector.await.context("registration collector failed")?;
        let listed = listed?;
        info!(objects = listed.iter().sum::<usize>(), registrations = regs.len(), "preview complete");
        Ok(regs)
    }

    /// List every selector once and reconcile everything through `workers`.
    pub async fn import(self, workers: Vec<Reconciler>) -> Result<PoolSummary> {
        let Self { controllers, receiver } = self;
        let pool = WorkerPool::spawn(workers, receiver);
        let listed = futures::future::try_join_all(controllers.iter().map(|c| c.run_once())).await;
        drop(controllers);
        let summary = pool.join().await;
        listed?;
        Ok(summary)
    }

    /// Watch every selector until `cancel` fires or a controller fails, then
    /// let the workers drain what was already queued.
    pub async fn run(self, workers: Vec<Reconciler>, cancel: CancellationToken) -> Result<PoolSummary> {
        let Self { controllers, receiver } = self;
        let pool = WorkerPool::spawn(workers, receiver);
        let mut running: FuturesUnordered<_> = controllers
            .into_iter()
            .map(|c| {
                let token = cancel.child_token();
                tokio::spawn(async move {
                    let gvk = c.selector().gvk_key();
                    c.run(token).await.with_context(|| format!("controller {}", gvk))
                })
            })
            .collect();

        let mut first_err = None;
        while let Some(res) = running.next().await {
            let err = match res {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => anyhow!("controller task failed: {}", e),
            };
            error!(error = %format!("{:#}", err), "controller stopped; shutting down");
            cancel.cancel();
            first_err.get_or_insert(err);
        }

        let summary = pool.join().await;
        match first_err {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// One reconciler per worker, each over its own catalog client.
pub fn workers<F>(n: usize, mut connect: F, refs: &Arc<ReferenceCache>, opts: ReconcileOptions) -> Result<Vec<Reconciler>>
where
    F: FnMut() -> Result<Arc<dyn CatalogClient>>,
{
    (0..n.max(1)).map(|_| Ok(Reconciler::new(connect()?, Arc::clone(refs), opts))).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use kubecat_catalog::MockCatalog;
    use kubecat_core::WatchEvent;
    use kubecat_expr::testing::StaticEvaluator;
    use kubecat_kubehub::MemorySource;

    const CONFIG: &str = r#"
version: "1.3.0"
service:
  import:
    - selector:
        apiVersion: apps/v1
        kind: Deployment
        excludes:
          - .metadata.namespace == "kube-system"
      opslevel:
        name: .metadata.name
        aliases:
          - '"k8s:\(.metadata.name)-\(.metadata.namespace)"'
"#;

    fn evaluator() -> StaticEvaluator {
        StaticEvaluator::default()
            .with_fn(".metadata.namespace == \"kube-system\"", |o| {
                Ok((o["metadata"]["namespace"] == "kube-system").to_string())
            })
            .with_fn(".metadata.name", |o| Ok(o["metadata"]["name"].to_string()))
            .with_fn("\"k8s:\\(.metadata.name)-\\(.metadata.namespace)\"", |o| {
                let name = o["metadata"]["name"].as_str().unwrap_or_default();
                let ns = o["metadata"]["namespace"].as_str().unwrap_or_default();
                Ok(format!("\"k8s:{}-{}\"", name, ns))
            })
    }

    fn deployment(name: &str, ns: &str) -> serde_json::Value {
        serde_json::json!({ "metadata": { "name": name, "namespace": ns, "resourceVersion": "1" } })
    }

    fn pipeline(source: MemorySource) -> Pipeline {
        let cfg = Config::parse(CONFIG).unwrap();
        Pipeline::build(&cfg, &evaluator(), Arc::new(source), ControllerOptions::default(), 16).unwrap()
    }

    fn pool(cat: &Arc<MockCatalog>, n: usize) -> Vec<Reconciler> {
        let refs = Arc::new(ReferenceCache::new(cat.clone()));
        workers(n, || Ok(cat.clone() as Arc<dyn CatalogClient>), &refs, ReconcileOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn preview_builds_without_excluded_objects() {
        let (source, _tx) =
            MemorySource::new(vec![deployment("web", "shop"), deployment("dns", "kube-system"), deployment("api", "shop")]);
        let p = pipeline(source);
        assert!(!p.is_empty());
        let mut regs = p.preview().await.unwrap();
        regs.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = regs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
        assert_eq!(regs[1].aliases, vec!["k8s:web-shop".to_string()]);
    }

    #[tokio::test]
    async fn preview_reports_list_failure() {
        let p = pipeline(MemorySource::failing());
        assert!(p.preview().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn import_reconciles_every_listed_object() {
        let (source, _tx) = MemorySource::new(vec![deployment("web", "shop"), deployment("api", "shop")]);
        let cat = Arc::new(MockCatalog::new());
        let summary = pipeline(source).import(pool(&cat, 2)).await.unwrap();
        assert_eq!(summary.reconciled, 2);
        assert_eq!(summary.created, 2);
        assert!(cat.service("k8s:web-shop").is_some());
        assert!(cat.service("k8s:api-shop").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_picks_up_watch_events_until_cancelled() {
        let (source, tx) = MemorySource::new(vec![deployment("web", "shop")]);
        let cat = Arc::new(MockCatalog::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline(source).run(pool(&cat, 1), cancel.clone()));

        tx.send(WatchEvent::Applied(deployment("api", "shop"))).unwrap();
        for _ in 0..500 {
            if cat.service("k8s:api-shop").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cat.service("k8s:web-shop").is_some());
        assert!(cat.service("k8s:api-shop").is_some());

        cancel.cancel();
        let summary = task.await.unwrap().unwrap();
        assert!(summary.created >= 2);
    }

    #[test]
    fn each_worker_gets_its_own_client() {
        let cat = Arc::new(MockCatalog::new());
        let refs = Arc::new(ReferenceCache::new(cat.clone()));
        let mut connected = 0;
        let built = workers(
            3,
            || {
                connected += 1;
                Ok(Arc::new(MockCatalog::new()) as Arc<dyn CatalogClient>)
            },
            &refs,
            ReconcileOptions::default(),
        )
        .unwrap();
        assert_eq!((built.len(), connected), (3, 3));

        let failing = workers(2, || Err(anyhow!("no token")), &refs, ReconcileOptions::default());
        assert!(failing.is_err());
    }
}
