//! kubecat kubehub: client bootstrap, API discovery and list/watch wiring

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use kubecat_core::{Selector, WatchEvent};
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Cluster collaborator: initial list plus a change stream per selector.
#[async_trait::async_trait]
pub trait ClusterSource: Send + Sync {
    async fn list(&self, selector: &Selector) -> Result<Vec<Json>>;

    async fn watch(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WatchEvent>>>;
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig / in-cluster env")
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// `ClusterSource` backed by the Kubernetes API via kube-rs.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    /// One `Api` per selected namespace, or a single cluster-wide `Api`.
    async fn apis(&self, selector: &Selector) -> Result<Vec<Api<DynamicObject>>> {
        let gvk = parse_gvk_key(&selector.gvk_key())?;
        let (ar, namespaced) = find_api_resource(self.client.clone(), &gvk).await?;
        if namespaced && !selector.namespaces.is_empty() {
            Ok(selector
                .namespaces
                .iter()
                .map(|ns| Api::namespaced_with(self.client.clone(), ns, &ar))
                .collect())
        } else {
            Ok(vec![Api::all_with(self.client.clone(), &ar)])
        }
    }
}

#[async_trait::async_trait]
impl ClusterSource for KubeSource {
    async fn list(&self, selector: &Selector) -> Result<Vec<Json>> {
        let lp = ListParams {
            label_selector: selector.label_selector(),
            field_selector: selector.field_selector(),
            ..Default::default()
        };
        let mut out = Vec::new();
        for api in self.apis(selector).await? {
            let list = api
                .list(&lp)
                .await
                .with_context(|| format!("listing {}", selector.gvk_key()))?;
            for o in list.items.iter() {
                out.push(to_json(o)?);
            }
        }
        info!(gvk = %selector.gvk_key(), count = out.len(), "initial list done");
        Ok(out)
    }

    async fn watch(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let mut cfg = watcher::Config::default();
        if let Some(labels) = selector.label_selector() {
            cfg = cfg.labels(&labels);
        }
        if let Some(fields) = selector.field_selector() {
            cfg = cfg.fields(&fields);
        }
        let streams: Vec<BoxStream<'static, Result<WatchEvent>>> = self
            .apis(selector)
            .await?
            .into_iter()
            .map(|api| {
                watcher::watcher(api, cfg.clone())
                    .default_backoff()
                    .map(|ev| -> Result<WatchEvent> {
                        match ev? {
                            Event::Applied(o) => Ok(WatchEvent::Applied(to_json(&o)?)),
                            Event::Deleted(o) => Ok(WatchEvent::Deleted(to_json(&o)?)),
                            Event::Restarted(list) => {
                                debug!(count = list.len(), "watch restart");
                                counter!("watch_restarts", 1u64);
                                Ok(WatchEvent::Restarted(list.iter().map(to_json).collect::<Result<_>>()?))
                            }
                        }
                    })
                    .boxed()
            })
            .collect();
        info!(gvk = %selector.gvk_key(), streams = streams.len(), "watcher started");
        Ok(futures::stream::select_all(streams).boxed())
    }
}

/// In-memory `ClusterSource`: a fixed list and a channel-fed watch stream.
pub struct MemorySource {
    items: Vec<Json>,
    fail_list: bool,
    watch_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
}

impl MemorySource {
    pub fn new(items: Vec<Json>) -> (Self, mpsc::UnboundedSender<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { items, fail_list: false, watch_rx: Mutex::new(Some(rx)) }, tx)
    }

    /// A source whose `list` always fails.
    pub fn failing() -> Self {
        let (mut me, _tx) = Self::new(Vec::new());
        me.fail_list = true;
        me
    }
}

#[async_trait::async_trait]
impl ClusterSource for MemorySource {
    async fn list(&self, selector: &Selector) -> Result<Vec<Json>> {
        if self.fail_list {
            return Err(anyhow!("listing {}: induced failure", selector.gvk_key()));
        }
        Ok(self.items.clone())
    }

    async fn watch(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let rx = self
            .watch_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow!("watch for {} already started", selector.gvk_key()))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (Ok::<_, anyhow::Error>(ev), rx)) }).boxed())
    }
}
