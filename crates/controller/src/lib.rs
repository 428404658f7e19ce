//! kubecat controller: per-selector cache, coalescing event queue and a batched
//! dispatch loop that hands current object state to a `ResourceHandler`.

#![forbid(unsafe_code)]

pub mod cache;
pub mod queue;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use kubecat_core::{Event, EventType, Selector, WatchEvent};
use kubecat_expr::ExcludeFilter;
use kubecat_kubehub::ClusterSource;
use metrics::counter;
use serde_json::Value as Json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use cache::ObjectCache;
pub use queue::EventQueue;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Receives batches of current object state, one call per batch.
#[async_trait::async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn on_add(&self, items: Vec<Json>);

    async fn on_update(&self, items: Vec<Json>);

    async fn on_delete(&self, items: Vec<Json>);
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub batch_size: usize,
    /// Re-enqueue every cached object as an Update on this interval.
    pub resync: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, resync: None }
    }
}

#[derive(Debug, Default)]
struct State {
    queue: EventQueue,
    cache: ObjectCache,
}

impl State {
    fn ingest(&mut self, ev: WatchEvent) -> usize {
        let events: Vec<Event> = match ev {
            WatchEvent::Applied(o) => self.cache.apply(o).into_iter().collect(),
            WatchEvent::Deleted(o) => self.cache.remove(o).into_iter().collect(),
            WatchEvent::Restarted(list) => self.cache.replace(list),
        };
        let mut queued = 0;
        for e in events {
            if self.queue.push(e) {
                queued += 1;
            }
        }
        queued
    }

    fn resync(&mut self) -> usize {
        let mut queued = 0;
        for key in self.cache.keys() {
            if self.queue.push(Event::new(key, EventType::Update)) {
                queued += 1;
            }
        }
        queued
    }

    /// Pop one same-type batch and resolve it against the cache.
    fn take_batch(&mut self, max: usize) -> Option<(EventType, Vec<Json>)> {
        let events = self.queue.pop_batch(max);
        let kind = events.first()?.kind;
        let mut items = Vec::with_capacity(events.len());
        for e in &events {
            match self.cache.resolve(e) {
                Some(obj) => items.push(obj),
                None if e.kind == EventType::Delete => {
                    debug!(key = %e.key, "tombstone already consumed; skipping delete");
                }
                None => {
                    warn!(key = %e.key, event = %e.kind, "object no longer in cache; dropping event");
                    counter!("controller_dropped", 1u64);
                }
            }
        }
        Some((kind, items))
    }
}

/// One selector's list/watch loop feeding a handler.
pub struct ResourceController {
    selector: Selector,
    source: Arc<dyn ClusterSource>,
    excludes: ExcludeFilter,
    handler: Arc<dyn ResourceHandler>,
    opts: ControllerOptions,
    state: Arc<Mutex<State>>,
    ready: Arc<Notify>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl ResourceController {
    pub fn new(
        selector: Selector,
        source: Arc<dyn ClusterSource>,
        excludes: ExcludeFilter,
        handler: Arc<dyn ResourceHandler>,
        opts: ControllerOptions,
    ) -> Self {
        Self {
            selector,
            source,
            excludes,
            handler,
            opts,
            state: Arc::new(Mutex::new(State::default())),
            ready: Arc::new(Notify::new()),
        }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Initial list into the cache; every object is queued as a Create.
    async fn prime(&self) -> Result<usize> {
        let items = self
            .source
            .list(&self.selector)
            .await
            .with_context(|| format!("listing {}", self.selector.gvk_key()))?;
        let n = lock(&self.state).ingest(WatchEvent::Restarted(items));
        info!(gvk = %self.selector.gvk_key(), queued = n, "controller primed");
        Ok(n)
    }

    /// Dispatch one batch. Returns the number of handed-over objects, or None
    /// once the queue is empty.
    async fn dispatch_next(&self) -> Option<usize> {
        let (kind, items) = lock(&self.state).take_batch(self.opts.batch_size)?;
        let items = self.filter(items).await;
        if items.is_empty() {
            return Some(0);
        }
        let n = items.len();
        debug!(gvk = %self.selector.gvk_key(), event = %kind, count = n, "dispatching batch");
        counter!("controller_dispatched", n as u64);
        match kind {
            EventType::Create => self.handler.on_add(items).await,
            EventType::Update => self.handler.on_update(items).await,
            EventType::Delete => self.handler.on_delete(items).await,
        }
        Some(n)
    }

    async fn filter(&self, items: Vec<Json>) -> Vec<Json> {
        if self.excludes.is_empty() || items.is_empty() {
            return items;
        }
        let excludes = self.excludes.clone();
        // Predicates shell out to the evaluator; keep them off the reactor.
        let kept = tokio::task::spawn_blocking(move || {
            let before = items.len();
            let kept: Vec<Json> = items.into_iter().filter(|o| !excludes.is_excluded(o)).collect();
            (before - kept.len(), kept)
        })
        .await;
        match kept {
            Ok((excluded, kept)) => {
                if excluded > 0 {
                    counter!("controller_excluded", excluded as u64);
                }
                kept
            }
            Err(e) => {
                warn!(error = %e, "exclude evaluation task failed; dropping batch");
                Vec::new()
            }
        }
    }

    async fn drain(&self, cancel: Option<&CancellationToken>) -> usize {
        let mut total = 0;
        while let Some(n) = self.dispatch_next().await {
            total += n;
            if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                break;
            }
        }
        total
    }

    /// List once, dispatch everything, return. Used by one-shot imports.
    pub async fn run_once(&self) -> Result<usize> {
        self.prime().await?;
        let n = self.drain(None).await;
        info!(gvk = %self.selector.gvk_key(), dispatched = n, "one-shot pass complete");
        Ok(n)
    }

    /// List, then follow the watch stream until cancelled. Pending events are
    /// discarded on cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.prime().await?;
        let mut stream = self
            .source
            .watch(&self.selector)
            .await
            .with_context(|| format!("watching {}", self.selector.gvk_key()))?;

        let state = Arc::clone(&self.state);
        let ready = Arc::clone(&self.ready);
        let pump_cancel = cancel.child_token();
        let resync = self.opts.resync;
        let gvk = self.selector.gvk_key();
        let pump = tokio::spawn(async move {
            let mut ticker = resync.map(|d| {
                let mut t = tokio::time::interval_at(tokio::time::Instant::now() + d, d);
                t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                t
            });
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    maybe = stream.next() => match maybe {
                        Some(Ok(ev)) => {
                            if lock(&state).ingest(ev) > 0 {
                                ready.notify_one();
                            }
                        }
                        Some(Err(e)) => warn!(gvk = %gvk, error = %e, "watch stream error"),
                        None => {
                            debug!(gvk = %gvk, "watch stream ended");
                            break;
                        }
                    },
                    _ = async {
                        match ticker.as_mut() {
                            Some(t) => {
                                t.tick().await;
                            }
                            None => futures::future::pending::<()>().await,
                        }
                    } => {
                        let n = lock(&state).resync();
                        debug!(gvk = %gvk, queued = n, "resync");
                        if n > 0 {
                            ready.notify_one();
                        }
                    }
                }
            }
        });

        // Listed objects are already queued.
        self.ready.notify_one();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.ready.notified() => {
                    self.drain(Some(&cancel)).await;
                }
            }
        }

        pump.abort();
        let discarded = lock(&self.state).queue.clear();
        info!(gvk = %self.selector.gvk_key(), discarded, "controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str) -> Json {
        serde_json::json!({ "metadata": { "name": name, "namespace": "default" } })
    }

    #[test]
    fn cache_miss_drops_non_delete_events() {
        let mut st = State::default();
        st.ingest(WatchEvent::Applied(obj("a")));
        st.ingest(WatchEvent::Deleted(obj("a")));
        let (kind, items) = st.take_batch(10).unwrap();
        assert_eq!(kind, EventType::Create);
        assert!(items.is_empty());
        let (kind, items) = st.take_batch(10).unwrap();
        assert_eq!(kind, EventType::Delete);
        assert_eq!(items, vec![obj("a")]);
        assert!(st.take_batch(10).is_none());
    }

    #[test]
    fn resync_queues_updates_for_cached_objects() {
        let mut st = State::default();
        st.ingest(WatchEvent::Restarted(vec![obj("a"), obj("b")]));
        st.take_batch(10);
        assert_eq!(st.resync(), 2);
        assert_eq!(st.resync(), 0, "pending updates coalesce");
        let (kind, items) = st.take_batch(10).unwrap();
        assert_eq!(kind, EventType::Update);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn resync_skips_objects_gone_from_relist() {
        let mut st = State::default();
        st.ingest(WatchEvent::Restarted(vec![obj("a"), obj("b")]));
        st.take_batch(10);
        st.ingest(WatchEvent::Restarted(vec![obj("a")]));
        while st.take_batch(10).is_some() {}
        assert_eq!(st.resync(), 1);
        let (kind, items) = st.take_batch(10).unwrap();
        assert_eq!(kind, EventType::Update);
        assert_eq!(items, vec![obj("a")]);
    }
}
