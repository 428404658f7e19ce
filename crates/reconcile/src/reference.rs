//! Alias-indexed tiers, lifecycles and teams, refreshed on a timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kubecat_catalog::{CatalogError, Lifecycle, ReferenceSource, Team, Tier};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Tables {
    tiers: HashMap<String, Tier>,
    lifecycles: HashMap<String, Lifecycle>,
    teams: HashMap<String, Team>,
    loaded: bool,
}

pub struct ReferenceCache {
    source: Arc<dyn ReferenceSource>,
    tables: Mutex<Tables>,
}

impl ReferenceCache {
    pub fn new(source: Arc<dyn ReferenceSource>) -> Self {
        Self { source, tables: Mutex::new(Tables::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch all three tables and swap them in together. On failure the
    /// previous data stays in place.
    pub async fn refresh(&self) -> Result<(), CatalogError> {
        let fetched = async {
            let tiers = self.source.list_tiers().await?;
            let lifecycles = self.source.list_lifecycles().await?;
            let teams = self.source.list_teams().await?;
            Ok::<_, CatalogError>((tiers, lifecycles, teams))
        }
        .await;
        let (tiers, lifecycles, teams) = match fetched {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "reference data refresh failed; keeping previous data");
                return Err(e);
            }
        };
        let mut t = self.lock();
        t.tiers = tiers.into_iter().map(|x| (x.alias.clone(), x)).collect();
        t.lifecycles = lifecycles.into_iter().map(|x| (x.alias.clone(), x)).collect();
        t.teams = teams.into_iter().map(|x| (x.alias.clone(), x)).collect();
        t.loaded = true;
        info!(tiers = t.tiers.len(), lifecycles = t.lifecycles.len(), teams = t.teams.len(), "reference data refreshed");
        Ok(())
    }

    /// Refresh every `every` until cancelled. The first refresh happens after
    /// one interval; call `refresh` at startup.
    pub fn spawn_refresh(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = me.refresh().await;
                    }
                }
            }
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    pub fn tier(&self, alias: &str) -> Option<Tier> {
        self.lock().tiers.get(alias).cloned()
    }

    pub fn lifecycle(&self, alias: &str) -> Option<Lifecycle> {
        self.lock().lifecycles.get(alias).cloned()
    }

    pub fn team(&self, alias: &str) -> Option<Team> {
        self.lock().teams.get(alias).cloned()
    }
}
