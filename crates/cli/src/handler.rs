//! Controller handler that turns resources into queued registrations.

use std::sync::Arc;

use kubecat_controller::ResourceHandler;
use kubecat_core::resource_key;
use kubecat_expr::RegistrationBuilder;
use kubecat_reconcile::Emitter;
use serde_json::Value as Json;
use tracing::{debug, warn};

pub struct RegistrationHandler {
    gvk: String,
    builder: Arc<RegistrationBuilder>,
    emitter: Emitter,
}

impl RegistrationHandler {
    pub fn new(gvk: impl Into<String>, builder: RegistrationBuilder, emitter: Emitter) -> Self {
        Self { gvk: gvk.into(), builder: Arc::new(builder), emitter }
    }

    async fn build_and_emit(&self, items: Vec<Json>) {
        let builder = Arc::clone(&self.builder);
        // Expressions run the evaluator binary once per field.
        let built = tokio::task::spawn_blocking(move || {
            items
                .iter()
                .map(|o| (resource_key(o).unwrap_or_default(), builder.build(o)))
                .collect::<Vec<_>>()
        })
        .await;
        let built = match built {
            Ok(v) => v,
            Err(e) => {
                warn!(gvk = %self.gvk, error = %e, "registration build task failed");
                return;
            }
        };
        for (key, res) in built {
            match res {
                Ok(reg) => {
                    if self.emitter.emit(reg).await.is_err() {
                        warn!(gvk = %self.gvk, key = %key, "registration queue closed; dropping remaining batch");
                        return;
                    }
                }
                Err(e) => warn!(gvk = %self.gvk, key = %key, error = %e, "building registration failed"),
            }
        }
    }
}

#[async_trait::async_trait]
impl ResourceHandler for RegistrationHandler {
    async fn on_add(&self, items: Vec<Json>) {
        self.build_and_emit(items).await;
    }

    async fn on_update(&self, items: Vec<Json>) {
        self.build_and_emit(items).await;
    }

    async fn on_delete(&self, items: Vec<Json>) {
        for o in &items {
            debug!(gvk = %self.gvk, key = %resource_key(o).unwrap_or_default(), "resource deleted; catalog left unchanged");
        }
    }
}
