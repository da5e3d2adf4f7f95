pub mod annotate;
pub mod cascade;

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::AdapterRegistry;
use crate::flow::HandlerRegistry;
use crate::notify::NotificationBridge;

/// Opaque "generate annotation" capability. Provider integrations live
/// outside the core and plug in through this trait.
#[async_trait]
pub trait Annotator: Send + Sync {
    async fn annotate(&self, run_id: &str, session_id: &str) -> anyhow::Result<serde_json::Value>;
}

/// Annotator used when no provider is wired: marks sessions as annotated
/// without generating content. Useful for dry runs and the CLI.
pub struct PassthroughAnnotator;

#[async_trait]
impl Annotator for PassthroughAnnotator {
    async fn annotate(
        &self,
        _run_id: &str,
        _session_id: &str,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({ "provider": "passthrough" }))
    }
}

/// Shared dependencies for the domain job handlers. Adapters are resolved
/// through the registry on every operation, never cached.
pub struct PipelineDeps {
    pub adapters: Arc<AdapterRegistry>,
    pub bridge: Arc<NotificationBridge>,
    pub annotator: Arc<dyn Annotator>,
}

/// Register every domain handler on the queue's handler registry.
pub fn register_handlers(registry: &mut HandlerRegistry, deps: Arc<PipelineDeps>) {
    registry.register(Arc::new(annotate::AnnotateSessionHandler {
        deps: deps.clone(),
    }));
    registry.register(Arc::new(annotate::AnnotateRunHandler {
        deps: deps.clone(),
    }));
    registry.register(Arc::new(cascade::CleanupCollectionHandler {
        deps: deps.clone(),
    }));
    registry.register(Arc::new(cascade::FinishDeleteHandler { deps }));
}
