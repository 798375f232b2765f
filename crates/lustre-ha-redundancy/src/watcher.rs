//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Failover decision engine and lock-guarded mount orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use lustre_ha_metrics::FailoverMetrics;
use lustre_ha_registry::{CoordinationStore, RegistryError, WatchEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{Decision, FailoverEngine};
use crate::error::Result;
use crate::resource::{resource_prefix, Resource};

/// Feeds resource documents under one controller prefix into the engine.
///
/// Decisions run inline, so a slow mount holds back the next event for the
/// same prefix.
#[derive(Clone)]
pub struct ResourceWatcher {
    store: Arc<dyn CoordinationStore>,
    engine: Arc<FailoverEngine>,
    metrics: Option<FailoverMetrics>,
}

impl std::fmt::Debug for ResourceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWatcher")
            .field("backend", &self.store.backend())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl ResourceWatcher {
    pub fn new(store: Arc<dyn CoordinationStore>, engine: Arc<FailoverEngine>) -> Self {
        Self {
            store,
            engine,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FailoverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Consume change events until `shutdown` fires. A closed or failed
    /// stream is returned as an error so the owner can decide to re-watch.
    pub async fn watch(&self, controller: &str, shutdown: CancellationToken) -> Result<()> {
        let prefix = resource_prefix(controller);
        let mut events = self.store.watch_prefix(&prefix).await?;
        info!(controller, prefix = %prefix, "watching resources");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(controller, "resource watcher stopped");
                    return Ok(());
                }
                next = events.recv() => next,
            };
            let Some(event) = next else {
                return Err(RegistryError::Watch(format!("stream for {prefix} closed")).into());
            };
            match event? {
                WatchEvent::Put { key, value } => {
                    self.record(controller, "put");
                    self.handle_put(&key, &value).await;
                }
                WatchEvent::Delete { key } => {
                    self.record(controller, "delete");
                    info!(controller, key = %key, "resource deleted; no action taken");
                }
            }
        }
    }

    /// Decode one stored document and run the engine on it. Malformed
    /// documents are logged and dropped.
    pub async fn handle_put(&self, key: &str, value: &[u8]) -> Option<Decision> {
        let resource = match Resource::from_json(key, value) {
            Ok(resource) => resource,
            Err(err) => {
                warn!(key, error = %err, "dropping malformed resource document");
                return None;
            }
        };
        debug!(key, resource = %resource.name, "resource updated");
        let decision = self.engine.process_resource(resource).await;
        debug!(
            resource = %decision.resource.name,
            primary = %decision.primary,
            outcome = decision.outcome.as_str(),
            switches = decision.switches.len(),
            "resource processed"
        );
        Some(decision)
    }

    fn record(&self, controller: &str, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_watch_event(controller, kind);
        }
    }
}
