//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Failover decision engine and lock-guarded mount orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Process-level wiring: registry lease, published keys and one watcher task
//! per controller prefix.

use std::sync::Arc;
use std::time::Duration;

use lustre_ha_common::AppConfig;
use lustre_ha_metrics::{FailoverMetrics, RegistryMetrics};
use lustre_ha_registry::{CoordinationStore, ServiceRegistry};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::FailoverEngine;
use crate::error::Result;
use crate::health::liveness_key;
use crate::mount::Mounter;
use crate::watcher::ResourceWatcher;

/// Key under which the `lustre` config section is published at startup.
pub const BASIS_CONFIG_KEY: &str = "lustre_basis_config";

const REWATCH_DELAY: Duration = Duration::from_secs(1);
const LISTENER_DRAIN: Duration = Duration::from_secs(5);

/// Builds and starts the long-running tasks of one failover controller.
pub struct FailoverSupervisor {
    config: AppConfig,
    store: Arc<dyn CoordinationStore>,
    mounter: Arc<dyn Mounter>,
    registry_metrics: Option<RegistryMetrics>,
    failover_metrics: Option<FailoverMetrics>,
}

impl std::fmt::Debug for FailoverSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverSupervisor")
            .field("controller", &self.config.controller.name)
            .field("backend", &self.store.backend())
            .finish_non_exhaustive()
    }
}

impl FailoverSupervisor {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn CoordinationStore>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            config,
            store,
            mounter,
            registry_metrics: None,
            failover_metrics: None,
        }
    }

    pub fn with_metrics(mut self, registry: RegistryMetrics, failover: FailoverMetrics) -> Self {
        self.registry_metrics = Some(registry);
        self.failover_metrics = Some(failover);
        self
    }

    /// Take the lease, publish startup keys and spawn the watchers.
    pub async fn start(mut self) -> Result<SupervisorHandle> {
        let mut registry = ServiceRegistry::new(Arc::clone(&self.store))
            .with_revoke_settle(self.config.etcd.revoke_settle);
        if let Some(metrics) = self.registry_metrics.take() {
            registry = registry.with_metrics(metrics);
        }
        let registry = Arc::new(registry);

        let lease = registry.lease(self.config.etcd.lease_ttl_secs()).await?;
        let listener = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.listen_lease(lease).await })
        };

        if let Err(err) = registry.put_json(BASIS_CONFIG_KEY, &self.config.lustre).await {
            warn!(key = BASIS_CONFIG_KEY, error = %err, "failed to publish lustre basis config");
        }
        if let Err(err) = self.publish_liveness(&registry).await {
            if let Err(revoke_err) = registry.revoke().await {
                warn!(error = %revoke_err, "failed to revoke lease after aborted startup");
            }
            listener.abort();
            return Err(err);
        }

        let mut engine =
            FailoverEngine::from_config(&self.config, Arc::clone(&registry), self.mounter);
        if let Some(metrics) = self.failover_metrics.clone() {
            engine = engine.with_metrics(metrics);
        }
        let mut watcher = ResourceWatcher::new(Arc::clone(&self.store), Arc::new(engine));
        if let Some(metrics) = self.failover_metrics {
            watcher = watcher.with_metrics(metrics);
        }

        let shutdown = CancellationToken::new();
        let watchers = self
            .config
            .watched_controllers()
            .into_iter()
            .map(|controller| {
                let watcher = watcher.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { run_watcher(watcher, controller, shutdown).await })
            })
            .collect();

        info!(
            controller = %self.config.controller.name,
            ip = %self.config.server.ip,
            backend = self.store.backend(),
            "failover supervisor started"
        );
        Ok(SupervisorHandle {
            registry,
            shutdown,
            watchers,
            listener,
        })
    }

    async fn publish_liveness(&self, registry: &ServiceRegistry) -> Result<()> {
        for resource in &self.config.liveness.resources {
            let key = liveness_key(resource, &self.config.server.ip);
            registry
                .put_leased(&key, self.config.controller.name.as_bytes())
                .await?;
            info!(key = %key, "liveness marker published");
        }
        Ok(())
    }
}

async fn run_watcher(watcher: ResourceWatcher, controller: String, shutdown: CancellationToken) {
    loop {
        match watcher.watch(&controller, shutdown.clone()).await {
            Ok(()) => return,
            Err(err) => {
                error!(controller = %controller, error = %err, "resource watch ended; re-watching");
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(REWATCH_DELAY) => {}
        }
    }
}

/// Running supervisor tasks.
#[derive(Debug)]
pub struct SupervisorHandle {
    registry: Arc<ServiceRegistry>,
    shutdown: CancellationToken,
    watchers: Vec<JoinHandle<()>>,
    listener: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Stop watchers, then revoke the lease. Watchers finish any decision
    /// already in progress first.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        for watcher in self.watchers {
            if let Err(err) = watcher.await {
                warn!(error = %err, "watcher task ended abnormally");
            }
        }
        self.registry.revoke().await?;
        if tokio::time::timeout(LISTENER_DRAIN, self.listener).await.is_err() {
            warn!("lease listener did not stop after revoke");
        }
        info!("failover supervisor stopped");
        Ok(())
    }
}
