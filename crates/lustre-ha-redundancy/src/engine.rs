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
use std::time::Instant;

use chrono::{DateTime, Utc};
use lustre_ha_common::AppConfig;
use lustre_ha_metrics::FailoverMetrics;
use lustre_ha_registry::ServiceRegistry;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::health::HealthChecker;
use crate::mount::{MountLock, Mounter};
use crate::resource::{NodeSlot, NodeStatus, Resource, ResourceStatus};

const DEFAULT_MOUNT_ATTEMPTS: u32 = 3;

/// How processing of one resource document ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// Neither node is `Healthy`; nothing evaluated.
    NoHealthyNode,
    /// The primary or backup already runs the mounted resource; nothing written.
    Steady,
    /// Arbitration left the document as it was; nothing written.
    Unchanged,
    Persisted,
    PersistFailed(String),
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::NoHealthyNode => "no_healthy_node",
            DecisionOutcome::Steady => "steady",
            DecisionOutcome::Unchanged => "unchanged",
            DecisionOutcome::Persisted => "persisted",
            DecisionOutcome::PersistFailed(_) => "persist_failed",
        }
    }
}

/// A switch this node performed while processing a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchAttempt {
    pub slot: NodeSlot,
    pub node: String,
    /// Last mount error when every attempt failed.
    pub error: Option<String>,
}

/// Summary of one engine pass, returned for logging, metrics and tests.
#[derive(Debug, Clone)]
pub struct Decision {
    pub resource: Resource,
    pub primary: NodeSlot,
    pub outcome: DecisionOutcome,
    pub switches: Vec<SwitchAttempt>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn persisted(&self) -> bool {
        self.outcome == DecisionOutcome::Persisted
    }
}

enum Arbitration {
    Steady,
    Continue,
}

/// Decides, per resource document, whether this node must take over the mount.
pub struct FailoverEngine {
    registry: Arc<ServiceRegistry>,
    health: HealthChecker,
    mount: MountLock,
    local_ip: String,
    tie_break: NodeSlot,
    mount_attempts: u32,
    metrics: Option<FailoverMetrics>,
}

impl std::fmt::Debug for FailoverEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverEngine")
            .field("local_ip", &self.local_ip)
            .field("tie_break", &self.tie_break)
            .field("mount_attempts", &self.mount_attempts)
            .field("mount", &self.mount)
            .finish_non_exhaustive()
    }
}

impl FailoverEngine {
    pub fn new(registry: Arc<ServiceRegistry>, mount: MountLock, local_ip: impl Into<String>) -> Self {
        Self {
            health: HealthChecker::new(Arc::clone(&registry)),
            registry,
            mount,
            local_ip: local_ip.into(),
            tie_break: NodeSlot::B,
            mount_attempts: DEFAULT_MOUNT_ATTEMPTS,
            metrics: None,
        }
    }

    /// Wire an engine from the daemon configuration.
    pub fn from_config(
        config: &AppConfig,
        registry: Arc<ServiceRegistry>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        let mount = MountLock::new(registry.store(), mounter, config.etcd.lease_ttl_secs())
            .with_acquire_timeout(config.etcd.lock_timeout);
        Self::new(registry, mount, config.server.ip.clone())
            .with_tie_break(config.failover.tie_break.into())
            .with_mount_attempts(config.failover.mount_attempts)
    }

    pub fn with_tie_break(mut self, tie_break: NodeSlot) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_mount_attempts(mut self, attempts: u32) -> Self {
        self.mount_attempts = attempts.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: FailoverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    /// Run the failover policy on one document and write back any change.
    pub async fn process_resource(&self, mut resource: Resource) -> Decision {
        let original = resource.clone();
        let primary = resource.primary_slot(self.tie_break);
        let backup = primary.other();
        let mut switches = Vec::new();

        let outcome = if resource.node(primary).status != NodeStatus::Healthy
            && resource.node(backup).status != NodeStatus::Healthy
        {
            debug!(resource = %resource.name, "no healthy node; document left untouched");
            DecisionOutcome::NoHealthyNode
        } else if let Arbitration::Steady =
            self.arbitrate(&mut resource, primary, &mut switches).await
        {
            debug!(resource = %resource.name, node = %resource.node(primary).name, "primary steady");
            DecisionOutcome::Steady
        } else if let Arbitration::Steady =
            self.arbitrate(&mut resource, backup, &mut switches).await
        {
            debug!(resource = %resource.name, node = %resource.node(backup).name, "backup steady");
            DecisionOutcome::Steady
        } else {
            self.persist(&original, &resource).await
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_decision(&resource.name, outcome.as_str());
        }
        Decision {
            resource,
            primary,
            outcome,
            switches,
            decided_at: Utc::now(),
        }
    }

    async fn arbitrate(
        &self,
        resource: &mut Resource,
        slot: NodeSlot,
        switches: &mut Vec<SwitchAttempt>,
    ) -> Arbitration {
        let node = resource.node(slot).clone();
        if !self.health.is_healthy(&resource.name, &node.ip).await {
            resource.node_mut(slot).status = NodeStatus::Unreachable;
            return Arbitration::Continue;
        }
        if resource.is_mounted() && node.status == NodeStatus::Running {
            return Arbitration::Steady;
        }
        if resource.current_node != node.name && node.ip == self.local_ip {
            info!(resource = %resource.name, node = %node.name, %slot, "switching resource to this node");
            let result = self.switch_resource_to_node(resource, &node.name).await;
            let error = match result {
                Ok(()) => {
                    resource.node_mut(slot).status = NodeStatus::Running;
                    None
                }
                Err(err) => {
                    warn!(resource = %resource.name, node = %node.name, error = %err, "resource failed to start");
                    resource.node_mut(slot).status = NodeStatus::Failed;
                    Some(err.to_string())
                }
            };
            switches.push(SwitchAttempt {
                slot,
                node: node.name,
                error,
            });
        }
        Arbitration::Continue
    }

    async fn persist(&self, original: &Resource, resource: &Resource) -> DecisionOutcome {
        if original == resource {
            return DecisionOutcome::Unchanged;
        }
        let written = match resource.to_json() {
            Ok(encoded) => self
                .registry
                .put(&resource.key(), encoded)
                .await
                .map_err(Into::into),
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => {
                info!(resource = %resource.name, current_node = %resource.current_node, status = %resource.status, "resource state updated");
                DecisionOutcome::Persisted
            }
            Err(err) => {
                warn!(resource = %resource.name, error = %err, "failed to persist resource state");
                DecisionOutcome::PersistFailed(err.to_string())
            }
        }
    }

    /// Mount the resource here, retrying without backoff. On success the
    /// document names `target` as current node; after the last failure it is
    /// left unmounted and the final error is returned.
    pub async fn switch_resource_to_node(&self, resource: &mut Resource, target: &str) -> Result<()> {
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = self
                .mount
                .mount(&resource.res_name, &resource.mount_point, &resource.name)
                .await;
            if let Some(metrics) = &self.metrics {
                metrics.record_mount_attempt(&resource.name, target, result.is_ok(), started.elapsed());
            }
            match result {
                Ok(()) => {
                    resource.current_node = target.to_owned();
                    resource.status = ResourceStatus::Mounted;
                    info!(resource = %resource.name, node = target, attempt, "resource mounted");
                    return Ok(());
                }
                Err(err) if attempt < self.mount_attempts => {
                    warn!(
                        resource = %resource.name,
                        node = target,
                        attempt,
                        attempts = self.mount_attempts,
                        error = %err,
                        "mount attempt failed; retrying"
                    );
                    attempt += 1;
                }
                Err(err) => {
                    resource.current_node.clear();
                    resource.status = ResourceStatus::Unmounted;
                    return Err(err);
                }
            }
        }
    }
}
