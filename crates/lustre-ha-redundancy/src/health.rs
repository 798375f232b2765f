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

use lustre_ha_registry::ServiceRegistry;
use tracing::debug;

/// Key whose presence marks `node_ip` as alive for `resource_name`.
pub fn liveness_key(resource_name: &str, node_ip: &str) -> String {
    format!("/controller/{resource_name}/{node_ip}")
}

/// Point-in-time liveness probe. A missing marker and a failed read both count as unhealthy.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
}

impl HealthChecker {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    pub async fn is_healthy(&self, resource_name: &str, node_ip: &str) -> bool {
        let key = liveness_key(resource_name, node_ip);
        match self.registry.get(&key).await {
            Ok(_) => true,
            Err(err) => {
                debug!(resource = resource_name, node_ip, error = %err, "node considered unhealthy");
                false
            }
        }
    }
}
