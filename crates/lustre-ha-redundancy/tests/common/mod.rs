//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Failover decision engine and lock-guarded mount orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lustre_ha_redundancy::{
    liveness_key, FailoverEngine, FailoverError, MountLock, Mounter, Node, NodeStatus, Resource,
    ResourceStatus,
};
use lustre_ha_registry::{MemoryStore, ServiceRegistry};
use parking_lot::Mutex;

/// Mounter that fails a scripted number of times and records every call.
#[derive(Debug, Default)]
pub struct ScriptedMounter {
    failures_left: Mutex<u32>,
    calls: Mutex<Vec<(String, String)>>,
    hold: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedMounter {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: Mutex::new(times),
            ..Self::default()
        }
    }

    pub fn holding(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of mounts observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mounter for ScriptedMounter {
    async fn mount(&self, device: &str, mount_point: &str) -> Result<(), FailoverError> {
        let in_flight = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(in_flight, Ordering::SeqCst);
        self.calls
            .lock()
            .push((device.to_owned(), mount_point.to_owned()));
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut failures = self.failures_left.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(FailoverError::Mount {
                device: device.to_owned(),
                mount_point: mount_point.to_owned(),
                reason: "mount: special device does not exist".into(),
            });
        }
        Ok(())
    }
}

pub const NODE_A_IP: &str = "10.0.0.1";
pub const NODE_B_IP: &str = "10.0.0.2";

pub struct Cluster {
    pub memory: MemoryStore,
    pub registry: Arc<ServiceRegistry>,
}

impl Cluster {
    pub fn new() -> Self {
        let memory = MemoryStore::new();
        let registry = Arc::new(ServiceRegistry::new(Arc::new(memory.clone())));
        Self { memory, registry }
    }

    pub fn engine(&self, local_ip: &str, mounter: Arc<ScriptedMounter>) -> FailoverEngine {
        let mount = MountLock::new(self.registry.store(), mounter, 10);
        FailoverEngine::new(Arc::clone(&self.registry), mount, local_ip)
    }

    pub async fn mark_alive(&self, resource: &str, ip: &str) {
        self.registry
            .put(&liveness_key(resource, ip), "alive")
            .await
            .unwrap();
    }

    pub async fn stored(&self, name: &str) -> Option<Resource> {
        match self.registry.get_json(&format!("/resources/{name}")).await {
            Ok(resource) => Some(resource),
            Err(err) if err.is_not_found() => None,
            Err(err) => panic!("unexpected store error: {err}"),
        }
    }
}

/// `ost1` with A preferred, both nodes healthy and nothing mounted.
pub fn ost1() -> Resource {
    Resource {
        name: "ost1".into(),
        a: Node {
            name: "A".into(),
            ip: NODE_A_IP.into(),
            priority: 10,
            status: NodeStatus::Healthy,
        },
        b: Node {
            name: "B".into(),
            ip: NODE_B_IP.into(),
            priority: 5,
            status: NodeStatus::Healthy,
        },
        res_name: "/dev/sdb".into(),
        mount_point: "/lustre/ost1".into(),
        current_node: String::new(),
        status: ResourceStatus::Unmounted,
    }
}
