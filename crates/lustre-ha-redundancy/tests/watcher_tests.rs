//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Failover decision engine and lock-guarded mount orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ost1, Cluster, ScriptedMounter, NODE_A_IP, NODE_B_IP};
use lustre_ha_redundancy::{
    DecisionOutcome, FailoverError, MountLock, NodeStatus, ResourceStatus, ResourceWatcher,
};
use lustre_ha_registry::RegistryError;
use tokio_util::sync::CancellationToken;

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn concurrent_mounts_of_one_device_never_overlap() {
    let cluster = Cluster::new();
    let mounter = Arc::new(ScriptedMounter::holding(Duration::from_millis(40)));
    let lock = MountLock::new(cluster.registry.store(), mounter.clone(), 10);

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let lock = lock.clone();
        tasks.push(tokio::spawn(async move {
            lock.mount("/dev/sdb", "/lustre/ost1", "ost1").await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(mounter.call_count(), 3);
    assert_eq!(mounter.peak_concurrency(), 1);
    assert!(!cluster.memory.is_locked("ost1//dev/sdb/mount_initing"));
    assert_eq!(cluster.memory.lease_count(), 0);
}

#[tokio::test]
async fn different_devices_do_not_contend() {
    let cluster = Cluster::new();
    let mounter = Arc::new(ScriptedMounter::holding(Duration::from_millis(100)));
    let lock = MountLock::new(cluster.registry.store(), mounter.clone(), 10);

    let first = {
        let lock = lock.clone();
        tokio::spawn(async move { lock.mount("/dev/sdb", "/lustre/ost1", "ost1").await })
    };
    let second = {
        let lock = lock.clone();
        tokio::spawn(async move { lock.mount("/dev/sdc", "/lustre/ost2", "ost2").await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(mounter.peak_concurrency(), 2);
}

#[tokio::test]
async fn watched_document_is_mounted_and_written_back_once() {
    let cluster = Cluster::new();
    cluster.mark_alive("ost1", NODE_A_IP).await;
    cluster.mark_alive("ost1", NODE_B_IP).await;
    let mounter = Arc::new(ScriptedMounter::default());
    let engine = Arc::new(cluster.engine(NODE_A_IP, Arc::clone(&mounter)));
    let watcher = ResourceWatcher::new(cluster.registry.store(), engine);

    let shutdown = CancellationToken::new();
    let task = {
        let watcher = watcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { watcher.watch("ost", shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    cluster.registry.put("/resources/ost1", "{not json").await.unwrap();
    cluster.registry.put_json("/resources/ost1", &ost1()).await.unwrap();

    wait_for(|| mounter.call_count() == 1).await;
    let stored = loop {
        let stored = cluster.stored("ost1").await.unwrap();
        if stored.status == ResourceStatus::Mounted {
            break stored;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(stored.current_node, "A");
    assert_eq!(stored.a.status, NodeStatus::Running);

    // the write-back is observed as steady and does not trigger another mount
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mounter.call_count(), 1);

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn delete_event_leaves_state_untouched() {
    let cluster = Cluster::new();
    cluster.mark_alive("ost1", NODE_A_IP).await;
    let mounter = Arc::new(ScriptedMounter::default());
    let engine = Arc::new(cluster.engine(NODE_B_IP, Arc::clone(&mounter)));
    let watcher = ResourceWatcher::new(cluster.registry.store(), engine);

    let shutdown = CancellationToken::new();
    let task = {
        let watcher = watcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { watcher.watch("ost", shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!cluster.memory.delete("/resources/ost1"));
    cluster.registry.put("/resources/ost2", "{}").await.unwrap();
    assert!(cluster.memory.delete("/resources/ost2"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mounter.call_count(), 0);
    assert!(cluster.stored("ost1").await.is_none());
    assert!(cluster.registry.get("/resources/ost2").await.unwrap_err().is_not_found());

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_put_is_dropped() {
    let cluster = Cluster::new();
    let mounter = Arc::new(ScriptedMounter::default());
    let engine = Arc::new(cluster.engine(NODE_A_IP, Arc::clone(&mounter)));
    let watcher = ResourceWatcher::new(cluster.registry.store(), engine);

    assert!(watcher.handle_put("/resources/ost1", b"[1,2").await.is_none());

    let mut resource = ost1();
    resource.a.status = NodeStatus::Failed;
    resource.b.status = NodeStatus::Failed;
    let raw = resource.to_json().unwrap();
    let decision = watcher.handle_put("/resources/ost1", &raw).await.unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::NoHealthyNode);
}

#[tokio::test]
async fn unreachable_store_fails_watch_setup() {
    let cluster = Cluster::new();
    let engine = Arc::new(cluster.engine(NODE_A_IP, Arc::new(ScriptedMounter::default())));
    let watcher = ResourceWatcher::new(cluster.registry.store(), engine);

    cluster.memory.set_offline(true);
    let err = watcher
        .watch("ost", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FailoverError::Registry(RegistryError::Watch(_))));
}
