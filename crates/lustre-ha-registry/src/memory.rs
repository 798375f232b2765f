//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Coordination store access, leases and service registration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! In-process [`CoordinationStore`] with etcd-like lease, watch and lock semantics.
//!
//! Lease expiry is evaluated lazily on every call and by running keepalive
//! tasks, so a lease nobody renews disappears at the first access after its
//! deadline. [`MemoryStore::expire_lease`] forces the transition for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::store::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, Lease, LeaseId, LockKey, WatchEvent,
    WatchStream,
};

const EVENT_BACKLOG: usize = 1024;
const LOCK_POLL: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseRecord {
    ttl: i64,
    deadline: Instant,
}

#[derive(Debug)]
struct HeldLock {
    name: String,
    lease: LeaseId,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseRecord>,
    locks: HashMap<LockKey, HeldLock>,
    next_lease: LeaseId,
}

#[derive(Debug)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<WatchEvent>,
    unlocked: Notify,
    offline: AtomicBool,
}

/// Shared, cloneable in-memory store. Clones observe the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState {
                    next_lease: 0x1000,
                    ..MemoryState::default()
                }),
                events,
                unlocked: Notify::new(),
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// Make every subsequent call fail as if the store were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Expire a lease immediately, deleting its keys and releasing its locks.
    pub fn expire_lease(&self, lease: LeaseId) {
        let mut state = self.inner.state.lock();
        self.drop_lease_locked(&mut state, lease);
    }

    pub fn lease_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.purge_expired_locked(&mut state);
        state.leases.len()
    }

    /// Whether the named lock is currently held.
    pub fn is_locked(&self, name: &str) -> bool {
        let mut state = self.inner.state.lock();
        self.purge_expired_locked(&mut state);
        state.locks.values().any(|held| held.name == name)
    }

    /// Delete a key, emitting a delete event when it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        let existed = state.entries.remove(key).is_some();
        if existed {
            let _ = self.inner.events.send(WatchEvent::Delete {
                key: key.to_owned(),
            });
        }
        existed
    }

    fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    fn purge_expired_locked(&self, state: &mut MemoryState) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, record)| record.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(lease, "memory store lease expired");
            self.drop_lease_locked(state, lease);
        }
    }

    fn drop_lease_locked(&self, state: &mut MemoryState, lease: LeaseId) {
        state.leases.remove(&lease);
        let doomed: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            state.entries.remove(&key);
            let _ = self.inner.events.send(WatchEvent::Delete { key });
        }
        let before = state.locks.len();
        state.locks.retain(|_, held| held.lease != lease);
        if state.locks.len() != before {
            self.inner.unlocked.notify_waiters();
        }
    }

    fn renew(&self, lease: LeaseId) -> Option<KeepAliveResponse> {
        let mut state = self.inner.state.lock();
        self.purge_expired_locked(&mut state);
        let record = state.leases.get_mut(&lease)?;
        record.deadline = Instant::now() + ttl_duration(record.ttl);
        Some(KeepAliveResponse {
            lease,
            ttl: record.ttl,
        })
    }

    fn try_acquire(&self, name: &str, lease: LeaseId) -> Result<Option<LockKey>> {
        let mut state = self.inner.state.lock();
        self.purge_expired_locked(&mut state);
        if !state.leases.contains_key(&lease) {
            return Err(RegistryError::Lock {
                name: name.to_owned(),
                reason: format!("lease {lease:x} not found"),
            });
        }
        if state.locks.values().any(|held| held.name == name) {
            return Ok(None);
        }
        let key = LockKey(format!("{name}/{lease:x}").into_bytes());
        state.locks.insert(
            key.clone(),
            HeldLock {
                name: name.to_owned(),
                lease,
            },
        );
        Ok(Some(key))
    }
}

fn ttl_duration(ttl: i64) -> Duration {
    Duration::from_secs(ttl.max(1) as u64)
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.is_offline() {
            return Err(RegistryError::StoreRead {
                key: key.to_owned(),
                reason: "store offline".into(),
            });
        }
        let mut state = self.inner.state.lock();
        self.purge_expired_locked(&mut state);
        Ok(state.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        if self.is_offline() {
            return Err(RegistryError::StoreWrite {
                key: key.to_owned(),
                reason: "store offline".into(),
            });
        }
        let mut state = self.inner.state.lock();
        self.purge_expired_locked(&mut state);
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(RegistryError::StoreWrite {
                    key: key.to_owned(),
                    reason: format!("requested lease {id:x} not found"),
                });
            }
        }
        state.entries.insert(
            key.to_owned(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        let _ = self.inner.events.send(WatchEvent::Put {
            key: key.to_owned(),
            value,
        });
        Ok(())
    }

    async fn grant_lease(&self, ttl: i64) -> Result<Lease> {
        if self.is_offline() {
            return Err(RegistryError::Lease("grant failed: store offline".into()));
        }
        let mut state = self.inner.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl_duration(ttl),
            },
        );
        Ok(Lease { id, ttl })
    }

    async fn keep_alive(&self, lease: Lease, cancel: CancellationToken) -> Result<KeepAliveStream> {
        if self.is_offline() {
            return Err(RegistryError::Lease("keepalive failed: store offline".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        let store = self.clone();
        let period = ttl_duration(lease.ttl) / 3;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if store.is_offline() {
                            warn!(lease = lease.id, "keepalive failed: store offline");
                            break;
                        }
                        let Some(renewal) = store.renew(lease.id) else {
                            debug!(lease = lease.id, "lease gone; keepalive stops");
                            break;
                        };
                        if tx.send(renewal).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        if self.is_offline() {
            return Err(RegistryError::Lease("revoke failed: store offline".into()));
        }
        let mut state = self.inner.state.lock();
        if !state.leases.contains_key(&lease) {
            return Err(RegistryError::Lease(format!(
                "revoke failed: lease {lease:x} not found"
            )));
        }
        self.drop_lease_locked(&mut state, lease);
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        if self.is_offline() {
            return Err(RegistryError::Watch("store offline".into()));
        }
        let mut events = self.inner.events.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_BACKLOG);
        let prefix = prefix.to_owned();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            if !event.key().starts_with(&prefix) {
                                continue;
                            }
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let _ = tx
                                .send(Err(RegistryError::Watch(format!(
                                    "watcher on {prefix} lagged by {skipped} events"
                                ))))
                                .await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey> {
        loop {
            if self.is_offline() {
                return Err(RegistryError::Lock {
                    name: name.to_owned(),
                    reason: "store offline".into(),
                });
            }
            let notified = self.inner.unlocked.notified();
            if let Some(key) = self.try_acquire(name, lease)? {
                return Ok(key);
            }
            // the poll also catches holders whose lease lapsed without anyone touching the store
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(LOCK_POLL) => {}
            }
        }
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        if self.is_offline() {
            return Err(RegistryError::Lock {
                name: key.to_string(),
                reason: "unlock failed: store offline".into(),
            });
        }
        let mut state = self.inner.state.lock();
        state.locks.remove(key);
        self.inner.unlocked.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_lease_removes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(5).await.unwrap();
        store
            .put("/controller/ost1/10.0.0.1", b"up".to_vec(), Some(lease.id))
            .await
            .unwrap();
        store.put("/plain", b"stays".to_vec(), None).await.unwrap();

        store.expire_lease(lease.id);

        assert_eq!(store.get("/controller/ost1/10.0.0.1").await.unwrap(), None);
        assert_eq!(store.get("/plain").await.unwrap(), Some(b"stays".to_vec()));
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn put_with_unknown_lease_is_rejected() {
        let store = MemoryStore::new();
        let err = store.put("/k", b"v".to_vec(), Some(42)).await.unwrap_err();
        assert!(matches!(err, RegistryError::StoreWrite { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unrenewed_lease_lapses_after_ttl() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(2).await.unwrap();
        store.put("/k", b"v".to_vec(), Some(lease.id)).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("/k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn watch_filters_by_prefix() {
        let store = MemoryStore::new();
        let mut stream = store.watch_prefix("/resources/ctl").await.unwrap();
        store.put("/other/x", b"1".to_vec(), None).await.unwrap();
        store.put("/resources/ctl-ost1", b"2".to_vec(), None).await.unwrap();
        store.delete("/resources/ctl-ost1");

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(
            first,
            WatchEvent::Put {
                key: "/resources/ctl-ost1".into(),
                value: b"2".to_vec()
            }
        );
        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(
            second,
            WatchEvent::Delete {
                key: "/resources/ctl-ost1".into()
            }
        );
    }

    #[tokio::test]
    async fn lock_released_when_holder_lease_expires() {
        let store = MemoryStore::new();
        let holder = store.grant_lease(30).await.unwrap();
        let waiter = store.grant_lease(30).await.unwrap();
        store.lock("ost1/dev/mount_initing", holder.id).await.unwrap();

        let contender = store.clone();
        let pending = tokio::spawn(async move {
            contender
                .lock("ost1/dev/mount_initing", waiter.id)
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        store.expire_lease(holder.id);
        let key = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(key.to_string().starts_with("ost1/dev/mount_initing/"));
    }
}
