//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Coordination store access, leases and service registration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Short-lived lease sessions used to hold named locks.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{CoordinationStore, Lease, LockKey};

/// A lease kept alive for as long as the session is open. Locks taken through
/// it are released by the store if this process dies mid critical section.
pub struct LockSession {
    store: Arc<dyn CoordinationStore>,
    lease: Lease,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LockSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSession")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl LockSession {
    pub async fn open(store: Arc<dyn CoordinationStore>, ttl: i64) -> Result<Self> {
        let lease = store.grant_lease(ttl).await?;
        let cancel = CancellationToken::new();
        let mut renewals = match store.keep_alive(lease, cancel.clone()).await {
            Ok(renewals) => renewals,
            Err(err) => {
                let _ = store.revoke_lease(lease.id).await;
                return Err(err);
            }
        };
        tokio::spawn(async move {
            while renewals.recv().await.is_some() {}
            debug!(lease = lease.id, "lock session keepalive ended");
        });
        Ok(Self {
            store,
            lease,
            cancel,
        })
    }

    pub fn lease(&self) -> Lease {
        self.lease
    }

    pub async fn lock(&self, name: &str) -> Result<LockKey> {
        self.store.lock(name, self.lease.id).await
    }

    pub async fn unlock(&self, key: &LockKey) -> Result<()> {
        self.store.unlock(key).await
    }

    /// Stop the keepalive and revoke the session lease, releasing any lock still held.
    pub async fn close(self) -> Result<()> {
        self.cancel.cancel();
        let result = self.store.revoke_lease(self.lease.id).await;
        if let Err(err) = &result {
            warn!(lease = self.lease.id, error = %err, "failed to revoke lock session lease");
        }
        result
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn close_releases_held_lock() {
        let memory = MemoryStore::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(memory.clone());

        let session = LockSession::open(Arc::clone(&store), 10).await.unwrap();
        session.lock("ost1/sdb/mount_initing").await.unwrap();
        assert!(memory.is_locked("ost1/sdb/mount_initing"));

        session.close().await.unwrap();
        assert!(!memory.is_locked("ost1/sdb/mount_initing"));
        assert_eq!(memory.lease_count(), 0);
    }
}
