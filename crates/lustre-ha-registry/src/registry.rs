//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Coordination store access, leases and service registration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use lustre_ha_metrics::RegistryMetrics;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::etcd::EtcdStore;
use crate::store::{CoordinationStore, KeepAliveStream, Lease, LeaseId};

const DEFAULT_REVOKE_SETTLE: Duration = Duration::from_secs(2);

/// The active lease together with its renewal stream.
#[derive(Debug)]
pub struct LeaseHandle {
    pub lease: Lease,
    pub renewals: KeepAliveStream,
}

#[derive(Debug)]
struct ActiveLease {
    lease: Lease,
    cancel: CancellationToken,
}

/// Process-wide registration against the coordination store.
///
/// Owns at most one lease. Keys written with [`ServiceRegistry::put_leased`]
/// are bound to it and disappear when the process stops renewing.
pub struct ServiceRegistry {
    store: Arc<dyn CoordinationStore>,
    active: Mutex<Option<ActiveLease>>,
    revoke_settle: Duration,
    metrics: Option<RegistryMetrics>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("backend", &self.store.backend())
            .field("lease", &self.lease_id())
            .field("revoke_settle", &self.revoke_settle)
            .finish()
    }
}

impl ServiceRegistry {
    /// Connect to etcd and wrap the client.
    pub async fn register(endpoints: &[String], dial_timeout: Duration) -> Result<Self> {
        let store = EtcdStore::connect(endpoints, dial_timeout).await?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            active: Mutex::new(None),
            revoke_settle: DEFAULT_REVOKE_SETTLE,
            metrics: None,
        }
    }

    pub fn with_revoke_settle(mut self, settle: Duration) -> Self {
        self.revoke_settle = settle;
        self
    }

    pub fn with_metrics(mut self, metrics: RegistryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&self.store)
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        self.active.lock().as_ref().map(|active| active.lease.id)
    }

    /// Grant the process lease and start keeping it alive.
    pub async fn lease(&self, ttl: i64) -> Result<LeaseHandle> {
        if let Some(id) = self.lease_id() {
            return Err(RegistryError::Lease(format!("lease {id:x} already active")));
        }
        let lease = self.store.grant_lease(ttl).await.map_err(|err| self.track(err))?;
        let cancel = CancellationToken::new();
        let renewals = match self.store.keep_alive(lease, cancel.clone()).await {
            Ok(renewals) => renewals,
            Err(err) => {
                let _ = self.store.revoke_lease(lease.id).await;
                return Err(self.track(err));
            }
        };
        info!(
            backend = self.store.backend(),
            lease = lease.id,
            ttl = lease.ttl,
            "registry lease granted"
        );
        *self.active.lock() = Some(ActiveLease { lease, cancel });
        Ok(LeaseHandle { lease, renewals })
    }

    /// Drain renewals until the keepalive stream closes.
    pub async fn listen_lease(&self, mut handle: LeaseHandle) {
        while let Some(renewal) = handle.renewals.recv().await {
            debug!(lease = renewal.lease, ttl = renewal.ttl, "lease renewed");
            if let Some(metrics) = &self.metrics {
                metrics.record_renewal();
            }
        }
        warn!(lease = handle.lease.id, "lease keepalive closed");
        if let Some(metrics) = &self.metrics {
            metrics.record_lease_closed();
        }
    }

    /// Write `value` bound to the process lease.
    pub async fn put_leased(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        let Some(lease) = self.lease_id() else {
            return Err(self.track(RegistryError::Lease(format!(
                "no active lease for leased put of {key}"
            ))));
        };
        self.store
            .put(key, value.into(), Some(lease))
            .await
            .map_err(|err| self.track(err))
    }

    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.store
            .put(key, value.into(), None)
            .await
            .map_err(|err| self.track(err))
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self.store.get(key).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(RegistryError::NotFound(key.to_owned())),
            Err(err) => Err(self.track(err)),
        }
    }

    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value).map_err(|source| RegistryError::Encode {
            key: key.to_owned(),
            source,
        })?;
        self.put(key, encoded).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self.get(key).await?;
        serde_json::from_slice(&raw).map_err(|source| RegistryError::Decode {
            key: key.to_owned(),
            source,
        })
    }

    /// Stop renewing and revoke the lease. Calling it without a lease is a no-op.
    pub async fn revoke(&self) -> Result<()> {
        let taken = self.active.lock().take();
        let Some(active) = taken else {
            return Ok(());
        };
        active.cancel.cancel();
        tokio::time::sleep(self.revoke_settle).await;
        self.store
            .revoke_lease(active.lease.id)
            .await
            .map_err(|err| self.track(err))?;
        info!(lease = active.lease.id, "registry lease revoked");
        Ok(())
    }

    fn track(&self, err: RegistryError) -> RegistryError {
        warn!(
            backend = self.store.backend(),
            operation = err.operation(),
            error = %err,
            "coordination store call failed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_store_error(err.operation());
        }
        err
    }
}
