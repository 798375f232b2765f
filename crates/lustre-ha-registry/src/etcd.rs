//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Coordination store access, leases and service registration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, LockOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::store::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, Lease, LeaseId, LockKey, WatchEvent,
    WatchStream,
};

const CHANNEL_DEPTH: usize = 64;

/// [`CoordinationStore`] backed by an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connect to the cluster, giving up after `dial_timeout`.
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = tokio::time::timeout(dial_timeout, Client::connect(endpoints, Some(options)))
            .await
            .map_err(|_| {
                RegistryError::Connection(format!(
                    "timed out after {:?} dialing {}",
                    dial_timeout,
                    endpoints.join(",")
                ))
            })?
            .map_err(|err| RegistryError::Connection(err.to_string()))?;
        info!(endpoints = %endpoints.join(","), "connected to etcd");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    fn backend(&self) -> &'static str {
        "etcd"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let response = client
            .get(key, None)
            .await
            .map_err(|err| RegistryError::StoreRead {
                key: key.to_owned(),
                reason: err.to_string(),
            })?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client
            .put(key, value, options)
            .await
            .map_err(|err| RegistryError::StoreWrite {
                key: key.to_owned(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn grant_lease(&self, ttl: i64) -> Result<Lease> {
        let mut client = self.client.clone();
        let response = client
            .lease_grant(ttl, None)
            .await
            .map_err(|err| RegistryError::Lease(format!("grant failed: {err}")))?;
        Ok(Lease {
            id: response.id(),
            ttl: response.ttl(),
        })
    }

    async fn keep_alive(&self, lease: Lease, cancel: CancellationToken) -> Result<KeepAliveStream> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease.id)
            .await
            .map_err(|err| RegistryError::Lease(format!("keepalive failed: {err}")))?;
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let period = lease.keepalive_period();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(lease = lease.id, "keepalive cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = keeper.keep_alive().await {
                            warn!(lease = lease.id, error = %err, "keepalive request failed");
                            break;
                        }
                        match responses.message().await {
                            Ok(Some(response)) if response.ttl() > 0 => {
                                let renewal = KeepAliveResponse {
                                    lease: response.id(),
                                    ttl: response.ttl(),
                                };
                                if tx.send(renewal).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Some(_)) => {
                                warn!(lease = lease.id, "lease expired before renewal");
                                break;
                            }
                            Ok(None) => break,
                            Err(err) => {
                                warn!(lease = lease.id, error = %err, "keepalive stream failed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease)
            .await
            .map_err(|err| RegistryError::Lease(format!("revoke failed: {err}")))?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|err| RegistryError::Watch(err.to_string()))?;
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let prefix = prefix.to_owned();

        tokio::spawn(async move {
            // the watch is cancelled server-side once the watcher is dropped
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.message() => match message {
                        Ok(Some(response)) => {
                            if response.canceled() {
                                let _ = tx
                                    .send(Err(RegistryError::Watch(format!("watch on {prefix} cancelled by server"))))
                                    .await;
                                break;
                            }
                            for event in response.events() {
                                let Some(kv) = event.kv() else {
                                    continue;
                                };
                                let key = String::from_utf8_lossy(kv.key()).into_owned();
                                let item = match event.event_type() {
                                    EventType::Put => WatchEvent::Put {
                                        key,
                                        value: kv.value().to_vec(),
                                    },
                                    EventType::Delete => WatchEvent::Delete { key },
                                };
                                if tx.send(Ok(item)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = tx.send(Err(RegistryError::Watch(err.to_string()))).await;
                            break;
                        }
                    }
                }
            }
            debug!(prefix = %prefix, "watch stream finished");
        });

        Ok(rx)
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey> {
        let mut client = self.client.clone();
        let response = client
            .lock(name, Some(LockOptions::new().with_lease(lease)))
            .await
            .map_err(|err| RegistryError::Lock {
                name: name.to_owned(),
                reason: err.to_string(),
            })?;
        Ok(LockKey(response.key().to_vec()))
    }

    async fn unlock(&self, key: &LockKey) -> Result<()> {
        let mut client = self.client.clone();
        client
            .unlock(key.0.clone())
            .await
            .map_err(|err| RegistryError::Lock {
                name: key.to_string(),
                reason: format!("unlock failed: {err}"),
            })?;
        Ok(())
    }
}
