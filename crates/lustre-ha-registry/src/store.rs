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
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub type LeaseId = i64;

/// A granted lease; keys attached to it vanish once it lapses or is revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    /// Granted TTL in seconds.
    pub ttl: i64,
}

impl Lease {
    /// Interval between keepalive requests: a third of the TTL, never below one second.
    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs((self.ttl / 3).max(1) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub lease: LeaseId,
    /// Remaining TTL reported by the store after the renewal.
    pub ttl: i64,
}

/// Renewals for one lease. The channel closes once the lease expired, the
/// keepalive RPC failed or the cancel token fired.
pub type KeepAliveStream = mpsc::Receiver<KeepAliveResponse>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// Change events for a key prefix, in store order.
pub type WatchStream = mpsc::Receiver<Result<WatchEvent>>;

/// Ownership key returned by a successful lock; required to unlock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(pub Vec<u8>);

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Primitives the failover core needs from the external key-value store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Stable backend label used in logs.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`, optionally attached to `lease`.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;

    async fn grant_lease(&self, ttl: i64) -> Result<Lease>;

    /// Start renewing `lease` until `cancel` fires or the lease is lost.
    async fn keep_alive(&self, lease: Lease, cancel: CancellationToken) -> Result<KeepAliveStream>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    /// Block until the named lock is held on behalf of `lease`.
    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey>;

    async fn unlock(&self, key: &LockKey) -> Result<()>;
}
