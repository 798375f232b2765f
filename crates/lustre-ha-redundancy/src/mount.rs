//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Failover decision engine and lock-guarded mount orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Cluster-wide serialization of mount calls.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lustre_ha_registry::{CoordinationStore, LockSession};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{FailoverError, Result};

/// Lock guarding mounts of `device` within the `prefix` failover domain.
pub fn lock_name(prefix: &str, device: &str) -> String {
    format!("{prefix}/{device}/mount_initing")
}

/// Performs the actual mount once the lock is held.
#[async_trait]
pub trait Mounter: Send + Sync + 'static {
    async fn mount(&self, device: &str, mount_point: &str) -> Result<()>;
}

/// Runs `<program> <device> <mount_point>` and logs its combined output.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    program: PathBuf,
}

impl SystemMounter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SystemMounter {
    fn default() -> Self {
        Self::new("mount")
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(&self, device: &str, mount_point: &str) -> Result<()> {
        let output = Command::new(&self.program)
            .arg(device)
            .arg(mount_point)
            .output()
            .await
            .map_err(|err| FailoverError::Mount {
                device: device.to_owned(),
                mount_point: mount_point.to_owned(),
                reason: format!("unable to run {}: {err}", self.program.display()),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim();

        if output.status.success() {
            info!(device, mount_point, output = combined, "mount succeeded");
            Ok(())
        } else {
            warn!(device, mount_point, status = %output.status, output = combined, "mount failed");
            Err(FailoverError::Mount {
                device: device.to_owned(),
                mount_point: mount_point.to_owned(),
                reason: format!("{}: {combined}", output.status),
            })
        }
    }
}

/// Logs the mount it would perform and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunMounter;

#[async_trait]
impl Mounter for DryRunMounter {
    async fn mount(&self, device: &str, mount_point: &str) -> Result<()> {
        info!(device, mount_point, "dry run: mount skipped");
        Ok(())
    }
}

/// Lock-guarded mount. Each call opens its own lease session, so a crashed
/// holder releases the lock once the session TTL runs out.
#[derive(Clone)]
pub struct MountLock {
    store: Arc<dyn CoordinationStore>,
    mounter: Arc<dyn Mounter>,
    session_ttl: i64,
    acquire_timeout: Option<Duration>,
}

impl std::fmt::Debug for MountLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountLock")
            .field("backend", &self.store.backend())
            .field("session_ttl", &self.session_ttl)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl MountLock {
    pub fn new(store: Arc<dyn CoordinationStore>, mounter: Arc<dyn Mounter>, session_ttl: i64) -> Self {
        Self {
            store,
            mounter,
            session_ttl,
            acquire_timeout: None,
        }
    }

    /// Bound lock acquisition; `None` waits until the lock frees up.
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub async fn mount(&self, device: &str, mount_point: &str, lock_prefix: &str) -> Result<()> {
        let session = LockSession::open(Arc::clone(&self.store), self.session_ttl).await?;
        let name = lock_name(lock_prefix, device);
        let result = self.mount_locked(&session, &name, device, mount_point).await;
        if let Err(err) = session.close().await {
            warn!(lock = %name, error = %err, "lock session not closed; lock lapses with its ttl");
        }
        result
    }

    async fn mount_locked(
        &self,
        session: &LockSession,
        name: &str,
        device: &str,
        mount_point: &str,
    ) -> Result<()> {
        let key = match self.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, session.lock(name))
                .await
                .map_err(|_| FailoverError::LockTimeout {
                    name: name.to_owned(),
                    waited: limit,
                })??,
            None => session.lock(name).await?,
        };
        debug!(lock = %key, device, "mount lock acquired");

        let mounted = self.mounter.mount(device, mount_point).await;

        if let Err(err) = session.unlock(&key).await {
            warn!(lock = %key, error = %err, "mount lock release failed");
        }
        mounted
    }
}
