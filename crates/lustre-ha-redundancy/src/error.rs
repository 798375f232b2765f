//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Failover decision engine and lock-guarded mount orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use lustre_ha_registry::RegistryError;

pub type Result<T> = std::result::Result<T, FailoverError>;

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The mount command could not be spawned or exited unsuccessfully.
    #[error("mount {device} on {mount_point} failed: {reason}")]
    Mount {
        device: String,
        mount_point: String,
        reason: String,
    },
    #[error("gave up waiting for lock {name} after {waited:?}")]
    LockTimeout { name: String, waited: Duration },
    #[error("malformed resource document at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode resource {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FailoverError {
    pub fn is_mount(&self) -> bool {
        matches!(self, FailoverError::Mount { .. })
    }
}
