//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Coordination store access, leases and service registration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---

/// Result alias used throughout the registry crate.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Error type for coordination store access.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The store could not be reached within the dial timeout.
    #[error("unable to reach coordination store: {0}")]
    Connection(String),
    /// Lease grant, keepalive or revoke failed, or no lease is active.
    #[error("lease error: {0}")]
    Lease(String),
    #[error("failed to write key {key}: {reason}")]
    StoreWrite { key: String, reason: String },
    #[error("failed to read key {key}: {reason}")]
    StoreRead { key: String, reason: String },
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("lock {name} failed: {reason}")]
    Lock { name: String, reason: String },
    #[error("watch failed: {0}")]
    Watch(String),
    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode value at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    /// Short label used for metrics tagging.
    pub fn operation(&self) -> &'static str {
        match self {
            RegistryError::Connection(_) => "connect",
            RegistryError::Lease(_) => "lease",
            RegistryError::StoreWrite { .. } => "put",
            RegistryError::StoreRead { .. } | RegistryError::NotFound(_) => "get",
            RegistryError::Lock { .. } => "lock",
            RegistryError::Watch(_) => "watch",
            RegistryError::Encode { .. } => "encode",
            RegistryError::Decode { .. } => "decode",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_key() {
        let err = RegistryError::StoreWrite {
            key: "/resources/ost1".into(),
            reason: "etcdserver: request timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to write key /resources/ost1: etcdserver: request timed out"
        );
        assert_eq!(err.operation(), "put");
        assert!(RegistryError::NotFound("/x".into()).is_not_found());
    }
}
