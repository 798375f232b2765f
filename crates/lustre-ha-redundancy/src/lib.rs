//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Failover decision engine and lock-guarded mount orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Failover decision engine for two-node Lustre targets.
//!
//! Every controller watches the same resource documents and only acts when
//! it is the node a document addresses; the mount lock is the one strict
//! exclusion boundary between nodes.

mod engine;
mod error;
mod health;
mod mount;
mod resource;
mod supervisor;
mod watcher;

pub use engine::{Decision, DecisionOutcome, FailoverEngine, SwitchAttempt};
pub use error::{FailoverError, Result};
pub use health::{liveness_key, HealthChecker};
pub use mount::{lock_name, DryRunMounter, MountLock, Mounter, SystemMounter};
pub use resource::{
    resource_key, resource_prefix, Node, NodeSlot, NodeStatus, Resource, ResourceStatus,
    StatusParseError,
};
pub use supervisor::{FailoverSupervisor, SupervisorHandle, BASIS_CONFIG_KEY};
pub use watcher::ResourceWatcher;
