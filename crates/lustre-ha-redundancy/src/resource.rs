//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Failover decision engine and lock-guarded mount orchestration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use lustre_ha_common::TieBreak;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::{FailoverError, Result};

const RESOURCE_NAMESPACE: &str = "/resources/";

/// Key prefix watched for one controller's resources.
pub fn resource_prefix(controller: &str) -> String {
    format!("{RESOURCE_NAMESPACE}{controller}")
}

pub fn resource_key(name: &str) -> String {
    format!("{RESOURCE_NAMESPACE}{name}")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value:?}")]
pub struct StatusParseError {
    kind: &'static str,
    value: String,
}

/// Node state as recorded in a resource document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, SerializeDisplay, DeserializeFromStr)]
pub enum NodeStatus {
    /// Not yet evaluated; written as the empty string.
    #[default]
    Unknown,
    Healthy,
    Unreachable,
    Failed,
    Running,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "",
            NodeStatus::Healthy => "Healthy",
            NodeStatus::Unreachable => "Unreachable",
            NodeStatus::Failed => "Failed",
            NodeStatus::Running => "running",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" => Ok(NodeStatus::Unknown),
            "Healthy" => Ok(NodeStatus::Healthy),
            "Unreachable" => Ok(NodeStatus::Unreachable),
            "Failed" => Ok(NodeStatus::Failed),
            "running" => Ok(NodeStatus::Running),
            other => Err(StatusParseError {
                kind: "node",
                value: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, SerializeDisplay, DeserializeFromStr)]
pub enum ResourceStatus {
    Mounted,
    #[default]
    Unmounted,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Mounted => "mounted",
            ResourceStatus::Unmounted => "unmounted",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mounted" => Ok(ResourceStatus::Mounted),
            // older writers spell it "umounted"
            "unmounted" | "umounted" | "" => Ok(ResourceStatus::Unmounted),
            other => Err(StatusParseError {
                kind: "resource",
                value: other.to_owned(),
            }),
        }
    }
}

/// Which of the two candidate slots of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeSlot {
    A,
    B,
}

impl NodeSlot {
    pub fn other(self) -> Self {
        match self {
            NodeSlot::A => NodeSlot::B,
            NodeSlot::B => NodeSlot::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeSlot::A => "A",
            NodeSlot::B => "B",
        }
    }
}

impl fmt::Display for NodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TieBreak> for NodeSlot {
    fn from(value: TieBreak) -> Self {
        match value {
            TieBreak::A => NodeSlot::A,
            TieBreak::B => NodeSlot::B,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub status: NodeStatus,
}

/// Failover domain document stored under `/resources/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "A")]
    pub a: Node,
    #[serde(rename = "B")]
    pub b: Node,
    /// Device handed to the mount command.
    #[serde(default)]
    pub res_name: String,
    #[serde(default)]
    pub mount_point: String,
    #[serde(default)]
    pub current_node: String,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl Resource {
    pub fn key(&self) -> String {
        resource_key(&self.name)
    }

    pub fn node(&self, slot: NodeSlot) -> &Node {
        match slot {
            NodeSlot::A => &self.a,
            NodeSlot::B => &self.b,
        }
    }

    pub fn node_mut(&mut self, slot: NodeSlot) -> &mut Node {
        match slot {
            NodeSlot::A => &mut self.a,
            NodeSlot::B => &mut self.b,
        }
    }

    /// Slot with the strictly greater priority, `tie_break` when equal.
    pub fn primary_slot(&self, tie_break: NodeSlot) -> NodeSlot {
        match self.a.priority.cmp(&self.b.priority) {
            std::cmp::Ordering::Greater => NodeSlot::A,
            std::cmp::Ordering::Less => NodeSlot::B,
            std::cmp::Ordering::Equal => tie_break,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.status == ResourceStatus::Mounted
    }

    pub fn from_json(key: &str, raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|source| FailoverError::Decode {
            key: key.to_owned(),
            source,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| FailoverError::Encode {
            name: self.name.clone(),
            source,
        })
    }
}
