//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the lustre-ha workspace.
//! This crate exposes configuration loading and logging bootstrap consumed
//! by the registry, redundancy and daemon crates.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, ControllerConfig, ControllerNodes, EtcdConfig, FailoverConfig, LivenessConfig,
    LoadedAppConfig, LoggingConfig, LustreConfig, MetricsConfig, ServerConfig, TieBreak,
};
pub use logging::{init_tracing, LogFormat};
