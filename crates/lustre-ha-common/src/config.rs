//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_revoke_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_mount_attempts() -> u32 {
    3
}

fn default_mount_program() -> PathBuf {
    PathBuf::from("mount")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_to_file() -> bool {
    true
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the failover daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub lustre: LustreConfig,
    pub controller: ControllerConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "LUSTRE_HA_CONFIG";

    /// Load configuration from disk, respecting the `LUSTRE_HA_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse a single file; `.yaml`/`.yml` are read as YAML, everything else as TOML.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let config = if is_yaml {
            Self::from_yaml_str(&contents)
        } else {
            contents.parse::<AppConfig>()
        };
        config.with_context(|| format!("failed to load config file {}", path.display()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(content).with_context(|| "failed to parse YAML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Controller prefixes this node watches under `/resources/`.
    pub fn watched_controllers(&self) -> Vec<String> {
        if self.controller.watch.is_empty() {
            vec![self.controller.name.clone()]
        } else {
            self.controller.watch.clone()
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.server
            .ip
            .parse::<IpAddr>()
            .map_err(|err| anyhow!("server.ip '{}' is not an IP address: {}", self.server.ip, err))?;
        self.etcd.validate()?;
        if self.controller.name.trim().is_empty() {
            return Err(anyhow!("controller.name must not be empty"));
        }
        if self.controller.watch.iter().any(|name| name.trim().is_empty()) {
            return Err(anyhow!("controller.watch entries must not be empty"));
        }
        if self.failover.mount_attempts == 0 {
            return Err(anyhow!("failover.mount_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity of this node; `ip` is compared against node addresses in resource documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub ip: String,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_dial_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dial_timeout: Duration,
    /// TTL of the registry lease and of every mount lock session.
    #[serde(default = "default_lease_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub lease_ttl: Duration,
    /// Upper bound on mount lock acquisition. Unset waits until the lock frees up.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub lock_timeout: Option<Duration>,
    #[serde(default = "default_revoke_settle")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub revoke_settle: Duration,
}

impl EtcdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(anyhow!("etcd.endpoints must list at least one endpoint"));
        }
        if self.lease_ttl.as_secs() == 0 {
            return Err(anyhow!("etcd.lease_ttl must be at least one second"));
        }
        Ok(())
    }

    /// Lease TTL in whole seconds, as the coordination store expects it.
    pub fn lease_ttl_secs(&self) -> i64 {
        i64::try_from(self.lease_ttl.as_secs()).unwrap_or(i64::MAX)
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_owned()],
            dial_timeout: default_dial_timeout(),
            lease_ttl: default_lease_ttl(),
            lock_timeout: None,
            revoke_settle: default_revoke_settle(),
        }
    }
}

/// Filesystem layout published to the store as `lustre_basis_config`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LustreConfig {
    #[serde(default)]
    pub mkfsoptions: String,
    #[serde(default)]
    pub backfstype: String,
    #[serde(default)]
    pub mgs: String,
    #[serde(default)]
    pub mdt: String,
    #[serde(default)]
    pub common: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub name: String,
    #[serde(default)]
    pub node: ControllerNodes,
    /// Controller prefixes to watch; defaults to `name` alone.
    #[serde(default)]
    pub watch: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerNodes {
    #[serde(rename = "A", default)]
    pub a: String,
    #[serde(rename = "B", default)]
    pub b: String,
}

/// Which node wins primary arbitration when both priorities are equal.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TieBreak {
    A,
    #[default]
    B,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default)]
    pub tie_break: TieBreak,
    #[serde(default = "default_mount_attempts")]
    pub mount_attempts: u32,
    #[serde(default = "default_mount_program")]
    pub mount_program: PathBuf,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::default(),
            mount_attempts: default_mount_attempts(),
            mount_program: default_mount_program(),
        }
    }
}

/// Resources for which this daemon publishes its own lease-bound liveness marker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LivenessConfig {
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Keep the rolling JSON file next to stdout; off for journald-only hosts.
    #[serde(default = "default_log_to_file")]
    pub to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            to_file: default_log_to_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [server]
        ip = "10.0.0.1"

        [etcd]
        endpoints = ["http://10.0.0.10:2379"]

        [controller]
        name = "ctl1"
    "#;

    #[test]
    fn minimal_toml_fills_defaults() {
        let config: AppConfig = MINIMAL.parse().unwrap();
        assert_eq!(config.etcd.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.etcd.lease_ttl_secs(), 10);
        assert_eq!(config.etcd.lock_timeout, None);
        assert_eq!(config.failover.mount_attempts, 3);
        assert_eq!(config.failover.tie_break, TieBreak::B);
        assert_eq!(config.watched_controllers(), vec!["ctl1".to_owned()]);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn rejects_non_ip_server_address() {
        let broken = MINIMAL.replace("ip = \"10.0.0.1\"", "ip = \"node-a\"");
        let err = broken.parse::<AppConfig>().unwrap_err();
        assert!(format!("{err:#}").contains("server.ip"));
    }

    #[test]
    fn rejects_zero_mount_attempts() {
        let broken = format!("{MINIMAL}\n[failover]\nmount_attempts = 0\n");
        assert!(broken.parse::<AppConfig>().is_err());
    }

    #[test]
    fn explicit_watch_list_replaces_controller_name() {
        let config: AppConfig = MINIMAL
            .replace("name = \"ctl1\"", "name = \"ctl1\"\nwatch = [\"ost\", \"mdt\"]")
            .parse()
            .unwrap();
        assert_eq!(config.watched_controllers(), vec!["ost", "mdt"]);
    }
}
