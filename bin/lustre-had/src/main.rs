//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the lustre-ha failover daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lustre_ha_common::{init_tracing, AppConfig};
use lustre_ha_metrics::{
    new_registry, spawn_http_server, DaemonMetrics, FailoverMetrics, RegistryMetrics,
};
use lustre_ha_redundancy::{
    liveness_key, resource_key, DryRunMounter, FailoverSupervisor, Mounter, NodeSlot, Resource,
    SystemMounter,
};
use lustre_ha_registry::{CoordinationStore, EtcdStore, MemoryStore, ServiceRegistry};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Two-node failover controller for Lustre targets",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Use an in-process store instead of etcd (implies --dry-run)")]
    in_memory: bool,

    #[arg(long, help = "Log mounts instead of running the mount program")]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the failover controller")]
    Run,
    #[command(about = "Write a resource document to the store")]
    Publish {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
    #[command(about = "Print a stored resource document and node liveness")]
    Show { resource: String },
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("config/lustre-ha.yaml"));
    candidates.push(PathBuf::from("config/lustre-ha.toml"));
    candidates.push(PathBuf::from("/etc/lustre-ha/config.yaml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            render_config_summary(&config, &loaded.source);
            Ok(())
        }
        Commands::Publish { file } => {
            let registry = connect_registry(&config, cli.in_memory).await?;
            publish_resource(&registry, &file).await
        }
        Commands::Show { resource } => {
            let registry = connect_registry(&config, cli.in_memory).await?;
            show_resource(&registry, &resource).await
        }
        Commands::Run => {
            init_tracing("lustre-had", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config, cli.in_memory, cli.dry_run, load_duration.as_secs_f64()).await
        }
    }
}

async fn connect_store(config: &AppConfig, in_memory: bool) -> Result<Arc<dyn CoordinationStore>> {
    if in_memory {
        warn!("using in-process store; state is lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = EtcdStore::connect(&config.etcd.endpoints, config.etcd.dial_timeout)
        .await
        .context("unable to connect to etcd")?;
    Ok(Arc::new(store))
}

async fn connect_registry(config: &AppConfig, in_memory: bool) -> Result<ServiceRegistry> {
    Ok(ServiceRegistry::new(connect_store(config, in_memory).await?))
}

async fn run_daemon(
    config: AppConfig,
    in_memory: bool,
    dry_run: bool,
    load_seconds: f64,
) -> Result<()> {
    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.observe_config_load(load_seconds);
    daemon_metrics.inc_start();

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(metrics_registry.clone(), config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mounter: Arc<dyn Mounter> = if in_memory || dry_run {
        Arc::new(DryRunMounter)
    } else {
        Arc::new(SystemMounter::new(config.failover.mount_program.clone()))
    };

    let store = connect_store(&config, in_memory).await?;
    let supervisor = FailoverSupervisor::new(config, store, mounter).with_metrics(
        RegistryMetrics::new(metrics_registry.clone())?,
        FailoverMetrics::new(metrics_registry)?,
    );
    let handle = supervisor.start().await?;

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn publish_resource(registry: &ServiceRegistry, file: &Path) -> Result<()> {
    let raw = std::fs::read(file)
        .with_context(|| format!("unable to read resource file {}", file.display()))?;
    let key = format!("file:{}", file.display());
    let resource = Resource::from_json(&key, &raw)?;
    registry.put(&resource.key(), resource.to_json()?).await?;
    println!("published {}", resource.key());
    Ok(())
}

async fn show_resource(registry: &ServiceRegistry, name: &str) -> Result<()> {
    let key = resource_key(name);
    let resource: Resource = registry
        .get_json(&key)
        .await
        .with_context(|| format!("unable to load {key}"))?;
    println!("{}", serde_json::to_string_pretty(&resource)?);
    for slot in [NodeSlot::A, NodeSlot::B] {
        let node = resource.node(slot);
        let alive = registry.get(&liveness_key(&resource.name, &node.ip)).await.is_ok();
        println!(
            "{slot}: {} {} priority={} status={} liveness={}",
            node.name,
            node.ip,
            node.priority,
            node.status,
            if alive { "present" } else { "absent" }
        );
    }
    Ok(())
}

fn render_config_summary(config: &AppConfig, source: &Path) {
    println!(
        "Config: {}\nNode IP: {}\nController: {}\nWatching: {}\nEtcd: {}\nLease TTL: {}s\nMount attempts: {}",
        source.display(),
        config.server.ip,
        config.controller.name,
        config.watched_controllers().join(", "),
        config.etcd.endpoints.join(", "),
        config.etcd.lease_ttl_secs(),
        config.failover.mount_attempts,
    );
}
