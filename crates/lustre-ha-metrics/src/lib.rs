//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to resolve metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            buffer,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "lustre_had_starts_total",
            "Total number of times the failover daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "lustre_had_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

/// Lease and store-access metrics reported by the service registry.
#[derive(Clone)]
pub struct RegistryMetrics {
    lease_renewals: IntCounter,
    lease_closed: IntCounter,
    store_errors: IntCounterVec,
}

impl RegistryMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let lease_renewals = IntCounter::with_opts(Opts::new(
            "lustre_ha_lease_renewals_total",
            "Keepalive responses received for the registry lease",
        ))?;
        registry.register(Box::new(lease_renewals.clone()))?;

        let lease_closed = IntCounter::with_opts(Opts::new(
            "lustre_ha_lease_closed_total",
            "Times the registry lease keepalive stream closed",
        ))?;
        registry.register(Box::new(lease_closed.clone()))?;

        let store_errors = IntCounterVec::new(
            Opts::new(
                "lustre_ha_store_errors_total",
                "Coordination store operations that returned an error",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(store_errors.clone()))?;

        Ok(Self {
            lease_renewals,
            lease_closed,
            store_errors,
        })
    }

    pub fn record_renewal(&self) {
        self.lease_renewals.inc();
    }

    pub fn record_lease_closed(&self) {
        self.lease_closed.inc();
    }

    pub fn record_store_error(&self, operation: &str) {
        self.store_errors.with_label_values(&[operation]).inc();
    }
}

/// Decision engine and mount metrics.
#[derive(Clone)]
pub struct FailoverMetrics {
    decisions: IntCounterVec,
    mount_attempts: IntCounterVec,
    mount_seconds: HistogramVec,
    watch_events: IntCounterVec,
}

impl FailoverMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let decisions = IntCounterVec::new(
            Opts::new(
                "lustre_ha_decisions_total",
                "Resource documents evaluated by the decision engine, by outcome",
            ),
            &["resource", "outcome"],
        )?;
        registry.register(Box::new(decisions.clone()))?;

        let mount_attempts = IntCounterVec::new(
            Opts::new(
                "lustre_ha_mount_attempts_total",
                "Locked mount invocations by resource, target node and result",
            ),
            &["resource", "node", "result"],
        )?;
        registry.register(Box::new(mount_attempts.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "lustre_ha_mount_seconds",
            "Wall time of a locked mount including lock acquisition",
        )
        .buckets(prometheus::exponential_buckets(0.01, 2.0, 14)?);
        let mount_seconds = HistogramVec::new(histogram_opts, &["resource"])?;
        registry.register(Box::new(mount_seconds.clone()))?;

        let watch_events = IntCounterVec::new(
            Opts::new(
                "lustre_ha_watch_events_total",
                "Resource watch events by controller prefix and kind",
            ),
            &["controller", "kind"],
        )?;
        registry.register(Box::new(watch_events.clone()))?;

        Ok(Self {
            decisions,
            mount_attempts,
            mount_seconds,
            watch_events,
        })
    }

    pub fn record_decision(&self, resource: &str, outcome: &str) {
        self.decisions.with_label_values(&[resource, outcome]).inc();
    }

    pub fn record_mount_attempt(&self, resource: &str, node: &str, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "failure" };
        self.mount_attempts
            .with_label_values(&[resource, node, result])
            .inc();
        self.mount_seconds
            .with_label_values(&[resource])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_watch_event(&self, controller: &str, kind: &str) {
        self.watch_events.with_label_values(&[controller, kind]).inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(registry: &SharedRegistry, name: &str, labels: &[(&str, &str)]) -> f64 {
        registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().iter())
            .filter(|metric| {
                labels.iter().all(|(key, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|label| label.get_name() == *key && label.get_value() == *value)
                })
            })
            .map(|metric| metric.get_counter().get_value())
            .sum()
    }

    #[test]
    fn failover_metrics_label_mount_results() {
        let registry = new_registry();
        let metrics = FailoverMetrics::new(registry.clone()).unwrap();
        metrics.record_mount_attempt("ost1", "A", false, Duration::from_millis(5));
        metrics.record_mount_attempt("ost1", "A", true, Duration::from_millis(5));
        metrics.record_decision("ost1", "persisted");

        assert_eq!(
            counter_value(
                &registry,
                "lustre_ha_mount_attempts_total",
                &[("resource", "ost1"), ("result", "failure")]
            ),
            1.0
        );
        assert_eq!(
            counter_value(&registry, "lustre_ha_decisions_total", &[("outcome", "persisted")]),
            1.0
        );
    }

    #[test]
    fn families_cannot_register_twice() {
        let registry = new_registry();
        RegistryMetrics::new(registry.clone()).unwrap();
        assert!(RegistryMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn handler_serves_text_exposition() {
        let registry = new_registry();
        DaemonMetrics::new(registry.clone()).unwrap().inc_start();

        let response = metrics_handler(registry).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            TEXT_FORMAT
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("lustre_had_starts_total 1"), "{text}");
    }

    #[tokio::test]
    async fn exporter_binds_ephemeral_port_and_shuts_down() {
        let registry = new_registry();
        DaemonMetrics::new(registry.clone()).unwrap().inc_start();
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.unwrap();
    }
}
