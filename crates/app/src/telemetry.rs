use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use license_sync_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Every metric the service exports, with its help text.
const METRIC_CATALOG: &[(&str, MetricKind, &str)] = &[
    (
        "app_build_info",
        MetricKind::Gauge,
        "Build metadata for the running binary",
    ),
    (
        "app_uptime_seconds",
        MetricKind::Gauge,
        "Seconds since the process started",
    ),
    (
        "webhook_events_total",
        MetricKind::Counter,
        "Verified billing webhook deliveries, labelled by classified kind",
    ),
    (
        "webhook_rejected_total",
        MetricKind::Counter,
        "Billing webhook deliveries rejected before completion, labelled by reason",
    ),
    (
        ACK_LATENCY_METRIC,
        MetricKind::Histogram,
        "Seconds taken to answer a billing webhook delivery, labelled by kind",
    ),
    (
        "entitlement_grants_total",
        MetricKind::Counter,
        "Entitlement writes, labelled by reconciliation path",
    ),
    (
        "payment_ledger_writes_total",
        MetricKind::Counter,
        "Payment ledger appends, labelled by result",
    ),
    (
        "checkout_sessions_total",
        MetricKind::Counter,
        "Checkout session requests, labelled by result",
    ),
];

const ACK_LATENCY_METRIC: &str = "webhook_ack_latency_seconds";
const ACK_LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
const SERVICE_NAME: &str = "license-sync";

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static START_TIME: OnceLock<Instant> = OnceLock::new();

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: pretty output outside production, JSON lines in production.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());

    match config.environment {
        Environment::Production => registry.with(layer.json()).try_init()?,
        Environment::Development | Environment::Test => registry
            .with(layer.event_format(tracing_fmt::format().pretty()))
            .try_init()?,
    }

    TRACING_INIT.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        service = SERVICE_NAME,
        env = %config.environment.as_str(),
        version = BUILD_VERSION,
        git_sha = build_git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder once per process and returns its handle.
///
/// Later calls return the same handle, so tests can build many app states.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut slot = METRICS_HANDLE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(ACK_LATENCY_METRIC.to_string()),
            ACK_LATENCY_BUCKETS,
        )?
        .install_recorder()?;
    *slot = Some(handle.clone());
    drop(slot);

    for &(name, kind, help) in METRIC_CATALOG {
        match kind {
            MetricKind::Counter => describe_counter!(name, help),
            MetricKind::Gauge => describe_gauge!(name, help),
            MetricKind::Histogram => describe_histogram!(name, help),
        }
    }
    START_TIME.get_or_init(Instant::now);

    Ok(handle)
}

/// Renders recorder output followed by the process-level gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();

    // Writing into a String cannot fail.
    let _ = writeln!(body, "# TYPE app_build_info gauge");
    let _ = writeln!(
        body,
        "app_build_info{{service=\"{SERVICE_NAME}\",version=\"{BUILD_VERSION}\",git=\"{}\"}} 1",
        build_git_sha()
    );
    let _ = writeln!(body, "# TYPE app_uptime_seconds gauge");
    let _ = writeln!(body, "app_uptime_seconds {uptime}");

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_names_are_unique() {
        let names: HashSet<_> = METRIC_CATALOG.iter().map(|(name, _, _)| *name).collect();
        assert_eq!(names.len(), METRIC_CATALOG.len());
    }

    #[test]
    fn init_metrics_is_idempotent() {
        let first = init_metrics().expect("first install");
        let second = init_metrics().expect("second install");
        ::metrics::counter!("checkout_sessions_total", "result" => "ok").increment(1);
        assert!(first.render().contains("checkout_sessions_total"));
        assert!(second.render().contains("checkout_sessions_total"));
    }

    #[test]
    fn rendered_output_ends_with_process_gauges() {
        let handle = init_metrics().expect("metrics");
        let body = render_metrics(&handle);

        assert!(body.contains(&format!(
            "app_build_info{{service=\"{SERVICE_NAME}\",version=\"{BUILD_VERSION}\""
        )));
        let last = body.lines().last().expect("non-empty output");
        assert!(last.starts_with("app_uptime_seconds "));
    }
}
