use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global tracing subscriber. Returns the appender guard; drop it
/// only at process exit or buffered log lines are lost.
pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Most log lines come out of the library crates (feed client, session
    // store, channel manager), not the binary, so the fallback filter is a
    // plain info floor rather than per-target pins. RUST_LOG overrides.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The writer must never park a session loop or the feed supervisor
    // behind a slow stdout; tick-path logging goes through the non-blocking
    // appender.
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init();

    tracing::info!(service = service_name, "tracing initialized");
    Some(guard)
}

/// Install the Prometheus recorder once; later calls return the same handle.
pub fn init_metrics() -> PrometheusHandle {
    if let Some(handle) = PROM_HANDLE.get() {
        return handle.clone();
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install prometheus recorder");

    describe_metrics();
    let _ = PROM_HANDLE.set(handle.clone());
    handle
}

fn describe_metrics() {
    describe_counter!("feed.frames_received", "Raw frames read off the upstream socket");
    describe_counter!("feed.ticks_decoded", "Binary frames decoded into ticks");
    describe_counter!("feed.decode_errors", "Frames dropped due to decode failures");
    describe_gauge!("feed.connection_generation", "Upstream auth generation counter");
    describe_gauge!("sessions.active", "Sessions resident in the registry");
    describe_gauge!("channels.active", "Bound downstream channels");
    describe_counter!("channels.slow_consumer_closes", "Channels closed for send-queue overflow");
    describe_counter!("store.flush_failures", "Snapshot flushes that failed and will retry");
}
