use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::burrow::net;

/// Registers every metric burrow emits so a scrape shows them before the
/// first event.
pub fn describe() {
    metrics::describe_gauge!("burrow_comms_active", "Comms currently registered");
    metrics::describe_gauge!("burrow_routes_active", "Routes currently active");
    metrics::describe_gauge!("burrow_forwarders_active", "Port forwarders currently open");
    metrics::describe_counter!("burrow_channels_total", "Channels accepted, by transport");
    metrics::describe_counter!(
        "burrow_channels_rejected_total",
        "Channels rejected before any data flowed"
    );

    metrics::gauge!("burrow_comms_active").set(0.0);
    metrics::gauge!("burrow_routes_active").set(0.0);
    metrics::gauge!("burrow_forwarders_active").set(0.0);
}

/// Installs the Prometheus recorder and its scrape endpoint on
/// `metrics_addr`. Must run inside the tokio runtime, once per process.
/// An empty address leaves metrics unrecorded.
pub fn init_prometheus(metrics_addr: &str) -> anyhow::Result<Option<SocketAddr>> {
    if metrics_addr.trim().is_empty() {
        return Ok(None);
    }
    let addr: SocketAddr = net::normalize_bind_addr(metrics_addr.trim())
        .parse()
        .with_context(|| format!("invalid metrics_addr: {}", metrics_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("metrics: install Prometheus exporter")?;
    describe();
    Ok(Some(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn described_metrics_render_before_any_event() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, describe);

        let out = handle.render();
        assert!(out.contains("burrow_comms_active 0"), "got: {out}");
        assert!(out.contains("# HELP burrow_routes_active"), "got: {out}");
    }

    #[test]
    fn empty_address_disables_the_exporter() {
        assert_eq!(init_prometheus("  ").unwrap(), None);
        assert!(init_prometheus("not-an-addr").is_err());
    }
}
