//! Prometheus metrics collection and export.
//!
//! The gateway records through the `metrics` facade; this module installs the
//! Prometheus recorder and registers descriptions for every series.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Installed Prometheus recorder.
pub struct GatewayMetrics {
    prometheus_handle: PrometheusHandle,
}

impl GatewayMetrics {
    /// Install the global recorder. Fails if one is already installed.
    pub fn install() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
        Self::register_metrics();
        info!("Metrics collection initialized");
        Ok(Self { prometheus_handle })
    }

    fn register_metrics() {
        // Unary calls
        describe_counter!(
            "gateway_rpc_calls_total",
            "Unary backend calls by method and final outcome"
        );
        describe_counter!(
            "gateway_rpc_retries_total",
            "Unary call attempts repeated after a connectivity failure"
        );
        describe_histogram!(
            "gateway_rpc_duration_seconds",
            Unit::Seconds,
            "Duration of one unary call attempt"
        );

        // Connection cache
        describe_counter!(
            "gateway_channels_created_total",
            "Backend channels built by the connection cache"
        );
        describe_counter!(
            "gateway_channels_evicted_total",
            "Backend channels dropped from the connection cache"
        );

        // Stream relays
        describe_gauge!("gateway_relays_active", "Backend streams currently relayed");
        describe_counter!(
            "gateway_relay_terminations_total",
            "Finished relays by stream and terminal state"
        );

        // Install sessions
        describe_counter!(
            "gateway_install_sessions_started_total",
            "Install sessions created"
        );
        describe_counter!(
            "gateway_install_sessions_finished_total",
            "Install sessions whose backend stream finished, by outcome"
        );
        describe_counter!(
            "gateway_install_sessions_collected_total",
            "Install sessions discarded after their grace period"
        );
        describe_gauge!(
            "gateway_install_sessions_live",
            "Install sessions currently observable"
        );
    }

    pub fn handle(&self) -> PrometheusHandle {
        self.prometheus_handle.clone()
    }
}
