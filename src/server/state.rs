//! Application state for dependency injection.
//!
//! This module provides the application state that is shared
//! between all request handlers.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{AppError, Result};
use crate::gateway::Gateway;
use crate::server::metrics::ServiceMetrics;

/// Shared application state containing dependencies.
#[derive(Clone)]
pub struct AppState {
    /// The backend gateway
    pub gateway: Arc<Gateway>,

    /// Request counters for `/api/stats`
    pub metrics: Arc<ServiceMetrics>,

    /// Limits concurrently open push channels
    pub stream_semaphore: Arc<Semaphore>,

    /// Prometheus renderer, when the recorder is installed
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Arguments
    /// * `gateway` - The gateway shared by every handler
    /// * `max_concurrent_streams` - Maximum number of open push channels
    pub fn new(gateway: Arc<Gateway>, max_concurrent_streams: usize) -> Self {
        Self {
            gateway,
            metrics: Arc::new(ServiceMetrics::new()),
            stream_semaphore: Arc::new(Semaphore::new(max_concurrent_streams)),
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Reserve a push channel slot, or fail with `CapacityExceeded`.
    pub fn acquire_stream_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.stream_semaphore.clone().try_acquire_owned().map_err(|_| {
            self.metrics.record_rejection();
            AppError::CapacityExceeded("too many open push channels".to_string())
        })
    }
}
