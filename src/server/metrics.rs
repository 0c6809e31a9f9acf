//! In-process request counters for `/api/stats`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Tracks HTTP requests and open push channels.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    /// Total number of API requests and push channels served
    total_requests: Arc<AtomicU64>,

    /// Number of currently open WebSocket push channels
    active_streams: Arc<AtomicU32>,

    /// Maximum number of concurrent push channels observed
    max_concurrent_streams: Arc<AtomicU32>,

    /// Push channels refused because the limit was reached
    rejected_streams: Arc<AtomicU64>,

    /// Requests answered with an error payload
    errors: Arc<AtomicU64>,

    /// Server start time
    start_time: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            total_requests: Arc::new(AtomicU64::new(0)),
            active_streams: Arc::new(AtomicU32::new(0)),
            max_concurrent_streams: Arc::new(AtomicU32::new(0)),
            rejected_streams: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stream(&self) {
        let active = self.active_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.max_concurrent_streams.fetch_max(active, Ordering::SeqCst);
    }

    pub fn decrement_stream(&self) {
        self.active_streams.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_rejection(&self) {
        self.rejected_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_streams(&self) -> u32 {
        self.active_streams.load(Ordering::SeqCst)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "active_streams": self.active_streams(),
            "max_concurrent_streams": self.max_concurrent_streams.load(Ordering::SeqCst),
            "rejected_streams": self.rejected_streams.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
        })
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_high_water_mark() {
        let metrics = ServiceMetrics::new();
        metrics.increment_stream();
        metrics.increment_stream();
        metrics.decrement_stream();

        let json = metrics.to_json();
        assert_eq!(json["active_streams"], 1);
        assert_eq!(json["max_concurrent_streams"], 2);
        assert_eq!(json["total_requests"], 2);
    }
}
