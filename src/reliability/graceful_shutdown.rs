//! Process shutdown.
//!
//! SIGINT or SIGTERM is broadcast to every subscriber. The HTTP server stops
//! accepting connections on the first signal, and [`GracefulShutdown::drain`]
//! bounds how long open connections may hold the process after that.

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct GracefulShutdown {
    tx: broadcast::Sender<()>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn trigger(&self) {
        info!("Shutdown requested");
        if self.tx.send(()).is_err() {
            debug!("Shutdown requested with no subscribers");
        }
    }

    /// Spawn a task that triggers shutdown on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) {
        let this = self.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = terminate => info!("Received SIGTERM"),
            }
            this.trigger();
        });
    }

    /// Resolves once shutdown is triggered. Subscribes immediately, so a
    /// trigger between this call and the first poll is not missed.
    pub fn signal(&self, component: &'static str) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            // Closed or lagged both mean shutdown is under way.
            let _ = rx.recv().await;
            debug!(component, "Shutdown signal received");
        }
    }

    /// Drive `work` to completion, but give up `grace` after shutdown is
    /// triggered. Returns `None` if `work` was cut off.
    pub async fn drain<F: Future>(&self, work: F, grace: Duration) -> Option<F::Output> {
        let signal = self.signal("drain");
        tokio::pin!(work);

        tokio::select! {
            output = &mut work => return Some(output),
            _ = signal => {}
        }

        match tokio::time::timeout(grace, work).await {
            Ok(output) => Some(output),
            Err(_) => {
                warn!("Connections still open {:?} after shutdown, closing them", grace);
                None
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_signal_resolves_for_every_subscriber() {
        let shutdown = GracefulShutdown::new();
        let server = tokio::spawn(shutdown.signal("http"));
        let relays = tokio::spawn(shutdown.signal("relays"));

        shutdown.trigger();

        assert!(timeout(Duration::from_millis(100), server).await.is_ok());
        assert!(timeout(Duration::from_millis(100), relays).await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_returns_output_of_finished_work() {
        let shutdown = GracefulShutdown::new();
        let output = shutdown.drain(async { 7 }, Duration::from_secs(1)).await;
        assert_eq!(output, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_cuts_off_work_after_grace() {
        let shutdown = GracefulShutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        let output = shutdown
            .drain(std::future::pending::<()>(), Duration::from_secs(5))
            .await;
        assert_eq!(output, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_lets_work_finish_within_grace() {
        let shutdown = GracefulShutdown::new();
        let signal = shutdown.signal("http");
        let work = async move {
            signal.await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            "drained"
        };

        let trigger = shutdown.clone();
        tokio::spawn(async move { trigger.trigger() });

        let output = shutdown.drain(work, Duration::from_secs(5)).await;
        assert_eq!(output, Some("drained"));
    }
}
