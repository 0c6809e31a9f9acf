//! WebSocket push channels.
//!
//! A push channel forwards one relay subscription, or one install session
//! observer, to one socket. A client close or failed send cancels the relay
//! right away so the backend stream doesn't outlive its only consumer.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::select;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::types::BuildProgress;
use crate::gateway::{ObservedEvent, RelayEvent, SessionObserver, Subscription};
use crate::server::events::{PushEvent, PushKind};
use crate::server::metrics::ServiceMetrics;

/// One open push channel over socket `S`.
pub struct PushChannel<S = WebSocket> {
    id: String,
    ws: S,
    metrics: Arc<ServiceMetrics>,
    _permit: OwnedSemaphorePermit,
}

/// Why the pump loop stopped.
enum Exit {
    /// Terminal event delivered.
    Finished,
    /// Client closed the socket or a send failed.
    ClientGone,
}

/// True if the client is gone. Other inbound frames are ignored.
fn client_gone(message: Option<Result<Message, axum::Error>>) -> bool {
    matches!(message, None | Some(Err(_)) | Some(Ok(Message::Close(_))))
}

impl<S> PushChannel<S>
where
    S: Sink<Message, Error = axum::Error> + Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    pub fn new(ws: S, metrics: Arc<ServiceMetrics>, permit: OwnedSemaphorePermit) -> Self {
        metrics.increment_stream();
        Self {
            id: Uuid::new_v4().to_string(),
            ws,
            metrics,
            _permit: permit,
        }
    }

    async fn send(&mut self, event: &PushEvent) -> bool {
        let message = match event.to_message() {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %self.id, "Failed to encode push event: {}", e);
                return true;
            }
        };
        match self.ws.send(message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(channel = %self.id, "Push send failed: {}", e);
                false
            }
        }
    }

    /// Forward a relay subscription until it ends, fails or the client leaves.
    pub async fn relay<T: Serialize>(mut self, mut subscription: Subscription<T>, kind: PushKind, label: String) {
        info!(channel = %self.id, stream = subscription.name(), "Push channel opened for {}", label);

        let exit = if self.send(&PushEvent::connected(format!("streaming {}", label))).await {
            self.pump_relay(&mut subscription, kind).await
        } else {
            Exit::ClientGone
        };

        if let Exit::ClientGone = exit {
            debug!(channel = %self.id, "Client left, canceling relay");
        }
        subscription.shutdown().await;
        self.close().await;
    }

    async fn pump_relay<T: Serialize>(&mut self, subscription: &mut Subscription<T>, kind: PushKind) -> Exit {
        loop {
            select! {
                event = subscription.next() => {
                    let push = match event {
                        Some(RelayEvent::Item(item)) => match PushEvent::item(kind, &item) {
                            Ok(push) => push,
                            Err(e) => {
                                warn!(channel = %self.id, "Dropping undecodable item: {}", e);
                                continue;
                            }
                        },
                        Some(RelayEvent::End) => PushEvent::end("stream ended"),
                        Some(RelayEvent::Error(e)) => {
                            self.metrics.record_error();
                            PushEvent::error(&e)
                        }
                        // Canceled from elsewhere, e.g. shutdown.
                        None => {
                            if !self.send(&PushEvent::end("stream canceled")).await {
                                debug!(channel = %self.id, "Client gone before cancel notice");
                            }
                            return Exit::Finished;
                        }
                    };

                    let terminal = push.is_terminal();
                    if !self.send(&push).await {
                        subscription.cancel();
                        return Exit::ClientGone;
                    }
                    if terminal {
                        return Exit::Finished;
                    }
                }
                message = self.ws.next() => {
                    if client_gone(message) {
                        subscription.cancel();
                        return Exit::ClientGone;
                    }
                }
            }
        }
    }

    /// Follow an install session. The install keeps running if the client
    /// leaves; only this observer goes away.
    pub async fn observe_install(mut self, mut observer: SessionObserver<BuildProgress>) {
        let session = observer.session_id().to_string();
        info!(channel = %self.id, session = %session, "Install observer attached");

        if !self
            .send(&PushEvent::connected(format!("observing install session {}", session)))
            .await
        {
            self.close().await;
            return;
        }
        if observer.position() > 0
            && !self
                .send(&PushEvent::info(format!(
                    "skipping {} events already delivered",
                    observer.position()
                )))
                .await
        {
            self.close().await;
            return;
        }

        loop {
            select! {
                event = observer.next() => {
                    let push = match event {
                        Some(ObservedEvent::Progress(progress)) => {
                            match PushEvent::item(PushKind::Progress, &progress) {
                                Ok(push) => push,
                                Err(e) => {
                                    warn!(channel = %self.id, "Dropping undecodable progress: {}", e);
                                    continue;
                                }
                            }
                        }
                        Some(ObservedEvent::Completed) => PushEvent::end("install completed"),
                        Some(ObservedEvent::Failed(reason)) => {
                            self.metrics.record_error();
                            PushEvent::failed(reason)
                        }
                        None => break,
                    };

                    let terminal = push.is_terminal();
                    if !self.send(&push).await || terminal {
                        break;
                    }
                }
                message = self.ws.next() => {
                    if client_gone(message) {
                        debug!(channel = %self.id, session = %session, "Install observer left");
                        break;
                    }
                }
            }
        }

        self.close().await;
    }

    async fn close(mut self) {
        if let Err(e) = self.ws.send(Message::Close(None)).await {
            debug!(channel = %self.id, "Close frame not sent: {}", e);
        }
        self.metrics.decrement_stream();
        debug!(channel = %self.id, "Push channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::gateway::relay::tests::Tracked;
    use crate::gateway::{attach, InstallSessionTracker};
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use futures::stream::{self, BoxStream};
    use std::pin::Pin;
    use std::sync::atomic::Ordering;
    use std::task::{Context, Poll};
    use tokio::sync::Semaphore;

    /// In-memory socket: what the channel sends lands in `outbound`, client
    /// frames are fed through `inbound`.
    struct MemorySocket {
        outbound: UnboundedSender<Message>,
        inbound: UnboundedReceiver<Result<Message, axum::Error>>,
    }

    struct Client {
        received: UnboundedReceiver<Message>,
        frames: UnboundedSender<Result<Message, axum::Error>>,
    }

    fn socket() -> (MemorySocket, Client) {
        let (outbound, received) = unbounded();
        let (frames, inbound) = unbounded();
        (MemorySocket { outbound, inbound }, Client { received, frames })
    }

    impl Sink<Message> for MemorySocket {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.outbound.unbounded_send(item).map_err(axum::Error::new)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    impl Stream for MemorySocket {
        type Item = Result<Message, axum::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inbound.poll_next_unpin(cx)
        }
    }

    async fn permit() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).acquire_owned().await.unwrap()
    }

    fn event_type(message: &Message) -> String {
        match message {
            Message::Text(text) => {
                let json: serde_json::Value = serde_json::from_str(text).unwrap();
                json["type"].as_str().unwrap().to_string()
            }
            Message::Close(_) => "close".to_string(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_close_cancels_backend_stream() {
        let endless: BoxStream<'static, crate::error::Result<&'static str>> =
            stream::iter(vec![Ok("line one")]).chain(stream::pending()).boxed();
        let (tracked, dropped) = Tracked::new(endless);
        let subscription = attach("logs", move || async move { Ok(tracked) }, 1);

        let (ws, mut client) = socket();
        let metrics = Arc::new(ServiceMetrics::new());
        let channel = PushChannel::new(ws, metrics.clone(), permit().await);
        let task = tokio::spawn(channel.relay(subscription, PushKind::Log, "logs for job 1".into()));

        assert_eq!(event_type(&client.received.next().await.unwrap()), "connected");
        assert_eq!(event_type(&client.received.next().await.unwrap()), "log");
        assert_eq!(metrics.active_streams(), 1);
        assert!(!dropped.load(Ordering::SeqCst));

        client.frames.unbounded_send(Ok(Message::Close(None))).unwrap();
        task.await.unwrap();

        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(metrics.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_cancels_backend_stream() {
        let endless: BoxStream<'static, crate::error::Result<u32>> =
            stream::iter(vec![Ok(1), Ok(2)]).chain(stream::pending()).boxed();
        let (tracked, dropped) = Tracked::new(endless);
        let subscription = attach("metrics", move || async move { Ok(tracked) }, 1);

        let (ws, client) = socket();
        drop(client.received);
        let channel = PushChannel::new(ws, Arc::new(ServiceMetrics::new()), permit().await);
        channel
            .relay(subscription, PushKind::Metrics, "metrics for job 1".into())
            .await;

        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stream_end_is_forwarded_then_closed() {
        let subscription = attach(
            "system",
            || async { Ok(stream::iter(vec![Ok::<_, AppError>(7u32)])) },
            1,
        );

        let (ws, client) = socket();
        let channel = PushChannel::new(ws, Arc::new(ServiceMetrics::new()), permit().await);
        channel
            .relay(subscription, PushKind::Metrics, "system metrics".into())
            .await;

        let types: Vec<String> = client.received.map(|m| event_type(&m)).collect().await;
        assert_eq!(types, vec!["connected", "metrics", "end", "close"]);
    }

    fn step(step: i32) -> BuildProgress {
        BuildProgress {
            phase: "build".into(),
            message: format!("step {}", step),
            step,
            total_steps: 2,
            log_line: None,
        }
    }

    #[tokio::test]
    async fn test_observer_skips_events_already_delivered() {
        let tracker = InstallSessionTracker::new(std::time::Duration::from_secs(60));
        let id = tracker.start_session();
        tracker
            .run_in_background(&id, || async {
                Ok(stream::iter(vec![Ok::<_, AppError>(step(1)), Ok(step(2))]))
            })
            .unwrap();
        let initial = tracker
            .collect_initial(&id, std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(initial.events.len(), 2);

        let observer = tracker.observe_from(&id, initial.events.len()).unwrap();
        let (ws, client) = socket();
        PushChannel::new(ws, Arc::new(ServiceMetrics::new()), permit().await)
            .observe_install(observer)
            .await;

        let types: Vec<String> = client.received.map(|m| event_type(&m)).collect().await;
        assert_eq!(types, vec!["connected", "info", "end", "close"]);
    }
}
