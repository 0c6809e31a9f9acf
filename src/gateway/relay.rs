//! Stream relay: one backend server-stream feeding one downstream consumer.
//!
//! A pump task owns the backend stream and forwards items through a
//! single-slot channel, so a slow consumer applies backpressure to the
//! backend instead of piling items up in memory. The consumer side is a
//! [`Subscription`], itself a `Stream` of [`RelayEvent`]s ending with
//! exactly one terminal event, or with nothing at all when canceled.
//!
//! Cancelling (explicitly, or by dropping the subscription) stops delivery
//! immediately and makes the pump drop the backend stream, which resets the
//! HTTP/2 stream and cancels the call on the backend.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RelayState {
    Idle = 0,
    Streaming = 1,
    Ended = 2,
    Errored = 3,
    Canceled = 4,
}

impl RelayState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RelayState::Idle,
            1 => RelayState::Streaming,
            2 => RelayState::Ended,
            3 => RelayState::Errored,
            _ => RelayState::Canceled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayState::Ended | RelayState::Errored | RelayState::Canceled
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            RelayState::Idle => "idle",
            RelayState::Streaming => "streaming",
            RelayState::Ended => "ended",
            RelayState::Errored => "errored",
            RelayState::Canceled => "canceled",
        }
    }
}

/// Shared state cell. Terminal states are sticky.
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(RelayState::Idle as u8))
    }

    fn get(&self) -> RelayState {
        RelayState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: RelayState, to: RelayState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to Canceled from any non-terminal state.
    fn cancel(&self) -> bool {
        self.transition(RelayState::Streaming, RelayState::Canceled)
            || self.transition(RelayState::Idle, RelayState::Canceled)
    }
}

/// What a subscriber receives.
#[derive(Debug)]
pub enum RelayEvent<T> {
    Item(T),
    /// The backend closed the stream normally.
    End,
    /// The backend stream failed; nothing follows.
    Error(AppError),
}

impl<T> RelayEvent<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayEvent::Item(_))
    }
}

/// Start relaying the stream produced by `open`.
///
/// `open` runs inside the pump task; an error opening the stream is delivered
/// as the terminal [`RelayEvent::Error`]. `buffer` is clamped to at least 1.
pub fn attach<T, F, Fut, S>(name: &'static str, open: F, buffer: usize) -> Subscription<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<S>> + Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let state = Arc::new(StateCell::new());
    let token = CancellationToken::new();

    let task = tokio::spawn(pump(id, name, open, tx, state.clone(), token.clone()));

    Subscription {
        id,
        name,
        rx,
        state,
        token,
        task: Some(task),
        canceled: AtomicBool::new(false),
        finished: false,
    }
}

async fn pump<T, F, Fut, S>(
    id: u64,
    name: &'static str,
    open: F,
    tx: mpsc::Sender<RelayEvent<T>>,
    state: Arc<StateCell>,
    token: CancellationToken,
) where
    T: Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<S>>,
    S: Stream<Item = Result<T>>,
{
    if !state.transition(RelayState::Idle, RelayState::Streaming) {
        return;
    }
    gauge!("gateway_relays_active").increment(1.0);
    debug!(subscription = id, stream = name, "Relay started");

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        opened = open() => Some(opened),
    };

    let mut forwarded = 0u64;
    match outcome {
        None => {}
        Some(Err(e)) => {
            if state.transition(RelayState::Streaming, RelayState::Errored) {
                warn!(subscription = id, stream = name, "Failed to open stream: {}", e);
                deliver(&tx, &token, RelayEvent::Error(e)).await;
            }
        }
        Some(Ok(stream)) => {
            let mut stream = Box::pin(stream);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(item)) => {
                        if !deliver(&tx, &token, RelayEvent::Item(item)).await {
                            // Consumer went away without cancelling.
                            state.cancel();
                            break;
                        }
                        forwarded += 1;
                    }
                    Some(Err(e)) => {
                        if state.transition(RelayState::Streaming, RelayState::Errored) {
                            warn!(subscription = id, stream = name, "Stream failed: {}", e);
                            deliver(&tx, &token, RelayEvent::Error(e)).await;
                        }
                        break;
                    }
                    None => {
                        if state.transition(RelayState::Streaming, RelayState::Ended) {
                            deliver(&tx, &token, RelayEvent::End).await;
                        }
                        break;
                    }
                }
            }
            // Dropping the stream here is what cancels the backend call.
            drop(stream);
        }
    }

    let final_state = state.get();
    gauge!("gateway_relays_active").decrement(1.0);
    counter!("gateway_relay_terminations_total", "stream" => name, "outcome" => final_state.as_str())
        .increment(1);
    debug!(
        subscription = id,
        stream = name,
        forwarded,
        state = final_state.as_str(),
        "Relay finished"
    );
}

/// Send unless the subscription is canceled first. Returns false if the event
/// was not delivered.
async fn deliver<T>(
    tx: &mpsc::Sender<RelayEvent<T>>,
    token: &CancellationToken,
    event: RelayEvent<T>,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Consumer end of a relay.
pub struct Subscription<T> {
    id: u64,
    name: &'static str,
    rx: mpsc::Receiver<RelayEvent<T>>,
    state: Arc<StateCell>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Set by the consumer. The pump may already be terminal with events
    /// still buffered, so this, not the pump state, gates delivery.
    canceled: AtomicBool,
    /// The terminal event has been handed out.
    finished: bool,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// State as seen by the consumer: a relay whose terminal event is still
    /// buffered is reported as streaming.
    pub fn state(&self) -> RelayState {
        if self.canceled.load(Ordering::Acquire) {
            return RelayState::Canceled;
        }
        match self.state.get() {
            RelayState::Ended | RelayState::Errored if !self.finished => RelayState::Streaming,
            state => state,
        }
    }

    /// Stop delivery now and cancel the backend stream.
    ///
    /// Items already buffered are discarded. No-op once the terminal event
    /// has been received.
    pub fn cancel(&self) {
        if !self.finished && !self.canceled.swap(true, Ordering::AcqRel) {
            self.state.cancel();
            debug!(subscription = self.id, stream = self.name, "Relay canceled");
        }
        self.token.cancel();
    }

    /// Cancel and wait until the backend stream has been released.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(subscription = self.id, "Relay task failed: {}", e);
            }
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = RelayEvent<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished || self.canceled.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::stream::{self, BoxStream};
    use tonic::Status;

    /// Stream wrapper that records when it is dropped.
    pub(crate) struct Tracked<I> {
        inner: BoxStream<'static, I>,
        dropped: Arc<AtomicBool>,
    }

    impl<I> Tracked<I> {
        pub(crate) fn new(inner: BoxStream<'static, I>) -> (Self, Arc<AtomicBool>) {
            let dropped = Arc::new(AtomicBool::new(false));
            (
                Self {
                    inner,
                    dropped: dropped.clone(),
                },
                dropped,
            )
        }
    }

    impl<I> Stream for Tracked<I> {
        type Item = I;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inner.poll_next_unpin(cx)
        }
    }

    impl<I> Drop for Tracked<I> {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn items(values: &[&'static str]) -> BoxStream<'static, Result<&'static str>> {
        stream::iter(values.iter().copied().map(Ok).collect::<Vec<_>>()).boxed()
    }

    #[tokio::test]
    async fn test_items_in_order_then_end() {
        let (tracked, dropped) = Tracked::new(items(&["a", "b", "c"]));
        let mut sub = attach("logs", move || async move { Ok(tracked) }, 1);

        let mut seen = Vec::new();
        let mut ended = false;
        while let Some(event) = sub.next().await {
            match event {
                RelayEvent::Item(item) => {
                    assert!(!ended);
                    seen.push(item);
                }
                RelayEvent::End => ended = true,
                RelayEvent::Error(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(ended);
        assert_eq!(sub.state(), RelayState::Ended);
        sub.shutdown().await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_error_is_terminal() {
        let failing = items(&["a"])
            .chain(stream::once(async {
                Err(AppError::from_status(Status::internal("collector crashed")))
            }))
            .chain(items(&["never"]))
            .boxed();
        let mut sub = attach("telemetry", move || async move { Ok(failing) }, 1);

        assert!(matches!(sub.next().await, Some(RelayEvent::Item("a"))));
        match sub.next().await {
            Some(RelayEvent::Error(e)) => assert_eq!(e.status().unwrap().message(), "collector crashed"),
            other => panic!("expected error, got {:?}", other.map(|e| e.is_terminal())),
        }
        assert!(sub.next().await.is_none());
        assert_eq!(sub.state(), RelayState::Errored);
    }

    #[tokio::test]
    async fn test_open_failure() {
        let mut sub = attach(
            "metrics",
            || async {
                Err::<BoxStream<'static, Result<u32>>, _>(AppError::from_status(Status::not_found(
                    "job 9",
                )))
            },
            1,
        );

        match sub.next().await {
            Some(RelayEvent::Error(e)) => assert_eq!(e.kind(), "backend_rejection"),
            _ => panic!("expected open error"),
        }
        assert!(sub.next().await.is_none());
        assert_eq!(sub.state(), RelayState::Errored);
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery_and_drops_backend_stream() {
        let endless = items(&["a", "b"]).chain(stream::pending()).boxed();
        let (tracked, dropped) = Tracked::new(endless);
        let mut sub = attach("logs", move || async move { Ok(tracked) }, 1);

        assert!(matches!(sub.next().await, Some(RelayEvent::Item("a"))));
        sub.cancel();
        assert_eq!(sub.state(), RelayState::Canceled);
        // "b" may already sit in the buffer; it must not come out.
        assert!(sub.next().await.is_none());

        sub.shutdown().await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_after_backend_finished_discards_buffered_events() {
        let (tracked, dropped) = Tracked::new(items(&["a", "b"]));
        let mut sub = attach("logs", move || async move { Ok(tracked) }, 1);

        assert!(matches!(sub.next().await, Some(RelayEvent::Item("a"))));
        // Let the pump run to the end: "b" then End wait in the buffer.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sub.state(), RelayState::Streaming);

        sub.cancel();
        assert_eq!(sub.state(), RelayState::Canceled);
        assert!(sub.next().await.is_none());

        sub.shutdown().await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_cancels_backend_stream() {
        let (tracked, dropped) = Tracked::new(stream::pending().boxed());
        let sub: Subscription<u32> = attach("system", move || async move { Ok(tracked) }, 1);
        tokio::task::yield_now().await;
        drop(sub);

        for _ in 0..10 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let mut sub = attach("logs", || async { Ok(items(&[])) }, 1);
        assert!(matches!(sub.next().await, Some(RelayEvent::End)));
        sub.cancel();
        assert_eq!(sub.state(), RelayState::Ended);
    }
}
