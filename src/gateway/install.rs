//! Install session tracker.
//!
//! A runtime install is a long backend stream whose progress may be watched
//! by nobody, by the request that started it, or by several late-joining
//! observers. The tracker runs the stream in the background, appends every
//! event to the session's ordered log and wakes observers through a `watch`
//! version counter. Each observer keeps its own cursor into the log, so it
//! replays the backlog and then follows live events without polling.
//!
//! Finished sessions stay around for a grace period and are then dropped;
//! after that, lookups fail with `SessionNotFound`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// How a session finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
}

/// One step of an observer's feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent<E> {
    Progress(E),
    /// Terminal: the backend stream ended normally.
    Completed,
    /// Terminal: the backend stream failed.
    Failed(String),
}

impl<E> ObservedEvent<E> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ObservedEvent::Progress(_))
    }
}

impl<E> From<Outcome> for ObservedEvent<E> {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => ObservedEvent::Completed,
            Outcome::Failed(reason) => ObservedEvent::Failed(reason),
        }
    }
}

struct SessionLog<E> {
    events: Vec<E>,
    outcome: Option<Outcome>,
    finished_at: Option<DateTime<Utc>>,
}

/// Server-side record of one install.
pub struct InstallSession<E> {
    id: String,
    started_at: DateTime<Utc>,
    log: Mutex<SessionLog<E>>,
    version: watch::Sender<u64>,
    delivered_to_trigger: AtomicUsize,
}

impl<E: Clone> InstallSession<E> {
    fn new(id: String) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            id,
            started_at: Utc::now(),
            log: Mutex::new(SessionLog {
                events: Vec::new(),
                outcome: None,
                finished_at: None,
            }),
            version,
            delivered_to_trigger: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // Log first, then bump the version: an observer that read the log before
    // the append is guaranteed to see the change notification.
    fn push(&self, event: E) {
        self.log.lock().events.push(event);
        self.version.send_modify(|v| *v += 1);
    }

    fn finish(&self, outcome: Outcome) -> bool {
        {
            let mut log = self.log.lock();
            if log.outcome.is_some() {
                return false;
            }
            log.outcome = Some(outcome);
            log.finished_at = Some(Utc::now());
        }
        self.version.send_modify(|v| *v += 1);
        true
    }

    pub fn status(&self) -> SessionStatus {
        let log = self.log.lock();
        SessionStatus {
            id: self.id.clone(),
            events: log.events.len(),
            completed: log.outcome.is_some(),
            error: match &log.outcome {
                Some(Outcome::Failed(reason)) => Some(reason.clone()),
                _ => None,
            },
            delivered_to_trigger: self.delivered_to_trigger.load(Ordering::Acquire),
            started_at: self.started_at,
            finished_at: log.finished_at,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: String,
    pub events: usize,
    pub completed: bool,
    pub error: Option<String>,
    pub delivered_to_trigger: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Events gathered for the request that started a session.
#[derive(Debug, Clone)]
pub struct InitialBatch<E> {
    pub events: Vec<E>,
    pub outcome: Option<Outcome>,
}

/// Cursor over one session's log.
pub struct SessionObserver<E> {
    session: Arc<InstallSession<E>>,
    version: watch::Receiver<u64>,
    cursor: usize,
    done: bool,
}

impl<E: Clone> SessionObserver<E> {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Next backlog or live event, then exactly one terminal event, then `None`.
    pub async fn next(&mut self) -> Option<ObservedEvent<E>> {
        loop {
            if self.done {
                return None;
            }

            self.version.borrow_and_update();
            {
                let log = self.session.log.lock();
                if let Some(event) = log.events.get(self.cursor) {
                    self.cursor += 1;
                    return Some(ObservedEvent::Progress(event.clone()));
                }
                if let Some(outcome) = &log.outcome {
                    self.done = true;
                    return Some(outcome.clone().into());
                }
            }

            if self.version.changed().await.is_err() {
                self.done = true;
                return None;
            }
        }
    }

    /// Number of progress events handed out so far.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

/// Owns every live install session.
pub struct InstallSessionTracker<E> {
    sessions: Arc<DashMap<String, Arc<InstallSession<E>>>>,
    grace: Duration,
    shutdown: CancellationToken,
}

impl<E> InstallSessionTracker<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(grace: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            grace,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a new session and return its id.
    ///
    /// Must happen before the id is handed to anyone, so an observer can
    /// never ask for an id that doesn't exist yet.
    pub fn start_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions
            .insert(id.clone(), Arc::new(InstallSession::new(id.clone())));
        counter!("gateway_install_sessions_started_total").increment(1);
        gauge!("gateway_install_sessions_live").set(self.sessions.len() as f64);
        debug!(session = %id, "Install session registered");
        id
    }

    fn get(&self, id: &str) -> Result<Arc<InstallSession<E>>> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    /// Drive the session's backend stream to completion in a background task.
    ///
    /// The task runs whether or not anyone observes it.
    pub fn run_in_background<F, Fut, S>(&self, id: &str, open: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
        S: Stream<Item = Result<E>> + Send + 'static,
    {
        let session = self.get(id)?;
        let sessions = self.sessions.clone();
        let grace = self.grace;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = drive(&session, open, &shutdown).await;
            let failed = matches!(outcome, Outcome::Failed(_));
            if let Outcome::Failed(reason) = &outcome {
                warn!(session = %session.id, "Install failed: {}", reason);
            } else {
                info!(
                    session = %session.id,
                    events = session.status().events,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Install completed"
                );
            }
            session.finish(outcome);
            counter!(
                "gateway_install_sessions_finished_total",
                "outcome" => if failed { "failed" } else { "completed" }
            )
            .increment(1);

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace) => {}
            }

            let removed = sessions
                .remove_if(&session.id, |_, current| Arc::ptr_eq(current, &session))
                .is_some();
            if removed {
                counter!("gateway_install_sessions_collected_total").increment(1);
                gauge!("gateway_install_sessions_live").set(sessions.len() as f64);
                debug!(session = %session.id, "Install session collected");
            }
        });

        Ok(())
    }

    /// Observe a session from the start of its log.
    pub fn observe(&self, id: &str) -> Result<SessionObserver<E>> {
        self.observe_from(id, 0)
    }

    /// Observe a session, skipping the first `cursor` events.
    pub fn observe_from(&self, id: &str, cursor: usize) -> Result<SessionObserver<E>> {
        let session = self.get(id)?;
        let version = session.version.subscribe();
        Ok(SessionObserver {
            session,
            version,
            cursor,
            done: false,
        })
    }

    pub fn status(&self, id: &str) -> Result<SessionStatus> {
        Ok(self.get(id)?.status())
    }

    pub fn record_delivered(&self, id: &str, count: usize) -> Result<()> {
        self.get(id)?
            .delivered_to_trigger
            .fetch_max(count, Ordering::AcqRel);
        Ok(())
    }

    /// Gather what the session produces within `window`, for the triggering
    /// response, and record it as delivered.
    pub async fn collect_initial(&self, id: &str, window: Duration) -> Result<InitialBatch<E>> {
        let mut observer = self.observe(id)?;
        let deadline = Instant::now() + window;
        let mut events = Vec::new();
        let mut outcome = None;

        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, observer.next()).await {
            match event {
                ObservedEvent::Progress(event) => events.push(event),
                ObservedEvent::Completed => {
                    outcome = Some(Outcome::Completed);
                    break;
                }
                ObservedEvent::Failed(reason) => {
                    outcome = Some(Outcome::Failed(reason));
                    break;
                }
            }
        }

        self.record_delivered(id, events.len())?;
        Ok(InitialBatch { events, outcome })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cancel every background install and drop all sessions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let count = self.sessions.len();
        self.sessions.clear();
        gauge!("gateway_install_sessions_live").set(0.0);
        if count > 0 {
            info!("Dropped {} install sessions", count);
        }
    }
}

async fn drive<E, F, Fut, S>(
    session: &InstallSession<E>,
    open: F,
    shutdown: &CancellationToken,
) -> Outcome
where
    E: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<S>>,
    S: Stream<Item = Result<E>>,
{
    let stream = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Outcome::Failed("gateway shutting down".to_string()),
        opened = open() => match opened {
            Ok(stream) => stream,
            Err(e) => return Outcome::Failed(e.to_string()),
        },
    };
    let mut stream = Box::pin(stream);

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                return Outcome::Failed("gateway shutting down".to_string());
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => session.push(event),
            Some(Err(e)) => return Outcome::Failed(e.to_string()),
            None => return Outcome::Completed,
        }
    }
}
