//! Resilient execution of unary backend calls.
//!
//! Each attempt runs under the deadline of its call class. Connectivity
//! failures evict the channel the attempt used and are retried with linear
//! backoff; every other failure is returned on the spot. The error from the
//! final attempt is returned unchanged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tonic::Status;
use tracing::{debug, instrument, warn};

use crate::backend::ServiceId;
use crate::config::{retry, timeouts};
use crate::error::{with_deadline, AppError, Result};
use crate::gateway::connection_cache::{ChannelHandle, ConnectionCache};
use crate::gateway::connector::Connector;

/// Deadline class of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallClass {
    /// List and status lookups.
    Read,
    /// Submissions, deletions and creations.
    Write,
}

impl CallClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallClass::Read => "read",
            CallClass::Write => "write",
        }
    }
}

/// Static description of a backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSpec {
    pub name: &'static str,
    pub service: ServiceId,
    pub class: CallClass,
    /// False when replaying the call after an ambiguous failure could
    /// execute it twice on the backend.
    pub idempotent: bool,
}

impl CallSpec {
    pub const fn read(name: &'static str, service: ServiceId) -> Self {
        Self {
            name,
            service,
            class: CallClass::Read,
            idempotent: true,
        }
    }

    pub const fn write(name: &'static str, service: ServiceId) -> Self {
        Self {
            name,
            service,
            class: CallClass::Write,
            idempotent: true,
        }
    }

    pub const fn mutation(name: &'static str, service: ServiceId) -> Self {
        Self {
            name,
            service,
            class: CallClass::Write,
            idempotent: false,
        }
    }
}

/// Retry policy shared by every unary call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Also retry non-idempotent calls.
    pub retry_mutations: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: retry::MAX_ATTEMPTS,
            base_delay: retry::BASE_DELAY,
            retry_mutations: false,
        }
    }
}

impl RetryPolicy {
    /// Delay after a failed attempt: `attempt * base_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// How many attempts a call of this kind gets.
    pub fn attempts_for(&self, spec: &CallSpec) -> u32 {
        if spec.idempotent || self.retry_mutations {
            self.max_attempts.max(1)
        } else {
            1
        }
    }
}

/// Per-class call deadlines.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub read: Duration,
    pub write: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            read: timeouts::READ_DEADLINE,
            write: timeouts::WRITE_DEADLINE,
        }
    }
}

impl Deadlines {
    pub fn for_class(&self, class: CallClass) -> Duration {
        match class {
            CallClass::Read => self.read,
            CallClass::Write => self.write,
        }
    }
}

/// What a single attempt runs against.
pub struct Attempt<Ch> {
    /// 1-based.
    pub number: u32,
    pub deadline: Duration,
    pub handle: Arc<ChannelHandle<Ch>>,
}

impl<Ch: Clone> Attempt<Ch> {
    pub fn channel(&self) -> Ch {
        self.handle.channel().clone()
    }
}

struct RetryState {
    attempt: u32,
    max: u32,
    last_error: Option<Status>,
    delay: Duration,
}

impl RetryState {
    fn new(max: u32) -> Self {
        Self {
            attempt: 0,
            max,
            last_error: None,
            delay: Duration::ZERO,
        }
    }

    fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    fn exhausted(&self) -> bool {
        self.attempt >= self.max
    }
}

/// Runs unary calls against the connection cache.
pub struct ResilientExecutor<C: Connector> {
    cache: Arc<ConnectionCache<C>>,
    policy: RetryPolicy,
    deadlines: Deadlines,
}

impl<C: Connector> ResilientExecutor<C> {
    pub fn new(cache: Arc<ConnectionCache<C>>, policy: RetryPolicy, deadlines: Deadlines) -> Self {
        Self {
            cache,
            policy,
            deadlines,
        }
    }

    /// Execute `call` with deadline, retry and eviction policy.
    ///
    /// The node is resolved once up front: a concurrent `switch_node` does not
    /// move a call that is already retrying.
    #[instrument(
        name = "rpc",
        skip(self, call),
        fields(method = spec.name, service = %spec.service)
    )]
    pub async fn execute<T, F, Fut>(&self, node: Option<&str>, spec: CallSpec, mut call: F) -> Result<T>
    where
        F: FnMut(Attempt<C::Channel>) -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        let node = self.cache.node_or_current(node);
        let deadline = self.deadlines.for_class(spec.class);
        let mut state = RetryState::new(self.policy.attempts_for(&spec));

        loop {
            let number = state.begin();
            let handle = self.cache.get_channel(Some(&node), spec.service)?;
            let attempt = Attempt {
                number,
                deadline,
                handle: handle.clone(),
            };

            let started = Instant::now();
            let result = with_deadline(call(attempt), deadline, spec.name).await;
            histogram!("gateway_rpc_duration_seconds", "method" => spec.name)
                .record(started.elapsed().as_secs_f64());

            let status = match result {
                Ok(value) => {
                    counter!("gateway_rpc_calls_total", "method" => spec.name, "outcome" => "ok")
                        .increment(1);
                    if number > 1 {
                        debug!(node = %node, attempt = number, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(status) => status,
            };

            let error = AppError::from_status(status.clone());
            if !error.is_retryable() {
                counter!("gateway_rpc_calls_total", "method" => spec.name, "outcome" => error.kind())
                    .increment(1);
                return Err(error);
            }

            // The channel is the usual suspect after a network blip.
            self.cache.evict(&handle);
            state.last_error = Some(status);

            if state.exhausted() {
                counter!("gateway_rpc_calls_total", "method" => spec.name, "outcome" => error.kind())
                    .increment(1);
                if !spec.idempotent && !self.policy.retry_mutations {
                    warn!(node = %node, "Non-idempotent call failed, not retried: {}", error);
                } else {
                    warn!(node = %node, attempts = number, "Giving up: {}", error);
                }
                return Err(error);
            }

            state.delay = self.policy.backoff(number);
            counter!("gateway_rpc_retries_total", "method" => spec.name).increment(1);
            warn!(
                node = %node,
                attempt = number,
                max = state.max,
                delay_ms = state.delay.as_millis() as u64,
                "Retrying after connectivity failure: {}",
                state.last_error.as_ref().map(|s| s.message()).unwrap_or_default()
            );
            tokio::time::sleep(state.delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection_cache::tests::{registry, FakeConnector};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tonic::Code;

    fn executor(policy: RetryPolicy) -> ResilientExecutor<FakeConnector> {
        let cache = Arc::new(ConnectionCache::new(registry(), FakeConnector::default(), "alpha"));
        ResilientExecutor::new(cache, policy, Deadlines::default())
    }

    const LIST: CallSpec = CallSpec::read("ListJobs", ServiceId::Jobs);
    const RUN: CallSpec = CallSpec::mutation("RunJob", ServiceId::Jobs);

    #[test]
    fn test_backoff_is_linear() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
    }

    #[test]
    fn test_attempts_for_mutations() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts_for(&LIST), 3);
        assert_eq!(policy.attempts_for(&RUN), 1);

        let permissive = RetryPolicy {
            retry_mutations: true,
            ..policy
        };
        assert_eq!(permissive.attempts_for(&RUN), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_on_fresh_channel_until_success() {
        let executor = executor(RetryPolicy::default());
        let mut seen = Vec::new();
        let started = Instant::now();

        let result = executor
            .execute(None, LIST, |attempt| {
                seen.push(attempt.handle.clone());
                let number = attempt.number;
                async move {
                    if number < 3 {
                        Err(Status::unavailable("connection reset"))
                    } else {
                        Ok(number)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(seen.len(), 3);
        assert_ne!(seen[0].id(), seen[2].id());
        assert!(seen[0].is_closed());
        assert!(seen[1].is_closed());
        assert!(!seen[2].is_closed());
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let executor = executor(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(None, LIST, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Status::not_found("job 7 does not exist")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), "backend_rejection");
        let status = err.status().unwrap();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "job 7 does not exist");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let executor = executor(RetryPolicy::default());

        let err = executor
            .execute(None, LIST, |attempt| {
                let number = attempt.number;
                async move { Err::<(), _>(Status::unavailable(format!("down #{}", number))) }
            })
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.status().unwrap().message(), "down #3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_not_retried_but_channel_evicted() {
        let executor = executor(RetryPolicy::default());
        let mut seen = Vec::new();

        let err = executor
            .execute(None, RUN, |attempt| {
                seen.push(attempt.handle.clone());
                async { Err::<(), _>(Status::unavailable("reset after send")) }
            })
            .await
            .unwrap_err();

        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_closed());
        assert_eq!(err.kind(), "connectivity");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_applies_per_attempt() {
        let executor = executor(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });

        let err = executor
            .execute(None, LIST, |_| std::future::pending::<std::result::Result<(), Status>>())
            .await
            .unwrap_err();

        assert_eq!(err.status().unwrap().code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_configuration_error_is_immediate() {
        let executor = executor(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(Some("gamma"), LIST, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "configuration");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
