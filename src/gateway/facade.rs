//! The gateway facade: the only surface the HTTP layer talks to.
//!
//! Unary operations go through the [`ResilientExecutor`], live tails through
//! the stream relay and runtime installs through the install session
//! tracker. Results are decoded into the types in [`crate::gateway::types`],
//! errors are already classified as [`AppError`]s.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tonic::Status;
use tracing::info;

use crate::backend::{jobs, monitoring, networks, proto, runtimes, volumes, BackendTransport, Method};
use crate::config::{nodes, streaming, Config};
use crate::error::{AppError, Result};
use crate::gateway::connection_cache::{CacheStats, ConnectionCache};
use crate::gateway::connector::{Connector, TonicConnector};
use crate::gateway::executor::{Deadlines, ResilientExecutor, RetryPolicy};
use crate::gateway::install::{InstallSessionTracker, Outcome, SessionObserver, SessionStatus};
use crate::gateway::registry::{FileSource, NodeRegistry};
use crate::gateway::relay::{attach, Subscription};
use crate::gateway::types::*;

/// Tunables that aren't part of the cache or registry.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub initial_node: String,
    pub retry: RetryPolicy,
    pub deadlines: Deadlines,
    pub relay_buffer: usize,
    pub install_grace: Duration,
    pub install_window: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            initial_node: nodes::DEFAULT_NODE_NAME.to_string(),
            retry: RetryPolicy::default(),
            deadlines: Deadlines::default(),
            relay_buffer: streaming::RELAY_BUFFER,
            install_grace: streaming::INSTALL_GRACE_PERIOD,
            install_window: streaming::INSTALL_INITIAL_WINDOW,
        }
    }
}

impl GatewayOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_node: config.initial_node.clone(),
            retry: config.retry_policy(),
            deadlines: config.deadlines(),
            relay_buffer: config.relay_buffer,
            install_grace: config.install_grace_period,
            install_window: config.install_initial_window,
        }
    }
}

/// Gateway to the job-execution backend.
///
/// Constructed once at startup, shared behind an `Arc` and disposed with
/// [`Gateway::shutdown`].
pub struct Gateway<C: Connector = TonicConnector> {
    registry: Arc<NodeRegistry>,
    cache: Arc<ConnectionCache<C>>,
    executor: ResilientExecutor<C>,
    installs: InstallSessionTracker<BuildProgress>,
    relay_buffer: usize,
    install_window: Duration,
}

impl Gateway<TonicConnector> {
    /// Production gateway reading nodes from the configured document.
    pub fn from_config(config: &Config) -> Self {
        let source = FileSource::new(config.nodes_path());
        let registry = Arc::new(NodeRegistry::new(source, config.registry_ttl));
        let connector = TonicConnector::new(config.channel_settings());
        Self::new(registry, connector, GatewayOptions::from_config(config))
    }
}

impl<C: Connector> Gateway<C> {
    pub fn new(registry: Arc<NodeRegistry>, connector: C, options: GatewayOptions) -> Self {
        let cache = Arc::new(ConnectionCache::new(
            registry.clone(),
            connector,
            options.initial_node,
        ));
        let executor = ResilientExecutor::new(cache.clone(), options.retry, options.deadlines);

        Self {
            registry,
            cache,
            executor,
            installs: InstallSessionTracker::new(options.install_grace),
            relay_buffer: options.relay_buffer,
            install_window: options.install_window,
        }
    }

    // ---- Nodes ----

    pub fn list_nodes(&self) -> NodeListing {
        let table = self.registry.table();
        let current = self.cache.current_node();
        let nodes = table
            .nodes
            .values()
            .map(|node| NodeSummary {
                name: node.name.clone(),
                address: node.address.clone(),
                secure: node.transport().map(|t| t.is_secure()).unwrap_or(false),
                current: node.name == current,
            })
            .collect();

        NodeListing {
            nodes,
            current,
            degraded: table.degraded,
        }
    }

    pub fn current_node(&self) -> String {
        self.cache.current_node()
    }

    /// Point default-node callers at `name`. Returns the previous node.
    pub fn switch_node(&self, name: &str) -> Result<String> {
        self.cache.switch_node(name)
    }

    /// Re-read the node document now instead of at TTL expiry.
    ///
    /// Cached channels whose node changed are rebuilt on next use.
    pub fn reload_nodes(&self) -> NodeListing {
        self.registry.expire();
        let listing = self.list_nodes();
        info!(
            nodes = listing.nodes.len(),
            degraded = listing.degraded,
            "Reloaded node document"
        );
        listing
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ---- Install sessions ----

    /// Follow an install session. With `skip_delivered`, events already
    /// returned to the triggering request are not replayed.
    pub fn observe_install(
        &self,
        session_id: &str,
        skip_delivered: bool,
    ) -> Result<SessionObserver<BuildProgress>> {
        if skip_delivered {
            let delivered = self.installs.status(session_id)?.delivered_to_trigger;
            self.installs.observe_from(session_id, delivered)
        } else {
            self.installs.observe(session_id)
        }
    }

    pub fn install_status(&self, session_id: &str) -> Result<SessionStatus> {
        self.installs.status(session_id)
    }

    pub fn live_install_sessions(&self) -> usize {
        self.installs.len()
    }

    /// Cancel background installs and close every channel.
    pub fn shutdown(&self) {
        self.installs.shutdown();
        let closed = self.cache.clear();
        info!("Gateway shut down, closed {} channels", closed);
    }
}

fn require_id(what: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(AppError::Validation(format!("{} must not be empty", what)));
    }
    Ok(())
}

/// Open a server stream on the cached channel for `node`, decoding items into
/// `T`. Connectivity failures, on open or mid-stream, evict the channel.
async fn open_stream<C, Req, Resp, T>(
    cache: Arc<ConnectionCache<C>>,
    node: String,
    method: Method,
    request: Req,
) -> Result<impl Stream<Item = Result<T>> + Send + 'static>
where
    C: Connector,
    C::Channel: BackendTransport,
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
    T: From<Resp> + Send + 'static,
{
    let handle = cache.get_channel(Some(&node), method.call.service)?;

    let stream = match handle
        .channel()
        .server_streaming::<Req, Resp>(method.path, request)
        .await
    {
        Ok(stream) => stream,
        Err(status) => {
            let error = AppError::from_status(status);
            if error.is_retryable() {
                cache.evict(&handle);
            }
            return Err(error);
        }
    };

    Ok(stream.map(move |item| {
        item.map(T::from).map_err(|status| {
            let error = AppError::from_status(status);
            if error.is_retryable() {
                cache.evict(&handle);
            }
            error
        })
    }))
}

impl<C> Gateway<C>
where
    C: Connector,
    C::Channel: BackendTransport,
{
    async fn unary<Req, Resp>(&self, node: Option<&str>, method: Method, request: Req) -> Result<Resp>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.executor
            .execute(node, method.call, |attempt| {
                attempt
                    .channel()
                    .unary(method.path, request.clone(), attempt.deadline)
            })
            .await
    }

    /// Start a live tail. Node problems are reported here; backend problems
    /// arrive as the subscription's terminal error.
    fn relay<Req, Resp, T>(&self, node: Option<&str>, method: Method, request: Req) -> Result<Subscription<T>>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
        T: From<Resp> + Send + 'static,
    {
        let node = self.cache.node_or_current(node);
        self.cache.get_channel(Some(&node), method.call.service)?;

        let cache = self.cache.clone();
        Ok(attach(
            method.call.name,
            move || open_stream::<C, Req, Resp, T>(cache, node, method, request),
            self.relay_buffer,
        ))
    }

    // ---- Jobs ----

    pub async fn list_jobs(&self, node: Option<&str>) -> Result<Vec<Job>> {
        let jobs: proto::Jobs = self.unary(node, jobs::LIST_JOBS, proto::EmptyRequest {}).await?;
        Ok(jobs.jobs.into_iter().map(Job::from).collect())
    }

    pub async fn job_status(&self, node: Option<&str>, uuid: &str) -> Result<Job> {
        require_id("job id", uuid)?;
        let request = proto::JobRequest { uuid: uuid.to_string() };
        let job: proto::Job = self.unary(node, jobs::GET_JOB_STATUS, request).await?;
        Ok(job.into())
    }

    /// Submit a job. Not retried on connectivity failure unless mutations
    /// are configured retryable: the job may already be running.
    pub async fn run_job(&self, node: Option<&str>, submission: JobSubmission) -> Result<JobStarted> {
        submission.validate()?;
        let started: proto::RunJobResponse = self
            .unary(node, jobs::RUN_JOB, submission.into_request())
            .await?;
        Ok(started.into())
    }

    pub async fn stop_job(&self, node: Option<&str>, uuid: &str) -> Result<JobStopped> {
        require_id("job id", uuid)?;
        let request = proto::JobRequest { uuid: uuid.to_string() };
        let stopped: proto::StopJobResponse = self.unary(node, jobs::STOP_JOB, request).await?;
        Ok(stopped.into())
    }

    pub async fn delete_job(&self, node: Option<&str>, uuid: &str) -> Result<JobDeleted> {
        require_id("job id", uuid)?;
        let request = proto::JobRequest { uuid: uuid.to_string() };
        let deleted: proto::DeleteJobResponse = self.unary(node, jobs::DELETE_JOB, request).await?;
        Ok(deleted.into())
    }

    /// Bulk delete of finished jobs; never blindly retried, same as `run_job`.
    pub async fn delete_all_jobs(&self, node: Option<&str>) -> Result<BulkDeleteReport> {
        let report: proto::DeleteAllJobsResponse = self
            .unary(node, jobs::DELETE_ALL_JOBS, proto::EmptyRequest {})
            .await?;
        Ok(report.into())
    }

    pub fn tail_job_logs(&self, node: Option<&str>, uuid: &str) -> Result<Subscription<LogChunk>> {
        require_id("job id", uuid)?;
        let request = proto::JobRequest { uuid: uuid.to_string() };
        self.relay::<_, proto::DataChunk, _>(node, jobs::GET_JOB_LOGS, request)
    }

    pub fn tail_job_metrics(
        &self,
        node: Option<&str>,
        uuid: &str,
        interval_seconds: u32,
    ) -> Result<Subscription<JobMetrics>> {
        require_id("job id", uuid)?;
        let request = proto::JobMetricsRequest {
            uuid: uuid.to_string(),
            interval_seconds: interval_seconds.clamp(1, 3600) as i32,
        };
        self.relay::<_, proto::JobMetricsSample, _>(node, jobs::STREAM_JOB_METRICS, request)
    }

    /// Security telemetry for a job; an empty `types` means every kind.
    pub fn tail_job_telemetry(
        &self,
        node: Option<&str>,
        uuid: &str,
        types: Vec<String>,
    ) -> Result<Subscription<Telemetry>> {
        require_id("job id", uuid)?;
        let request = proto::JobTelemetryRequest {
            uuid: uuid.to_string(),
            types,
        };
        self.relay::<_, proto::TelemetryEvent, _>(node, jobs::STREAM_JOB_TELEMETRY, request)
    }

    // ---- Networks ----

    pub async fn list_networks(&self, node: Option<&str>) -> Result<Vec<Network>> {
        let networks: proto::Networks = self
            .unary(node, networks::LIST_NETWORKS, proto::EmptyRequest {})
            .await?;
        Ok(networks.networks.into_iter().map(Network::from).collect())
    }

    /// Not retried by default: a replay answers AlreadyExists.
    pub async fn create_network(&self, node: Option<&str>, spec: NetworkSpec) -> Result<Network> {
        spec.validate()?;
        let request = proto::CreateNetworkRequest {
            name: spec.name,
            cidr: spec.cidr,
        };
        let created: proto::NetworkInfo = self.unary(node, networks::CREATE_NETWORK, request).await?;
        Ok(created.into())
    }

    pub async fn remove_network(&self, node: Option<&str>, name: &str) -> Result<Removal> {
        require_id("network name", name)?;
        let request = proto::NameRequest { name: name.to_string() };
        let removed: proto::RemoveResponse = self.unary(node, networks::REMOVE_NETWORK, request).await?;
        Ok(removed.into())
    }

    // ---- Volumes ----

    pub async fn list_volumes(&self, node: Option<&str>) -> Result<Vec<Volume>> {
        let volumes: proto::Volumes = self
            .unary(node, volumes::LIST_VOLUMES, proto::EmptyRequest {})
            .await?;
        Ok(volumes.volumes.into_iter().map(Volume::from).collect())
    }

    pub async fn create_volume(&self, node: Option<&str>, spec: VolumeSpec) -> Result<Volume> {
        spec.validate()?;
        let request = proto::CreateVolumeRequest {
            name: spec.name,
            size: spec.size,
            volume_type: spec.volume_type,
        };
        let created: proto::VolumeInfo = self.unary(node, volumes::CREATE_VOLUME, request).await?;
        Ok(created.into())
    }

    pub async fn remove_volume(&self, node: Option<&str>, name: &str) -> Result<Removal> {
        require_id("volume name", name)?;
        let request = proto::NameRequest { name: name.to_string() };
        let removed: proto::RemoveResponse = self.unary(node, volumes::REMOVE_VOLUME, request).await?;
        Ok(removed.into())
    }

    // ---- Monitoring ----

    pub async fn system_status(&self, node: Option<&str>) -> Result<SystemStatus> {
        let status: proto::SystemStatus = self
            .unary(node, monitoring::GET_SYSTEM_STATUS, proto::EmptyRequest {})
            .await?;
        Ok(status.into())
    }

    pub fn tail_system_metrics(
        &self,
        node: Option<&str>,
        interval_seconds: u32,
        metric_types: Vec<String>,
    ) -> Result<Subscription<SystemStatus>> {
        let request = proto::StreamMetricsRequest {
            interval_seconds: interval_seconds.clamp(1, 3600) as i32,
            metric_types,
        };
        self.relay::<_, proto::SystemStatus, _>(node, monitoring::STREAM_SYSTEM_METRICS, request)
    }

    // ---- Runtimes ----

    pub async fn list_runtimes(&self, node: Option<&str>) -> Result<Vec<Runtime>> {
        let runtimes: proto::Runtimes = self
            .unary(node, runtimes::LIST_RUNTIMES, proto::EmptyRequest {})
            .await?;
        Ok(runtimes.runtimes.into_iter().map(Runtime::from).collect())
    }

    pub async fn runtime_info(&self, node: Option<&str>, runtime: &str) -> Result<Runtime> {
        require_id("runtime", runtime)?;
        let request = proto::RuntimeRequest {
            runtime: runtime.to_string(),
        };
        let info: proto::RuntimeInfoResponse = self.unary(node, runtimes::GET_RUNTIME_INFO, request).await?;
        match info.runtime {
            Some(found) if info.found => Ok(found.into()),
            _ => Err(AppError::BackendRejection(Status::not_found(format!(
                "runtime '{}' is not installed",
                runtime
            )))),
        }
    }

    pub async fn remove_runtime(&self, node: Option<&str>, runtime: &str) -> Result<RuntimeRemoval> {
        require_id("runtime", runtime)?;
        let request = proto::RuntimeRequest {
            runtime: runtime.to_string(),
        };
        let removed: proto::RuntimeRemoveResponse =
            self.unary(node, runtimes::REMOVE_RUNTIME, request).await?;
        Ok(removed.into())
    }

    pub async fn validate_runtime_spec(&self, node: Option<&str>, spec_yaml: &str) -> Result<SpecValidation> {
        require_id("runtime definition", spec_yaml)?;
        let request = proto::ValidateRuntimeSpecRequest {
            spec_yaml: spec_yaml.to_string(),
        };
        let answer: proto::ValidateRuntimeSpecResponse =
            self.unary(node, runtimes::VALIDATE_RUNTIME_SPEC, request).await?;
        Ok(answer.into())
    }

    /// Start building a runtime in the background.
    ///
    /// The session exists before this returns; the answer carries the
    /// progress produced during the initial window.
    pub async fn install_runtime(
        &self,
        node: Option<&str>,
        install: RuntimeInstallRequest,
    ) -> Result<InstallStarted> {
        install.validate()?;
        let node = self.cache.node_or_current(node);
        let method = runtimes::BUILD_RUNTIME;
        self.cache.get_channel(Some(&node), method.call.service)?;

        let runtime = install.runtime.clone();
        let session_id = self.installs.start_session();
        let cache = self.cache.clone();
        let request = install.into_request();
        self.installs.run_in_background(&session_id, move || {
            open_stream::<C, _, proto::RuntimeBuildProgress, BuildProgress>(cache, node, method, request)
        })?;

        info!(session = %session_id, runtime = %runtime, "Runtime install started");
        let initial = self
            .installs
            .collect_initial(&session_id, self.install_window)
            .await?;

        let (completed, error) = match initial.outcome {
            Some(Outcome::Completed) => (true, None),
            Some(Outcome::Failed(reason)) => (true, Some(reason)),
            None => (false, None),
        };

        Ok(InstallStarted {
            session_id,
            runtime,
            events: initial.events,
            completed,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendStream, ServiceId};
    use crate::gateway::connection_cache::tests::{registry, FakeConnector};
    use crate::gateway::install::ObservedEvent;
    use crate::gateway::registry::{NodeConfig, Transport};
    use crate::gateway::relay::tests::Tracked;
    use crate::gateway::relay::RelayEvent;
    use futures::future::BoxFuture;
    use futures::{stream, FutureExt};
    use parking_lot::Mutex;
    use prost::Message as _;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend that answers from encoded frames registered per method path.
    #[derive(Clone, Default)]
    struct ScriptedBackend {
        answers: Arc<Mutex<HashMap<&'static str, Vec<u8>>>>,
        streams: Arc<Mutex<HashMap<&'static str, (Vec<Vec<u8>>, bool)>>>,
        last_stream: Arc<Mutex<Option<Arc<AtomicBool>>>>,
    }

    impl ScriptedBackend {
        fn answer<M: prost::Message>(&self, method: Method, reply: M) {
            self.answers.lock().insert(method.path, reply.encode_to_vec());
        }

        /// Frames for a server stream; `stay_open` keeps it pending after them.
        fn stream<M: prost::Message>(&self, method: Method, frames: Vec<M>, stay_open: bool) {
            let frames = frames.iter().map(|m| m.encode_to_vec()).collect();
            self.streams.lock().insert(method.path, (frames, stay_open));
        }

        fn last_stream_dropped(&self) -> bool {
            self.last_stream
                .lock()
                .as_ref()
                .map(|flag| flag.load(Ordering::SeqCst))
                .unwrap_or(false)
        }
    }

    fn decode<Resp: prost::Message + Default>(bytes: &[u8]) -> std::result::Result<Resp, Status> {
        Resp::decode(bytes).map_err(|e| Status::internal(e.to_string()))
    }

    impl BackendTransport for ScriptedBackend {
        fn unary<Req, Resp>(
            &self,
            path: &'static str,
            _message: Req,
            _deadline: Duration,
        ) -> BoxFuture<'static, std::result::Result<Resp, Status>>
        where
            Req: prost::Message + Send + Sync + 'static,
            Resp: prost::Message + Default + Send + Sync + 'static,
        {
            let answer = self.answers.lock().get(path).cloned();
            async move {
                let bytes = answer.ok_or_else(|| Status::unavailable(format!("nothing at {}", path)))?;
                decode(&bytes)
            }
            .boxed()
        }

        fn server_streaming<Req, Resp>(
            &self,
            path: &'static str,
            _message: Req,
        ) -> BoxFuture<'static, std::result::Result<BackendStream<Resp>, Status>>
        where
            Req: prost::Message + Send + Sync + 'static,
            Resp: prost::Message + Default + Send + Sync + 'static,
        {
            let script = self.streams.lock().get(path).cloned();
            let last_stream = self.last_stream.clone();
            async move {
                let (frames, stay_open) = script.ok_or_else(|| Status::unimplemented(path))?;
                let items = stream::iter(frames.into_iter().map(|bytes| decode::<Resp>(&bytes)));
                let items: BackendStream<Resp> = if stay_open {
                    items.chain(stream::pending()).boxed()
                } else {
                    items.boxed()
                };
                let (tracked, dropped) = Tracked::new(items);
                *last_stream.lock() = Some(dropped);
                Ok(tracked.boxed())
            }
            .boxed()
        }
    }

    struct ScriptedConnector(ScriptedBackend);

    impl Connector for ScriptedConnector {
        type Channel = ScriptedBackend;

        fn connect(&self, _: &NodeConfig, _: &Transport, _: ServiceId) -> Result<ScriptedBackend> {
            Ok(self.0.clone())
        }
    }

    fn scripted(backend: &ScriptedBackend, install_window: Duration) -> Gateway<ScriptedConnector> {
        Gateway::new(
            registry(),
            ScriptedConnector(backend.clone()),
            GatewayOptions {
                initial_node: "alpha".into(),
                install_window,
                ..GatewayOptions::default()
            },
        )
    }

    fn progress(step: i32, message: &str) -> proto::RuntimeBuildProgress {
        proto::RuntimeBuildProgress {
            phase: "build".into(),
            message: message.into(),
            step,
            total_steps: 2,
            log_line: String::new(),
        }
    }

    fn gateway() -> Gateway<FakeConnector> {
        Gateway::new(
            registry(),
            FakeConnector::default(),
            GatewayOptions {
                initial_node: "alpha".into(),
                ..GatewayOptions::default()
            },
        )
    }

    #[test]
    fn test_list_nodes_marks_current() {
        let listing = gateway().list_nodes();
        assert_eq!(listing.current, "alpha");
        assert!(!listing.degraded);

        let names: Vec<_> = listing.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        assert!(listing.nodes[0].current);
        assert!(listing.nodes[1].secure);
        // Partial bundle: not usable as TLS, reported as insecure.
        assert!(!listing.nodes[2].secure);
    }

    #[test]
    fn test_switch_node() {
        let gateway = gateway();
        assert_eq!(gateway.switch_node("beta").unwrap(), "alpha");
        assert_eq!(gateway.current_node(), "beta");
        assert!(gateway.switch_node("missing").is_err());
        assert_eq!(gateway.current_node(), "beta");
    }

    #[test]
    fn test_install_lookups_for_unknown_session() {
        let gateway = gateway();
        assert!(matches!(
            gateway.install_status("does-not-exist"),
            Err(AppError::SessionNotFound(_))
        ));
        assert!(gateway.observe_install("does-not-exist", true).is_err());
    }

    #[tokio::test]
    async fn test_tonic_gateway_rejects_partial_credentials_before_io() {
        let gateway = Gateway::new(registry(), TonicConnector::default(), GatewayOptions::default());
        let err = gateway.list_jobs(Some("gamma")).await.unwrap_err();
        assert_eq!(err.kind(), "configuration");

        let err = gateway
            .tail_job_logs(Some("gamma"), "job-1")
            .err()
            .map(|e| e.kind());
        assert_eq!(err, Some("configuration"));
    }

    #[tokio::test]
    async fn test_validation_runs_before_backend() {
        let gateway = Gateway::new(registry(), TonicConnector::default(), GatewayOptions::default());
        let err = gateway
            .run_job(Some("alpha"), JobSubmission::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(gateway.cache_stats().entries == 0);
    }

    #[tokio::test]
    async fn test_unary_result_is_decoded() {
        let backend = ScriptedBackend::default();
        backend.answer(
            jobs::LIST_JOBS,
            proto::Jobs {
                jobs: vec![proto::Job {
                    uuid: "job-1".into(),
                    command: "make".into(),
                    ..Default::default()
                }],
            },
        );
        let gateway = scripted(&backend, Duration::from_millis(10));

        let jobs = gateway.list_jobs(None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].uuid, "job-1");
        assert_eq!(jobs[0].command, "make");
    }

    #[tokio::test]
    async fn test_log_tail_relays_and_releases_backend_stream() {
        let backend = ScriptedBackend::default();
        backend.stream(
            jobs::GET_JOB_LOGS,
            vec![proto::DataChunk {
                payload: b"compiling\n".to_vec(),
            }],
            true,
        );
        let gateway = scripted(&backend, Duration::from_millis(10));

        let mut logs = gateway.tail_job_logs(None, "job-1").unwrap();
        match logs.next().await {
            Some(RelayEvent::Item(chunk)) => assert_eq!(chunk.text, "compiling\n"),
            _ => panic!("expected a log chunk"),
        }
        assert!(!backend.last_stream_dropped());

        logs.shutdown().await;
        assert!(backend.last_stream_dropped());
    }

    #[tokio::test]
    async fn test_install_returns_initial_batch_and_records_delivery() {
        let backend = ScriptedBackend::default();
        backend.stream(
            runtimes::BUILD_RUNTIME,
            vec![progress(1, "fetching"), progress(2, "linking")],
            false,
        );
        let gateway = scripted(&backend, Duration::from_secs(5));

        let started = gateway
            .install_runtime(
                None,
                RuntimeInstallRequest {
                    runtime: "python-3.11".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(started.runtime, "python-3.11");
        assert_eq!(started.events.len(), 2);
        assert_eq!(started.events[1].message, "linking");
        assert!(started.completed);
        assert!(started.error.is_none());

        let status = gateway.install_status(&started.session_id).unwrap();
        assert_eq!(status.delivered_to_trigger, 2);
        assert_eq!(status.events, 2);

        let mut rest = gateway.observe_install(&started.session_id, true).unwrap();
        assert_eq!(rest.next().await, Some(ObservedEvent::Completed));

        let mut all = gateway.observe_install(&started.session_id, false).unwrap();
        assert!(matches!(all.next().await, Some(ObservedEvent::Progress(_))));
        assert!(matches!(all.next().await, Some(ObservedEvent::Progress(_))));
        assert_eq!(all.next().await, Some(ObservedEvent::Completed));
    }

    #[tokio::test]
    async fn test_install_session_outlives_initial_window() {
        let backend = ScriptedBackend::default();
        backend.stream(runtimes::BUILD_RUNTIME, vec![progress(1, "fetching")], true);
        let gateway = scripted(&backend, Duration::from_millis(50));

        let started = gateway
            .install_runtime(
                None,
                RuntimeInstallRequest {
                    runtime: "node-20".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!started.completed);
        assert_eq!(started.events.len(), 1);
        assert_eq!(gateway.live_install_sessions(), 1);
        assert!(!gateway.install_status(&started.session_id).unwrap().completed);

        gateway.shutdown();
        assert_eq!(gateway.live_install_sessions(), 0);
    }
}
