//! Logical backend services and their RPC methods.

use std::fmt;

use serde::Serialize;

use crate::gateway::CallSpec;

/// One of the five backend services. Each (node, service) pair gets its own
/// pooled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceId {
    Jobs,
    Networks,
    Volumes,
    Monitoring,
    Runtimes,
}

impl ServiceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Jobs => "jobs",
            ServiceId::Networks => "networks",
            ServiceId::Volumes => "volumes",
            ServiceId::Monitoring => "monitoring",
            ServiceId::Runtimes => "runtimes",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend RPC: its wire path plus the retry/deadline class it runs under.
#[derive(Debug, Clone, Copy)]
pub struct Method {
    pub path: &'static str,
    pub call: CallSpec,
}

impl Method {
    const fn read(service: ServiceId, name: &'static str, path: &'static str) -> Self {
        Self {
            path,
            call: CallSpec::read(name, service),
        }
    }

    const fn write(service: ServiceId, name: &'static str, path: &'static str) -> Self {
        Self {
            path,
            call: CallSpec::write(name, service),
        }
    }

    const fn mutation(service: ServiceId, name: &'static str, path: &'static str) -> Self {
        Self {
            path,
            call: CallSpec::mutation(name, service),
        }
    }

    const fn stream(service: ServiceId, name: &'static str, path: &'static str) -> Self {
        // Streams are never retried; the call class only labels metrics.
        Self::read(service, name, path)
    }
}

pub mod jobs {
    use super::{Method, ServiceId::Jobs};

    /// Not idempotent: a replay would start a second job.
    pub const RUN_JOB: Method = Method::mutation(Jobs, "RunJob", "/jobdeck.v1.JobService/RunJob");
    /// Stopping an already stopped job is a no-op on the backend.
    pub const STOP_JOB: Method = Method::write(Jobs, "StopJob", "/jobdeck.v1.JobService/StopJob");
    /// A replay after success answers NotFound, which is surfaced as-is.
    pub const DELETE_JOB: Method = Method::write(Jobs, "DeleteJob", "/jobdeck.v1.JobService/DeleteJob");
    /// Not idempotent: the deleted/skipped counts of a replay are wrong.
    pub const DELETE_ALL_JOBS: Method =
        Method::mutation(Jobs, "DeleteAllJobs", "/jobdeck.v1.JobService/DeleteAllJobs");
    pub const LIST_JOBS: Method = Method::read(Jobs, "ListJobs", "/jobdeck.v1.JobService/ListJobs");
    pub const GET_JOB_STATUS: Method =
        Method::read(Jobs, "GetJobStatus", "/jobdeck.v1.JobService/GetJobStatus");
    pub const GET_JOB_LOGS: Method =
        Method::stream(Jobs, "GetJobLogs", "/jobdeck.v1.JobService/GetJobLogs");
    pub const STREAM_JOB_METRICS: Method =
        Method::stream(Jobs, "StreamJobMetrics", "/jobdeck.v1.JobService/StreamJobMetrics");
    pub const STREAM_JOB_TELEMETRY: Method =
        Method::stream(Jobs, "StreamJobTelemetry", "/jobdeck.v1.JobService/StreamJobTelemetry");
}

pub mod networks {
    use super::{Method, ServiceId::Networks};

    pub const LIST_NETWORKS: Method =
        Method::read(Networks, "ListNetworks", "/jobdeck.v1.NetworkService/ListNetworks");
    /// Not idempotent: a replay answers AlreadyExists for a network we created.
    pub const CREATE_NETWORK: Method =
        Method::mutation(Networks, "CreateNetwork", "/jobdeck.v1.NetworkService/CreateNetwork");
    pub const REMOVE_NETWORK: Method =
        Method::write(Networks, "RemoveNetwork", "/jobdeck.v1.NetworkService/RemoveNetwork");
}

pub mod volumes {
    use super::{Method, ServiceId::Volumes};

    pub const LIST_VOLUMES: Method =
        Method::read(Volumes, "ListVolumes", "/jobdeck.v1.VolumeService/ListVolumes");
    /// Not idempotent, same as network creation.
    pub const CREATE_VOLUME: Method =
        Method::mutation(Volumes, "CreateVolume", "/jobdeck.v1.VolumeService/CreateVolume");
    pub const REMOVE_VOLUME: Method =
        Method::write(Volumes, "RemoveVolume", "/jobdeck.v1.VolumeService/RemoveVolume");
}

pub mod monitoring {
    use super::{Method, ServiceId::Monitoring};

    pub const GET_SYSTEM_STATUS: Method = Method::read(
        Monitoring,
        "GetSystemStatus",
        "/jobdeck.v1.MonitoringService/GetSystemStatus",
    );
    pub const STREAM_SYSTEM_METRICS: Method = Method::stream(
        Monitoring,
        "StreamSystemMetrics",
        "/jobdeck.v1.MonitoringService/StreamSystemMetrics",
    );
}

pub mod runtimes {
    use super::{Method, ServiceId::Runtimes};

    pub const LIST_RUNTIMES: Method =
        Method::read(Runtimes, "ListRuntimes", "/jobdeck.v1.RuntimeService/ListRuntimes");
    pub const GET_RUNTIME_INFO: Method =
        Method::read(Runtimes, "GetRuntimeInfo", "/jobdeck.v1.RuntimeService/GetRuntimeInfo");
    pub const REMOVE_RUNTIME: Method =
        Method::write(Runtimes, "RemoveRuntime", "/jobdeck.v1.RuntimeService/RemoveRuntime");
    pub const VALIDATE_RUNTIME_SPEC: Method = Method::read(
        Runtimes,
        "ValidateRuntimeSpec",
        "/jobdeck.v1.RuntimeService/ValidateRuntimeSpec",
    );
    pub const BUILD_RUNTIME: Method =
        Method::stream(Runtimes, "BuildRuntime", "/jobdeck.v1.RuntimeService/BuildRuntime");
}
