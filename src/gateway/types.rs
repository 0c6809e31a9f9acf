//! Typed results of gateway operations.
//!
//! Backend messages are decoded into these once, at the gateway boundary.
//! Empty wire strings become `None`; everything serializes as camelCase JSON
//! for the presentation layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::proto;
use crate::error::{AppError, Result};

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

// ---- Jobs ----

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub uuid: String,
    pub name: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub max_cpu: i32,
    pub cpu_cores: Option<String>,
    pub max_memory: i32,
    pub max_iobps: i32,
    pub status: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub exit_code: i32,
    pub scheduled_time: Option<String>,
    pub runtime: Option<String>,
    pub network: Option<String>,
    pub volumes: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

impl From<proto::Job> for Job {
    fn from(job: proto::Job) -> Self {
        Self {
            uuid: job.uuid,
            name: non_empty(job.name),
            command: job.command,
            args: job.args,
            max_cpu: job.max_cpu,
            cpu_cores: non_empty(job.cpu_cores),
            max_memory: job.max_memory,
            max_iobps: job.max_iobps,
            status: job.status,
            start_time: non_empty(job.start_time),
            end_time: non_empty(job.end_time),
            exit_code: job.exit_code,
            scheduled_time: non_empty(job.scheduled_time),
            runtime: non_empty(job.runtime),
            network: non_empty(job.network),
            volumes: job.volumes,
            environment: job.environment.into_iter().collect(),
        }
    }
}

/// A job submission as accepted from the presentation layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSubmission {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub max_cpu: i32,
    pub cpu_cores: String,
    pub max_memory: i32,
    pub max_iobps: i32,
    /// RFC-3339 time or relative expression understood by the backend.
    pub schedule: String,
    pub network: String,
    pub volumes: Vec<String>,
    pub runtime: String,
    pub work_dir: String,
    pub environment: BTreeMap<String, String>,
    pub secret_environment: BTreeMap<String, String>,
}

impl JobSubmission {
    pub fn validate(&self) -> Result<()> {
        require("command", &self.command)?;
        if self.max_cpu < 0 || self.max_memory < 0 || self.max_iobps < 0 {
            return Err(AppError::Validation(
                "resource limits must not be negative".to_string(),
            ));
        }
        if let Some(key) = self
            .environment
            .keys()
            .chain(self.secret_environment.keys())
            .find(|key| key.is_empty() || key.contains('='))
        {
            return Err(AppError::Validation(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        Ok(())
    }

    pub fn into_request(self) -> proto::RunJobRequest {
        proto::RunJobRequest {
            name: self.name,
            command: self.command,
            args: self.args,
            max_cpu: self.max_cpu,
            cpu_cores: self.cpu_cores,
            max_memory: self.max_memory,
            max_iobps: self.max_iobps,
            schedule: self.schedule,
            network: self.network,
            volumes: self.volumes,
            runtime: self.runtime,
            work_dir: self.work_dir,
            environment: self.environment.into_iter().collect(),
            secret_environment: self.secret_environment.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub uuid: String,
    pub name: Option<String>,
    pub status: String,
    pub command: String,
    pub args: Vec<String>,
    pub start_time: Option<String>,
    pub scheduled_time: Option<String>,
}

impl From<proto::RunJobResponse> for JobStarted {
    fn from(resp: proto::RunJobResponse) -> Self {
        Self {
            uuid: resp.job_uuid,
            name: non_empty(resp.name),
            status: resp.status,
            command: resp.command,
            args: resp.args,
            start_time: non_empty(resp.start_time),
            scheduled_time: non_empty(resp.scheduled_time),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStopped {
    pub uuid: String,
    pub status: String,
    pub end_time: Option<String>,
    pub exit_code: i32,
}

impl From<proto::StopJobResponse> for JobStopped {
    fn from(resp: proto::StopJobResponse) -> Self {
        Self {
            uuid: resp.uuid,
            status: resp.status,
            end_time: non_empty(resp.end_time),
            exit_code: resp.exit_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDeleted {
    pub uuid: String,
    pub success: bool,
    pub message: Option<String>,
}

impl From<proto::DeleteJobResponse> for JobDeleted {
    fn from(resp: proto::DeleteJobResponse) -> Self {
        Self {
            uuid: resp.uuid,
            success: resp.success,
            message: non_empty(resp.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteReport {
    pub success: bool,
    pub message: Option<String>,
    pub deleted: u32,
    /// Jobs still running, left alone.
    pub skipped: u32,
}

impl From<proto::DeleteAllJobsResponse> for BulkDeleteReport {
    fn from(resp: proto::DeleteAllJobsResponse) -> Self {
        Self {
            success: resp.success,
            message: non_empty(resp.message),
            deleted: resp.deleted_count.max(0) as u32,
            skipped: resp.skipped_count.max(0) as u32,
        }
    }
}

/// A chunk of job output. Invalid UTF-8 is replaced, not rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogChunk {
    pub text: String,
}

impl From<proto::DataChunk> for LogChunk {
    fn from(chunk: proto::DataChunk) -> Self {
        Self {
            text: String::from_utf8_lossy(&chunk.payload).into_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    pub job_uuid: String,
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub memory_bytes: i64,
    pub memory_limit_bytes: i64,
    pub io_read_bytes: i64,
    pub io_write_bytes: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub process_count: i32,
}

impl From<proto::JobMetricsSample> for JobMetrics {
    fn from(s: proto::JobMetricsSample) -> Self {
        Self {
            job_uuid: s.job_uuid,
            timestamp: s.timestamp,
            cpu_percent: s.cpu_percent,
            memory_bytes: s.memory_bytes,
            memory_limit_bytes: s.memory_limit_bytes,
            io_read_bytes: s.io_read_bytes,
            io_write_bytes: s.io_write_bytes,
            net_rx_bytes: s.net_rx_bytes,
            net_tx_bytes: s.net_tx_bytes,
            process_count: s.process_count,
        }
    }
}

/// One security telemetry event (exec, connect, file access, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub job_uuid: String,
    pub timestamp: i64,
    pub kind: String,
    pub pid: i32,
    pub comm: Option<String>,
    pub detail: BTreeMap<String, String>,
}

impl From<proto::TelemetryEvent> for Telemetry {
    fn from(e: proto::TelemetryEvent) -> Self {
        Self {
            job_uuid: e.job_uuid,
            timestamp: e.timestamp,
            kind: e.kind,
            pid: e.pid,
            comm: non_empty(e.comm),
            detail: e.detail.into_iter().collect(),
        }
    }
}

// ---- Networks & volumes ----

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    pub cidr: Option<String>,
    pub bridge: Option<String>,
    pub job_count: i32,
}

impl From<proto::NetworkInfo> for Network {
    fn from(n: proto::NetworkInfo) -> Self {
        Self {
            name: n.name,
            cidr: non_empty(n.cidr),
            bridge: non_empty(n.bridge),
            job_count: n.job_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub cidr: String,
}

impl NetworkSpec {
    pub fn validate(&self) -> Result<()> {
        require("name", &self.name)?;
        require("cidr", &self.cidr)?;
        let (addr, prefix) = self
            .cidr
            .split_once('/')
            .ok_or_else(|| AppError::Validation(format!("'{}' is not CIDR notation", self.cidr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| AppError::Validation(format!("invalid prefix length in '{}'", self.cidr)))?;
        if addr.parse::<std::net::Ipv4Addr>().is_err() || prefix > 32 {
            return Err(AppError::Validation(format!(
                "'{}' is not an IPv4 CIDR block",
                self.cidr
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub size: Option<String>,
    #[serde(rename = "type")]
    pub volume_type: Option<String>,
    pub path: Option<String>,
    pub created_time: Option<String>,
    pub job_count: i32,
}

impl From<proto::VolumeInfo> for Volume {
    fn from(v: proto::VolumeInfo) -> Self {
        Self {
            name: v.name,
            size: non_empty(v.size),
            volume_type: non_empty(v.volume_type),
            path: non_empty(v.path),
            created_time: non_empty(v.created_time),
            job_count: v.job_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    /// e.g. "1GB", "500MB".
    pub size: String,
    #[serde(rename = "type", default = "default_volume_type")]
    pub volume_type: String,
}

fn default_volume_type() -> String {
    "filesystem".to_string()
}

impl VolumeSpec {
    pub fn validate(&self) -> Result<()> {
        require("name", &self.name)?;
        require("size", &self.size)?;
        match self.volume_type.as_str() {
            "filesystem" | "memory" => Ok(()),
            other => Err(AppError::Validation(format!(
                "unsupported volume type '{}'",
                other
            ))),
        }
    }
}

/// Result of removing a network or volume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Removal {
    pub success: bool,
    pub message: Option<String>,
}

impl From<proto::RemoveResponse> for Removal {
    fn from(r: proto::RemoveResponse) -> Self {
        Self {
            success: r.success,
            message: non_empty(r.message),
        }
    }
}

// ---- Monitoring ----

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub hostname: String,
    pub os: String,
    pub kernel_version: String,
    pub architecture: String,
    pub uptime_seconds: i64,
    pub cpu_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: i32,
    pub usage_percent: f64,
    pub load_average: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub mount_point: String,
    pub device: String,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub interface: String,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Processes {
    pub total: i32,
    pub running: i32,
}

/// Host status; also the item type of the system metrics stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub timestamp: i64,
    pub available: bool,
    pub host: Option<Host>,
    pub cpu: Option<Cpu>,
    pub memory: Option<Memory>,
    pub disks: Vec<Disk>,
    pub networks: Vec<Interface>,
    pub processes: Option<Processes>,
}

impl From<proto::SystemStatus> for SystemStatus {
    fn from(s: proto::SystemStatus) -> Self {
        Self {
            timestamp: s.timestamp,
            available: s.available,
            host: s.host.map(|h| Host {
                hostname: h.hostname,
                os: h.os,
                kernel_version: h.kernel_version,
                architecture: h.architecture,
                uptime_seconds: h.uptime_seconds,
                cpu_count: h.cpu_count,
            }),
            cpu: s.cpu.map(|c| Cpu {
                cores: c.cores,
                usage_percent: c.usage_percent,
                load_average: c.load_average,
            }),
            memory: s.memory.map(|m| Memory {
                total_bytes: m.total_bytes,
                used_bytes: m.used_bytes,
                available_bytes: m.available_bytes,
                usage_percent: m.usage_percent,
            }),
            disks: s
                .disks
                .into_iter()
                .map(|d| Disk {
                    mount_point: d.mount_point,
                    device: d.device,
                    total_bytes: d.total_bytes,
                    used_bytes: d.used_bytes,
                    usage_percent: d.usage_percent,
                })
                .collect(),
            networks: s
                .networks
                .into_iter()
                .map(|n| Interface {
                    interface: n.interface,
                    rx_bytes: n.rx_bytes,
                    tx_bytes: n.tx_bytes,
                })
                .collect(),
            processes: s.processes.map(|p| Processes {
                total: p.total,
                running: p.running,
            }),
        }
    }
}

// ---- Runtimes ----

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub name: String,
    pub language: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub size_bytes: i64,
    pub available: bool,
    pub packages: Vec<String>,
}

impl From<proto::RuntimeInfo> for Runtime {
    fn from(r: proto::RuntimeInfo) -> Self {
        Self {
            name: r.name,
            language: non_empty(r.language),
            version: non_empty(r.version),
            description: non_empty(r.description),
            size_bytes: r.size_bytes,
            available: r.available,
            packages: r.packages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRemoval {
    pub success: bool,
    pub message: Option<String>,
    pub freed_space_bytes: i64,
}

impl From<proto::RuntimeRemoveResponse> for RuntimeRemoval {
    fn from(r: proto::RuntimeRemoveResponse) -> Self {
        Self {
            success: r.success,
            message: non_empty(r.message),
            freed_space_bytes: r.freed_space_bytes,
        }
    }
}

/// Request to build and install a runtime.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeInstallRequest {
    pub runtime: String,
    /// Inline runtime definition; when empty the backend uses its catalog.
    pub spec_yaml: String,
    /// Where the definition came from, e.g. "github" or "local".
    pub source: String,
    pub force_reinstall: bool,
}

impl RuntimeInstallRequest {
    pub fn validate(&self) -> Result<()> {
        require("runtime", &self.runtime)
    }

    pub fn into_request(self) -> proto::BuildRuntimeRequest {
        proto::BuildRuntimeRequest {
            runtime: self.runtime,
            spec_yaml: self.spec_yaml,
            source: self.source,
            force_reinstall: self.force_reinstall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildProgress {
    pub phase: String,
    pub message: String,
    pub step: i32,
    pub total_steps: i32,
    pub log_line: Option<String>,
}

impl From<proto::RuntimeBuildProgress> for BuildProgress {
    fn from(p: proto::RuntimeBuildProgress) -> Self {
        Self {
            phase: p.phase,
            message: p.message,
            step: p.step,
            total_steps: p.total_steps,
            log_line: non_empty(p.log_line),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecValidation {
    pub valid: bool,
    pub message: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl From<proto::ValidateRuntimeSpecResponse> for SpecValidation {
    fn from(r: proto::ValidateRuntimeSpecResponse) -> Self {
        Self {
            valid: r.valid,
            message: non_empty(r.message),
            errors: r.errors,
            warnings: r.warnings,
        }
    }
}

/// Answer to an install request: the session to observe plus whatever the
/// backend produced during the initial window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStarted {
    pub session_id: String,
    pub runtime: String,
    pub events: Vec<BuildProgress>,
    pub completed: bool,
    pub error: Option<String>,
}

// ---- Nodes ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub address: String,
    pub secure: bool,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeListing {
    pub nodes: Vec<NodeSummary>,
    pub current: String,
    /// True when the node document could not be read and the built-in
    /// default is in use.
    pub degraded: bool,
}
