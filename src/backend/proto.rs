//! Wire messages for the `jobdeck.v1` backend services.
//!
//! These mirror the externally versioned protobuf schema field-for-field.
//! Nothing outside `backend` and the decoding in `gateway::types` should look
//! at them.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmptyRequest {}

// ---- JobService ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Job {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub command: String,
    #[prost(string, repeated, tag = "4")]
    pub args: Vec<String>,
    #[prost(int32, tag = "5")]
    pub max_cpu: i32,
    #[prost(string, tag = "6")]
    pub cpu_cores: String,
    #[prost(int32, tag = "7")]
    pub max_memory: i32,
    #[prost(int32, tag = "8")]
    pub max_iobps: i32,
    #[prost(string, tag = "9")]
    pub status: String,
    #[prost(string, tag = "10")]
    pub start_time: String,
    #[prost(string, tag = "11")]
    pub end_time: String,
    #[prost(int32, tag = "12")]
    pub exit_code: i32,
    #[prost(string, tag = "13")]
    pub scheduled_time: String,
    #[prost(string, tag = "14")]
    pub runtime: String,
    #[prost(string, tag = "15")]
    pub network: String,
    #[prost(string, repeated, tag = "16")]
    pub volumes: Vec<String>,
    #[prost(map = "string, string", tag = "17")]
    pub environment: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Jobs {
    #[prost(message, repeated, tag = "1")]
    pub jobs: Vec<Job>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunJobRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub command: String,
    #[prost(string, repeated, tag = "3")]
    pub args: Vec<String>,
    #[prost(int32, tag = "4")]
    pub max_cpu: i32,
    #[prost(string, tag = "5")]
    pub cpu_cores: String,
    #[prost(int32, tag = "6")]
    pub max_memory: i32,
    #[prost(int32, tag = "7")]
    pub max_iobps: i32,
    #[prost(string, tag = "8")]
    pub schedule: String,
    #[prost(string, tag = "9")]
    pub network: String,
    #[prost(string, repeated, tag = "10")]
    pub volumes: Vec<String>,
    #[prost(string, tag = "11")]
    pub runtime: String,
    #[prost(string, tag = "12")]
    pub work_dir: String,
    #[prost(map = "string, string", tag = "13")]
    pub environment: HashMap<String, String>,
    #[prost(map = "string, string", tag = "14")]
    pub secret_environment: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunJobResponse {
    #[prost(string, tag = "1")]
    pub job_uuid: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub status: String,
    #[prost(string, tag = "4")]
    pub command: String,
    #[prost(string, repeated, tag = "5")]
    pub args: Vec<String>,
    #[prost(string, tag = "6")]
    pub start_time: String,
    #[prost(string, tag = "7")]
    pub scheduled_time: String,
}

/// Addresses one job by uuid (status, stop, delete, logs).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopJobResponse {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(string, tag = "3")]
    pub end_time: String,
    #[prost(int32, tag = "4")]
    pub exit_code: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteJobResponse {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteAllJobsResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(int32, tag = "3")]
    pub deleted_count: i32,
    #[prost(int32, tag = "4")]
    pub skipped_count: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataChunk {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobMetricsRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(int32, tag = "2")]
    pub interval_seconds: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobMetricsSample {
    #[prost(string, tag = "1")]
    pub job_uuid: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(double, tag = "3")]
    pub cpu_percent: f64,
    #[prost(int64, tag = "4")]
    pub memory_bytes: i64,
    #[prost(int64, tag = "5")]
    pub memory_limit_bytes: i64,
    #[prost(int64, tag = "6")]
    pub io_read_bytes: i64,
    #[prost(int64, tag = "7")]
    pub io_write_bytes: i64,
    #[prost(int64, tag = "8")]
    pub net_rx_bytes: i64,
    #[prost(int64, tag = "9")]
    pub net_tx_bytes: i64,
    #[prost(int32, tag = "10")]
    pub process_count: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobTelemetryRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, repeated, tag = "2")]
    pub types: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TelemetryEvent {
    #[prost(string, tag = "1")]
    pub job_uuid: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(string, tag = "3")]
    pub kind: String,
    #[prost(int32, tag = "4")]
    pub pid: i32,
    #[prost(string, tag = "5")]
    pub comm: String,
    #[prost(map = "string, string", tag = "6")]
    pub detail: HashMap<String, String>,
}

// ---- NetworkService ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NetworkInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub cidr: String,
    #[prost(string, tag = "3")]
    pub bridge: String,
    #[prost(int32, tag = "4")]
    pub job_count: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Networks {
    #[prost(message, repeated, tag = "1")]
    pub networks: Vec<NetworkInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateNetworkRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub cidr: String,
}

/// Addresses a network or volume by name.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NameRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

// ---- VolumeService ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VolumeInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub size: String,
    #[prost(string, tag = "3")]
    pub volume_type: String,
    #[prost(string, tag = "4")]
    pub path: String,
    #[prost(string, tag = "5")]
    pub created_time: String,
    #[prost(int32, tag = "6")]
    pub job_count: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Volumes {
    #[prost(message, repeated, tag = "1")]
    pub volumes: Vec<VolumeInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateVolumeRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub size: String,
    #[prost(string, tag = "3")]
    pub volume_type: String,
}

// ---- MonitoringService ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostInfo {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(string, tag = "2")]
    pub os: String,
    #[prost(string, tag = "3")]
    pub kernel_version: String,
    #[prost(string, tag = "4")]
    pub architecture: String,
    #[prost(int64, tag = "5")]
    pub uptime_seconds: i64,
    #[prost(int32, tag = "6")]
    pub cpu_count: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CpuMetrics {
    #[prost(int32, tag = "1")]
    pub cores: i32,
    #[prost(double, tag = "2")]
    pub usage_percent: f64,
    #[prost(double, repeated, tag = "3")]
    pub load_average: Vec<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemoryMetrics {
    #[prost(int64, tag = "1")]
    pub total_bytes: i64,
    #[prost(int64, tag = "2")]
    pub used_bytes: i64,
    #[prost(int64, tag = "3")]
    pub available_bytes: i64,
    #[prost(double, tag = "4")]
    pub usage_percent: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiskMetrics {
    #[prost(string, tag = "1")]
    pub mount_point: String,
    #[prost(string, tag = "2")]
    pub device: String,
    #[prost(int64, tag = "3")]
    pub total_bytes: i64,
    #[prost(int64, tag = "4")]
    pub used_bytes: i64,
    #[prost(double, tag = "5")]
    pub usage_percent: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InterfaceMetrics {
    #[prost(string, tag = "1")]
    pub interface: String,
    #[prost(int64, tag = "2")]
    pub rx_bytes: i64,
    #[prost(int64, tag = "3")]
    pub tx_bytes: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessMetrics {
    #[prost(int32, tag = "1")]
    pub total: i32,
    #[prost(int32, tag = "2")]
    pub running: i32,
}

/// Unary status answer and streamed metric sample share one shape.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SystemStatus {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(bool, tag = "2")]
    pub available: bool,
    #[prost(message, optional, tag = "3")]
    pub host: Option<HostInfo>,
    #[prost(message, optional, tag = "4")]
    pub cpu: Option<CpuMetrics>,
    #[prost(message, optional, tag = "5")]
    pub memory: Option<MemoryMetrics>,
    #[prost(message, repeated, tag = "6")]
    pub disks: Vec<DiskMetrics>,
    #[prost(message, repeated, tag = "7")]
    pub networks: Vec<InterfaceMetrics>,
    #[prost(message, optional, tag = "8")]
    pub processes: Option<ProcessMetrics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamMetricsRequest {
    #[prost(int32, tag = "1")]
    pub interval_seconds: i32,
    #[prost(string, repeated, tag = "2")]
    pub metric_types: Vec<String>,
}

// ---- RuntimeService ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub language: String,
    #[prost(string, tag = "3")]
    pub version: String,
    #[prost(string, tag = "4")]
    pub description: String,
    #[prost(int64, tag = "5")]
    pub size_bytes: i64,
    #[prost(bool, tag = "6")]
    pub available: bool,
    #[prost(string, repeated, tag = "7")]
    pub packages: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Runtimes {
    #[prost(message, repeated, tag = "1")]
    pub runtimes: Vec<RuntimeInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeRequest {
    #[prost(string, tag = "1")]
    pub runtime: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeInfoResponse {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(message, optional, tag = "2")]
    pub runtime: Option<RuntimeInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeRemoveResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(int64, tag = "3")]
    pub freed_space_bytes: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BuildRuntimeRequest {
    #[prost(string, tag = "1")]
    pub runtime: String,
    #[prost(string, tag = "2")]
    pub spec_yaml: String,
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(bool, tag = "4")]
    pub force_reinstall: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeBuildProgress {
    #[prost(string, tag = "1")]
    pub phase: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(int32, tag = "3")]
    pub step: i32,
    #[prost(int32, tag = "4")]
    pub total_steps: i32,
    #[prost(string, tag = "5")]
    pub log_line: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValidateRuntimeSpecRequest {
    #[prost(string, tag = "1")]
    pub spec_yaml: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValidateRuntimeSpecResponse {
    #[prost(bool, tag = "1")]
    pub valid: bool,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, repeated, tag = "3")]
    pub errors: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_optional_submessages_survive_encoding() {
        let status = SystemStatus {
            timestamp: 1_700_000_000,
            available: true,
            cpu: Some(CpuMetrics {
                cores: 8,
                usage_percent: 12.5,
                load_average: vec![0.5, 0.4, 0.3],
            }),
            ..Default::default()
        };

        let decoded = SystemStatus::decode(status.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.cpu.unwrap().load_average, vec![0.5, 0.4, 0.3]);
        assert!(decoded.host.is_none());
    }
}
