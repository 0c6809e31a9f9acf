//! Job-execution backend integration.
//!
//! This module provides the wire messages and the gRPC client used to reach
//! the backend's job, network, volume, monitoring and runtime services.

mod client;
pub mod proto;
mod service;

pub use client::{BackendClient, BackendStream, BackendTransport};
pub use service::{jobs, monitoring, networks, runtimes, volumes, Method, ServiceId};
