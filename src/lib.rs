//! The `jobdeck` core library.
//!
//! A control-plane gateway in front of a remote job-execution backend. It
//! keeps one pooled gRPC channel per node and service, runs unary calls with
//! deadlines and retry, relays server-streaming RPCs onto WebSocket push
//! channels and tracks runtime install sessions so late observers can attach.

pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod reliability;
pub mod server;

pub use config::Config;
pub use error::{AppError, Result};
pub use gateway::{Gateway, GatewayOptions};
