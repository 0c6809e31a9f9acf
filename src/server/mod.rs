//! Web server and API implementation.
//!
//! This module provides the HTTP routes and WebSocket push channels
//! in front of the gateway.

pub mod events;
mod handlers;
mod metrics;
mod state;
mod stream;

pub use events::{PushEvent, PushKind};
pub use handlers::{create_router, health_check};
pub use metrics::ServiceMetrics;
pub use state::AppState;
pub use stream::PushChannel;
