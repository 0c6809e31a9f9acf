//! Gateway layer between the HTTP surface and the backend nodes.
//!
//! - [`registry`]: node name to address and credentials, TTL cached
//! - [`connection_cache`]: one pooled channel per (node, service)
//! - [`executor`]: deadlines, retries and eviction for unary calls
//! - [`relay`]: one backend stream to one cancellable subscription
//! - [`install`]: background install sessions with late-joining observers
//! - [`facade`]: the [`Gateway`] tying them together

pub mod connection_cache;
pub mod connector;
pub mod executor;
pub mod facade;
pub mod install;
pub mod registry;
pub mod relay;
pub mod types;

pub use connection_cache::{CacheKey, CacheStats, ChannelHandle, ConnectionCache};
pub use connector::{ChannelSettings, Connector, TonicConnector};
pub use executor::{Attempt, CallClass, CallSpec, Deadlines, ResilientExecutor, RetryPolicy};
pub use facade::{Gateway, GatewayOptions};
pub use install::{
    InstallSessionTracker, ObservedEvent, Outcome, SessionObserver, SessionStatus,
};
pub use registry::{
    FileSource, NodeConfig, NodeRegistry, NodeSource, NodesDocument, StaticSource, Transport,
};
pub use relay::{attach, RelayEvent, RelayState, Subscription};
