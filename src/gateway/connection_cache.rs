//! Connection cache: one pooled channel per (node, service) pair.
//!
//! Entries are created on first use and evicted on connectivity failures, on
//! credential changes picked up by a registry reload, and when the current
//! node is switched away from. Insertion and eviction happen under the map's
//! shard lock, so a reader only ever receives a fully built, live handle.
//! Handles already handed out stay usable after eviction; in-flight calls
//! finish on the channel they started on.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::ServiceId;
use crate::error::Result;
use crate::gateway::connector::Connector;
use crate::gateway::registry::{NodeConfig, NodeRegistry, Transport};

/// Cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub node: String,
    pub service: ServiceId,
}

/// A cached channel plus the configuration snapshot it was built from.
pub struct ChannelHandle<Ch> {
    id: u64,
    key: CacheKey,
    channel: Ch,
    config: Arc<NodeConfig>,
    transport: Transport,
    created_at: Instant,
    closed: AtomicBool,
}

impl<Ch> ChannelHandle<Ch> {
    /// Unique per construction; a rebuilt channel always gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &str {
        &self.key.node
    }

    pub fn service(&self) -> ServiceId {
        self.key.service
    }

    pub fn channel(&self) -> &Ch {
        &self.channel
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True once the cache has dropped this handle.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl<Ch> fmt::Debug for ChannelHandle<Ch> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("node", &self.key.node)
            .field("service", &self.key.service)
            .field("secure", &self.transport.is_secure())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub current_node: String,
    pub created_total: u64,
    pub evicted_total: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache: {} live channels, {} created, {} evicted, current node '{}'",
            self.entries, self.created_total, self.evicted_total, self.current_node
        )
    }
}

/// Shared channel cache, constructed once per process and injected.
pub struct ConnectionCache<C: Connector> {
    registry: Arc<NodeRegistry>,
    connector: C,
    entries: DashMap<CacheKey, Arc<ChannelHandle<C::Channel>>>,
    current: RwLock<String>,
    next_id: AtomicU64,
    evicted: AtomicU64,
}

impl<C: Connector> ConnectionCache<C> {
    pub fn new(registry: Arc<NodeRegistry>, connector: C, initial_node: impl Into<String>) -> Self {
        Self {
            registry,
            connector,
            entries: DashMap::new(),
            current: RwLock::new(initial_node.into()),
            next_id: AtomicU64::new(1),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Node used by callers that don't name one.
    pub fn current_node(&self) -> String {
        self.current.read().clone()
    }

    /// Explicit node, or the current one.
    pub fn node_or_current(&self, node: Option<&str>) -> String {
        match node {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.current_node(),
        }
    }

    /// Return the live channel for a key, building it if needed.
    ///
    /// Fails fast with a configuration error for unknown nodes and partial
    /// credential bundles; nothing is cached in that case.
    pub fn get_channel(
        &self,
        node: Option<&str>,
        service: ServiceId,
    ) -> Result<Arc<ChannelHandle<C::Channel>>> {
        let key = CacheKey {
            node: self.node_or_current(node),
            service,
        };
        let config = self.registry.resolve(&key.node)?;

        if let Some(entry) = self.entries.get(&key) {
            if entry.config == config {
                debug!(node = %key.node, service = %service, id = entry.id, "Reusing cached channel");
                return Ok(entry.value().clone());
            }
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().config == config {
                    return Ok(occupied.get().clone());
                }
                // The node document changed under this entry.
                let fresh = self.build(occupied.key().clone(), config)?;
                let stale = occupied.insert(fresh.clone());
                self.retire(&stale, "node configuration changed");
                Ok(fresh)
            }
            Entry::Vacant(vacant) => {
                let fresh = self.build(vacant.key().clone(), config)?;
                vacant.insert(fresh.clone());
                Ok(fresh)
            }
        }
    }

    fn build(
        &self,
        key: CacheKey,
        config: Arc<NodeConfig>,
    ) -> Result<Arc<ChannelHandle<C::Channel>>> {
        let transport = config.transport()?;
        let channel = self.connector.connect(&config, &transport, key.service)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        counter!("gateway_channels_created_total", "service" => key.service.as_str()).increment(1);
        info!(
            node = %key.node,
            service = %key.service,
            id,
            secure = transport.is_secure(),
            "Created channel"
        );

        Ok(Arc::new(ChannelHandle {
            id,
            key,
            channel,
            config,
            transport,
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        }))
    }

    fn retire(&self, handle: &ChannelHandle<C::Channel>, reason: &str) {
        handle.close();
        self.evicted.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_channels_evicted_total", "service" => handle.key.service.as_str())
            .increment(1);
        debug!(
            node = %handle.key.node,
            service = %handle.key.service,
            id = handle.id,
            age_secs = handle.age().as_secs(),
            "Evicted channel: {}",
            reason
        );
    }

    /// Evict exactly this handle if it is still the cached one.
    ///
    /// Several calls failing on the same channel may all report it; only the
    /// first removes it, and a replacement built meanwhile is left alone.
    pub fn evict(&self, handle: &ChannelHandle<C::Channel>) -> bool {
        match self.entries.remove_if(&handle.key, |_, cached| cached.id == handle.id) {
            Some((_, removed)) => {
                self.retire(&removed, "connectivity failure");
                true
            }
            None => false,
        }
    }

    /// Evict every entry for a node. Idempotent.
    pub fn invalidate(&self, node: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, handle| {
            if key.node == node {
                self.retire(handle, "node invalidated");
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Make `node` the current node and drop channels tied to the previous one.
    ///
    /// Returns the previous node name. Unknown nodes are rejected and leave the
    /// pointer unchanged.
    pub fn switch_node(&self, node: &str) -> Result<String> {
        self.registry.resolve(node)?;

        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, node.to_string())
        };

        if previous != node {
            let removed = self.invalidate(&previous);
            info!(
                "Switched current node '{}' -> '{}', dropped {} channels",
                previous, node, removed
            );
        }
        Ok(previous)
    }

    /// Drop every channel. Used at shutdown.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, handle| {
            self.retire(handle, "cache cleared");
            removed += 1;
            false
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            current_node: self.current_node(),
            created_total: self.next_id.load(Ordering::Relaxed) - 1,
            evicted_total: self.evicted.load(Ordering::Relaxed),
        }
    }
}
