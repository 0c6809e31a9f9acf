//! Node registry: logical node name to connection parameters.
//!
//! The node document is read lazily and trusted for a fixed time-to-live.
//! Readers inside the window share one immutable [`NodeTable`]; the first
//! reader after expiry reloads it. If the document can't be used the registry
//! degrades to a single unauthenticated loopback node.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::nodes::{DEFAULT_NODE_ADDRESS, DEFAULT_NODE_NAME};
use crate::error::{AppError, ConfigError, Result};

/// Connection parameters for one backend node.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: String,
    /// `host:port`
    pub address: String,
    /// TLS server name override; defaults to the host part of `address`.
    pub server_name: Option<String>,
    pub cert: Option<Bytes>,
    pub key: Option<Bytes>,
    pub ca: Option<Bytes>,
}

// Key material stays out of logs.
impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("server_name", &self.server_name)
            .field("cert", &self.cert.is_some())
            .field("key", &self.key.is_some())
            .field("ca", &self.ca.is_some())
            .finish()
    }
}

/// The complete mutual-TLS triple.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub cert: Bytes,
    pub key: Bytes,
    pub ca: Bytes,
}

impl fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsBundle { .. }")
    }
}

/// How a channel to a node is secured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Plaintext,
    MutualTls(TlsBundle),
}

impl Transport {
    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::MutualTls(_))
    }
}

impl NodeConfig {
    /// Unauthenticated node with no credentials.
    pub fn plaintext(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            server_name: None,
            cert: None,
            key: None,
            ca: None,
        }
    }

    /// The built-in loopback node used in degraded mode.
    pub fn builtin_default() -> Self {
        Self::plaintext(DEFAULT_NODE_NAME, DEFAULT_NODE_ADDRESS)
    }

    /// Derive the transport. Mutual TLS is all-or-nothing: a partial triple
    /// is an error, never a silent downgrade to plaintext.
    pub fn transport(&self) -> Result<Transport> {
        match (&self.cert, &self.key, &self.ca) {
            (None, None, None) => Ok(Transport::Plaintext),
            (Some(cert), Some(key), Some(ca)) => Ok(Transport::MutualTls(TlsBundle {
                cert: cert.clone(),
                key: key.clone(),
                ca: ca.clone(),
            })),
            (cert, key, ca) => {
                let missing: Vec<&str> = [("cert", cert.is_none()), ("key", key.is_none()), ("ca", ca.is_none())]
                    .into_iter()
                    .filter_map(|(field, absent)| absent.then_some(field))
                    .collect();
                Err(AppError::Configuration(ConfigError::PartialCredentials {
                    node: self.name.clone(),
                    missing: missing.join(", "),
                }))
            }
        }
    }

    /// Host part of the address, used as the default TLS server name.
    pub fn host(&self) -> &str {
        let address = self.address.trim_start_matches("https://").trim_start_matches("http://");
        match address.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => address,
        }
    }
}

/// One load generation of the node document.
#[derive(Debug, Clone)]
pub struct NodeTable {
    pub generation: u64,
    pub nodes: BTreeMap<String, Arc<NodeConfig>>,
    /// True when this table is the built-in fallback.
    pub degraded: bool,
}

impl NodeTable {
    fn fallback(generation: u64) -> Self {
        let node = NodeConfig::builtin_default();
        let mut nodes = BTreeMap::new();
        nodes.insert(node.name.clone(), Arc::new(node));
        Self {
            generation,
            nodes,
            degraded: true,
        }
    }
}

/// On-disk node document.
///
/// ```yaml
/// version: "1"
/// nodes:
///   default:
///     address: "10.0.0.5:50051"
///     cert: |
///       -----BEGIN CERTIFICATE-----
///     key: ...
///     ca: ...
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesDocument {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

impl NodesDocument {
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    fn into_configs(self) -> BTreeMap<String, Arc<NodeConfig>> {
        let blob = |value: Option<String>| {
            value
                .filter(|v| !v.trim().is_empty())
                .map(|v| Bytes::from(v.into_bytes()))
        };

        self.nodes
            .into_iter()
            .map(|(name, entry)| {
                let config = NodeConfig {
                    name: name.clone(),
                    address: entry.address,
                    server_name: entry.server_name,
                    cert: blob(entry.cert),
                    key: blob(entry.key),
                    ca: blob(entry.ca),
                };
                (name, Arc::new(config))
            })
            .collect()
    }
}

/// Where the node document comes from.
pub trait NodeSource: Send + Sync + 'static {
    fn load(&self) -> Result<NodesDocument>;

    /// Human-readable origin for log lines.
    fn describe(&self) -> String;
}

/// YAML node document on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NodeSource for FileSource {
    fn load(&self) -> Result<NodesDocument> {
        let source_error = |reason: String| {
            AppError::Configuration(ConfigError::Source {
                source_name: self.path.display().to_string(),
                reason,
            })
        };

        let text = std::fs::read_to_string(&self.path).map_err(|e| source_error(e.to_string()))?;
        NodesDocument::from_yaml(&text).map_err(|e| source_error(e.to_string()))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory node document.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    document: NodesDocument,
}

impl StaticSource {
    pub fn new(document: NodesDocument) -> Self {
        Self { document }
    }
}

impl NodeSource for StaticSource {
    fn load(&self) -> Result<NodesDocument> {
        Ok(self.document.clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

struct CachedTable {
    loaded_at: Instant,
    table: Arc<NodeTable>,
}

/// Resolves node names against a TTL-cached node document.
pub struct NodeRegistry {
    source: Box<dyn NodeSource>,
    ttl: Duration,
    cache: RwLock<Option<CachedTable>>,
    generation: AtomicU64,
}

impl NodeRegistry {
    pub fn new(source: impl NodeSource, ttl: Duration) -> Self {
        Self {
            source: Box::new(source),
            ttl,
            cache: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Current node table, reloading it if the TTL has passed.
    pub fn table(&self) -> Arc<NodeTable> {
        {
            let cache = self.cache.read();
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    return cached.table.clone();
                }
            }
        }

        let mut cache = self.cache.write();
        // Another reader may have reloaded while we waited for the write lock.
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return cached.table.clone();
            }
        }

        let table = Arc::new(self.load_table());
        *cache = Some(CachedTable {
            loaded_at: Instant::now(),
            table: table.clone(),
        });
        table
    }

    fn load_table(&self) -> NodeTable {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        match self.source.load() {
            Ok(document) => {
                let nodes = document.into_configs();
                if nodes.is_empty() {
                    warn!(
                        "Node document {} lists no nodes, using built-in {}",
                        self.source.describe(),
                        DEFAULT_NODE_ADDRESS
                    );
                    return NodeTable::fallback(generation);
                }
                info!(
                    generation,
                    nodes = nodes.len(),
                    "Loaded node document from {}",
                    self.source.describe()
                );
                NodeTable {
                    generation,
                    nodes,
                    degraded: false,
                }
            }
            Err(e) => {
                warn!(
                    "Failed to load node document ({}), using built-in {}",
                    e, DEFAULT_NODE_ADDRESS
                );
                NodeTable::fallback(generation)
            }
        }
    }

    /// Look up one node.
    pub fn resolve(&self, name: &str) -> Result<Arc<NodeConfig>> {
        let table = self.table();
        match table.nodes.get(name) {
            Some(node) => Ok(node.clone()),
            None => {
                debug!(node = name, generation = table.generation, "Node not in registry");
                Err(AppError::Configuration(ConfigError::NodeNotFound(name.to_string())))
            }
        }
    }

    /// All nodes in the current generation, ordered by name.
    pub fn list(&self) -> Vec<Arc<NodeConfig>> {
        self.table().nodes.values().cloned().collect()
    }

    /// Force the next read to reload the document.
    pub fn expire(&self) {
        *self.cache.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    const DOC: &str = r#"
version: "1"
nodes:
  default:
    address: "10.0.0.5:50051"
  secure:
    address: "prod.internal:50051"
    cert: "CERT"
    key: "KEY"
    ca: "CA"
  broken:
    address: "10.0.0.9:50051"
    cert: "CERT"
"#;

    struct CountingSource {
        loads: Arc<AtomicUsize>,
        fail: bool,
    }

    impl NodeSource for CountingSource {
        fn load(&self) -> Result<NodesDocument> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Configuration(ConfigError::Source {
                    source_name: "counting".into(),
                    reason: "unreadable".into(),
                }));
            }
            Ok(NodesDocument::from_yaml(DOC).unwrap())
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    #[test]
    fn test_reads_are_cached_within_ttl() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = NodeRegistry::new(
            CountingSource {
                loads: loads.clone(),
                fail: false,
            },
            Duration::from_secs(60),
        );

        for _ in 0..10 {
            registry.resolve("default").unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        registry.expire();
        registry.resolve("secure").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(registry.table().generation, 2);
    }

    #[test]
    fn test_zero_ttl_reloads_every_time() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = NodeRegistry::new(
            CountingSource {
                loads: loads.clone(),
                fail: false,
            },
            Duration::ZERO,
        );
        registry.resolve("default").unwrap();
        registry.resolve("default").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unreadable_source_falls_back_to_loopback() {
        let registry = NodeRegistry::new(
            CountingSource {
                loads: Arc::new(AtomicUsize::new(0)),
                fail: true,
            },
            Duration::from_secs(60),
        );

        let node = registry.resolve(DEFAULT_NODE_NAME).unwrap();
        assert_eq!(node.address, DEFAULT_NODE_ADDRESS);
        assert_eq!(node.transport().unwrap(), Transport::Plaintext);
        assert!(registry.table().degraded);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_unknown_node_is_configuration_error() {
        let registry = NodeRegistry::new(StaticSource::new(NodesDocument::from_yaml(DOC).unwrap()), Duration::from_secs(60));
        let err = registry.resolve("nope").unwrap_err();
        assert!(matches!(
            err,
            AppError::Configuration(ConfigError::NodeNotFound(ref name)) if name == "nope"
        ));
    }

    #[test]
    fn test_transport_is_all_or_nothing() {
        let registry = NodeRegistry::new(StaticSource::new(NodesDocument::from_yaml(DOC).unwrap()), Duration::from_secs(60));

        assert!(registry.resolve("secure").unwrap().transport().unwrap().is_secure());
        assert_eq!(
            registry.resolve("default").unwrap().transport().unwrap(),
            Transport::Plaintext
        );

        match registry.resolve("broken").unwrap().transport() {
            Err(AppError::Configuration(ConfigError::PartialCredentials { node, missing })) => {
                assert_eq!(node, "broken");
                assert_eq!(missing, "key, ca");
            }
            other => panic!("expected partial credential error, got {:?}", other),
        }
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOC.as_bytes()).unwrap();

        let registry = NodeRegistry::new(FileSource::new(file.path()), Duration::from_secs(60));
        let names: Vec<String> = registry.list().iter().map(|n| n.name.clone()).collect();
        assert_eq!(names, vec!["broken", "default", "secure"]);
        assert!(!registry.table().degraded);
    }

    #[test]
    fn test_host_extraction() {
        assert_eq!(NodeConfig::plaintext("a", "10.0.0.5:50051").host(), "10.0.0.5");
        assert_eq!(NodeConfig::plaintext("a", "https://node.local:443").host(), "node.local");
        assert_eq!(NodeConfig::plaintext("a", "[::1]:50051").host(), "::1");
    }
}
