//! Channel construction.
//!
//! The connection cache owns *when* channels are built; a [`Connector`] owns
//! *how*. The production connector builds lazily-connecting tonic channels
//! with HTTP/2 keep-alives so that silently dead peers are detected.

use std::time::Duration;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::debug;

use crate::backend::ServiceId;
use crate::config::timeouts;
use crate::error::{AppError, ConfigError, Result};
use crate::gateway::registry::{NodeConfig, Transport};

/// Keep-alive and connect parameters applied to every channel.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_timeout: timeouts::CONNECT_TIMEOUT,
            keepalive_interval: timeouts::KEEPALIVE_INTERVAL,
            keepalive_timeout: timeouts::KEEPALIVE_TIMEOUT,
        }
    }
}

/// Builds a channel for one (node, service) pair.
///
/// Construction must not perform network I/O: it runs while the cache holds
/// the lock for the key.
pub trait Connector: Send + Sync + 'static {
    type Channel: Clone + Send + Sync + 'static;

    fn connect(
        &self,
        node: &NodeConfig,
        transport: &Transport,
        service: ServiceId,
    ) -> Result<Self::Channel>;
}

/// Connector producing tonic channels.
#[derive(Debug, Clone, Default)]
pub struct TonicConnector {
    settings: ChannelSettings,
}

impl TonicConnector {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }

    fn endpoint(&self, node: &NodeConfig, transport: &Transport) -> Result<Endpoint> {
        let scheme = if transport.is_secure() { "https" } else { "http" };
        let address = node
            .address
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        let uri = format!("{}://{}", scheme, address);

        let endpoint = Endpoint::from_shared(uri).map_err(|e| {
            AppError::Configuration(ConfigError::InvalidAddress {
                node: node.name.clone(),
                address: node.address.clone(),
                reason: e.to_string(),
            })
        })?;

        let endpoint = endpoint
            .connect_timeout(self.settings.connect_timeout)
            .http2_keep_alive_interval(self.settings.keepalive_interval)
            .keep_alive_timeout(self.settings.keepalive_timeout)
            .keep_alive_while_idle(true)
            .tcp_keepalive(Some(self.settings.keepalive_interval))
            .tcp_nodelay(true);

        match transport {
            Transport::Plaintext => Ok(endpoint),
            Transport::MutualTls(bundle) => {
                let server_name = node
                    .server_name
                    .clone()
                    .unwrap_or_else(|| node.host().to_string());
                let tls = ClientTlsConfig::new()
                    .ca_certificate(Certificate::from_pem(bundle.ca.clone()))
                    .identity(Identity::from_pem(bundle.cert.clone(), bundle.key.clone()))
                    .domain_name(server_name);

                endpoint.tls_config(tls).map_err(|e| {
                    AppError::Configuration(ConfigError::Tls {
                        node: node.name.clone(),
                        reason: e.to_string(),
                    })
                })
            }
        }
    }
}

impl Connector for TonicConnector {
    type Channel = Channel;

    fn connect(
        &self,
        node: &NodeConfig,
        transport: &Transport,
        service: ServiceId,
    ) -> Result<Channel> {
        let endpoint = self.endpoint(node, transport)?;
        debug!(
            node = %node.name,
            service = %service,
            secure = transport.is_secure(),
            "Building lazy channel to {}",
            node.address
        );
        Ok(endpoint.connect_lazy())
    }
}
