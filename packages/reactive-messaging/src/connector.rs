//! Connectors and the registry that materializes channels from configuration.
//!
//! A [`Connector`] adapts an external transport. For every configured
//! channel the [`ConnectorRegistry`] asks the connector named by the
//! channel's `connector` attribute for an independent publisher (incoming)
//! or subscriber (outgoing).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::{ConnectorConfig, Direction, SharedConfig, CONNECTOR_KEY};
use crate::error::{ConfigError, ConnectorError};
use crate::stream::{MessageStream, Subscriber};

/// Adapter between channels and an external transport.
///
/// Called once per configured channel; every call yields independent
/// resources.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Name channels select this connector with.
    fn name(&self) -> &str;

    /// Acquire process-wide resources before any channel is materialized.
    async fn start(&self) {}

    /// Stream of an incoming channel.
    async fn publisher(&self, config: &ConnectorConfig) -> Result<MessageStream, ConnectorError> {
        let _ = config;
        Err(ConnectorError::Unsupported {
            connector: self.name().to_string(),
            direction: "incoming",
        })
    }

    /// Consumer of an outgoing channel.
    async fn subscriber(&self, config: &ConnectorConfig) -> Result<Subscriber, ConnectorError> {
        let _ = config;
        Err(ConnectorError::Unsupported {
            connector: self.name().to_string(),
            direction: "outgoing",
        })
    }

    /// Release everything, draining outbound work for at most `deadline`.
    async fn shutdown(&self, deadline: Duration) {
        let _ = deadline;
    }
}

/// Shared connector handle.
pub type SharedConnector = Arc<dyn Connector>;

/// Connectors by name plus the configuration they read.
pub struct ConnectorRegistry {
    connectors: HashMap<String, SharedConnector>,
    order: Vec<String>,
    config: SharedConfig,
}

impl ConnectorRegistry {
    /// Create an empty registry reading `config`.
    pub fn new(config: SharedConfig) -> Self {
        Self {
            connectors: HashMap::new(),
            order: Vec::new(),
            config,
        }
    }

    /// Register a connector under its own name. A later registration with
    /// the same name replaces the earlier one.
    pub fn register(&mut self, connector: SharedConnector) {
        let name = connector.name().to_string();
        if self.connectors.insert(name.clone(), connector).is_none() {
            self.order.push(name);
        }
    }

    /// Connector registered as `name`.
    pub fn get(&self, name: &str) -> Option<SharedConnector> {
        self.connectors.get(name).cloned()
    }

    /// The configuration every channel view reads from.
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Per-channel configuration view.
    pub fn channel_config(&self, direction: Direction, channel: &str) -> ConnectorConfig {
        ConnectorConfig::new(self.config.clone(), direction, channel)
    }

    /// Whether `channel` has any attribute configured for `direction`.
    pub fn is_configured(&self, direction: Direction, channel: &str) -> bool {
        self.channel_config(direction, channel).has_attributes()
    }

    fn select(&self, config: &ConnectorConfig) -> Option<Result<SharedConnector, ConnectorError>> {
        if !config.has_attributes() {
            return None;
        }
        let Some(name) = config.connector_name() else {
            return Some(Err(ConfigError::MissingRequiredKey(config.key(CONNECTOR_KEY)).into()));
        };
        Some(
            self.get(&name)
                .ok_or_else(|| ConfigError::UnknownConnector(name).into()),
        )
    }

    /// Materialize an incoming channel. `None` when the channel is not
    /// configured at all.
    pub async fn materialize_publisher(
        &self,
        channel: &str,
    ) -> Option<Result<MessageStream, ConnectorError>> {
        let config = self.channel_config(Direction::Incoming, channel);
        let connector = match self.select(&config)? {
            Ok(connector) => connector,
            Err(e) => return Some(Err(e)),
        };
        debug!(channel = %channel, connector = %connector.name(), "materializing incoming channel");
        Some(connector.publisher(&config).await)
    }

    /// Materialize an outgoing channel. `None` when the channel is not
    /// configured at all.
    pub async fn materialize_subscriber(
        &self,
        channel: &str,
    ) -> Option<Result<Subscriber, ConnectorError>> {
        let config = self.channel_config(Direction::Outgoing, channel);
        let connector = match self.select(&config)? {
            Ok(connector) => connector,
            Err(e) => return Some(Err(e)),
        };
        debug!(channel = %channel, connector = %connector.name(), "materializing outgoing channel");
        Some(connector.subscriber(&config).await)
    }

    /// Start every connector, in registration order.
    pub async fn start_all(&self) {
        for name in &self.order {
            if let Some(connector) = self.connectors.get(name) {
                connector.start().await;
                debug!(connector = %name, "connector started");
            }
        }
    }

    /// Shut every connector down, in registration order.
    pub async fn shutdown_all(&self, deadline: Duration) {
        for name in &self.order {
            if let Some(connector) = self.connectors.get(name) {
                connector.shutdown(deadline).await;
                info!(connector = %name, "connector shut down");
            }
        }
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("connectors", &self.order)
            .finish()
    }
}
