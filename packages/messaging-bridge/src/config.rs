use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use reactive_messaging::{ConfigSource, MapConfig, CONNECTOR_KEY};
use reactive_messaging_jms::JMS_CONNECTOR;
use std::env;
use std::time::Duration;

const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 5;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 500;

/// One forwarding route: everything read from `incoming` is sent to
/// `outgoing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub incoming: String,
    pub outgoing: String,
}

/// Bridge configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub routes: Vec<Route>,
    pub shutdown_deadline: Duration,
    pub health_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let routes = lookup("BRIDGE_ROUTES").context("BRIDGE_ROUTES must be set")?;
        let config = Self {
            routes: parse_routes(&routes)?,
            shutdown_deadline: Duration::from_secs(
                lookup("BRIDGE_SHUTDOWN_DEADLINE_SECS")
                    .map(|v| v.parse::<u64>())
                    .transpose()
                    .context("BRIDGE_SHUTDOWN_DEADLINE_SECS must be a valid number")?
                    .unwrap_or(DEFAULT_SHUTDOWN_DEADLINE_SECS),
            ),
            health_interval: Duration::from_millis(
                lookup("BRIDGE_HEALTH_INTERVAL_MS")
                    .map(|v| v.parse::<u64>())
                    .transpose()
                    .context("BRIDGE_HEALTH_INTERVAL_MS must be a valid number")?
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_MS),
            ),
        };
        if config.health_interval.is_zero() {
            bail!("BRIDGE_HEALTH_INTERVAL_MS must be greater than zero");
        }
        Ok(config)
    }

    /// Channel attributes every route needs: both ends use the JMS
    /// connector unless the environment says otherwise.
    pub fn channel_defaults(&self) -> MapConfig {
        let mut defaults = MapConfig::new();
        for route in &self.routes {
            defaults.insert(
                format!("mp.messaging.incoming.{}.{CONNECTOR_KEY}", route.incoming),
                JMS_CONNECTOR,
            );
            defaults.insert(
                format!("mp.messaging.outgoing.{}.{CONNECTOR_KEY}", route.outgoing),
                JMS_CONNECTOR,
            );
        }
        defaults
    }
}

/// Parse `in:out[,in:out]`.
pub fn parse_routes(value: &str) -> Result<Vec<Route>> {
    let mut routes = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((incoming, outgoing)) = entry.split_once(':') else {
            bail!("route {entry:?} must look like in:out");
        };
        let (incoming, outgoing) = (incoming.trim(), outgoing.trim());
        if incoming.is_empty() || outgoing.is_empty() {
            bail!("route {entry:?} has an empty channel name");
        }
        if incoming == outgoing {
            bail!("route {entry:?} reads and writes the same channel");
        }
        routes.push(Route {
            incoming: incoming.to_string(),
            outgoing: outgoing.to_string(),
        });
    }
    if routes.is_empty() {
        bail!("BRIDGE_ROUTES lists no routes");
    }
    Ok(routes)
}

/// Looks a key up in `primary`, then in `defaults`.
pub struct Layered<P> {
    primary: P,
    defaults: MapConfig,
}

impl<P: ConfigSource> Layered<P> {
    pub fn new(primary: P, defaults: MapConfig) -> Self {
        Self { primary, defaults }
    }
}

impl<P: ConfigSource> ConfigSource for Layered<P> {
    fn get_value(&self, key: &str) -> Option<String> {
        self.primary
            .get_value(key)
            .or_else(|| self.defaults.get_value(key))
    }

    fn property_names(&self) -> Vec<String> {
        let mut names = self.defaults.property_names();
        names.extend(self.primary.property_names());
        names
    }
}
