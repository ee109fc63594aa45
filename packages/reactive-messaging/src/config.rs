//! Channel configuration.
//!
//! Channel attributes live under
//! `mp.messaging.incoming.<channel>.<attr>` and
//! `mp.messaging.outgoing.<channel>.<attr>`. [`ConnectorConfig`] is the
//! read-only per-channel view a connector receives.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ConfigError;

/// Attribute selecting the connector of a channel.
pub const CONNECTOR_KEY: &str = "connector";

/// Key/value configuration lookup supplied by the host.
pub trait ConfigSource: Send + Sync + 'static {
    /// Value for a fully qualified key.
    fn get_value(&self, key: &str) -> Option<String>;

    /// Every key this source knows about, as the source spells it.
    fn property_names(&self) -> Vec<String>;
}

/// Shared configuration handle.
pub type SharedConfig = Arc<dyn ConfigSource>;

/// In-memory configuration.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: BTreeMap<String, String>,
}

impl MapConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add or replace a key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl ConfigSource for MapConfig {
    fn get_value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn property_names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

/// Process environment configuration.
///
/// A key is looked up verbatim, then with every non-alphanumeric character
/// replaced by `_`, then upper-cased:
/// `mp.messaging.incoming.in.connector` → `MP_MESSAGING_INCOMING_IN_CONNECTOR`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfig;

impl EnvConfig {
    /// Create a view over the current process environment.
    pub fn new() -> Self {
        Self
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn normalize(key: &str) -> String {
    sanitize(key).to_ascii_uppercase()
}

impl ConfigSource for EnvConfig {
    fn get_value(&self, key: &str) -> Option<String> {
        let sanitized = sanitize(key);
        [key.to_string(), sanitized.clone(), sanitized.to_ascii_uppercase()]
            .iter()
            .find_map(|candidate| env::var(candidate).ok())
    }

    fn property_names(&self) -> Vec<String> {
        env::vars().map(|(name, _)| name).collect()
    }
}

/// Direction of a channel relative to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// The broker feeds the application.
    Incoming,
    /// The application feeds the broker.
    Outgoing,
}

impl Direction {
    /// Lower-case name used in keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    /// Key prefix of a channel's attributes, including the trailing dot.
    pub fn prefix(self, channel: &str) -> String {
        format!("mp.messaging.{}.{channel}.", self.as_str())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channels that have at least one attribute configured for `direction`.
///
/// Only sources that report keys in their dotted form can be enumerated.
pub fn configured_channels(source: &dyn ConfigSource, direction: Direction) -> BTreeSet<String> {
    let head = format!("mp.messaging.{}.", direction.as_str());
    source
        .property_names()
        .iter()
        .filter_map(|key| key.strip_prefix(&head))
        .filter_map(|rest| rest.rsplit_once('.').map(|(channel, _)| channel.to_string()))
        .filter(|channel| !channel.is_empty())
        .collect()
}

/// Read-only attributes of one channel.
#[derive(Clone)]
pub struct ConnectorConfig {
    channel: String,
    direction: Direction,
    prefix: String,
    source: SharedConfig,
}

impl ConnectorConfig {
    /// View the attributes of `channel` in `direction`.
    pub fn new(source: SharedConfig, direction: Direction, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        Self {
            prefix: direction.prefix(&channel),
            channel,
            direction,
            source,
        }
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Channel direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Fully qualified key of an attribute.
    pub fn key(&self, attribute: &str) -> String {
        format!("{}{attribute}", self.prefix)
    }

    /// The `connector` attribute.
    pub fn connector_name(&self) -> Option<String> {
        self.get(CONNECTOR_KEY)
    }

    /// Whether any attribute is configured for this channel.
    pub fn has_attributes(&self) -> bool {
        if self.connector_name().is_some() {
            return true;
        }
        let prefix = normalize(&self.prefix);
        self.source
            .property_names()
            .iter()
            .any(|name| normalize(name).starts_with(&prefix))
    }

    /// Raw attribute value.
    pub fn get(&self, attribute: &str) -> Option<String> {
        self.source.get_value(&self.key(attribute))
    }

    /// Attribute value, or `default`.
    pub fn get_or(&self, attribute: &str, default: &str) -> String {
        self.get(attribute).unwrap_or_else(|| default.to_string())
    }

    /// Attribute value that must be present.
    pub fn require(&self, attribute: &str) -> Result<String, ConfigError> {
        self.get(attribute)
            .ok_or_else(|| ConfigError::MissingRequiredKey(self.key(attribute)))
    }

    /// Parse an attribute with [`FromStr`].
    pub fn get_parsed<T: FromStr>(
        &self,
        attribute: &str,
        expected: &'static str,
    ) -> Result<Option<T>, ConfigError> {
        match self.get(attribute) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: self.key(attribute),
                    value: raw,
                    expected,
                }),
        }
    }

    /// Boolean attribute (`true`/`false`, case-insensitive).
    pub fn get_bool(&self, attribute: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(attribute) {
            None => Ok(None),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue {
                    key: self.key(attribute),
                    value: raw,
                    expected: "true or false",
                }),
            },
        }
    }

    /// Unsigned integer attribute.
    pub fn get_u64(&self, attribute: &str) -> Result<Option<u64>, ConfigError> {
        self.get_parsed(attribute, "a non-negative integer")
    }

    /// Lookup of a key outside the channel namespace.
    pub fn global(&self, key: &str) -> Option<String> {
        self.source.get_value(key)
    }
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("channel", &self.channel)
            .field("direction", &self.direction)
            .finish()
    }
}
