//! JMS channel and pool configuration.
//!
//! Parsed once per channel from the generic [`ConnectorConfig`] view, so a
//! bad value fails materialization of that channel only.

use std::time::Duration;

use reactive_messaging::{ConfigError, ConfigSource, ConnectorConfig};

use crate::api::{DeliveryMode, Destination, DestinationType, SendOptions, SessionMode};

/// Global key: upper bound on worker threads.
pub const MAX_POOL_SIZE_KEY: &str = "smallrye.jms.threads.max-pool-size";

/// Global key: idle worker lifetime, in seconds.
pub const POOL_TTL_KEY: &str = "smallrye.jms.threads.ttl";

/// Default upper bound on worker threads.
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

/// Default idle worker lifetime.
pub const DEFAULT_POOL_TTL: Duration = Duration::from_secs(60);

/// Shared worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live workers.
    pub max_size: usize,
    /// How long an idle worker waits for work before exiting.
    pub ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_POOL_SIZE,
            ttl: DEFAULT_POOL_TTL,
        }
    }
}

impl PoolConfig {
    /// Read the global pool keys, falling back to the defaults.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let max_size = match source.get_value(MAX_POOL_SIZE_KEY) {
            None => DEFAULT_MAX_POOL_SIZE,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: MAX_POOL_SIZE_KEY.to_string(),
                        value: raw,
                        expected: "a positive integer",
                    })
                }
            },
        };
        let ttl = match source.get_value(POOL_TTL_KEY) {
            None => DEFAULT_POOL_TTL,
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue {
                    key: POOL_TTL_KEY.to_string(),
                    value: raw,
                    expected: "a number of seconds",
                })?,
        };
        Ok(Self { max_size, ttl })
    }
}

/// Everything a binding needs to know about its channel.
#[derive(Debug, Clone)]
pub struct JmsChannelConfig {
    /// Channel name.
    pub channel: String,
    /// Queue or topic the binding reads or writes.
    pub destination: Destination,
    /// Bean name of the connection factory to use.
    pub connection_factory_name: Option<String>,
    /// Session user.
    pub username: Option<String>,
    /// Session password.
    pub password: Option<String>,
    /// Acknowledgement discipline.
    pub session_mode: SessionMode,
    /// Inbound message selector.
    pub selector: Option<String>,
    /// Outbound delivery mode.
    pub delivery_mode: Option<DeliveryMode>,
    /// Outbound delivery delay.
    pub delivery_delay: Option<Duration>,
    /// Outbound time to live.
    pub ttl: Option<Duration>,
    /// Outbound priority, `0..=9`.
    pub priority: Option<u8>,
    /// Outbound correlation id.
    pub correlation_id: Option<String>,
    /// Outbound reply-to destination.
    pub reply_to: Option<Destination>,
    /// Do not assign message ids on send.
    pub disable_message_id: bool,
    /// Do not assign timestamps on send.
    pub disable_message_timestamp: bool,
}

fn destination_type(config: &ConnectorConfig, attribute: &str) -> Result<DestinationType, ConfigError> {
    let raw = config.get_or(attribute, "queue");
    match raw.trim().to_ascii_lowercase().as_str() {
        "queue" => Ok(DestinationType::Queue),
        "topic" => Ok(DestinationType::Topic),
        _ => Err(ConfigError::InvalidValue {
            key: config.key(attribute),
            value: raw,
            expected: "queue or topic",
        }),
    }
}

fn millis(config: &ConnectorConfig, attribute: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(config.get_u64(attribute)?.map(Duration::from_millis))
}

impl JmsChannelConfig {
    /// Parse the attributes of one channel.
    pub fn parse(config: &ConnectorConfig) -> Result<Self, ConfigError> {
        let channel = config.channel().to_string();
        let name = config.get("destination").unwrap_or_else(|| channel.clone());
        let destination = Destination {
            name,
            kind: destination_type(config, "destination-type")?,
        };

        let session_mode = match config.get("session-mode") {
            Some(raw) => raw.parse::<SessionMode>()?,
            None => SessionMode::default(),
        };

        let delivery_mode = match config.get("delivery-mode") {
            None => None,
            Some(raw) => Some(raw.parse::<DeliveryMode>().map_err(|_| {
                ConfigError::InvalidValue {
                    key: config.key("delivery-mode"),
                    value: raw.clone(),
                    expected: "PERSISTENT or NON_PERSISTENT",
                }
            })?),
        };

        let priority = match config.get_parsed::<u8>("priority", "an integer between 0 and 9")? {
            Some(p) if p > 9 => {
                return Err(ConfigError::InvalidValue {
                    key: config.key("priority"),
                    value: p.to_string(),
                    expected: "an integer between 0 and 9",
                })
            }
            other => other,
        };

        let reply_to = match config.get("reply-to") {
            None => None,
            Some(name) => Some(Destination {
                name,
                kind: destination_type(config, "reply-to-destination-type")?,
            }),
        };

        Ok(Self {
            channel,
            destination,
            connection_factory_name: config.get("connection-factory-name"),
            username: config.get("username"),
            password: config.get("password"),
            session_mode,
            selector: config.get("selector").filter(|s| !s.trim().is_empty()),
            delivery_mode,
            delivery_delay: millis(config, "delivery-delay")?,
            ttl: millis(config, "ttl")?,
            priority,
            correlation_id: config.get("correlation-id"),
            reply_to,
            disable_message_id: config.get_bool("disable-message-id")?.unwrap_or(false),
            disable_message_timestamp: config
                .get_bool("disable-message-timestamp")?
                .unwrap_or(false),
        })
    }

    /// Producer options derived from the outbound attributes.
    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            delivery_mode: self.delivery_mode,
            delivery_delay: self.delivery_delay,
            time_to_live: self.ttl,
            priority: self.priority,
            disable_message_id: self.disable_message_id,
            disable_message_timestamp: self.disable_message_timestamp,
        }
    }
}
