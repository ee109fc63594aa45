//! Broker client abstraction.
//!
//! A trait-based broker client so the connector can run against a real
//! JMS-style broker or the in-process [`InMemoryBroker`](crate::InMemoryBroker).
//! The client is synchronous: calls block the calling thread, which is why
//! the connector drives it from pooled worker threads.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reactive_messaging::{ConfigError, Metadata};
use thiserror::Error;

// =============================================================================
// Session Modes
// =============================================================================

/// Broker-level acknowledgement discipline of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// The session acknowledges each message on receive.
    #[default]
    AutoAcknowledge,
    /// Receipts and sends are committed or rolled back together.
    SessionTransacted,
    /// The application acknowledges; one acknowledgement covers every
    /// message consumed so far by the session.
    ClientAcknowledge,
    /// Lazy acknowledgement on receive; duplicates are possible.
    DupsOkAcknowledge,
}

impl SessionMode {
    /// Configuration spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::AutoAcknowledge => "AUTO_ACKNOWLEDGE",
            SessionMode::SessionTransacted => "SESSION_TRANSACTED",
            SessionMode::ClientAcknowledge => "CLIENT_ACKNOWLEDGE",
            SessionMode::DupsOkAcknowledge => "DUPS_OK_ACKNOWLEDGE",
        }
    }

    /// Whether the broker settles messages without the application.
    pub fn acknowledges_on_receive(self) -> bool {
        matches!(
            self,
            SessionMode::AutoAcknowledge | SessionMode::DupsOkAcknowledge
        )
    }
}

impl FromStr for SessionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTO_ACKNOWLEDGE" => Ok(SessionMode::AutoAcknowledge),
            "SESSION_TRANSACTED" => Ok(SessionMode::SessionTransacted),
            "CLIENT_ACKNOWLEDGE" => Ok(SessionMode::ClientAcknowledge),
            "DUPS_OK_ACKNOWLEDGE" => Ok(SessionMode::DupsOkAcknowledge),
            _ => Err(ConfigError::UnknownSessionMode(s.to_string())),
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Destinations
// =============================================================================

/// Point-to-point or publish-subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DestinationType {
    /// Each message goes to one consumer.
    #[default]
    Queue,
    /// Each message goes to every subscriber.
    Topic,
}

impl DestinationType {
    /// Lower-case spelling used in configuration and URIs.
    pub fn as_str(self) -> &'static str {
        match self {
            DestinationType::Queue => "queue",
            DestinationType::Topic => "topic",
        }
    }
}

/// A named queue or topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Destination name.
    pub name: String,
    /// Queue or topic.
    pub kind: DestinationType,
}

impl Destination {
    /// A queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationType::Queue,
        }
    }

    /// A topic.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationType::Topic,
        }
    }

    /// Parse the `queue://name` / `topic://name` form written by
    /// [`Display`](fmt::Display).
    pub fn parse_uri(uri: &str) -> Option<Self> {
        if let Some(name) = uri.strip_prefix("queue://") {
            Some(Self::queue(name))
        } else {
            uri.strip_prefix("topic://").map(Self::topic)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.as_str(), self.name)
    }
}

/// Whether the broker must persist a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Survives a broker restart.
    #[default]
    Persistent,
    /// May be lost on broker failure.
    NonPersistent,
}

impl DeliveryMode {
    /// Configuration spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Persistent => "PERSISTENT",
            DeliveryMode::NonPersistent => "NON_PERSISTENT",
        }
    }

    /// Numeric header value (`1` non-persistent, `2` persistent).
    pub fn code(self) -> i64 {
        match self {
            DeliveryMode::NonPersistent => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DeliveryMode::NonPersistent),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PERSISTENT" => Ok(DeliveryMode::Persistent),
            "NON_PERSISTENT" => Ok(DeliveryMode::NonPersistent),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Typed message body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Text message.
    Text(String),
    /// Bytes message.
    Bytes(Vec<u8>),
    /// Long value.
    Long(i64),
    /// Double value.
    Double(f64),
    /// Boolean value.
    Bool(bool),
}

/// Message headers. Broker-assigned fields are filled on send.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Headers {
    /// `JMSMessageID`, unless disabled by the producer.
    pub message_id: Option<String>,
    /// `JMSCorrelationID`.
    pub correlation_id: Option<String>,
    /// `JMSDeliveryMode`.
    pub delivery_mode: DeliveryMode,
    /// `JMSDestination`.
    pub destination: Option<Destination>,
    /// `JMSExpiration`, epoch millis; `0` never expires.
    pub expiration: i64,
    /// `JMSPriority`, `0..=9`.
    pub priority: u8,
    /// `JMSRedelivered`.
    pub redelivered: bool,
    /// `JMSReplyTo`.
    pub reply_to: Option<Destination>,
    /// `JMSTimestamp`, epoch millis; `0` when disabled.
    pub timestamp: i64,
    /// `JMSType`.
    pub jms_type: Option<String>,
    /// `JMSDeliveryTime`, epoch millis.
    pub delivery_time: i64,
}

/// A message as the broker sees it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BrokerMessage {
    /// Standard headers.
    pub headers: Headers,
    /// Application properties.
    pub properties: Metadata,
    /// Body.
    pub body: Body,
}

impl BrokerMessage {
    /// A message with `body` and default headers.
    pub fn new(body: Body) -> Self {
        Self {
            body,
            headers: Headers {
                priority: DEFAULT_PRIORITY,
                ..Headers::default()
            },
            properties: Metadata::new(),
        }
    }

    /// A text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Body::Text(text.into()))
    }

    /// Set a property.
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<reactive_messaging::MetadataValue>,
    ) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Priority used when neither the message nor the channel sets one.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Producer-side options applied on send.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the message's delivery mode.
    pub delivery_mode: Option<DeliveryMode>,
    /// Hold the message back for this long.
    pub delivery_delay: Option<Duration>,
    /// Expire the message after this long.
    pub time_to_live: Option<Duration>,
    /// Overrides the message's priority.
    pub priority: Option<u8>,
    /// Do not assign `JMSMessageID`.
    pub disable_message_id: bool,
    /// Do not assign `JMSTimestamp`.
    pub disable_message_timestamp: bool,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure reported by the broker client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The session or consumer was closed.
    #[error("session closed")]
    Closed,

    /// The connection to the broker failed.
    #[error("broker i/o failure: {0}")]
    Io(String),

    /// Credentials were rejected.
    #[error("authentication failed for user {0}")]
    Security(String),

    /// The message selector does not parse.
    #[error("invalid message selector: {0}")]
    InvalidSelector(String),

    /// The operation does not apply to the session mode.
    #[error("operation not allowed in {0} sessions")]
    IllegalState(SessionMode),
}

// =============================================================================
// Client Traits
// =============================================================================

/// Opens broker sessions.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open an anonymous session.
    fn create_context(&self, mode: SessionMode) -> Result<SharedContext, BrokerError>;

    /// Open a session as `username`.
    fn create_context_with_credentials(
        &self,
        username: &str,
        password: Option<&str>,
        mode: SessionMode,
    ) -> Result<SharedContext, BrokerError>;
}

/// A broker session.
///
/// Blocking; may be called from several threads, but each binding owns its
/// session exclusively.
pub trait JmsContext: Send + Sync + 'static {
    /// Acknowledgement discipline of this session.
    fn session_mode(&self) -> SessionMode;

    /// Consumer on `destination`, filtered by `selector`.
    fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError>;

    /// Producer able to send to any destination.
    fn create_producer(&self) -> Result<Box<dyn MessageProducer>, BrokerError>;

    /// Acknowledge every message consumed so far (client-acknowledge only).
    fn acknowledge(&self) -> Result<(), BrokerError>;

    /// Commit receipts and sends (transacted only).
    fn commit(&self) -> Result<(), BrokerError>;

    /// Roll back receipts and sends (transacted only).
    fn rollback(&self) -> Result<(), BrokerError>;

    /// Close the session. Unblocks pending receives; unsettled messages
    /// are redelivered.
    fn close(&self);

    /// Whether [`close`](Self::close) ran or the connection was lost.
    fn is_closed(&self) -> bool;
}

/// Shared session handle.
pub type SharedContext = Arc<dyn JmsContext>;

/// Shared factory handle, the type factories are registered under in the
/// bean registry.
pub type SharedConnectionFactory = Arc<dyn ConnectionFactory>;

/// Receives from one destination.
pub trait MessageConsumer: Send {
    /// Wait up to `timeout` for a message. `Ok(None)` on timeout.
    fn receive(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError>;

    /// Stop receiving.
    fn close(&mut self);
}

/// Sends to destinations.
pub trait MessageProducer: Send {
    /// Send and wait for the broker to accept.
    fn send(
        &mut self,
        destination: &Destination,
        message: BrokerMessage,
        options: &SendOptions,
    ) -> Result<(), BrokerError>;

    /// Release the producer.
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_mode_case_insensitive() {
        assert_eq!(
            "client_acknowledge".parse::<SessionMode>().unwrap(),
            SessionMode::ClientAcknowledge
        );
        assert_eq!(
            "Session_Transacted".parse::<SessionMode>().unwrap(),
            SessionMode::SessionTransacted
        );
        let err = "BOGUS".parse::<SessionMode>().unwrap_err();
        assert_eq!(err.kind(), "UNKNOWN_SESSION_MODE");
    }

    #[test]
    fn test_destination_uri() {
        let queue = Destination::queue("orders");
        assert_eq!(queue.to_string(), "queue://orders");
        assert_eq!(Destination::parse_uri("queue://orders"), Some(queue));
        assert_eq!(
            Destination::parse_uri("topic://prices"),
            Some(Destination::topic("prices"))
        );
        assert_eq!(Destination::parse_uri("prices"), None);
    }

    #[test]
    fn test_delivery_mode_codes() {
        assert_eq!(DeliveryMode::from_code(DeliveryMode::Persistent.code()), Some(DeliveryMode::Persistent));
        assert_eq!("non_persistent".parse(), Ok(DeliveryMode::NonPersistent));
        assert_eq!(DeliveryMode::from_code(7), None);
    }
}
