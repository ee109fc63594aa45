//! Structured error types for the messaging runtime.
//!
//! Errors are grouped by when they surface:
//!
//! - [`ConfigError`] and [`ConnectorError`] are raised while a channel is
//!   materialized from configuration.
//! - [`DeploymentProblem`] collects everything found while the graph is
//!   wired and validated; [`DeploymentError`] reports all of them at once.
//! - [`FlowError`] travels *inside* streams and acknowledgement outcomes.
//!   It is `Clone` so the same failure can be observed by every party
//!   (the emitting caller, the downstream, the failure bus).
//!
//! # The Stream Boundary Rule
//!
//! > **No `anyhow::Error` ever enters a stream.**
//!
//! Mediator closures return `anyhow::Result` for ergonomics. The runtime
//! converts failures into [`FlowError::Processing`] before they cross into
//! the channel graph.
//!
//! # Example
//!
//! ```ignore
//! match runtime_builder.start().await {
//!     Ok(runtime) => { /* running */ }
//!     Err(deployment) => {
//!         for problem in deployment.problems() {
//!             eprintln!("{}: {}", problem.kind(), problem);
//!         }
//!     }
//! }
//! ```

use std::fmt;

use thiserror::Error;

// =============================================================================
// Flow Errors
// =============================================================================

/// Runtime failure that terminates a stream.
///
/// Flow errors are values: they are cloned into every place that needs to
/// observe them, so causes are carried as strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// A producer outran its consumer beyond the overflow policy.
    #[error("overflow: the downstream did not request items fast enough")]
    Overflow,

    /// The stream was completed, failed or cancelled.
    #[error("stream closed")]
    StreamClosed,

    /// The publisher was already subscribed by every consumer it was built for.
    #[error("publisher for channel {channel} has no remaining subscription")]
    AlreadySubscribed {
        /// Channel name.
        channel: String,
    },

    /// The broker client reported an I/O failure.
    #[error("broker i/o failure: {0}")]
    BrokerIo(String),

    /// A payload could not be decoded into the requested type.
    #[error("payload decode failure: {0}")]
    Decode(String),

    /// A payload could not be encoded for the transport.
    #[error("payload encode failure: {0}")]
    Encode(String),

    /// An application mediator returned an error.
    #[error("processing failed: {0}")]
    Processing(String),
}

impl FlowError {
    /// Wrap an application error raised by a mediator.
    pub fn processing(err: impl fmt::Display) -> Self {
        FlowError::Processing(err.to_string())
    }

    /// Stable upper-case kind code.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Overflow => "OVERFLOW",
            FlowError::StreamClosed => "STREAM_CLOSED",
            FlowError::AlreadySubscribed { .. } => "ALREADY_SUBSCRIBED",
            FlowError::BrokerIo(_) => "BROKER_IO",
            FlowError::Decode(_) => "DECODE",
            FlowError::Encode(_) => "ENCODE",
            FlowError::Processing(_) => "PROCESSING",
        }
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Invalid or incomplete channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `session-mode` is not one of the recognized broker modes.
    #[error("unknown session mode: {0}")]
    UnknownSessionMode(String),

    /// A key the connector cannot work without is absent.
    #[error("missing required configuration key: {0}")]
    MissingRequiredKey(String),

    /// The `connector` key names a connector nobody registered.
    #[error("unknown connector: {0}")]
    UnknownConnector(String),

    /// A key is present but its value cannot be used.
    #[error("invalid value {value:?} for {key}: expected {expected}")]
    InvalidValue {
        /// Fully qualified key.
        key: String,
        /// The raw value found.
        value: String,
        /// What would have been accepted.
        expected: &'static str,
    },
}

impl ConfigError {
    /// Stable upper-case kind code.
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::UnknownSessionMode(_) => "UNKNOWN_SESSION_MODE",
            ConfigError::MissingRequiredKey(_) => "MISSING_REQUIRED_KEY",
            ConfigError::UnknownConnector(_) => "UNKNOWN_CONNECTOR",
            ConfigError::InvalidValue { .. } => "INVALID_VALUE",
        }
    }
}

// =============================================================================
// Connector Errors
// =============================================================================

/// Failure to materialize a publisher or subscriber for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// The channel configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No connection factory is registered at all.
    #[error("cannot find a connection factory bean")]
    NoFactory,

    /// No connection factory carries the requested name.
    #[error("cannot find a connection factory bean named {0}")]
    NamedFactoryNotFound(String),

    /// Several factories are registered and the channel did not pick one.
    #[error("several connection factory beans are registered; set connection-factory-name")]
    AmbiguousFactory,

    /// The broker refused to open a session or endpoint.
    #[error("broker failure: {0}")]
    Broker(String),

    /// The shared worker pool has no thread left for a new binding.
    #[error("worker pool exhausted")]
    PoolExhausted,

    /// The connector has not been started (or has been shut down).
    #[error("connector {0} is not running")]
    NotRunning(String),

    /// The connector cannot serve this direction.
    #[error("connector {connector} does not support {direction} channels")]
    Unsupported {
        /// Connector name.
        connector: String,
        /// `incoming` or `outgoing`.
        direction: &'static str,
    },
}

impl ConnectorError {
    /// Stable upper-case kind code.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::Config(e) => e.kind(),
            ConnectorError::NoFactory => "NO_FACTORY",
            ConnectorError::NamedFactoryNotFound(_) => "NAMED_FACTORY_NOT_FOUND",
            ConnectorError::AmbiguousFactory => "AMBIGUOUS_FACTORY",
            ConnectorError::Broker(_) => "BROKER_IO",
            ConnectorError::PoolExhausted => "POOL_EXHAUSTED",
            ConnectorError::NotRunning(_) => "NOT_RUNNING",
            ConnectorError::Unsupported { .. } => "UNSUPPORTED",
        }
    }
}

// =============================================================================
// Registry and Definition Errors
// =============================================================================

/// Conflicting registrations in the [`ChannelRegistry`](crate::ChannelRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The channel already has a producer.
    #[error("channel {0} already has a producer")]
    DuplicateProducer(String),

    /// The channel already has a consumer.
    #[error("channel {0} already has a consumer")]
    DuplicateConsumer(String),

    /// The channel already has an emitter.
    #[error("channel {0} already has an emitter")]
    DuplicateEmitter(String),
}

/// A mediator declaration that cannot be turned into a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The signature matches no row of the shape decision table.
    #[error("unsupported signature: {0}")]
    UnsupportedSignature(String),

    /// The declared channels contradict the shape.
    #[error("{shape} mediator {reason}")]
    ShapeMismatch {
        /// Shape derived from the signature.
        shape: &'static str,
        /// What is wrong with the channel declarations.
        reason: &'static str,
    },

    /// A channel name is empty.
    #[error("channel names must not be empty")]
    EmptyChannelName,
}

// =============================================================================
// Deployment Problems
// =============================================================================

/// One problem found while wiring or validating the channel graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeploymentProblem {
    /// Nothing produces a channel that something consumes.
    #[error("no channel found for name: {channel}{}", describe(.injection_point))]
    UnresolvedIncoming {
        /// Channel name.
        channel: String,
        /// Injection point that asked for it, when the consumer is the host.
        injection_point: Option<String>,
    },

    /// A mediator produces into a channel nobody consumes.
    #[error("no subscriber for outgoing channel: {channel}")]
    UnresolvedOutgoing {
        /// Channel name.
        channel: String,
    },

    /// Several producers target a channel whose consumer does not merge.
    #[error("multiple producers for channel {channel} and no merge policy")]
    DuplicateProducer {
        /// Channel name.
        channel: String,
    },

    /// Several consumers read a channel whose producer does not broadcast.
    #[error("multiple consumers for channel {channel} and no broadcast")]
    DuplicateConsumer {
        /// Channel name.
        channel: String,
    },

    /// A duplicate emitter registration.
    #[error("multiple emitters for channel {channel}")]
    DuplicateEmitter {
        /// Channel name.
        channel: String,
    },

    /// A connector failed to materialize the channel.
    #[error("connector for channel {channel} failed to initialize: {cause}")]
    ConnectorInit {
        /// Channel name.
        channel: String,
        /// Underlying failure.
        cause: ConnectorError,
    },

    /// A mediator declaration was rejected.
    #[error("invalid mediator {mediator}: {cause}")]
    InvalidMediator {
        /// `bean#method`.
        mediator: String,
        /// Underlying failure.
        cause: DefinitionError,
    },

    /// An injected emitter was never subscribed by the graph.
    #[error("emitter for channel {channel} is not connected, injection point: {injection_point}")]
    EmitterNotConnected {
        /// Channel name.
        channel: String,
        /// Injection point that asked for it.
        injection_point: String,
    },
}

fn describe(injection_point: &Option<String>) -> String {
    match injection_point {
        Some(point) => format!(", injection point: {point}"),
        None => String::new(),
    }
}

impl DeploymentProblem {
    /// Stable upper-case kind code.
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentProblem::UnresolvedIncoming { .. } => "UNRESOLVED_INCOMING",
            DeploymentProblem::UnresolvedOutgoing { .. } => "UNRESOLVED_OUTGOING",
            DeploymentProblem::DuplicateProducer { .. } => "DUPLICATE_PRODUCER",
            DeploymentProblem::DuplicateConsumer { .. } => "DUPLICATE_CONSUMER",
            DeploymentProblem::DuplicateEmitter { .. } => "DUPLICATE_EMITTER",
            DeploymentProblem::ConnectorInit { .. } => "CONNECTOR_INIT",
            DeploymentProblem::InvalidMediator { .. } => "INVALID_MEDIATOR",
            DeploymentProblem::EmitterNotConnected { .. } => "EMITTER_NOT_CONNECTED",
        }
    }

    /// Channel the problem is about, when there is one.
    pub fn channel(&self) -> Option<&str> {
        match self {
            DeploymentProblem::UnresolvedIncoming { channel, .. }
            | DeploymentProblem::UnresolvedOutgoing { channel }
            | DeploymentProblem::DuplicateProducer { channel }
            | DeploymentProblem::DuplicateConsumer { channel }
            | DeploymentProblem::DuplicateEmitter { channel }
            | DeploymentProblem::ConnectorInit { channel, .. }
            | DeploymentProblem::EmitterNotConnected { channel, .. } => Some(channel),
            DeploymentProblem::InvalidMediator { .. } => None,
        }
    }
}

impl From<RegistryError> for DeploymentProblem {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateProducer(channel) => {
                DeploymentProblem::DuplicateProducer { channel }
            }
            RegistryError::DuplicateConsumer(channel) => {
                DeploymentProblem::DuplicateConsumer { channel }
            }
            RegistryError::DuplicateEmitter(channel) => {
                DeploymentProblem::DuplicateEmitter { channel }
            }
        }
    }
}

/// Aggregate deployment failure listing every known problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentError {
    problems: Vec<DeploymentProblem>,
}

impl DeploymentError {
    /// Build the aggregate from the collected problems.
    pub fn new(problems: Vec<DeploymentProblem>) -> Self {
        Self { problems }
    }

    /// All problems, in discovery order.
    pub fn problems(&self) -> &[DeploymentProblem] {
        &self.problems
    }

    /// Whether a problem with the given kind code was reported.
    pub fn contains_kind(&self, kind: &str) -> bool {
        self.problems.iter().any(|p| p.kind() == kind)
    }
}

impl fmt::Display for DeploymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deployment failed with {} problem(s)", self.problems.len())?;
        for problem in &self.problems {
            write!(f, "\n  - [{}] {}", problem.kind(), problem)?;
        }
        Ok(())
    }
}

impl std::error::Error for DeploymentError {}
