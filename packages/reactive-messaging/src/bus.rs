//! Broadcast bus for channel failures.
//!
//! When a flow error terminates a stream, the runtime publishes a
//! [`ChannelFailure`] here. Hosts subscribe to observe failures without
//! being part of the channel graph.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: Slow receivers may miss failures
//! - **In-memory only**: Failures are not persisted
//! - **No replay**: Lagged receivers get `RecvError::Lagged`

use std::fmt;

use tokio::sync::broadcast;
use tracing::warn;

use crate::error::FlowError;

/// Default channel capacity for the failure bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Which part of the graph observed a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// A mediator's input or invocation.
    Mediator,
    /// An outbound connector's subscriber.
    Connector,
    /// A host-registered subscriber.
    Host,
    /// A broadcast pump or other graph plumbing.
    Graph,
}

impl fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureOrigin::Mediator => "mediator",
            FailureOrigin::Connector => "connector",
            FailureOrigin::Host => "host",
            FailureOrigin::Graph => "graph",
        };
        f.write_str(name)
    }
}

/// A stream terminated by a flow error.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFailure {
    /// Channel whose stream failed.
    pub channel: String,
    /// Who observed the failure.
    pub origin: FailureOrigin,
    /// The terminating error.
    pub error: FlowError,
}

/// Broadcast bus carrying [`ChannelFailure`]s.
///
/// # Example
///
/// ```ignore
/// let mut failures = runtime.failures().subscribe();
/// while let Ok(failure) = failures.recv().await {
///     eprintln!("{} failed: {}", failure.channel, failure.error);
/// }
/// ```
#[derive(Clone)]
pub struct FailureBus {
    sender: broadcast::Sender<ChannelFailure>,
}

impl FailureBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a failure to all subscribers.
    ///
    /// Returns the number of receivers that got it.
    pub fn emit(&self, channel: &str, origin: FailureOrigin, error: FlowError) -> usize {
        warn!(channel = %channel, origin = %origin, error = %error, "channel stream failed");
        self.sender
            .send(ChannelFailure {
                channel: channel.to_string(),
                origin,
                error,
            })
            .unwrap_or(0)
    }

    /// Subscribe to failures published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelFailure> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for FailureBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FailureBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
