//! Binding lifecycle and health.
//!
//! A binding is one channel attached to one broker session. Its state only
//! moves forward:
//!
//! ```text
//! OPEN ──cancel/shutdown──► DRAINING ──worker exits──► CLOSED
//!   │
//!   └──broker failure──► FAILED
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use reactive_messaging::Direction;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{Destination, SharedContext};

/// Lifecycle state of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// Moving messages.
    Open,
    /// Cancelled; the worker is winding down.
    Draining,
    /// Worker gone, session closed.
    Closed,
    /// The broker connection failed.
    Failed,
}

impl BindingState {
    /// Whether the binding can no longer move messages.
    pub fn is_terminal(self) -> bool {
        matches!(self, BindingState::Closed | BindingState::Failed)
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BindingState::Open => "OPEN",
            BindingState::Draining => "DRAINING",
            BindingState::Closed => "CLOSED",
            BindingState::Failed => "FAILED",
        })
    }
}

/// Shared view of one binding, held by the connector and by the worker.
pub struct Binding {
    channel: String,
    direction: Direction,
    destination: Destination,
    state: watch::Sender<BindingState>,
    failure: Mutex<Option<String>>,
    context: SharedContext,
}

impl Binding {
    pub(crate) fn new(
        channel: impl Into<String>,
        direction: Direction,
        destination: Destination,
        context: SharedContext,
    ) -> Arc<Self> {
        let binding = Arc::new(Self {
            channel: channel.into(),
            direction,
            destination,
            state: watch::Sender::new(BindingState::Open),
            failure: Mutex::new(None),
            context,
        });
        info!(
            channel = %binding.channel,
            direction = %direction,
            destination = %binding.destination,
            "jms binding open"
        );
        binding
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Channel direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state.
    pub fn state(&self) -> BindingState {
        *self.state.borrow()
    }

    pub(crate) fn context(&self) -> &SharedContext {
        &self.context
    }

    fn advance(&self, from: &[BindingState], to: BindingState) -> bool {
        self.state.send_if_modified(|current| {
            let allowed = from.contains(current);
            if allowed {
                *current = to;
            }
            allowed
        })
    }

    /// Resolves once the binding leaves [`BindingState::Open`].
    pub(crate) async fn closing(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s != BindingState::Open).await;
    }

    /// Resolves once the binding reaches a terminal state.
    pub(crate) async fn terminated(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }

    /// Stop moving messages and close the session, which unblocks a pending
    /// receive. Idempotent.
    pub(crate) fn drain(&self) {
        if self.advance(&[BindingState::Open], BindingState::Draining) {
            info!(channel = %self.channel, direction = %self.direction, "jms binding draining");
            self.context.close();
        }
    }

    /// The worker exited.
    pub(crate) fn mark_closed(&self) {
        if self.advance(&[BindingState::Open, BindingState::Draining], BindingState::Closed) {
            self.context.close();
            info!(channel = %self.channel, direction = %self.direction, "jms binding closed");
        }
    }

    /// The broker connection failed. A binding that was already draining
    /// or closed stays where it is.
    pub(crate) fn mark_failed(&self, cause: &str) {
        if self.advance(&[BindingState::Open], BindingState::Failed) {
            *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(cause.to_string());
            self.context.close();
            warn!(channel = %self.channel, direction = %self.direction, error = %cause, "jms binding failed");
        }
    }

    /// Whether the worker should keep going.
    pub(crate) fn is_open(&self) -> bool {
        self.state() == BindingState::Open
    }

    /// Snapshot for health reporting.
    pub fn status(&self) -> BindingStatus {
        BindingStatus {
            channel: self.channel.clone(),
            direction: self.direction,
            destination: self.destination.clone(),
            state: self.state(),
            failure: self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("channel", &self.channel)
            .field("direction", &self.direction)
            .field("destination", &self.destination)
            .field("state", &self.state())
            .finish()
    }
}

/// Point-in-time state of one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingStatus {
    /// Channel name.
    pub channel: String,
    /// Channel direction.
    pub direction: Direction,
    /// Destination the binding is attached to.
    pub destination: Destination,
    /// Lifecycle state.
    pub state: BindingState,
    /// Cause when the state is [`BindingState::Failed`].
    pub failure: Option<String>,
}

/// Connector-wide health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Every binding opened since start, in opening order.
    pub bindings: Vec<BindingStatus>,
}

impl HealthReport {
    /// Bindings of one direction.
    pub fn direction(&self, direction: Direction) -> impl Iterator<Item = &BindingStatus> {
        self.bindings.iter().filter(move |b| b.direction == direction)
    }

    /// Number of bindings in `state`.
    pub fn count(&self, state: BindingState) -> usize {
        self.bindings.iter().filter(|b| b.state == state).count()
    }

    /// Whether no binding has failed.
    pub fn is_healthy(&self) -> bool {
        self.count(BindingState::Failed) == 0
    }

    /// Whether at least one inbound binding exists and every one of them
    /// has failed.
    pub fn all_inbound_failed(&self) -> bool {
        let mut inbound = self.direction(Direction::Incoming).peekable();
        inbound.peek().is_some() && inbound.all(|b| b.state == BindingState::Failed)
    }
}
