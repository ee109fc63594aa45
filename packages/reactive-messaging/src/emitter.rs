//! Application-side ingress into a channel.
//!
//! An [`Emitter`] lets imperative code push messages into the graph. Items
//! wait in an overflow buffer until the channel's consumer pulls them; what
//! happens when the consumer falls behind is decided by the
//! [`OverflowSpec`] the emitter was declared with.
//!
//! # Lifecycle
//!
//! ```text
//! UNCONNECTED ──(first subscription)──► CONNECTED ──► COMPLETED
//!                                                 └─► FAILED
//! ```
//!
//! Sending while unconnected buffers per policy. Sending after completion or
//! failure fails with [`FlowError::StreamClosed`].
//!
//! # Delivery futures
//!
//! [`Emitter::send`] is synchronous and may be called from any thread. It
//! returns a [`Delivery`] future that resolves once the consumer has pulled
//! the item (or the policy has decided its fate).

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{ConfigError, FlowError};
use crate::message::{Message, Payload};
use crate::stream::Publisher;

/// Capacity used by `FAIL`, `NONE` and `BUFFER` without a size.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

// =============================================================================
// Overflow Policy
// =============================================================================

/// Declared overflow strategy of an emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowSpec {
    /// Queue up to `n` items, then fail the stream.
    Buffer(usize),
    /// Queue without limit.
    UnboundedBuffer,
    /// Discard items the consumer is not waiting for.
    Drop,
    /// Queue up to [`DEFAULT_BUFFER_SIZE`] items, then fail the stream.
    Fail,
    /// Keep only the most recent queued item.
    Latest,
    /// Apply the default (`Fail`).
    #[default]
    None,
}

impl OverflowSpec {
    /// Parse an overflow annotation value (case-insensitive).
    ///
    /// `capacity` only applies to `BUFFER`; it defaults to 256.
    pub fn parse(value: &str, capacity: Option<usize>) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BUFFER" => Ok(OverflowSpec::Buffer(capacity.unwrap_or(DEFAULT_BUFFER_SIZE))),
            "UNBOUNDED_BUFFER" => Ok(OverflowSpec::UnboundedBuffer),
            "DROP" => Ok(OverflowSpec::Drop),
            "FAIL" => Ok(OverflowSpec::Fail),
            "LATEST" => Ok(OverflowSpec::Latest),
            "NONE" => Ok(OverflowSpec::None),
            _ => Err(ConfigError::InvalidValue {
                key: "overflow".into(),
                value: value.to_string(),
                expected: "BUFFER, UNBOUNDED_BUFFER, DROP, FAIL, LATEST or NONE",
            }),
        }
    }

    fn policy(self) -> Policy {
        match self {
            OverflowSpec::Buffer(n) => Policy::Bounded(n),
            OverflowSpec::Fail | OverflowSpec::None => Policy::Bounded(DEFAULT_BUFFER_SIZE),
            OverflowSpec::UnboundedBuffer => Policy::Unbounded,
            OverflowSpec::Drop => Policy::Drop,
            OverflowSpec::Latest => Policy::Latest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Bounded(usize),
    Unbounded,
    Drop,
    Latest,
}

/// Declaration of an emitter, made before the graph is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterSpec {
    /// Channel the emitter feeds.
    pub channel: String,
    /// Overflow strategy.
    pub overflow: OverflowSpec,
    /// Multicast to every consumer of the channel.
    pub broadcast: bool,
}

impl EmitterSpec {
    /// An emitter with the default overflow strategy.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            overflow: OverflowSpec::None,
            broadcast: false,
        }
    }

    /// Set the overflow strategy.
    pub fn overflow(mut self, overflow: OverflowSpec) -> Self {
        self.overflow = overflow;
        self
    }

    /// Allow several consumers.
    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }
}

// =============================================================================
// Shared Buffer
// =============================================================================

/// Lifecycle state of an emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    /// Nobody subscribed yet.
    Unconnected,
    /// The channel's consumer subscribed.
    Connected,
    /// `complete()` was called or the consumer cancelled.
    Completed,
    /// `fail()` was called or the buffer overflowed.
    Failed,
}

struct Pending {
    message: Message,
    done: oneshot::Sender<Result<(), FlowError>>,
}

struct BufferState {
    queue: VecDeque<Pending>,
    state: EmitterState,
    terminal: Option<FlowError>,
    waiting: bool,
    waker: Option<Waker>,
    subscribed: bool,
}

impl BufferState {
    fn is_closed(&self) -> bool {
        matches!(self.state, EmitterState::Completed | EmitterState::Failed)
    }

    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn reject_queued(&mut self, error: &FlowError) {
        for pending in self.queue.drain(..) {
            let _ = pending.done.send(Err(error.clone()));
        }
    }
}

struct Shared {
    channel: String,
    policy: Policy,
    buffer: Mutex<BufferState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Emitter
// =============================================================================

/// Handle that pushes messages into a channel.
#[derive(Clone)]
pub struct Emitter {
    shared: Arc<Shared>,
}

impl Emitter {
    /// Create an emitter and the publisher its channel's consumer subscribes to.
    pub fn new(spec: &EmitterSpec) -> (Emitter, Publisher) {
        let shared = Arc::new(Shared {
            channel: spec.channel.clone(),
            policy: spec.overflow.policy(),
            buffer: Mutex::new(BufferState {
                queue: VecDeque::new(),
                state: EmitterState::Unconnected,
                terminal: None,
                waiting: false,
                waker: None,
                subscribed: false,
            }),
        });

        let stream = EmitterStream {
            shared: shared.clone(),
            ended: false,
        };
        let hook = shared.clone();
        let publisher = Publisher::new(spec.channel.clone(), stream.boxed()).on_first_subscribe(
            move || {
                let mut buffer = hook.lock();
                buffer.subscribed = true;
                if buffer.state == EmitterState::Unconnected {
                    buffer.state = EmitterState::Connected;
                }
                debug!(channel = %hook.channel, "emitter connected");
            },
        );

        (Emitter { shared }, publisher)
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EmitterState {
        self.shared.lock().state
    }

    /// Whether the channel's consumer ever subscribed.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().subscribed
    }

    /// Send a payload.
    pub fn send(&self, payload: impl Into<Payload>) -> Delivery {
        self.send_message(Message::new(payload))
    }

    /// Send a message, keeping its acknowledgement hooks.
    pub fn send_message(&self, message: Message) -> Delivery {
        let mut buffer = self.shared.lock();
        if buffer.is_closed() {
            return Delivery::ready(Err(FlowError::StreamClosed));
        }

        let (done, receiver) = oneshot::channel();
        let pending = Pending { message, done };

        if buffer.waiting {
            buffer.waiting = false;
            buffer.queue.push_back(pending);
            buffer.wake();
            return Delivery::waiting(receiver);
        }

        match self.shared.policy {
            Policy::Unbounded => buffer.queue.push_back(pending),
            Policy::Bounded(capacity) if buffer.queue.len() < capacity => {
                buffer.queue.push_back(pending)
            }
            Policy::Bounded(capacity) => {
                warn!(channel = %self.shared.channel, capacity, "emitter buffer overflow");
                buffer.state = EmitterState::Failed;
                buffer.reject_queued(&FlowError::Overflow);
                buffer.terminal = Some(FlowError::Overflow);
                buffer.wake();
                return Delivery::ready(Err(FlowError::Overflow));
            }
            Policy::Drop => {
                trace!(channel = %self.shared.channel, "no demand, item dropped");
                return Delivery::ready(Ok(()));
            }
            Policy::Latest => {
                if let Some(superseded) = buffer.queue.pop_back() {
                    trace!(channel = %self.shared.channel, "queued item superseded");
                    let _ = superseded.done.send(Ok(()));
                }
                buffer.queue.push_back(pending);
            }
        }
        Delivery::waiting(receiver)
    }

    /// Signal end of stream. Queued items are still delivered.
    pub fn complete(&self) {
        let mut buffer = self.shared.lock();
        if buffer.is_closed() {
            return;
        }
        buffer.state = EmitterState::Completed;
        buffer.wake();
        debug!(channel = %self.shared.channel, "emitter completed");
    }

    /// Terminate the stream with `error`. Queued items are discarded.
    pub fn fail(&self, error: FlowError) {
        let mut buffer = self.shared.lock();
        if buffer.is_closed() {
            return;
        }
        buffer.state = EmitterState::Failed;
        buffer.reject_queued(&FlowError::StreamClosed);
        buffer.terminal = Some(error);
        buffer.wake();
        debug!(channel = %self.shared.channel, "emitter failed");
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("channel", &self.shared.channel)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Consumer Side
// =============================================================================

struct EmitterStream {
    shared: Arc<Shared>,
    ended: bool,
}

impl Stream for EmitterStream {
    type Item = Result<Message, FlowError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.ended {
            return Poll::Ready(None);
        }
        let mut buffer = self.shared.lock();

        if let Some(error) = buffer.terminal.take() {
            drop(buffer);
            self.ended = true;
            return Poll::Ready(Some(Err(error)));
        }

        if let Some(pending) = buffer.queue.pop_front() {
            buffer.waiting = false;
            let _ = pending.done.send(Ok(()));
            return Poll::Ready(Some(Ok(pending.message)));
        }

        if buffer.is_closed() {
            drop(buffer);
            self.ended = true;
            return Poll::Ready(None);
        }

        buffer.waiting = true;
        buffer.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for EmitterStream {
    fn drop(&mut self) {
        let mut buffer = self.shared.lock();
        buffer.waiting = false;
        buffer.waker = None;
        buffer.reject_queued(&FlowError::StreamClosed);
        if !buffer.is_closed() {
            buffer.state = EmitterState::Completed;
            debug!(channel = %self.shared.channel, "emitter stream cancelled");
        }
    }
}

// =============================================================================
// Delivery
// =============================================================================

enum DeliveryInner {
    Ready(Option<Result<(), FlowError>>),
    Waiting(oneshot::Receiver<Result<(), FlowError>>),
}

/// Resolves when the consumer has taken the item or the policy decided
/// its fate.
#[must_use = "a delivery does nothing unless awaited or dropped deliberately"]
pub struct Delivery {
    inner: DeliveryInner,
}

impl Delivery {
    fn ready(result: Result<(), FlowError>) -> Self {
        Self {
            inner: DeliveryInner::Ready(Some(result)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Result<(), FlowError>>) -> Self {
        Self {
            inner: DeliveryInner::Waiting(receiver),
        }
    }
}

impl Future for Delivery {
    type Output = Result<(), FlowError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            DeliveryInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(FlowError::StreamClosed)))
            }
            DeliveryInner::Waiting(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|outcome| outcome.unwrap_or(Err(FlowError::StreamClosed))),
        }
    }
}
