//! Publishers, subscribers and the stream combinators the graph is built from.
//!
//! A channel's data flows as a [`MessageStream`]: a pull-based stream, so a
//! consumer that stops polling stops the producer (backpressure), and a
//! consumer that drops the stream cancels it.
//!
//! - [`Publisher`] hands out the producing side of a channel, once per
//!   consumer it was built for.
//! - [`Subscriber`] consumes a stream to completion, once.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

use crate::error::FlowError;
use crate::message::Message;

/// A channel's message stream. An `Err` item terminates the stream.
pub type MessageStream = BoxStream<'static, Result<Message, FlowError>>;

type SubscribeHook = Box<dyn FnOnce() + Send>;

// =============================================================================
// Publisher
// =============================================================================

struct PublisherInner {
    channel: String,
    streams: Mutex<VecDeque<MessageStream>>,
    on_subscribe: Mutex<Option<SubscribeHook>>,
}

/// Producing side of a channel.
///
/// Cloning shares the publisher: every clone hands out from the same pool of
/// streams.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// A publisher serving a single subscription.
    pub fn new(channel: impl Into<String>, stream: MessageStream) -> Self {
        Self::from_streams(channel, vec![stream])
    }

    /// A publisher serving one subscription per stream, in order.
    pub fn from_streams(channel: impl Into<String>, streams: Vec<MessageStream>) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                channel: channel.into(),
                streams: Mutex::new(streams.into()),
                on_subscribe: Mutex::new(None),
            }),
        }
    }

    /// Run `hook` on the first successful subscription.
    pub fn on_first_subscribe(self, hook: impl FnOnce() + Send + 'static) -> Self {
        let hook: SubscribeHook = Box::new(hook);
        *self
            .inner
            .on_subscribe
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(hook);
        self
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Subscriptions still available.
    pub fn remaining(&self) -> usize {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Take the next stream.
    pub fn subscribe(&self) -> Result<MessageStream, FlowError> {
        let stream = self
            .inner
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| FlowError::AlreadySubscribed {
                channel: self.inner.channel.clone(),
            })?;
        let hook = self
            .inner
            .on_subscribe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            hook();
        }
        trace!(channel = %self.inner.channel, "publisher subscribed");
        Ok(stream)
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("channel", &self.inner.channel)
            .field("remaining", &self.remaining())
            .finish()
    }
}

// =============================================================================
// Subscriber
// =============================================================================

type ConsumeFn = Box<dyn FnOnce(MessageStream) -> BoxFuture<'static, Result<(), FlowError>> + Send>;

/// Consuming side of a channel.
///
/// The consume function runs at most once; clones share it.
#[derive(Clone)]
pub struct Subscriber {
    channel: Arc<str>,
    consume: Arc<Mutex<Option<ConsumeFn>>>,
}

impl Subscriber {
    /// Wrap a function that drives a stream to completion.
    pub fn new<F, Fut>(channel: impl Into<String>, consume: F) -> Self
    where
        F: FnOnce(MessageStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
    {
        let channel: String = channel.into();
        let consume: ConsumeFn = Box::new(move |stream| consume(stream).boxed());
        Self {
            channel: channel.into(),
            consume: Arc::new(Mutex::new(Some(consume))),
        }
    }

    /// A subscriber that acks every message and discards it.
    pub fn draining(channel: impl Into<String>) -> Self {
        Self::new(channel, |mut stream: MessageStream| async move {
            while let Some(item) = stream.next().await {
                item?.ack().await?;
            }
            Ok(())
        })
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Drive `stream` through the consume function.
    pub async fn consume(&self, stream: MessageStream) -> Result<(), FlowError> {
        let consume = self
            .consume
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| FlowError::AlreadySubscribed {
                channel: self.channel.to_string(),
            })?;
        consume(stream).await
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("channel", &self.channel)
            .finish()
    }
}

// =============================================================================
// Combinators
// =============================================================================

/// Write end of a [`deferred`] stream.
pub struct DeferredSlot {
    sender: oneshot::Sender<MessageStream>,
}

impl DeferredSlot {
    /// Supply the stream the deferred side forwards.
    pub fn fill(self, stream: MessageStream) {
        if self.sender.send(stream).is_err() {
            debug!("deferred stream dropped before it was filled");
        }
    }
}

/// A stream whose source is supplied later.
///
/// Lets the graph hand a consumer its input before the producer exists.
/// If the slot is dropped unfilled, the stream yields
/// [`FlowError::StreamClosed`].
pub fn deferred() -> (DeferredSlot, MessageStream) {
    let (sender, receiver) = oneshot::channel::<MessageStream>();
    let stream = stream::once(async move {
        match receiver.await {
            Ok(stream) => stream,
            Err(_) => stream::once(future::ready(Err(FlowError::StreamClosed))).boxed(),
        }
    })
    .flatten()
    .boxed();
    (DeferredSlot { sender }, stream)
}

/// Interleave streams, preserving each stream's own order.
pub fn merge(streams: Vec<MessageStream>) -> MessageStream {
    stream::select_all(streams).boxed()
}

/// Drain streams one after another.
pub fn concat(streams: Vec<MessageStream>) -> MessageStream {
    stream::iter(streams).flatten().boxed()
}

/// End the stream right after its first error.
pub fn terminate_on_error(stream: MessageStream) -> MessageStream {
    stream
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}

/// A stream of already-built messages.
pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> MessageStream {
    stream::iter(messages.into_iter().map(Ok).collect::<Vec<_>>()).boxed()
}

/// Fan `upstream` out to `consumers` streams.
///
/// Returns the consumer streams and the pump that moves items. Each item is
/// handed to every consumer before the next is pulled, so the slowest
/// consumer sets the pace. Consumers that cancel are skipped; the pump stops
/// when all of them have.
pub fn multicast(
    channel: &str,
    upstream: MessageStream,
    consumers: usize,
) -> (Vec<MessageStream>, BoxFuture<'static, ()>) {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..consumers)
        .map(|_| mpsc::channel::<Result<Message, FlowError>>(1))
        .unzip();
    let streams = receivers
        .into_iter()
        .map(|receiver| ReceiverStream::new(receiver).boxed())
        .collect();

    let channel = channel.to_string();
    let pump = async move {
        let mut upstream = upstream;
        while let Some(item) = upstream.next().await {
            let terminal = item.is_err();
            let mut delivered = false;
            for sender in &senders {
                if sender.send(item.clone()).await.is_ok() {
                    delivered = true;
                }
            }
            if !delivered {
                debug!(channel = %channel, "every broadcast consumer cancelled");
                break;
            }
            if terminal {
                break;
            }
        }
    }
    .boxed();

    (streams, pump)
}
