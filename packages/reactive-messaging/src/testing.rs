//! Testing utilities for channel graphs.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! reactive-messaging = { path = "../reactive-messaging", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use reactive_messaging::testing::InMemoryConnector;
//!
//! let memory = Arc::new(InMemoryConnector::new());
//! let source = memory.source("in");
//! let sink = memory.sink("out");
//!
//! let runtime = MessagingBuilder::new()
//!     .config(MapConfig::new()
//!         .with("mp.messaging.incoming.in.connector", "smallrye-in-memory")
//!         .with("mp.messaging.outgoing.out.connector", "smallrye-in-memory"))
//!     .connector(memory.clone())
//!     .mediator(uppercase)
//!     .start()
//!     .await?;
//!
//! source.send("hello").await?;
//! assert!(sink.wait_for(1, Duration::from_secs(1)).await);
//! assert_eq!(sink.payloads::<String>(), vec!["HELLO".to_string()]);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Notify;

use crate::config::ConnectorConfig;
use crate::connector::Connector;
use crate::emitter::{Delivery, Emitter, EmitterSpec, OverflowSpec};
use crate::error::{ConnectorError, FlowError};
use crate::message::{FromPayload, Message, Payload};
use crate::stream::{MessageStream, Publisher, Subscriber};

/// Name channels use to select the [`InMemoryConnector`].
pub const IN_MEMORY_CONNECTOR: &str = "smallrye-in-memory";

/// Connector whose channels are driven by the test.
///
/// Incoming channels read from a [`InMemorySource`], outgoing channels write
/// into a [`InMemorySink`]. Handles can be taken before or after the runtime
/// starts; both sides of a channel share one handle.
#[derive(Default)]
pub struct InMemoryConnector {
    sources: DashMap<String, (InMemorySource, Publisher)>,
    sinks: DashMap<String, InMemorySink>,
    shut_down: AtomicBool,
}

impl InMemoryConnector {
    /// Create a connector with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle feeding incoming channel `channel`.
    pub fn source(&self, channel: &str) -> InMemorySource {
        self.sources
            .entry(channel.to_string())
            .or_insert_with(|| {
                let spec = EmitterSpec::new(channel).overflow(OverflowSpec::UnboundedBuffer);
                let (emitter, publisher) = Emitter::new(&spec);
                (InMemorySource { emitter }, publisher)
            })
            .0
            .clone()
    }

    /// Handle collecting outgoing channel `channel`.
    pub fn sink(&self, channel: &str) -> InMemorySink {
        self.sinks
            .entry(channel.to_string())
            .or_insert_with(InMemorySink::default)
            .clone()
    }

    /// Whether [`Connector::shutdown`] ran.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    fn name(&self) -> &str {
        IN_MEMORY_CONNECTOR
    }

    async fn publisher(&self, config: &ConnectorConfig) -> Result<MessageStream, ConnectorError> {
        self.source(config.channel());
        let publisher = self
            .sources
            .get(config.channel())
            .map(|entry| entry.value().1.clone())
            .ok_or_else(|| ConnectorError::NotRunning(IN_MEMORY_CONNECTOR.to_string()))?;
        publisher.subscribe().map_err(|e| ConnectorError::Broker(e.to_string()))
    }

    async fn subscriber(&self, config: &ConnectorConfig) -> Result<Subscriber, ConnectorError> {
        let sink = self.sink(config.channel());
        Ok(Subscriber::new(config.channel(), move |stream| sink.drain(stream)))
    }

    async fn shutdown(&self, _deadline: Duration) {
        for entry in self.sources.iter() {
            entry.value().0.complete();
        }
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Feeds one incoming channel.
#[derive(Clone)]
pub struct InMemorySource {
    emitter: Emitter,
}

impl InMemorySource {
    /// Send a payload; resolves once the graph pulled it.
    pub fn send(&self, payload: impl Into<Payload>) -> Delivery {
        self.emitter.send(payload)
    }

    /// Send a prebuilt message.
    pub fn send_message(&self, message: Message) -> Delivery {
        self.emitter.send_message(message)
    }

    /// End the channel.
    pub fn complete(&self) {
        self.emitter.complete();
    }

    /// Terminate the channel with `error`.
    pub fn fail(&self, error: FlowError) {
        self.emitter.fail(error);
    }
}

#[derive(Default)]
struct SinkState {
    messages: Mutex<Vec<Message>>,
    completed: AtomicBool,
    failure: Mutex<Option<FlowError>>,
    arrived: Notify,
}

/// Collects one outgoing channel, acking everything it receives.
#[derive(Clone, Default)]
pub struct InMemorySink {
    state: Arc<SinkState>,
}

impl InMemorySink {
    async fn drain(self, mut stream: MessageStream) -> Result<(), FlowError> {
        while let Some(item) = stream.next().await {
            match item {
                Ok(message) => {
                    message.ack().await?;
                    self.lock_messages().push(message);
                    self.state.arrived.notify_waiters();
                }
                Err(error) => {
                    *self
                        .state
                        .failure
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(error.clone());
                    self.state.arrived.notify_waiters();
                    return Err(error);
                }
            }
        }
        self.state.completed.store(true, Ordering::SeqCst);
        self.state.arrived.notify_waiters();
        Ok(())
    }

    fn lock_messages(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.state.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages received so far.
    pub fn messages(&self) -> Vec<Message> {
        self.lock_messages().clone()
    }

    /// Number of messages received so far.
    pub fn len(&self) -> usize {
        self.lock_messages().len()
    }

    /// Whether nothing arrived yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Received payloads decoded as `T`.
    ///
    /// # Panics
    ///
    /// Panics if a payload does not decode.
    pub fn payloads<T: FromPayload>(&self) -> Vec<T> {
        self.lock_messages()
            .iter()
            .map(|message| {
                message
                    .decode::<T>()
                    .unwrap_or_else(|e| panic!("sink payload does not decode: {e}"))
            })
            .collect()
    }

    /// Whether the upstream completed.
    pub fn is_completed(&self) -> bool {
        self.state.completed.load(Ordering::SeqCst)
    }

    /// The error that terminated the upstream, if any.
    pub fn failure(&self) -> Option<FlowError> {
        self.state
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until at least `count` messages arrived. `false` on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let arrived = self.state.arrived.notified();
                if self.len() >= count {
                    return;
                }
                arrived.await;
            }
        })
        .await
        .is_ok()
    }
}

impl std::fmt::Debug for InMemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySink")
            .field("received", &self.len())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Pull `count` messages from `stream`.
///
/// # Panics
///
/// Panics if the stream fails or ends early, or nothing arrives for 5s.
pub async fn collect(mut stream: MessageStream, count: usize) -> Vec<Message> {
    let mut messages = Vec::with_capacity(count);
    while messages.len() < count {
        match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
            Ok(Some(Ok(message))) => messages.push(message),
            Ok(Some(Err(error))) => panic!("stream failed after {} messages: {error}", messages.len()),
            Ok(None) => panic!("stream ended after {} of {count} messages", messages.len()),
            Err(_) => panic!("timed out after {} of {count} messages", messages.len()),
        }
    }
    messages
}

/// Poll `condition` every 5ms until it holds. `false` on timeout.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
