//! In-process broker implementing the client traits.
//!
//! Queues and non-durable topic subscriptions live behind one mutex; a
//! condvar wakes blocked receivers when messages arrive, become available,
//! or a session closes. Supports the four session modes, simple selectors,
//! expiry, delivery delay, redelivery on rollback/close, and fault injection
//! for tests.
//!
//! # Example
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! broker.send(&Destination::queue("Q1"), BrokerMessage::text("hello"))?;
//!
//! let mut beans = BeanRegistry::new();
//! beans.register::<SharedConnectionFactory>(Arc::new(broker.clone()));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use reactive_messaging::MetadataValue;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::api::{
    BrokerError, BrokerMessage, ConnectionFactory, Destination, DestinationType, JmsContext,
    MessageConsumer, MessageProducer, SendOptions, SessionMode, SharedContext,
};
use crate::metadata;

// =============================================================================
// Broker State
// =============================================================================

#[derive(Debug, Clone)]
struct Stored {
    message: BrokerMessage,
    available_at: Instant,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Source {
    Queue(String),
    Subscription(u64),
}

#[derive(Debug)]
struct Subscription {
    topic: String,
    messages: VecDeque<Stored>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Stored>>,
    subscriptions: HashMap<u64, Subscription>,
    next_subscription: u64,
}

impl BrokerState {
    fn messages_mut(&mut self, source: &Source) -> Option<&mut VecDeque<Stored>> {
        match source {
            Source::Queue(name) => Some(self.queues.entry(name.clone()).or_default()),
            Source::Subscription(id) => self.subscriptions.get_mut(id).map(|s| &mut s.messages),
        }
    }

    fn deliver(&mut self, destination: &Destination, stored: Stored) {
        match destination.kind {
            DestinationType::Queue => {
                self.queues
                    .entry(destination.name.clone())
                    .or_default()
                    .push_back(stored);
            }
            DestinationType::Topic => {
                for subscription in self.subscriptions.values_mut() {
                    if subscription.topic == destination.name {
                        subscription.messages.push_back(stored.clone());
                    }
                }
            }
        }
    }

    /// Take the first live message matching `selector`, dropping expired
    /// ones on the way. Otherwise report when the next delayed message
    /// becomes available.
    fn take(
        &mut self,
        source: &Source,
        selector: Option<&Selector>,
        now: Instant,
    ) -> Result<Stored, Option<Instant>> {
        let Some(messages) = self.messages_mut(source) else {
            return Err(None);
        };
        messages.retain(|stored| {
            let expired = stored.is_expired(now);
            if expired {
                trace!(message_id = ?stored.message.headers.message_id, "message expired");
            }
            !expired
        });
        let mut next_available = None::<Instant>;
        let position = messages.iter().position(|stored| {
            if stored.available_at > now {
                next_available = Some(next_available.map_or(stored.available_at, |t| t.min(stored.available_at)));
                return false;
            }
            selector.map_or(true, |s| s.matches(&stored.message))
        });
        match position.and_then(|i| messages.remove(i)) {
            Some(stored) => Ok(stored),
            None => Err(next_available),
        }
    }

    fn requeue(&mut self, deliveries: Vec<(Source, Stored)>) {
        for (source, mut stored) in deliveries.into_iter().rev() {
            stored.message.headers.redelivered = true;
            if let Some(messages) = self.messages_mut(&source) {
                messages.push_front(stored);
            }
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    arrived: Condvar,
    credentials: Option<(String, Option<String>)>,
    fail_sends: AtomicBool,
    severed: AtomicBool,
    open_sessions: AtomicUsize,
    next_session: AtomicU64,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wake_all(&self) {
        let _state = self.lock();
        self.arrived.notify_all();
    }

    fn stamp(&self, destination: &Destination, message: &mut BrokerMessage, options: &SendOptions) {
        let now = chrono::Utc::now().timestamp_millis();
        let headers = &mut message.headers;
        headers.destination = Some(destination.clone());
        headers.redelivered = false;
        headers.message_id = (!options.disable_message_id).then(|| format!("ID:{}", Uuid::new_v4()));
        headers.timestamp = if options.disable_message_timestamp { 0 } else { now };
        if let Some(mode) = options.delivery_mode {
            headers.delivery_mode = mode;
        }
        if let Some(priority) = options.priority {
            headers.priority = priority;
        }
        headers.expiration = options
            .time_to_live
            .map_or(0, |ttl| now + millis(ttl));
        headers.delivery_time = now + options.delivery_delay.map_or(0, millis);
    }

    fn store(message: BrokerMessage, options: &SendOptions) -> Stored {
        let now = Instant::now();
        Stored {
            message,
            available_at: now + options.delivery_delay.unwrap_or_default(),
            expires_at: options.time_to_live.map(|ttl| now + ttl),
        }
    }

    fn publish(&self, destination: &Destination, stored: Stored) {
        let mut state = self.lock();
        state.deliver(destination, stored);
        self.arrived.notify_all();
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// InMemoryBroker
// =============================================================================

/// In-process broker and connection factory.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// A broker accepting any session.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A broker that only accepts sessions opened as `username`.
    pub fn with_credentials(username: impl Into<String>, password: Option<&str>) -> Self {
        Self::build(Some((username.into(), password.map(str::to_string))))
    }

    fn build(credentials: Option<(String, Option<String>)>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                arrived: Condvar::new(),
                credentials,
                fail_sends: AtomicBool::new(false),
                severed: AtomicBool::new(false),
                open_sessions: AtomicUsize::new(0),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    fn open(&self, mode: SessionMode) -> Result<SharedContext, BrokerError> {
        if self.is_severed() {
            return Err(BrokerError::Io("connection refused".to_string()));
        }
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        debug!(session = id, mode = %mode, "in-memory session opened");
        Ok(Arc::new(MemoryContext {
            inner: Arc::new(ContextInner {
                id,
                broker: self.inner.clone(),
                mode,
                closed: AtomicBool::new(false),
                session: Mutex::new(SessionState::default()),
            }),
        }))
    }

    /// Send as an external producer, outside any session.
    pub fn send(&self, destination: &Destination, mut message: BrokerMessage) -> Result<(), BrokerError> {
        if self.is_severed() {
            return Err(BrokerError::Io("connection lost".to_string()));
        }
        let options = SendOptions::default();
        self.inner.stamp(destination, &mut message, &options);
        self.inner.publish(destination, BrokerInner::store(message, &options));
        Ok(())
    }

    /// Messages waiting on a queue, oldest first, without consuming them.
    pub fn browse(&self, queue: &str) -> Vec<BrokerMessage> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|messages| messages.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting on a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Remove and return everything waiting on a queue.
    pub fn drain(&self, queue: &str) -> Vec<BrokerMessage> {
        self.inner
            .lock()
            .queues
            .get_mut(queue)
            .map(|messages| messages.drain(..).map(|s| s.message).collect())
            .unwrap_or_default()
    }

    /// Make every producer send fail with an I/O error until reset.
    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Drop the connection: receives, sends and new sessions fail with an
    /// I/O error until [`restore`](Self::restore).
    pub fn sever(&self) {
        self.inner.severed.store(true, Ordering::SeqCst);
        self.inner.wake_all();
    }

    /// Undo [`sever`](Self::sever).
    pub fn restore(&self) {
        self.inner.severed.store(false, Ordering::SeqCst);
    }

    /// Whether the connection is severed.
    pub fn is_severed(&self) -> bool {
        self.inner.severed.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for InMemoryBroker {
    fn create_context(&self, mode: SessionMode) -> Result<SharedContext, BrokerError> {
        if self.inner.credentials.is_some() {
            return Err(BrokerError::Security("anonymous".to_string()));
        }
        self.open(mode)
    }

    fn create_context_with_credentials(
        &self,
        username: &str,
        password: Option<&str>,
        mode: SessionMode,
    ) -> Result<SharedContext, BrokerError> {
        if let Some((expected_user, expected_password)) = &self.inner.credentials {
            if expected_user != username || expected_password.as_deref() != password {
                return Err(BrokerError::Security(username.to_string()));
            }
        }
        self.open(mode)
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("InMemoryBroker")
            .field("queues", &state.queues.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("open_sessions", &self.open_sessions())
            .finish()
    }
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Default)]
struct SessionState {
    unsettled: Vec<(Source, Stored)>,
    pending_sends: Vec<(Destination, Stored)>,
    subscriptions: Vec<u64>,
}

struct ContextInner {
    id: u64,
    broker: Arc<BrokerInner>,
    mode: SessionMode,
    closed: AtomicBool,
    session: Mutex<SessionState>,
}

impl ContextInner {
    fn session(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_usable(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.broker.severed.load(Ordering::SeqCst) {
            return Err(BrokerError::Io("connection lost".to_string()));
        }
        Ok(())
    }

    fn requeue_unsettled(&self) {
        let unsettled = std::mem::take(&mut self.session().unsettled);
        if unsettled.is_empty() {
            return;
        }
        trace!(session = self.id, count = unsettled.len(), "redelivering unsettled messages");
        let mut state = self.broker.lock();
        state.requeue(unsettled);
        self.broker.arrived.notify_all();
    }
}

/// Session on an [`InMemoryBroker`].
struct MemoryContext {
    inner: Arc<ContextInner>,
}

impl JmsContext for MemoryContext {
    fn session_mode(&self) -> SessionMode {
        self.inner.mode
    }

    fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        self.inner.check_usable()?;
        let selector = selector.map(Selector::parse).transpose()?;
        let source = match destination.kind {
            DestinationType::Queue => Source::Queue(destination.name.clone()),
            DestinationType::Topic => {
                let mut state = self.inner.broker.lock();
                let id = state.next_subscription;
                state.next_subscription += 1;
                state.subscriptions.insert(
                    id,
                    Subscription {
                        topic: destination.name.clone(),
                        messages: VecDeque::new(),
                    },
                );
                drop(state);
                self.inner.session().subscriptions.push(id);
                Source::Subscription(id)
            }
        };
        Ok(Box::new(MemoryConsumer {
            context: self.inner.clone(),
            source,
            selector,
            closed: false,
        }))
    }

    fn create_producer(&self) -> Result<Box<dyn MessageProducer>, BrokerError> {
        self.inner.check_usable()?;
        Ok(Box::new(MemoryProducer {
            context: self.inner.clone(),
        }))
    }

    fn acknowledge(&self) -> Result<(), BrokerError> {
        self.inner.check_usable()?;
        match self.inner.mode {
            SessionMode::ClientAcknowledge => {
                self.inner.session().unsettled.clear();
                Ok(())
            }
            SessionMode::SessionTransacted => Err(BrokerError::IllegalState(self.inner.mode)),
            SessionMode::AutoAcknowledge | SessionMode::DupsOkAcknowledge => Ok(()),
        }
    }

    fn commit(&self) -> Result<(), BrokerError> {
        self.inner.check_usable()?;
        if self.inner.mode != SessionMode::SessionTransacted {
            return Err(BrokerError::IllegalState(self.inner.mode));
        }
        let sends = {
            let mut session = self.inner.session();
            session.unsettled.clear();
            std::mem::take(&mut session.pending_sends)
        };
        if !sends.is_empty() {
            let mut state = self.inner.broker.lock();
            for (destination, stored) in sends {
                state.deliver(&destination, stored);
            }
            self.inner.broker.arrived.notify_all();
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), BrokerError> {
        self.inner.check_usable()?;
        if self.inner.mode != SessionMode::SessionTransacted {
            return Err(BrokerError::IllegalState(self.inner.mode));
        }
        self.inner.session().pending_sends.clear();
        self.inner.requeue_unsettled();
        Ok(())
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.session().pending_sends.clear();
        self.inner.requeue_unsettled();
        let subscriptions = std::mem::take(&mut self.inner.session().subscriptions);
        {
            let mut state = self.inner.broker.lock();
            for id in subscriptions {
                state.subscriptions.remove(&id);
            }
            self.inner.broker.arrived.notify_all();
        }
        self.inner.broker.open_sessions.fetch_sub(1, Ordering::SeqCst);
        debug!(session = self.inner.id, "in-memory session closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct MemoryConsumer {
    context: Arc<ContextInner>,
    source: Source,
    selector: Option<Selector>,
    closed: bool,
}

impl MessageConsumer for MemoryConsumer {
    fn receive(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let deadline = Instant::now() + timeout;
        let broker = &self.context.broker;
        let mut state = broker.lock();
        loop {
            self.context.check_usable()?;
            let now = Instant::now();
            match state.take(&self.source, self.selector.as_ref(), now) {
                Ok(stored) => {
                    let message = stored.message.clone();
                    if !self.context.mode.acknowledges_on_receive() {
                        self.context.session().unsettled.push((self.source.clone(), stored));
                    }
                    return Ok(Some(message));
                }
                Err(next_available) => {
                    if now >= deadline {
                        return Ok(None);
                    }
                    let wake = next_available.map_or(deadline, |at| at.min(deadline));
                    state = broker
                        .arrived
                        .wait_timeout(state, wake.saturating_duration_since(now))
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct MemoryProducer {
    context: Arc<ContextInner>,
}

impl MessageProducer for MemoryProducer {
    fn send(
        &mut self,
        destination: &Destination,
        mut message: BrokerMessage,
        options: &SendOptions,
    ) -> Result<(), BrokerError> {
        self.context.check_usable()?;
        if self.context.broker.fail_sends.load(Ordering::SeqCst) {
            return Err(BrokerError::Io("send rejected by broker".to_string()));
        }
        self.context.broker.stamp(destination, &mut message, options);
        let stored = BrokerInner::store(message, options);
        if self.context.mode == SessionMode::SessionTransacted {
            self.context
                .session()
                .pending_sends
                .push((destination.clone(), stored));
        } else {
            self.context.broker.publish(destination, stored);
        }
        Ok(())
    }
}

// =============================================================================
// Selectors
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Text(String),
    Long(i64),
    Bool(bool),
}

impl Literal {
    fn matches(&self, value: &MetadataValue) -> bool {
        match (self, value) {
            (Literal::Text(expected), MetadataValue::String(actual)) => expected == actual,
            (Literal::Long(expected), MetadataValue::Long(actual)) => expected == actual,
            (Literal::Bool(expected), MetadataValue::Bool(actual)) => expected == actual,
            _ => false,
        }
    }
}

/// Conjunction of `name = literal` clauses.
#[derive(Debug, Clone, PartialEq)]
struct Selector {
    clauses: Vec<(String, Literal)>,
}

impl Selector {
    fn parse(input: &str) -> Result<Self, BrokerError> {
        let invalid = || BrokerError::InvalidSelector(input.to_string());
        let mut clauses = Vec::new();
        let mut rest = input.trim();
        loop {
            let (name, after) = rest.split_once('=').ok_or_else(invalid)?;
            let name = name.trim();
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
                return Err(invalid());
            }
            let after = after.trim_start();
            let (literal, remaining) = if let Some(quoted) = after.strip_prefix('\'') {
                let end = quoted.find('\'').ok_or_else(invalid)?;
                (Literal::Text(quoted[..end].to_string()), &quoted[end + 1..])
            } else {
                let end = after.find(char::is_whitespace).unwrap_or(after.len());
                let token = &after[..end];
                let literal = if token.eq_ignore_ascii_case("true") {
                    Literal::Bool(true)
                } else if token.eq_ignore_ascii_case("false") {
                    Literal::Bool(false)
                } else {
                    Literal::Long(token.parse().map_err(|_| invalid())?)
                };
                (literal, &after[end..])
            };
            clauses.push((name.to_string(), literal));

            let remaining = remaining.trim_start();
            if remaining.is_empty() {
                return Ok(Self { clauses });
            }
            let keyword = remaining.get(..3).ok_or_else(invalid)?;
            let after_keyword = &remaining[3..];
            if !keyword.eq_ignore_ascii_case("and") || !after_keyword.starts_with(char::is_whitespace) {
                return Err(invalid());
            }
            rest = after_keyword.trim_start();
        }
    }

    fn matches(&self, message: &BrokerMessage) -> bool {
        self.clauses.iter().all(|(name, literal)| {
            message
                .properties
                .get(name)
                .cloned()
                .or_else(|| metadata::header_value(&message.headers, name))
                .is_some_and(|value| literal.matches(&value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Body, DeliveryMode};

    fn queue() -> Destination {
        Destination::queue("Q1")
    }

    fn receive(consumer: &mut Box<dyn MessageConsumer>) -> Option<BrokerMessage> {
        consumer.receive(Duration::from_millis(50)).unwrap()
    }

    #[test]
    fn test_queue_fifo_and_stamping() {
        let broker = InMemoryBroker::new();
        broker.send(&queue(), BrokerMessage::text("a")).unwrap();
        broker.send(&queue(), BrokerMessage::text("b")).unwrap();
        assert_eq!(broker.queue_depth("Q1"), 2);

        let context = broker.create_context(SessionMode::AutoAcknowledge).unwrap();
        let mut consumer = context.create_consumer(&queue(), None).unwrap();
        let first = receive(&mut consumer).unwrap();
        assert_eq!(first.body, Body::Text("a".into()));
        assert!(first.headers.message_id.as_deref().unwrap().starts_with("ID:"));
        assert!(first.headers.timestamp > 0);
        assert_eq!(first.headers.destination, Some(queue()));
        assert_eq!(receive(&mut consumer).unwrap().body, Body::Text("b".into()));
        assert!(receive(&mut consumer).is_none());
    }

    #[test]
    fn test_topic_fans_out_to_subscribers() {
        let broker = InMemoryBroker::new();
        let topic = Destination::topic("prices");
        let context = broker.create_context(SessionMode::AutoAcknowledge).unwrap();
        let mut a = context.create_consumer(&topic, None).unwrap();
        let mut b = context.create_consumer(&topic, None).unwrap();

        broker.send(&topic, BrokerMessage::text("tick")).unwrap();
        assert_eq!(receive(&mut a).unwrap().body, Body::Text("tick".into()));
        assert_eq!(receive(&mut b).unwrap().body, Body::Text("tick".into()));
    }

    #[test]
    fn test_client_ack_redelivers_on_close() {
        let broker = InMemoryBroker::new();
        broker.send(&queue(), BrokerMessage::text("a")).unwrap();
        broker.send(&queue(), BrokerMessage::text("b")).unwrap();

        let context = broker.create_context(SessionMode::ClientAcknowledge).unwrap();
        let mut consumer = context.create_consumer(&queue(), None).unwrap();
        receive(&mut consumer).unwrap();
        context.acknowledge().unwrap();
        receive(&mut consumer).unwrap();
        context.close();

        let redelivered = broker.browse("Q1");
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].body, Body::Text("b".into()));
        assert!(redelivered[0].headers.redelivered);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[test]
    fn test_transacted_commit_and_rollback() {
        let broker = InMemoryBroker::new();
        let context = broker.create_context(SessionMode::SessionTransacted).unwrap();
        let mut producer = context.create_producer().unwrap();
        producer
            .send(&queue(), BrokerMessage::text("pending"), &SendOptions::default())
            .unwrap();
        assert_eq!(broker.queue_depth("Q1"), 0);
        context.commit().unwrap();
        assert_eq!(broker.queue_depth("Q1"), 1);

        let mut consumer = context.create_consumer(&queue(), None).unwrap();
        receive(&mut consumer).unwrap();
        context.rollback().unwrap();
        assert!(broker.browse("Q1")[0].headers.redelivered);

        receive(&mut consumer).unwrap();
        context.commit().unwrap();
        assert_eq!(broker.queue_depth("Q1"), 0);
        assert_eq!(context.acknowledge(), Err(BrokerError::IllegalState(SessionMode::SessionTransacted)));
    }

    #[test]
    fn test_selector_filters_properties_and_headers() {
        let broker = InMemoryBroker::new();
        broker
            .send(&queue(), BrokerMessage::text("blue").with_property("color", "blue"))
            .unwrap();
        let mut red = BrokerMessage::text("red").with_property("color", "red").with_property("size", 3i64);
        red.headers.jms_type = Some("paint".into());
        broker.send(&queue(), red).unwrap();

        let context = broker.create_context(SessionMode::AutoAcknowledge).unwrap();
        let mut consumer = context
            .create_consumer(&queue(), Some("color = 'red' AND size = 3 and JMSType = 'paint'"))
            .unwrap();
        assert_eq!(receive(&mut consumer).unwrap().body, Body::Text("red".into()));
        assert!(receive(&mut consumer).is_none());
        assert_eq!(broker.queue_depth("Q1"), 1);

        for bad in ["color", "color = 'red", "= 'x'", "a = 1 OR b = 2", "a = x"] {
            assert!(matches!(
                context.create_consumer(&queue(), Some(bad)),
                Err(BrokerError::InvalidSelector(_))
            ));
        }
    }

    #[test]
    fn test_delivery_delay_and_ttl() {
        let broker = InMemoryBroker::new();
        let context = broker.create_context(SessionMode::AutoAcknowledge).unwrap();
        let mut producer = context.create_producer().unwrap();
        let delayed = SendOptions {
            delivery_delay: Some(Duration::from_millis(30)),
            ..SendOptions::default()
        };
        producer.send(&queue(), BrokerMessage::text("later"), &delayed).unwrap();
        let short_lived = SendOptions {
            time_to_live: Some(Duration::from_millis(1)),
            delivery_mode: Some(DeliveryMode::NonPersistent),
            ..SendOptions::default()
        };
        producer.send(&queue(), BrokerMessage::text("gone"), &short_lived).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let mut consumer = context.create_consumer(&queue(), None).unwrap();
        assert!(consumer.receive(Duration::from_millis(1)).unwrap().is_none());
        let later = consumer.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(later.body, Body::Text("later".into()));
        assert!(later.headers.delivery_time >= later.headers.timestamp + 30);
        assert!(consumer.receive(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_close_unblocks_receive() {
        let broker = InMemoryBroker::new();
        let context = broker.create_context(SessionMode::AutoAcknowledge).unwrap();
        let mut consumer = context.create_consumer(&queue(), None).unwrap();
        let closer = context.clone();
        let handle = std::thread::spawn(move || consumer.receive(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        closer.close();
        assert_eq!(handle.join().unwrap(), Err(BrokerError::Closed));
    }

    #[test]
    fn test_fault_injection() {
        let broker = InMemoryBroker::new();
        let context = broker.create_context(SessionMode::AutoAcknowledge).unwrap();
        let mut producer = context.create_producer().unwrap();

        broker.fail_sends(true);
        let err = producer
            .send(&queue(), BrokerMessage::text("x"), &SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, BrokerError::Io(_)));
        broker.fail_sends(false);

        broker.sever();
        let mut consumer = context.create_consumer(&queue(), None);
        assert!(matches!(consumer, Err(BrokerError::Io(_))));
        assert!(broker.create_context(SessionMode::AutoAcknowledge).is_err());
        broker.restore();
        consumer = context.create_consumer(&queue(), None);
        assert!(consumer.is_ok());
    }

    #[test]
    fn test_credentials() {
        let broker = InMemoryBroker::with_credentials("app", Some("secret"));
        assert!(matches!(
            broker.create_context(SessionMode::AutoAcknowledge),
            Err(BrokerError::Security(_))
        ));
        assert!(broker
            .create_context_with_credentials("app", Some("wrong"), SessionMode::AutoAcknowledge)
            .is_err());
        assert!(broker
            .create_context_with_credentials("app", Some("secret"), SessionMode::AutoAcknowledge)
            .is_ok());
    }
}
