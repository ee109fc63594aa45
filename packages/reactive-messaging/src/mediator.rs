//! Mediators: application functions that are nodes of the channel graph.
//!
//! A mediator is declared with the builder returned by [`Mediator::builder`]:
//! channels first, then one terminal method that supplies the function and
//! fixes the signature.
//!
//! ```ignore
//! let uppercase = Mediator::builder("Uppercase", "process")
//!     .incoming("in")
//!     .outgoing("out")
//!     .process(|text: String| async move { Ok(text.to_uppercase()) });
//! ```
//!
//! # Shapes
//!
//! The signature decides the shape, first match wins:
//!
//! | Return       | Parameter    | Shape                      |
//! |--------------|--------------|----------------------------|
//! | stream of M  | stream of M  | processor, message mode    |
//! | stream of T  | stream of T  | processor, payload mode    |
//! | stream       | none         | publisher                  |
//! | none         | stream       | subscriber                 |
//! | T            | U            | processor, per item        |
//! | none         | T            | consumer, per item         |
//!
//! # Acknowledgement
//!
//! Payload-mode mediators default to [`AckPolicy::Post`], message-mode ones
//! to [`AckPolicy::Manual`]. Per-item processors in payload mode chain the
//! acknowledgement: the output message carries the input's ack, so the input
//! is acked when the downstream acks the output. Stream shapes cannot
//! correlate outputs with inputs and ack each input when it is handed to the
//! function.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use tracing::warn;

use crate::error::{ConfigError, DefinitionError, FlowError};
use crate::message::{FromPayload, IntoPayload, Message};
use crate::stream::{terminate_on_error, MessageStream};

// =============================================================================
// Descriptor Types
// =============================================================================

/// Graph role of a mediator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Consumes and produces.
    Processor,
    /// Consumes a whole stream.
    Subscriber,
    /// Produces a stream from nothing.
    Publisher,
    /// Consumes item by item.
    Consumer,
}

impl Shape {
    fn as_str(self) -> &'static str {
        match self {
            Shape::Processor => "processor",
            Shape::Subscriber => "subscriber",
            Shape::Publisher => "publisher",
            Shape::Consumer => "consumer",
        }
    }
}

/// What a mediator sees: whole messages or their payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// The function handles [`Message`]s.
    Message,
    /// The function handles payload values.
    Payload,
}

/// One side of a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// A stream of items.
    Stream(ItemKind),
    /// A single item.
    Item(ItemKind),
}

/// Return and parameter of a mediator function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignature {
    /// What the function returns, if anything.
    pub returns: Option<Arity>,
    /// What the function takes, if anything.
    pub parameter: Option<Arity>,
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn side(arity: Option<Arity>) -> &'static str {
            match arity {
                None => "()",
                Some(Arity::Stream(ItemKind::Message)) => "Stream<Message>",
                Some(Arity::Stream(ItemKind::Payload)) => "Stream<T>",
                Some(Arity::Item(ItemKind::Message)) => "Message",
                Some(Arity::Item(ItemKind::Payload)) => "T",
            }
        }
        write!(f, "fn({}) -> {}", side(self.parameter), side(self.returns))
    }
}

/// When a mediator's input messages are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Before the function runs.
    Pre,
    /// After the function succeeds (or chained to the output).
    Post,
    /// The function acks itself.
    Manual,
}

impl FromStr for AckPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PRE" | "PRE_PROCESSING" => Ok(AckPolicy::Pre),
            "POST" | "POST_PROCESSING" => Ok(AckPolicy::Post),
            "MANUAL" => Ok(AckPolicy::Manual),
            _ => Err(ConfigError::InvalidValue {
                key: "acknowledgment".into(),
                value: value.to_string(),
                expected: "PRE_PROCESSING, POST_PROCESSING or MANUAL",
            }),
        }
    }
}

/// How several producers of one incoming channel are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// A single producer is required.
    #[default]
    None,
    /// Interleave, keeping each producer's order.
    Merge,
    /// Drain producers one after another.
    Concat,
}

impl FromStr for MergePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(MergePolicy::None),
            "MERGE" => Ok(MergePolicy::Merge),
            "CONCAT" => Ok(MergePolicy::Concat),
            _ => Err(ConfigError::InvalidValue {
                key: "merge".into(),
                value: value.to_string(),
                expected: "NONE, MERGE or CONCAT",
            }),
        }
    }
}

/// Everything declared about a mediator before it is analyzed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorDeclaration {
    /// Owning bean.
    pub bean: String,
    /// Method name.
    pub method: String,
    /// The function's signature.
    pub signature: MethodSignature,
    /// Incoming channels, in declaration order.
    pub incoming: Vec<String>,
    /// Outgoing channel.
    pub outgoing: Option<String>,
    /// Acknowledgement override.
    pub acknowledgment: Option<AckPolicy>,
    /// Merge policy for incoming channels with several producers.
    pub merge: MergePolicy,
    /// Multicast the output to every consumer.
    pub broadcast: bool,
}

/// Validated, parsed form of a [`MediatorDeclaration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorDescriptor {
    /// Owning bean.
    pub bean: String,
    /// Method name.
    pub method: String,
    /// Incoming channels, deduplicated, in declaration order.
    pub incoming: Vec<String>,
    /// Outgoing channel.
    pub outgoing: Option<String>,
    /// Graph role.
    pub shape: Shape,
    /// Message or payload mode.
    pub mode: ItemKind,
    /// Whether the function is invoked per item (as opposed to per stream).
    pub per_item: bool,
    /// Effective acknowledgement policy.
    pub ack: AckPolicy,
    /// Merge policy.
    pub merge: MergePolicy,
    /// Multicast the output.
    pub broadcast: bool,
}

impl MediatorDescriptor {
    /// Apply the shape decision table and check the channel declarations.
    pub fn parse(declaration: &MediatorDeclaration) -> Result<Self, DefinitionError> {
        use Arity::{Item, Stream};

        let signature = declaration.signature;
        let (shape, mode, per_item) = match (signature.returns, signature.parameter) {
            (Some(Stream(ItemKind::Message)), Some(Stream(ItemKind::Message))) => {
                (Shape::Processor, ItemKind::Message, false)
            }
            (Some(Stream(ItemKind::Payload)), Some(Stream(ItemKind::Payload))) => {
                (Shape::Processor, ItemKind::Payload, false)
            }
            (Some(Stream(kind)), None) => (Shape::Publisher, kind, false),
            (None, Some(Stream(kind))) => (Shape::Subscriber, kind, false),
            (Some(Item(_)), Some(Item(kind))) => (Shape::Processor, kind, true),
            (None, Some(Item(kind))) => (Shape::Consumer, kind, true),
            _ => return Err(DefinitionError::UnsupportedSignature(signature.to_string())),
        };

        let mut incoming: Vec<String> = Vec::with_capacity(declaration.incoming.len());
        for name in &declaration.incoming {
            if !incoming.contains(name) {
                incoming.push(name.clone());
            }
        }
        if incoming.iter().any(String::is_empty)
            || declaration.outgoing.as_deref() == Some("")
        {
            return Err(DefinitionError::EmptyChannelName);
        }

        let mismatch = |reason| DefinitionError::ShapeMismatch {
            shape: shape.as_str(),
            reason,
        };
        match shape {
            Shape::Processor => {
                if declaration.outgoing.is_none() {
                    return Err(mismatch("must declare exactly one outgoing channel"));
                }
                if incoming.is_empty() {
                    return Err(mismatch("must declare at least one incoming channel"));
                }
            }
            Shape::Subscriber | Shape::Consumer => {
                if declaration.outgoing.is_some() {
                    return Err(mismatch("must not declare an outgoing channel"));
                }
                if incoming.is_empty() {
                    return Err(mismatch("must declare at least one incoming channel"));
                }
            }
            Shape::Publisher => {
                if !incoming.is_empty() {
                    return Err(mismatch("must not declare incoming channels"));
                }
                if declaration.outgoing.is_none() {
                    return Err(mismatch("must declare exactly one outgoing channel"));
                }
            }
        }

        let ack = declaration.acknowledgment.unwrap_or(match mode {
            ItemKind::Payload => AckPolicy::Post,
            ItemKind::Message => AckPolicy::Manual,
        });

        Ok(Self {
            bean: declaration.bean.clone(),
            method: declaration.method.clone(),
            incoming,
            outgoing: declaration.outgoing.clone(),
            shape,
            mode,
            per_item,
            ack,
            merge: declaration.merge,
            broadcast: declaration.broadcast,
        })
    }

    /// `bean#method`, used in diagnostics.
    pub fn qualified_name(&self) -> String {
        format!("{}#{}", self.bean, self.method)
    }
}

// =============================================================================
// Invocation
// =============================================================================

type StreamFn = Box<dyn FnOnce(MessageStream) -> MessageStream + Send>;
type GeneratorFn = Box<dyn FnOnce() -> MessageStream + Send>;
type StreamSinkFn = Box<dyn FnOnce(MessageStream) -> BoxFuture<'static, Result<(), FlowError>> + Send>;
type TransformFn = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Message, FlowError>> + Send + Sync>;
type SinkFn = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), FlowError>> + Send + Sync>;

enum Invocation {
    StreamProcessor(StreamFn),
    Generator(GeneratorFn),
    StreamSubscriber(StreamSinkFn),
    Transform(TransformFn),
    Sink(SinkFn),
}

fn processing_error(err: anyhow::Error) -> FlowError {
    FlowError::Processing(format!("{err:#}"))
}

/// First error seen on a stream handed to user code as plain items.
#[derive(Clone, Default)]
struct ErrorSlot(Arc<Mutex<Option<FlowError>>>);

impl ErrorSlot {
    fn set(&self, error: FlowError) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert(error);
    }

    fn take(&self) -> Option<FlowError> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Strip `Result` from a message stream, parking the terminating error.
fn messages_of(input: MessageStream, slot: ErrorSlot) -> BoxStream<'static, Message> {
    input
        .scan(slot, |slot, item| {
            future::ready(match item {
                Ok(message) => Some(message),
                Err(error) => {
                    slot.set(error);
                    None
                }
            })
        })
        .boxed()
}

/// Decode a message stream into payload values, parking the first error.
fn payloads_of<I: FromPayload>(input: MessageStream, slot: ErrorSlot) -> BoxStream<'static, I> {
    input
        .scan(slot, |slot, item| {
            future::ready(match item.and_then(|message| message.decode::<I>()) {
                Ok(value) => Some(value),
                Err(error) => {
                    slot.set(error);
                    None
                }
            })
        })
        .boxed()
}

/// Append the parked error, if any, after `output` ends.
fn rethrow(output: MessageStream, slot: ErrorSlot) -> MessageStream {
    output
        .chain(stream::once(async move { slot.take() }).filter_map(|error| future::ready(error.map(Err))))
        .boxed()
}

async fn ack_logged(message: &Message) {
    if let Err(error) = message.ack().await {
        warn!(error = %error, "acknowledgement failed");
    }
}

async fn nack_logged(message: &Message, reason: FlowError) {
    if let Err(error) = message.nack(reason).await {
        warn!(error = %error, "negative acknowledgement failed");
    }
}

/// Ack every message as it is pulled through.
fn ack_on_handoff(input: MessageStream) -> MessageStream {
    input
        .then(|item| async move {
            if let Ok(message) = &item {
                ack_logged(message).await;
            }
            item
        })
        .boxed()
}

// =============================================================================
// Mediator
// =============================================================================

/// A declared mediator: its declaration plus the function behind it.
pub struct Mediator {
    declaration: MediatorDeclaration,
    invocation: Invocation,
}

impl Mediator {
    /// Start declaring a mediator owned by `bean`.
    pub fn builder(bean: impl Into<String>, method: impl Into<String>) -> MediatorBuilder {
        MediatorBuilder {
            bean: bean.into(),
            method: method.into(),
            incoming: Vec::new(),
            outgoing: None,
            acknowledgment: None,
            merge: MergePolicy::None,
            broadcast: false,
        }
    }

    /// The declaration.
    pub fn declaration(&self) -> &MediatorDeclaration {
        &self.declaration
    }

    /// Validate the declaration.
    pub fn analyze(self) -> Result<AnalyzedMediator, DefinitionError> {
        let descriptor = MediatorDescriptor::parse(&self.declaration)?;
        Ok(AnalyzedMediator {
            descriptor,
            invocation: self.invocation,
        })
    }
}

impl fmt::Debug for Mediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mediator")
            .field("declaration", &self.declaration)
            .finish_non_exhaustive()
    }
}

/// A mediator whose declaration passed analysis.
pub struct AnalyzedMediator {
    descriptor: MediatorDescriptor,
    invocation: Invocation,
}

/// Runnable graph node built from an analyzed mediator.
pub(crate) enum Node {
    /// Input stream to output stream.
    Processor(StreamFn),
    /// Output stream from nothing.
    Publisher(GeneratorFn),
    /// Input stream to completion.
    Sink(StreamSinkFn),
}

impl AnalyzedMediator {
    /// The parsed descriptor.
    pub fn descriptor(&self) -> &MediatorDescriptor {
        &self.descriptor
    }

    /// Wrap the function with the acknowledgement policy.
    pub(crate) fn into_node(self) -> Node {
        let ack = self.descriptor.ack;
        let mode = self.descriptor.mode;
        match self.invocation {
            Invocation::StreamProcessor(f) => Node::Processor(Box::new(move |input| {
                let input = if ack == AckPolicy::Manual {
                    input
                } else {
                    ack_on_handoff(input)
                };
                terminate_on_error(f(input))
            })),
            Invocation::Generator(f) => Node::Publisher(Box::new(move || terminate_on_error(f()))),
            Invocation::StreamSubscriber(f) => Node::Sink(Box::new(move |input| {
                let input = if ack == AckPolicy::Manual {
                    input
                } else {
                    ack_on_handoff(input)
                };
                f(input)
            })),
            Invocation::Transform(f) => Node::Processor(Box::new(move |input| {
                let output = input.then(move |item| {
                    let f = f.clone();
                    async move {
                        let message = item?;
                        if ack == AckPolicy::Pre {
                            ack_logged(&message).await;
                        }
                        match f.as_ref()(message.clone()).await {
                            Ok(output) => {
                                if ack == AckPolicy::Post && mode == ItemKind::Message {
                                    ack_logged(&message).await;
                                }
                                Ok(output)
                            }
                            Err(error) => {
                                if ack != AckPolicy::Manual {
                                    nack_logged(&message, error.clone()).await;
                                }
                                Err(error)
                            }
                        }
                    }
                });
                terminate_on_error(output.boxed())
            })),
            Invocation::Sink(f) => Node::Sink(Box::new(move |mut input| {
                async move {
                    while let Some(item) = input.next().await {
                        let message = item?;
                        if ack == AckPolicy::Pre {
                            ack_logged(&message).await;
                        }
                        match f.as_ref()(message.clone()).await {
                            Ok(()) => {
                                if ack == AckPolicy::Post {
                                    ack_logged(&message).await;
                                }
                            }
                            Err(error) => {
                                if ack != AckPolicy::Manual {
                                    nack_logged(&message, error.clone()).await;
                                }
                                return Err(error);
                            }
                        }
                    }
                    Ok(())
                }
                .boxed()
            })),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Declares a mediator's channels, then its function.
#[derive(Debug, Clone)]
pub struct MediatorBuilder {
    bean: String,
    method: String,
    incoming: Vec<String>,
    outgoing: Option<String>,
    acknowledgment: Option<AckPolicy>,
    merge: MergePolicy,
    broadcast: bool,
}

impl MediatorBuilder {
    /// Add an incoming channel.
    pub fn incoming(mut self, channel: impl Into<String>) -> Self {
        self.incoming.push(channel.into());
        self
    }

    /// Set the outgoing channel.
    pub fn outgoing(mut self, channel: impl Into<String>) -> Self {
        self.outgoing = Some(channel.into());
        self
    }

    /// Override the acknowledgement policy.
    pub fn acknowledgment(mut self, policy: AckPolicy) -> Self {
        self.acknowledgment = Some(policy);
        self
    }

    /// Accept several producers on the incoming channels.
    pub fn merge(mut self, policy: MergePolicy) -> Self {
        self.merge = policy;
        self
    }

    /// Multicast the output to every consumer of the outgoing channel.
    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    fn finish(self, returns: Option<Arity>, parameter: Option<Arity>, invocation: Invocation) -> Mediator {
        Mediator {
            declaration: MediatorDeclaration {
                bean: self.bean,
                method: self.method,
                signature: MethodSignature { returns, parameter },
                incoming: self.incoming,
                outgoing: self.outgoing,
                acknowledgment: self.acknowledgment,
                merge: self.merge,
                broadcast: self.broadcast,
            },
            invocation,
        }
    }

    /// `fn(T) -> U`, per payload.
    pub fn process<I, O, F, Fut>(self, f: F) -> Mediator
    where
        I: FromPayload,
        O: IntoPayload,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let f = Arc::new(f);
        let transform: TransformFn = Arc::new(move |message: Message| {
            let f = f.clone();
            async move {
                let input = message.decode::<I>()?;
                let output = f.as_ref()(input).await.map_err(processing_error)?;
                Ok(message.with_payload(output.into_payload()?))
            }
            .boxed()
        });
        self.finish(
            Some(Arity::Item(ItemKind::Payload)),
            Some(Arity::Item(ItemKind::Payload)),
            Invocation::Transform(transform),
        )
    }

    /// `fn(Message) -> Message`, per message.
    pub fn process_messages<F, Fut>(self, f: F) -> Mediator
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Message>> + Send + 'static,
    {
        let f = Arc::new(f);
        let transform: TransformFn = Arc::new(move |message: Message| {
            let f = f.clone();
            async move { f.as_ref()(message).await.map_err(processing_error) }.boxed()
        });
        self.finish(
            Some(Arity::Item(ItemKind::Message)),
            Some(Arity::Item(ItemKind::Message)),
            Invocation::Transform(transform),
        )
    }

    /// `fn(T)`, per payload.
    pub fn consume<I, F, Fut>(self, f: F) -> Mediator
    where
        I: FromPayload,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        let sink: SinkFn = Arc::new(move |message: Message| {
            let f = f.clone();
            async move {
                let input = message.decode::<I>()?;
                f.as_ref()(input).await.map_err(processing_error)
            }
            .boxed()
        });
        self.finish(None, Some(Arity::Item(ItemKind::Payload)), Invocation::Sink(sink))
    }

    /// `fn(Message)`, per message.
    pub fn consume_messages<F, Fut>(self, f: F) -> Mediator
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        let sink: SinkFn = Arc::new(move |message: Message| {
            let f = f.clone();
            async move { f.as_ref()(message).await.map_err(processing_error) }.boxed()
        });
        self.finish(None, Some(Arity::Item(ItemKind::Message)), Invocation::Sink(sink))
    }

    /// `fn(Stream<T>) -> Stream<U>`.
    pub fn process_stream<I, O, F, S>(self, f: F) -> Mediator
    where
        I: FromPayload,
        O: IntoPayload,
        F: FnOnce(BoxStream<'static, I>) -> S + Send + 'static,
        S: Stream<Item = O> + Send + 'static,
    {
        let processor: StreamFn = Box::new(move |input| {
            let slot = ErrorSlot::default();
            let output = f(payloads_of::<I>(input, slot.clone()))
                .map(|value| value.into_payload().map(Message::new))
                .boxed();
            rethrow(output, slot)
        });
        self.finish(
            Some(Arity::Stream(ItemKind::Payload)),
            Some(Arity::Stream(ItemKind::Payload)),
            Invocation::StreamProcessor(processor),
        )
    }

    /// `fn(Stream<Message>) -> Stream<Message>`.
    pub fn process_message_stream<F, S>(self, f: F) -> Mediator
    where
        F: FnOnce(BoxStream<'static, Message>) -> S + Send + 'static,
        S: Stream<Item = Message> + Send + 'static,
    {
        let processor: StreamFn = Box::new(move |input| {
            let slot = ErrorSlot::default();
            let output = f(messages_of(input, slot.clone())).map(Ok).boxed();
            rethrow(output, slot)
        });
        self.finish(
            Some(Arity::Stream(ItemKind::Message)),
            Some(Arity::Stream(ItemKind::Message)),
            Invocation::StreamProcessor(processor),
        )
    }

    /// `fn() -> Stream<T>`.
    pub fn generate<O, F, S>(self, f: F) -> Mediator
    where
        O: IntoPayload,
        F: FnOnce() -> S + Send + 'static,
        S: Stream<Item = O> + Send + 'static,
    {
        let generator: GeneratorFn = Box::new(move || {
            f().map(|value| value.into_payload().map(Message::new)).boxed()
        });
        self.finish(
            Some(Arity::Stream(ItemKind::Payload)),
            None,
            Invocation::Generator(generator),
        )
    }

    /// `fn() -> Stream<Message>`.
    pub fn generate_messages<F, S>(self, f: F) -> Mediator
    where
        F: FnOnce() -> S + Send + 'static,
        S: Stream<Item = Message> + Send + 'static,
    {
        let generator: GeneratorFn = Box::new(move || f().map(Ok).boxed());
        self.finish(
            Some(Arity::Stream(ItemKind::Message)),
            None,
            Invocation::Generator(generator),
        )
    }

    /// `fn(Stream<T>)`.
    pub fn subscribe<I, F, Fut>(self, f: F) -> Mediator
    where
        I: FromPayload,
        F: FnOnce(BoxStream<'static, I>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let subscriber: StreamSinkFn = Box::new(move |input| {
            let slot = ErrorSlot::default();
            let done = f(payloads_of::<I>(input, slot.clone()));
            async move {
                done.await.map_err(processing_error)?;
                slot.take().map_or(Ok(()), Err)
            }
            .boxed()
        });
        self.finish(
            None,
            Some(Arity::Stream(ItemKind::Payload)),
            Invocation::StreamSubscriber(subscriber),
        )
    }

    /// `fn(Stream<Message>)`.
    pub fn subscribe_messages<F, Fut>(self, f: F) -> Mediator
    where
        F: FnOnce(BoxStream<'static, Message>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let subscriber: StreamSinkFn = Box::new(move |input| {
            let slot = ErrorSlot::default();
            let done = f(messages_of(input, slot.clone()));
            async move {
                done.await.map_err(processing_error)?;
                slot.take().map_or(Ok(()), Err)
            }
            .boxed()
        });
        self.finish(
            None,
            Some(Arity::Stream(ItemKind::Message)),
            Invocation::StreamSubscriber(subscriber),
        )
    }
}
