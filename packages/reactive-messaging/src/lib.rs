//! # Reactive Messaging
//!
//! Wires application methods ("mediators") to external brokers through
//! named channels.
//!
//! ## Core Concepts
//!
//! - A **channel** is a name. Something produces into it, something
//!   consumes from it.
//! - A [`Mediator`] is a node in the graph: it consumes channels, produces
//!   a channel, or both.
//! - An [`Emitter`] lets the application push items into a channel.
//! - A [`Connector`] adapts an external transport; configuration decides
//!   which channels it serves.
//!
//! ## Architecture
//!
//! ```text
//! MessagingBuilder
//!     │ start()
//!     ▼
//! ConnectorRegistry.start_all()
//!     │
//!     ▼
//! MediatorManager
//!     ├─► initialize_emitters()  ──► ChannelRegistry (producers)
//!     ├─► analyze(mediator)      ──► MediatorDescriptor
//!     └─► initialize_and_run()
//!             ├─► plan: producers / consumers per channel
//!             ├─► resolve: connectors, merge, broadcast
//!             ├─► wire: deferred streams, multicast
//!             └─► validate: injection points
//!                     │
//!          problems? ─┼─► DeploymentError (nothing started)
//!                     ▼
//!              RunningGraph ──► FailureBus (terminated streams)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One producer, one consumer** per channel unless the consumer merges
//!    or the producer broadcasts
//! 2. **Pull-based streams** - a slow consumer slows its producer
//! 3. **First ack or nack wins** - later calls return the first outcome
//! 4. **Aggregate deployment** - every wiring problem is reported at once
//! 5. **Immutable graph** once started
//!
//! ## Example
//!
//! ```ignore
//! use reactive_messaging::{MapConfig, Mediator, MessagingBuilder};
//!
//! let runtime = MessagingBuilder::new()
//!     .config(MapConfig::new()
//!         .with("mp.messaging.incoming.in.connector", "smallrye-jms")
//!         .with("mp.messaging.outgoing.out.connector", "smallrye-jms"))
//!     .connector(jms)
//!     .mediator(
//!         Mediator::builder("Shouter", "uppercase")
//!             .incoming("in")
//!             .outgoing("out")
//!             .process(|text: String| async move { Ok(text.to_uppercase()) }),
//!     )
//!     .start()
//!     .await?;
//! ```

// Core modules
mod beans;
mod bus;
mod codec;
mod config;
mod connector;
mod emitter;
mod error;
mod manager;
mod mediator;
mod message;
mod registry;
mod runtime;
mod stream;
mod validator;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export message model
pub use message::{
    AckFuture, AckState, FromPayload, IntoPayload, Json, Message, MessageBuilder, Metadata,
    MetadataValue, Payload,
};

// Re-export codec seam
pub use codec::{resolve_codec, JsonCodec, PayloadCodec, SharedCodec, APPLICATION_JSON, CONTENT_TYPE};

// Re-export bean registry
pub use beans::{BeanRegistry, NamedBean};

// Re-export configuration
pub use config::{
    configured_channels, ConfigSource, ConnectorConfig, Direction, EnvConfig, MapConfig,
    SharedConfig, CONNECTOR_KEY,
};

// Re-export error types
pub use error::{
    ConfigError, ConnectorError, DefinitionError, DeploymentError, DeploymentProblem, FlowError,
    RegistryError,
};

// Re-export stream plumbing
pub use stream::{
    concat, deferred, from_messages, merge, multicast, terminate_on_error, DeferredSlot,
    MessageStream, Publisher, Subscriber,
};

// Re-export graph building blocks
pub use connector::{Connector, ConnectorRegistry, SharedConnector};
pub use emitter::{Delivery, Emitter, EmitterSpec, EmitterState, OverflowSpec, DEFAULT_BUFFER_SIZE};
pub use manager::{MediatorManager, RunningGraph};
pub use mediator::{
    AckPolicy, AnalyzedMediator, Arity, ItemKind, Mediator, MediatorBuilder, MediatorDeclaration,
    MediatorDescriptor, MergePolicy, MethodSignature, Shape,
};
pub use registry::ChannelRegistry;
pub use validator::{validate, InjectionKind, InjectionPoint};

// Re-export bus types
pub use bus::{ChannelFailure, FailureBus, FailureOrigin};

// Re-export runtime types
pub use runtime::{ExitStatus, MessagingBuilder, MessagingRuntime, DEFAULT_SHUTDOWN_DEADLINE};

// Re-export commonly used external types
pub use async_trait::async_trait;
