//! # JMS Connector
//!
//! Bridges channels to a JMS-style broker. The broker client is
//! synchronous; the channel graph is pull-based and async. Each channel
//! binding runs its blocking broker calls on a worker from a shared pool
//! and meets the async side at a single-slot handoff, so a slow mediator
//! slows broker consumption instead of filling memory.
//!
//! ## Architecture
//!
//! ```text
//!              inbound                                  outbound
//! broker ──receive()──► pool worker            stream ──next()──► consume loop
//!                           │ reserve slot                          │ SendRequest
//!                           ▼                                       ▼
//!                   handoff (capacity 1)                     pool worker ──send()──► broker
//!                           │                                       │
//!                           ▼                                       ▼
//!                    MessageStream ──► graph              reply ──► ack / nack
//! ```
//!
//! ## Session Modes
//!
//! | Mode | `ack` | `nack` |
//! |------|-------|--------|
//! | `AUTO_ACKNOWLEDGE`, `DUPS_OK_ACKNOWLEDGE` | no-op | no-op |
//! | `CLIENT_ACKNOWLEDGE` | acknowledges the session | no-op, redelivered on close |
//! | `SESSION_TRANSACTED` | commits | rolls back |
//!
//! ## Example
//!
//! ```ignore
//! use reactive_messaging::{BeanRegistry, MapConfig, MessagingBuilder};
//! use reactive_messaging_jms::{InMemoryBroker, JmsConnector, SharedConnectionFactory};
//!
//! let mut beans = BeanRegistry::new();
//! beans.register::<SharedConnectionFactory>(Arc::new(InMemoryBroker::new()));
//!
//! let runtime = MessagingBuilder::new()
//!     .config(MapConfig::new()
//!         .with("mp.messaging.incoming.in.connector", "smallrye-jms")
//!         .with("mp.messaging.incoming.in.destination", "Q1"))
//!     .connector(Arc::new(JmsConnector::new(Arc::new(beans))))
//!     .mediator(printer)
//!     .start()
//!     .await?;
//! ```

mod api;
mod binding;
mod config;
mod connector;
mod memory;
pub mod metadata;
mod pool;
mod sink;
mod source;

// Scenario tests (test-only)
#[cfg(test)]
mod scenario_tests;

// Re-export broker client seam
pub use api::{
    Body, BrokerError, BrokerMessage, ConnectionFactory, DeliveryMode, Destination,
    DestinationType, Headers, JmsContext, MessageConsumer, MessageProducer, SendOptions,
    SessionMode, SharedConnectionFactory, SharedContext, DEFAULT_PRIORITY,
};

// Re-export configuration
pub use config::{
    JmsChannelConfig, PoolConfig, DEFAULT_MAX_POOL_SIZE, DEFAULT_POOL_TTL, MAX_POOL_SIZE_KEY,
    POOL_TTL_KEY,
};

// Re-export connector types
pub use binding::{BindingState, BindingStatus, HealthReport};
pub use connector::{JmsConnector, JMS_CONNECTOR};
pub use pool::WorkerPool;

// Re-export the in-process broker
pub use memory::InMemoryBroker;
