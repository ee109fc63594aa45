//! Name → publisher / subscriber / emitter directory.
//!
//! Names match exactly: case-sensitive, whitespace kept. The registry is
//! filled before the graph is built and read-only once it runs.

use std::collections::BTreeSet;

use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::emitter::Emitter;
use crate::error::RegistryError;
use crate::stream::{Publisher, Subscriber};

/// Directory of everything bound to a channel name.
#[derive(Default)]
pub struct ChannelRegistry {
    publishers: DashMap<String, Publisher>,
    subscribers: DashMap<String, Subscriber>,
    emitters: DashMap<String, Emitter>,
    resolved: DashSet<String>,
    references: DashMap<String, Publisher>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the producer of a channel.
    pub fn register_incoming(&self, name: &str, publisher: Publisher) -> Result<(), RegistryError> {
        match self.publishers.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::DuplicateProducer(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(publisher);
                debug!(channel = %name, "producer registered");
                Ok(())
            }
        }
    }

    /// Bind the consumer of a channel.
    pub fn register_subscriber(&self, name: &str, subscriber: Subscriber) -> Result<(), RegistryError> {
        match self.subscribers.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::DuplicateConsumer(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(subscriber);
                debug!(channel = %name, "consumer registered");
                Ok(())
            }
        }
    }

    /// Bind the emitter of a channel.
    pub fn register_emitter(&self, name: &str, emitter: Emitter) -> Result<(), RegistryError> {
        match self.emitters.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::DuplicateEmitter(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(emitter);
                Ok(())
            }
        }
    }

    /// Record that the wired graph produces `name`.
    pub(crate) fn mark_resolved(&self, name: &str) {
        self.resolved.insert(name.to_string());
    }

    /// Expose the wired stream of `name` to the host.
    pub(crate) fn bind_reference(&self, name: &str, publisher: Publisher) {
        self.references.insert(name.to_string(), publisher);
    }

    /// Every channel something produces: registered producers plus channels
    /// the wired graph resolved.
    pub fn incoming_names(&self) -> BTreeSet<String> {
        self.publishers
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.resolved.iter().map(|name| name.key().clone()))
            .collect()
    }

    /// Names with a registered producer.
    pub fn publisher_names(&self) -> BTreeSet<String> {
        self.publishers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Names with a registered consumer.
    pub fn subscriber_names(&self) -> BTreeSet<String> {
        self.subscribers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Registered producer of `name`.
    pub fn publisher(&self, name: &str) -> Option<Publisher> {
        self.publishers.get(name).map(|entry| entry.value().clone())
    }

    /// Registered consumer of `name`.
    pub fn subscriber(&self, name: &str) -> Option<Subscriber> {
        self.subscribers.get(name).map(|entry| entry.value().clone())
    }

    /// Registered emitter of `name`.
    pub fn emitter(&self, name: &str) -> Option<Emitter> {
        self.emitters.get(name).map(|entry| entry.value().clone())
    }

    /// Every registered emitter.
    pub fn emitters(&self) -> Vec<Emitter> {
        self.emitters.iter().map(|entry| entry.value().clone()).collect()
    }

    /// The wired stream of `name` handed to a channel reference.
    pub fn reference(&self, name: &str) -> Option<Publisher> {
        self.references.get(name).map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("incoming", &self.incoming_names())
            .field("subscribers", &self.subscriber_names())
            .finish()
    }
}
