//! Runtime lifecycle: collect the parts, start the graph, shut it down.
//!
//! [`MessagingBuilder`] gathers connectors, mediators, emitters and the
//! host's channel bindings. [`MessagingBuilder::start`] then:
//! - starts every connector
//! - registers host publishers, subscribers and emitters
//! - analyzes mediators
//! - wires, validates and spawns the graph
//!
//! Either everything starts or nothing does and the aggregate
//! [`DeploymentError`] lists every problem found.
//!
//! # Example
//!
//! ```ignore
//! let runtime = MessagingBuilder::new()
//!     .config(MapConfig::new()
//!         .with("mp.messaging.incoming.in.connector", "smallrye-jms")
//!         .with("mp.messaging.outgoing.out.connector", "smallrye-jms"))
//!     .connector(Arc::new(JmsConnector::new(beans)))
//!     .mediator(
//!         Mediator::builder("Shouter", "uppercase")
//!             .incoming("in")
//!             .outgoing("out")
//!             .process(|text: String| async move { Ok(text.to_uppercase()) }),
//!     )
//!     .start()
//!     .await?;
//!
//! // ...
//! runtime.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::FailureBus;
use crate::config::{ConfigSource, MapConfig, SharedConfig};
use crate::connector::{Connector, ConnectorRegistry, SharedConnector};
use crate::emitter::{Emitter, EmitterSpec};
use crate::error::DeploymentError;
use crate::manager::{MediatorManager, RunningGraph};
use crate::mediator::Mediator;
use crate::registry::ChannelRegistry;
use crate::stream::{MessageStream, Publisher, Subscriber};
use crate::validator::InjectionPoint;

/// Default time outbound work gets to drain on shutdown.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Collects everything a runtime is built from.
pub struct MessagingBuilder {
    config: SharedConfig,
    connectors: Vec<SharedConnector>,
    mediators: Vec<Mediator>,
    emitters: Vec<EmitterSpec>,
    injection_points: Vec<InjectionPoint>,
    publishers: Vec<Publisher>,
    subscribers: Vec<Subscriber>,
    shutdown_deadline: Duration,
    failures: FailureBus,
}

impl MessagingBuilder {
    /// Builder with an empty configuration.
    pub fn new() -> Self {
        Self {
            config: Arc::new(MapConfig::new()),
            connectors: Vec::new(),
            mediators: Vec::new(),
            emitters: Vec::new(),
            injection_points: Vec::new(),
            publishers: Vec::new(),
            subscribers: Vec::new(),
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            failures: FailureBus::new(),
        }
    }

    /// Read channel attributes from `source`.
    pub fn config(self, source: impl ConfigSource) -> Self {
        self.shared_config(Arc::new(source))
    }

    /// Read channel attributes from an already shared source.
    pub fn shared_config(mut self, config: SharedConfig) -> Self {
        self.config = config;
        self
    }

    /// Make a connector available to configured channels.
    pub fn connector<C: Connector>(mut self, connector: Arc<C>) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Add a mediator.
    pub fn mediator(mut self, mediator: Mediator) -> Self {
        self.mediators.push(mediator);
        self
    }

    /// Add an emitter, retrievable after start with
    /// [`MessagingRuntime::emitter`].
    pub fn emitter(mut self, spec: EmitterSpec) -> Self {
        self.emitters.push(spec);
        self
    }

    /// Add an emitter the host injects at `description`; the deployment
    /// fails if nothing consumes its channel.
    pub fn inject_emitter(mut self, spec: EmitterSpec, description: impl Into<String>) -> Self {
        self.injection_points
            .push(InjectionPoint::emitter(spec.channel.clone(), description));
        self.emitters.push(spec);
        self
    }

    /// Declare that the host reads `channel` at `description`; retrieve the
    /// stream after start with [`MessagingRuntime::channel`].
    pub fn inject_channel(mut self, channel: impl Into<String>, description: impl Into<String>) -> Self {
        self.injection_points
            .push(InjectionPoint::channel(channel, description));
        self
    }

    /// Bind a host producer to its channel.
    pub fn publisher(mut self, publisher: Publisher) -> Self {
        self.publishers.push(publisher);
        self
    }

    /// Bind a host consumer to its channel.
    pub fn subscriber(mut self, subscriber: Subscriber) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Time outbound work gets to drain on shutdown.
    pub fn shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    /// Use an existing failure bus.
    pub fn failures(mut self, failures: FailureBus) -> Self {
        self.failures = failures;
        self
    }

    /// Start connectors, build the graph and run it.
    ///
    /// On failure every connector is shut down again before returning.
    pub async fn start(self) -> Result<MessagingRuntime, DeploymentError> {
        let mut connectors = ConnectorRegistry::new(self.config);
        for connector in self.connectors {
            connectors.register(connector);
        }
        let connectors = Arc::new(connectors);
        connectors.start_all().await;

        let registry = Arc::new(ChannelRegistry::new());
        let mut manager =
            MediatorManager::new(registry.clone(), connectors.clone(), self.failures.clone());

        for publisher in self.publishers {
            manager.register_publisher(publisher);
        }
        for subscriber in self.subscribers {
            manager.register_subscriber(subscriber);
        }
        let emitters = manager.initialize_emitters(self.emitters);
        for mediator in self.mediators {
            // Recorded by the manager and reported with everything else.
            let _ = manager.analyze(mediator);
        }
        for point in self.injection_points {
            manager.register_injection_point(point);
        }
        debug!(
            mediators = manager.mediator_count(),
            emitters = emitters.len(),
            "starting messaging runtime"
        );

        match manager.initialize_and_run().await {
            Ok(graph) => {
                info!(tasks = graph.task_count(), "messaging runtime started");
                Ok(MessagingRuntime {
                    registry,
                    connectors,
                    failures: self.failures,
                    emitters,
                    graph,
                    shutdown_deadline: self.shutdown_deadline,
                })
            }
            Err(error) => {
                warn!(problems = error.problems().len(), "deployment failed");
                connectors.shutdown_all(self.shutdown_deadline).await;
                Err(error)
            }
        }
    }
}

impl Default for MessagingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A started channel graph.
pub struct MessagingRuntime {
    registry: Arc<ChannelRegistry>,
    connectors: Arc<ConnectorRegistry>,
    failures: FailureBus,
    emitters: Vec<Emitter>,
    graph: RunningGraph,
    shutdown_deadline: Duration,
}

impl MessagingRuntime {
    /// Emitter feeding `channel`.
    pub fn emitter(&self, channel: &str) -> Option<Emitter> {
        self.registry.emitter(channel)
    }

    /// Stream of an injected channel reference. Each reference declared
    /// with [`MessagingBuilder::inject_channel`] can be taken once.
    pub fn channel(&self, name: &str) -> Option<MessageStream> {
        self.registry.reference(name)?.subscribe().ok()
    }

    /// The channel directory.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Bus carrying stream failures.
    pub fn failures(&self) -> &FailureBus {
        &self.failures
    }

    /// Registered connector by name.
    pub fn connector(&self, name: &str) -> Option<SharedConnector> {
        self.connectors.get(name)
    }

    /// Complete emitters, shut connectors down, then stop leftover tasks.
    pub async fn shutdown(self) {
        info!("shutting down messaging runtime");
        for emitter in &self.emitters {
            emitter.complete();
        }
        self.connectors.shutdown_all(self.shutdown_deadline).await;
        let aborted = self.graph.shutdown(self.shutdown_deadline).await;
        info!(aborted, "messaging runtime stopped");
    }
}

impl std::fmt::Debug for MessagingRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingRuntime")
            .field("registry", &self.registry)
            .field("connectors", &self.connectors)
            .field("tasks", &self.graph.task_count())
            .finish()
    }
}

/// How a standalone runtime ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Shut down on request.
    Graceful,
    /// The deployment failed.
    StartupFailure,
    /// Every broker session was lost.
    RuntimeFailure,
}

impl ExitStatus {
    /// Process exit code.
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Graceful => 0,
            ExitStatus::StartupFailure => 1,
            ExitStatus::RuntimeFailure => 2,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FailureOrigin;
    use crate::emitter::OverflowSpec;
    use crate::error::FlowError;
    use crate::mediator::MergePolicy;
    use crate::stream::from_messages;
    use crate::testing::{collect, wait_until, InMemoryConnector};
    use crate::Message;
    use futures::StreamExt;

    fn in_memory_config() -> MapConfig {
        MapConfig::new()
            .with("mp.messaging.incoming.in.connector", "smallrye-in-memory")
            .with("mp.messaging.outgoing.out.connector", "smallrye-in-memory")
    }

    #[tokio::test]
    async fn test_pipeline_through_connectors() {
        let memory = Arc::new(InMemoryConnector::new());
        let source = memory.source("in");
        let sink = memory.sink("out");

        let runtime = MessagingBuilder::new()
            .config(in_memory_config())
            .connector(memory.clone())
            .mediator(
                Mediator::builder("Shouter", "uppercase")
                    .incoming("in")
                    .outgoing("out")
                    .process(|text: String| async move { Ok(text.to_uppercase()) }),
            )
            .start()
            .await
            .unwrap();

        source.send("hello").await.unwrap();
        assert!(sink.wait_for(1, Duration::from_secs(1)).await);
        assert_eq!(sink.payloads::<String>(), vec!["HELLO".to_string()]);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_emitter_feeds_injected_channel() {
        let runtime = MessagingBuilder::new()
            .inject_emitter(EmitterSpec::new("orders"), "Shop::orders")
            .mediator(
                Mediator::builder("Pricing", "double")
                    .incoming("orders")
                    .outgoing("priced")
                    .process(|n: i64| async move { Ok(n * 2) }),
            )
            .inject_channel("priced", "Dashboard::priced")
            .start()
            .await
            .unwrap();

        let emitter = runtime.emitter("orders").unwrap();
        let stream = runtime.channel("priced").unwrap();
        assert!(runtime.channel("priced").is_none());

        let (first, second) = (emitter.send(1i64), emitter.send(2i64));
        let received = collect(stream, 2).await;
        first.await.unwrap();
        second.await.unwrap();

        let values: Vec<i64> = received.iter().map(|m| m.decode().unwrap()).collect();
        assert_eq!(values, vec![2, 4]);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_problems_reported_together() {
        let error = MessagingBuilder::new()
            .mediator(
                Mediator::builder("Orphan", "read")
                    .incoming("nowhere")
                    .consume(|_: String| async { Ok(()) }),
            )
            .inject_channel("ghost", "Dashboard::feed")
            .inject_emitter(EmitterSpec::new("idle"), "Shop::idle")
            .start()
            .await
            .unwrap_err();

        assert!(error.contains_kind("UNRESOLVED_INCOMING"));
        assert!(error.contains_kind("EMITTER_NOT_CONNECTED"));
        let ghost = error
            .problems()
            .iter()
            .find(|problem| problem.channel() == Some("ghost"))
            .unwrap();
        assert!(ghost.to_string().contains("Dashboard::feed"));
    }

    #[tokio::test]
    async fn test_merge_of_host_publishers() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let runtime = MessagingBuilder::new()
            .publisher(Publisher::new("in", from_messages(vec![Message::new("a")])))
            .mediator(
                Mediator::builder("Other", "produce")
                    .outgoing("in")
                    .generate(|| futures::stream::iter(vec!["b".to_string()])),
            )
            .mediator(
                Mediator::builder("Reader", "read")
                    .incoming("in")
                    .merge(MergePolicy::Merge)
                    .consume(move |text: String| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(text);
                            Ok(())
                        }
                    }),
            )
            .start()
            .await
            .unwrap();

        let mut seen: Vec<String> = tokio_stream::wrappers::UnboundedReceiverStream::new(rx)
            .take(2)
            .collect()
            .await;
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_bus_reports_terminated_stream() {
        let failures = FailureBus::new();
        let mut events = failures.subscribe();
        let runtime = MessagingBuilder::new()
            .failures(failures)
            .emitter(EmitterSpec::new("jobs").overflow(OverflowSpec::UnboundedBuffer))
            .mediator(
                Mediator::builder("Worker", "run")
                    .incoming("jobs")
                    .consume(|n: i64| async move {
                        anyhow::ensure!(n > 0, "non-positive job {n}");
                        Ok(())
                    }),
            )
            .start()
            .await
            .unwrap();

        let emitter = runtime.emitter("jobs").unwrap();
        let _ = emitter.send(-1i64).await;

        let failure = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.channel, "jobs");
        assert_eq!(failure.origin, FailureOrigin::Mediator);
        assert!(matches!(failure.error, FlowError::Processing(_)));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_shuts_connectors_down() {
        let memory = Arc::new(InMemoryConnector::new());
        let error = MessagingBuilder::new()
            .config(MapConfig::new().with("mp.messaging.incoming.in.connector", "kafka"))
            .connector(memory.clone())
            .mediator(
                Mediator::builder("Reader", "read")
                    .incoming("in")
                    .consume(|_: String| async { Ok(()) }),
            )
            .start()
            .await
            .unwrap_err();

        assert!(error.contains_kind("CONNECTOR_INIT"));
        assert!(!error.contains_kind("UNRESOLVED_INCOMING"));
        assert!(wait_until(Duration::from_secs(1), || memory.is_shut_down()).await);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Graceful.code(), 0);
        assert_eq!(ExitStatus::StartupFailure.code(), 1);
        assert_eq!(ExitStatus::RuntimeFailure.code(), 2);
    }
}
