//! Builds the channel graph and starts it.
//!
//! The [`MediatorManager`] collects analyzed mediators, emitters and
//! injection points, then [`initialize_and_run`](MediatorManager::initialize_and_run)
//! plans every channel, materializes connectors, wires streams and checks
//! the result. Problems are accumulated, never fail-fast: either every
//! channel is wired and started, or nothing is started and all problems are
//! reported together.
//!
//! # Wiring
//!
//! ```text
//! producers                channel                 consumers
//! ─────────                ───────                 ─────────
//! registry publisher ─┐                         ┌─► mediator input
//! inbound connector  ─┼─► merge/concat ─► slot ─┼─► registry subscriber
//! mediator output    ─┘                         ├─► outbound connector
//!                                     (multicast)└─► channel reference
//! ```
//!
//! Every channel's consumers receive a deferred stream first; producers fill
//! it once all mediator outputs exist, so the graph can be built in any
//! order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::{FailureBus, FailureOrigin};
use crate::config::{configured_channels, Direction};
use crate::connector::ConnectorRegistry;
use crate::emitter::{Emitter, EmitterSpec};
use crate::error::{DefinitionError, DeploymentError, DeploymentProblem, FlowError};
use crate::mediator::{AnalyzedMediator, Mediator, MediatorDescriptor, MergePolicy, Node};
use crate::registry::ChannelRegistry;
use crate::stream::{self, MessageStream, Publisher, Subscriber};
use crate::validator::{self, InjectionKind, InjectionPoint};

enum Producer {
    Registry(Publisher),
    Connector(MessageStream),
    Mediator(usize),
}

enum Consumer {
    Mediator(usize),
    Registry(Subscriber),
    Connector(Subscriber),
    Reference,
}

#[derive(Default)]
struct ChannelPlan {
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
}

struct Task {
    channel: String,
    origin: FailureOrigin,
    future: BoxFuture<'static, Result<(), FlowError>>,
}

/// Owns mediator descriptors and builds the wiring graph.
pub struct MediatorManager {
    registry: Arc<ChannelRegistry>,
    connectors: Arc<ConnectorRegistry>,
    failures: FailureBus,
    mediators: BTreeMap<(String, String), AnalyzedMediator>,
    broadcast_emitters: Vec<String>,
    injection_points: Vec<InjectionPoint>,
    problems: Vec<DeploymentProblem>,
}

impl MediatorManager {
    /// Create a manager over a registry and the available connectors.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        connectors: Arc<ConnectorRegistry>,
        failures: FailureBus,
    ) -> Self {
        Self {
            registry,
            connectors,
            failures,
            mediators: BTreeMap::new(),
            broadcast_emitters: Vec::new(),
            injection_points: Vec::new(),
            problems: Vec::new(),
        }
    }

    /// Analyze a mediator and keep it, keyed by `(bean, method)`.
    ///
    /// An invalid declaration is also recorded as a deployment problem.
    pub fn analyze(&mut self, mediator: Mediator) -> Result<(), DefinitionError> {
        let name = format!(
            "{}#{}",
            mediator.declaration().bean,
            mediator.declaration().method
        );
        match mediator.analyze() {
            Ok(analyzed) => {
                let descriptor = analyzed.descriptor();
                debug!(
                    mediator = %name,
                    shape = ?descriptor.shape,
                    ack = ?descriptor.ack,
                    "mediator analyzed"
                );
                let key = (descriptor.bean.clone(), descriptor.method.clone());
                if self.mediators.insert(key, analyzed).is_some() {
                    warn!(mediator = %name, "mediator declared twice, keeping the last");
                }
                Ok(())
            }
            Err(cause) => {
                self.problems.push(DeploymentProblem::InvalidMediator {
                    mediator: name,
                    cause: cause.clone(),
                });
                Err(cause)
            }
        }
    }

    /// Number of analyzed mediators.
    pub fn mediator_count(&self) -> usize {
        self.mediators.len()
    }

    /// Create one emitter per spec and register it as its channel's producer.
    pub fn initialize_emitters(&mut self, specs: impl IntoIterator<Item = EmitterSpec>) -> Vec<Emitter> {
        let mut created = Vec::new();
        for spec in specs {
            let (emitter, publisher) = Emitter::new(&spec);
            let registered = self
                .registry
                .register_emitter(&spec.channel, emitter.clone())
                .and_then(|()| self.registry.register_incoming(&spec.channel, publisher));
            match registered {
                Ok(()) => {
                    if spec.broadcast {
                        self.broadcast_emitters.push(spec.channel.clone());
                    }
                    debug!(channel = %spec.channel, overflow = ?spec.overflow, "emitter initialized");
                    created.push(emitter);
                }
                Err(e) => self.problems.push(e.into()),
            }
        }
        created
    }

    /// Register a host-supplied producer for its channel.
    pub fn register_publisher(&mut self, publisher: Publisher) {
        if let Err(e) = self.registry.register_incoming(publisher.channel(), publisher.clone()) {
            self.problems.push(e.into());
        }
    }

    /// Register a host-supplied consumer for its channel.
    pub fn register_subscriber(&mut self, subscriber: Subscriber) {
        if let Err(e) = self
            .registry
            .register_subscriber(subscriber.channel(), subscriber.clone())
        {
            self.problems.push(e.into());
        }
    }

    /// Register a host injection point checked after wiring.
    pub fn register_injection_point(&mut self, point: InjectionPoint) {
        self.injection_points.push(point);
    }

    /// Plan, wire, validate and start the graph.
    pub async fn initialize_and_run(&mut self) -> Result<RunningGraph, DeploymentError> {
        let mediators: Vec<AnalyzedMediator> =
            std::mem::take(&mut self.mediators).into_values().collect();
        let mut problems = std::mem::take(&mut self.problems);

        let descriptors: Vec<MediatorDescriptor> = mediators
            .iter()
            .map(|mediator| mediator.descriptor().clone())
            .collect();
        let mut plans = self.plan(&descriptors);
        resolve(
            &self.registry,
            &self.connectors,
            &self.broadcast_emitters,
            &descriptors,
            &mut plans,
            &mut problems,
        )
        .await;
        let (tasks, connector_tasks) = self.wire(mediators, plans);

        problems.extend(validator::validate(&self.registry, &self.injection_points));

        if !problems.is_empty() {
            for problem in &problems {
                error!(kind = problem.kind(), "{problem}");
            }
            return Err(DeploymentError::new(problems));
        }

        let mut graph = RunningGraph {
            tasks: JoinSet::new(),
        };
        for task in tasks.into_iter().chain(connector_tasks) {
            graph.spawn(task, self.failures.clone());
        }
        info!(tasks = graph.task_count(), "channel graph started");
        Ok(graph)
    }

    /// Collect every producer and consumer declared in-process.
    fn plan(&self, descriptors: &[MediatorDescriptor]) -> BTreeMap<String, ChannelPlan> {
        let mut plans: BTreeMap<String, ChannelPlan> = BTreeMap::new();

        for name in self.registry.publisher_names() {
            if let Some(publisher) = self.registry.publisher(&name) {
                plans.entry(name).or_default().producers.push(Producer::Registry(publisher));
            }
        }
        for (index, descriptor) in descriptors.iter().enumerate() {
            if let Some(outgoing) = &descriptor.outgoing {
                plans
                    .entry(outgoing.clone())
                    .or_default()
                    .producers
                    .push(Producer::Mediator(index));
            }
            for incoming in &descriptor.incoming {
                plans
                    .entry(incoming.clone())
                    .or_default()
                    .consumers
                    .push(Consumer::Mediator(index));
            }
        }
        for name in self.registry.subscriber_names() {
            if let Some(subscriber) = self.registry.subscriber(&name) {
                plans.entry(name).or_default().consumers.push(Consumer::Registry(subscriber));
            }
        }
        for point in &self.injection_points {
            if point.kind == InjectionKind::Channel {
                plans
                    .entry(point.channel.clone())
                    .or_default()
                    .consumers
                    .push(Consumer::Reference);
            }
        }
        let config = self.connectors.config();
        for direction in [Direction::Incoming, Direction::Outgoing] {
            for name in configured_channels(config.as_ref(), direction) {
                plans.entry(name).or_default();
            }
        }
        plans
    }

    /// Turn the plans into streams and not-yet-spawned tasks.
    ///
    /// Returns graph tasks and outbound connector tasks separately so the
    /// latter can be started last.
    fn wire(
        &self,
        mediators: Vec<AnalyzedMediator>,
        plans: BTreeMap<String, ChannelPlan>,
    ) -> (Vec<Task>, Vec<Task>) {
        let mut inputs: Vec<Vec<(String, MessageStream)>> =
            (0..mediators.len()).map(|_| Vec::new()).collect();
        let mut tasks = Vec::new();
        let mut connector_tasks = Vec::new();
        let mut references: HashMap<String, Vec<MessageStream>> = HashMap::new();
        let mut fills = Vec::new();

        for (name, plan) in plans {
            if plan.producers.is_empty() || plan.consumers.is_empty() {
                continue;
            }
            let merge = plan
                .consumers
                .iter()
                .find_map(|consumer| match consumer {
                    Consumer::Mediator(index) => Some(mediators[*index].descriptor().merge),
                    _ => None,
                })
                .unwrap_or_default();

            let (slot, combined) = stream::deferred();
            let streams = if plan.consumers.len() > 1 {
                let (streams, pump) = stream::multicast(&name, combined, plan.consumers.len());
                tasks.push(Task {
                    channel: name.clone(),
                    origin: FailureOrigin::Graph,
                    future: pump.map(Ok).boxed(),
                });
                streams
            } else {
                vec![combined]
            };

            for (consumer, stream) in plan.consumers.into_iter().zip(streams) {
                match consumer {
                    Consumer::Mediator(index) => inputs[index].push((name.clone(), stream)),
                    Consumer::Registry(subscriber) => tasks.push(Task {
                        channel: name.clone(),
                        origin: FailureOrigin::Host,
                        future: async move { subscriber.consume(stream).await }.boxed(),
                    }),
                    Consumer::Connector(subscriber) => connector_tasks.push(Task {
                        channel: name.clone(),
                        origin: FailureOrigin::Connector,
                        future: async move { subscriber.consume(stream).await }.boxed(),
                    }),
                    Consumer::Reference => references.entry(name.clone()).or_default().push(stream),
                }
            }
            fills.push((name, slot, plan.producers, merge));
        }

        for (name, streams) in references {
            self.registry
                .bind_reference(&name, Publisher::from_streams(name.clone(), streams));
        }

        let mut outputs: HashMap<usize, MessageStream> = HashMap::new();
        for (index, mediator) in mediators.into_iter().enumerate() {
            let descriptor = mediator.descriptor().clone();
            let mut channel_inputs = std::mem::take(&mut inputs[index]);
            channel_inputs.sort_by_key(|(channel, _)| {
                descriptor.incoming.iter().position(|name| name == channel)
            });
            let mut input_streams: Vec<MessageStream> =
                channel_inputs.into_iter().map(|(_, stream)| stream).collect();
            let input = match (descriptor.merge, input_streams.len()) {
                (_, 1) => input_streams.remove(0),
                (MergePolicy::Concat, _) => stream::concat(input_streams),
                _ => stream::merge(input_streams),
            };

            match mediator.into_node() {
                Node::Processor(f) => {
                    outputs.insert(index, f(input));
                }
                Node::Publisher(f) => {
                    outputs.insert(index, f());
                }
                Node::Sink(f) => tasks.push(Task {
                    channel: descriptor.incoming.first().cloned().unwrap_or_default(),
                    origin: FailureOrigin::Mediator,
                    future: f(input),
                }),
            }
        }

        for (name, slot, producers, merge) in fills {
            let mut streams: Vec<MessageStream> = producers
                .into_iter()
                .filter_map(|producer| match producer {
                    Producer::Registry(publisher) => Some(publisher.subscribe().unwrap_or_else(
                        |error| futures::stream::once(futures::future::ready(Err(error))).boxed(),
                    )),
                    Producer::Connector(stream) => Some(stream),
                    Producer::Mediator(index) => outputs.remove(&index),
                })
                .collect();
            let combined = match (merge, streams.len()) {
                (_, 1) => streams.remove(0),
                (MergePolicy::Concat, _) => stream::concat(streams),
                _ => stream::merge(streams),
            };
            debug!(channel = %name, "channel wired");
            slot.fill(combined);
        }

        (tasks, connector_tasks)
    }
}

/// Materialize connectors where nothing in-process binds, then apply
/// the resolution rules to every channel.
async fn resolve(
    registry: &ChannelRegistry,
    connectors: &ConnectorRegistry,
    broadcast_emitters: &[String],
    descriptors: &[MediatorDescriptor],
    plans: &mut BTreeMap<String, ChannelPlan>,
    problems: &mut Vec<DeploymentProblem>,
) {
    for (name, plan) in plans.iter_mut() {
        if plan.producers.is_empty() && plan.consumers.is_empty() {
            open_unreferenced(connectors, name, problems).await;
            continue;
        }
        let mut connector_failed = false;

        if plan.producers.is_empty() && !plan.consumers.is_empty() {
            match connectors.materialize_publisher(name).await {
                Some(Ok(stream)) => plan.producers.push(Producer::Connector(stream)),
                Some(Err(cause)) => {
                    connector_failed = true;
                    problems.push(DeploymentProblem::ConnectorInit {
                        channel: name.clone(),
                        cause,
                    });
                }
                None => {}
            }
        }

        let host_consumer = plan
            .consumers
            .iter()
            .any(|consumer| matches!(consumer, Consumer::Registry(_)));
        if !plan.producers.is_empty() && !host_consumer {
            match connectors.materialize_subscriber(name).await {
                Some(Ok(subscriber)) => plan.consumers.push(Consumer::Connector(subscriber)),
                Some(Err(cause)) => {
                    connector_failed = true;
                    problems.push(DeploymentProblem::ConnectorInit {
                        channel: name.clone(),
                        cause,
                    });
                }
                None => {}
            }
        }

        if plan.producers.is_empty() {
            let host_subscriber = plan
                .consumers
                .iter()
                .any(|consumer| matches!(consumer, Consumer::Registry(_)));
            let mediator_consumer = plan
                .consumers
                .iter()
                .any(|consumer| matches!(consumer, Consumer::Mediator(_)));
            if (mediator_consumer || host_subscriber) && !connector_failed {
                problems.push(DeploymentProblem::UnresolvedIncoming {
                    channel: name.clone(),
                    injection_point: host_subscriber.then(|| "host subscriber".to_string()),
                });
            }
            continue;
        }
        registry.mark_resolved(name);

        if plan.consumers.is_empty() {
            let mediator_producer = plan
                .producers
                .iter()
                .any(|producer| matches!(producer, Producer::Mediator(_)));
            if mediator_producer && !connector_failed {
                problems.push(DeploymentProblem::UnresolvedOutgoing {
                    channel: name.clone(),
                });
            }
            continue;
        }

        if plan.producers.len() > 1 {
            let merging = plan.consumers.iter().all(|consumer| match consumer {
                Consumer::Mediator(index) => {
                    descriptors[*index].merge != MergePolicy::None
                }
                _ => false,
            });
            if merging {
                debug!(channel = %name, producers = plan.producers.len(), "merging producers");
            } else {
                problems.push(DeploymentProblem::DuplicateProducer {
                    channel: name.clone(),
                });
            }
        }

        if plan.consumers.len() > 1 {
            let broadcasting = plan.producers.iter().all(|producer| match producer {
                Producer::Mediator(index) => descriptors[*index].broadcast,
                Producer::Registry(_) => broadcast_emitters.contains(name),
                Producer::Connector(_) => matches!(
                    connectors
                        .channel_config(Direction::Incoming, name)
                        .get_bool("broadcast"),
                    Ok(Some(true))
                ),
            });
            if broadcasting {
                debug!(channel = %name, consumers = plan.consumers.len(), "broadcasting");
            } else {
                problems.push(DeploymentProblem::DuplicateConsumer {
                    channel: name.clone(),
                });
            }
        }
    }
}

/// Open both ends of a channel only configuration mentions.
///
/// Init failures are reported like any other connector problem. What opens
/// is released right away since nothing in-process would read or write it.
async fn open_unreferenced(
    connectors: &ConnectorRegistry,
    name: &str,
    problems: &mut Vec<DeploymentProblem>,
) {
    let inbound = connectors.materialize_publisher(name).await.map(|r| r.map(drop));
    let outbound = connectors.materialize_subscriber(name).await.map(|r| r.map(drop));
    for result in [inbound, outbound].into_iter().flatten() {
        match result {
            Ok(()) => warn!(channel = %name, "configured channel has no in-process counterpart"),
            Err(cause) => problems.push(DeploymentProblem::ConnectorInit {
                channel: name.to_string(),
                cause,
            }),
        }
    }
}

/// Tasks driving a started graph.
#[derive(Debug)]
pub struct RunningGraph {
    tasks: JoinSet<()>,
}

impl RunningGraph {
    fn spawn(&mut self, task: Task, failures: FailureBus) {
        let Task {
            channel,
            origin,
            future,
        } = task;
        self.tasks.spawn(async move {
            match future.await {
                Ok(()) => debug!(channel = %channel, origin = %origin, "stream completed"),
                Err(error) => {
                    failures.emit(&channel, origin, error);
                }
            }
        });
    }

    /// Tasks still tracked.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait up to `deadline` for every task, then abort the rest.
    ///
    /// Returns how many tasks had to be aborted.
    pub async fn shutdown(mut self, deadline: Duration) -> usize {
        let drained = tokio::time::timeout(deadline, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }
        let remaining = self.tasks.len();
        warn!(remaining, "graph tasks still running at deadline, aborting");
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        remaining
    }
}
