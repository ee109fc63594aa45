//! The `smallrye-jms` connector.
//!
//! Every configured channel gets its own broker session and its own pool
//! worker. Factories come from the bean registry: by name when the channel
//! sets `connection-factory-name`, otherwise the only one registered.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reactive_messaging::{
    resolve_codec, BeanRegistry, ConfigError, ConfigSource, Connector, ConnectorConfig,
    ConnectorError, Direction, MessageStream, SharedCodec, Subscriber,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{BrokerError, SharedConnectionFactory, SharedContext};
use crate::binding::{Binding, BindingState, HealthReport};
use crate::config::{JmsChannelConfig, PoolConfig};
use crate::pool::WorkerPool;
use crate::sink::{self, OutboundWorker};
use crate::source::{self, InboundWorker};

/// Name channels select this connector with.
pub const JMS_CONNECTOR: &str = "smallrye-jms";

/// Connector bridging channels to a JMS-style broker.
pub struct JmsConnector {
    beans: Arc<BeanRegistry>,
    codec: SharedCodec,
    pool_config: PoolConfig,
    pool: Mutex<Option<WorkerPool>>,
    bindings: Mutex<Vec<Arc<Binding>>>,
}

fn broker(error: BrokerError) -> ConnectorError {
    ConnectorError::Broker(error.to_string())
}

impl JmsConnector {
    /// Connector with the default pool sizing.
    pub fn new(beans: Arc<BeanRegistry>) -> Self {
        Self::with_pool_config(beans, PoolConfig::default())
    }

    /// Connector sized by the global `smallrye.jms.threads.*` keys.
    pub fn with_config(beans: Arc<BeanRegistry>, config: &dyn ConfigSource) -> Result<Self, ConfigError> {
        Ok(Self::with_pool_config(beans, PoolConfig::from_source(config)?))
    }

    /// Connector with explicit pool sizing.
    pub fn with_pool_config(beans: Arc<BeanRegistry>, pool_config: PoolConfig) -> Self {
        Self {
            codec: resolve_codec(&beans),
            beans,
            pool_config,
            pool: Mutex::new(None),
            bindings: Mutex::new(Vec::new()),
        }
    }

    fn lock_bindings(&self) -> MutexGuard<'_, Vec<Arc<Binding>>> {
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn running_pool(&self) -> Result<WorkerPool, ConnectorError> {
        self.pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ConnectorError::NotRunning(JMS_CONNECTOR.to_string()))
    }

    /// Shared worker pool, while started.
    pub fn pool(&self) -> Option<WorkerPool> {
        self.running_pool().ok()
    }

    /// State of every binding opened since start.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            bindings: self.lock_bindings().iter().map(|b| b.status()).collect(),
        }
    }

    fn factory(&self, name: Option<&str>) -> Result<SharedConnectionFactory, ConnectorError> {
        match name {
            Some(name) => self
                .beans
                .select_named::<SharedConnectionFactory>(name)
                .map(|factory| (*factory).clone())
                .ok_or_else(|| ConnectorError::NamedFactoryNotFound(name.to_string())),
            None => {
                let mut factories = self.beans.select_all::<SharedConnectionFactory>();
                match factories.len() {
                    0 => Err(ConnectorError::NoFactory),
                    1 => Ok(factories.remove(0).bean.as_ref().clone()),
                    _ => Err(ConnectorError::AmbiguousFactory),
                }
            }
        }
    }

    /// Resolve the factory, parse the channel and open its session.
    fn open(&self, config: &ConnectorConfig) -> Result<(JmsChannelConfig, SharedContext), ConnectorError> {
        let factory = self.factory(config.get("connection-factory-name").as_deref())?;
        let jms = JmsChannelConfig::parse(config)?;
        let context = match &jms.username {
            Some(user) => factory.create_context_with_credentials(user, jms.password.as_deref(), jms.session_mode),
            None => factory.create_context(jms.session_mode),
        }
        .map_err(broker)?;
        Ok((jms, context))
    }

    /// Remember a new binding, forgetting closed ones. Failed bindings stay
    /// so health keeps reporting them.
    fn track(&self, binding: &Arc<Binding>) {
        let mut bindings = self.lock_bindings();
        bindings.retain(|b| b.state() != BindingState::Closed);
        bindings.push(binding.clone());
    }
}

#[async_trait]
impl Connector for JmsConnector {
    fn name(&self) -> &str {
        JMS_CONNECTOR
    }

    async fn start(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if pool.is_none() {
            *pool = Some(WorkerPool::new(self.pool_config));
            info!(
                max_pool_size = self.pool_config.max_size,
                ttl_secs = self.pool_config.ttl.as_secs(),
                "jms connector started"
            );
        }
    }

    async fn publisher(&self, config: &ConnectorConfig) -> Result<MessageStream, ConnectorError> {
        let pool = self.running_pool()?;
        let (jms, context) = self.open(config)?;
        let consumer = match context.create_consumer(&jms.destination, jms.selector.as_deref()) {
            Ok(consumer) => consumer,
            Err(e) => {
                context.close();
                return Err(broker(e));
            }
        };

        let binding = Binding::new(&jms.channel, Direction::Incoming, jms.destination.clone(), context);
        let (handoff, stream) = source::handoff(binding.clone());
        let worker = InboundWorker {
            binding: binding.clone(),
            consumer,
            handoff,
            codec: self.codec.clone(),
        };
        if let Err(e) = pool.submit(move || source::run_inbound(worker)) {
            binding.mark_closed();
            return Err(e);
        }
        self.track(&binding);
        debug!(channel = %jms.channel, session_mode = %jms.session_mode, "inbound binding started");
        Ok(stream)
    }

    async fn subscriber(&self, config: &ConnectorConfig) -> Result<Subscriber, ConnectorError> {
        let pool = self.running_pool()?;
        let (jms, context) = self.open(config)?;
        let producer = match context.create_producer() {
            Ok(producer) => producer,
            Err(e) => {
                context.close();
                return Err(broker(e));
            }
        };

        let jms = Arc::new(jms);
        let binding = Binding::new(&jms.channel, Direction::Outgoing, jms.destination.clone(), context);
        let (requests, rx) = mpsc::channel(1);
        let worker = OutboundWorker {
            binding: binding.clone(),
            producer,
            requests: rx,
            config: jms.clone(),
        };
        if let Err(e) = pool.submit(move || sink::run_outbound(worker)) {
            binding.mark_closed();
            return Err(e);
        }
        self.track(&binding);

        let codec = self.codec.clone();
        let channel = jms.channel.clone();
        let consumer_binding = binding.clone();
        Ok(Subscriber::new(channel, move |stream| {
            sink::consume(stream, consumer_binding, requests, jms, codec)
        }))
    }

    /// Close inbound bindings, give outbound bindings `deadline` to drain,
    /// force-close the rest, then release the pool.
    async fn shutdown(&self, deadline: Duration) {
        let bindings = self.lock_bindings().clone();
        let (inbound, outbound): (Vec<_>, Vec<_>) = bindings
            .into_iter()
            .partition(|b| b.direction() == Direction::Incoming);

        for binding in &inbound {
            binding.drain();
        }

        let drained = futures::future::join_all(outbound.iter().map(|b| b.terminated()));
        if tokio::time::timeout(deadline, drained).await.is_err() {
            let pending = outbound.iter().filter(|b| !b.state().is_terminal()).count();
            warn!(pending, "outbound bindings did not drain in time; closing");
            for binding in &outbound {
                binding.drain();
            }
        }

        if let Some(pool) = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pool.shutdown();
        }
        info!(bindings = inbound.len() + outbound.len(), "jms connector shut down");
    }
}

impl std::fmt::Debug for JmsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JmsConnector")
            .field("pool_config", &self.pool_config)
            .field("bindings", &self.lock_bindings().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use futures::StreamExt;
    use reactive_messaging::{FlowError, MapConfig, Message};

    fn beans(factories: &[(&str, InMemoryBroker)]) -> Arc<BeanRegistry> {
        let mut beans = BeanRegistry::new();
        for (name, broker) in factories {
            beans.register_named::<SharedConnectionFactory>(*name, Arc::new(broker.clone()));
        }
        Arc::new(beans)
    }

    fn view(direction: Direction, channel: &str, config: MapConfig) -> ConnectorConfig {
        ConnectorConfig::new(Arc::new(config), direction, channel)
    }

    #[tokio::test]
    async fn test_not_running_before_start() {
        let connector = JmsConnector::new(beans(&[("a", InMemoryBroker::new())]));
        let err = connector
            .publisher(&view(Direction::Incoming, "in", MapConfig::new()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "NOT_RUNNING");
    }

    #[tokio::test]
    async fn test_factory_selection() {
        let none = JmsConnector::new(Arc::new(BeanRegistry::new()));
        assert_eq!(none.factory(None).err(), Some(ConnectorError::NoFactory));

        let two = JmsConnector::new(beans(&[("a", InMemoryBroker::new()), ("b", InMemoryBroker::new())]));
        assert_eq!(two.factory(None).err(), Some(ConnectorError::AmbiguousFactory));
        assert!(two.factory(Some("b")).is_ok());
        assert_eq!(
            two.factory(Some("c")).err(),
            Some(ConnectorError::NamedFactoryNotFound("c".into()))
        );

        let one = JmsConnector::new(beans(&[("only", InMemoryBroker::new())]));
        assert!(one.factory(None).is_ok());
    }

    #[tokio::test]
    async fn test_credentials_are_passed_to_factory() {
        let broker = InMemoryBroker::with_credentials("app", Some("secret"));
        let connector = JmsConnector::new(beans(&[("secure", broker.clone())]));
        connector.start().await;

        let denied = connector
            .publisher(&view(Direction::Incoming, "in", MapConfig::new()))
            .await
            .err()
            .unwrap();
        assert_eq!(denied.kind(), "BROKER_IO");

        let allowed = connector
            .publisher(&view(
                Direction::Incoming,
                "in",
                MapConfig::new()
                    .with("mp.messaging.incoming.in.username", "app")
                    .with("mp.messaging.incoming.in.password", "secret"),
            ))
            .await;
        assert!(allowed.is_ok());
        connector.shutdown(Duration::from_millis(100)).await;
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_fails_channel() {
        let broker = InMemoryBroker::new();
        let connector = JmsConnector::with_pool_config(
            beans(&[("a", broker)]),
            PoolConfig {
                max_size: 1,
                ttl: Duration::from_secs(1),
            },
        );
        connector.start().await;

        let _first = connector
            .publisher(&view(Direction::Incoming, "a", MapConfig::new()))
            .await
            .unwrap();
        let err = connector
            .publisher(&view(Direction::Incoming, "b", MapConfig::new()))
            .await
            .err()
            .unwrap();
        assert_eq!(err, ConnectorError::PoolExhausted);

        let health = connector.health();
        assert_eq!(health.bindings.len(), 1);
        connector.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_bindings_and_pool() {
        let broker = InMemoryBroker::new();
        let connector = JmsConnector::new(beans(&[("a", broker.clone())]));
        connector.start().await;

        let stream = connector
            .publisher(&view(Direction::Incoming, "in", MapConfig::new()))
            .await
            .unwrap();
        let subscriber = connector
            .subscriber(&view(Direction::Outgoing, "out", MapConfig::new()))
            .await
            .unwrap();
        // An outbound channel whose upstream never completes.
        let upstream = futures::stream::pending::<Result<Message, FlowError>>().boxed();
        let pending = tokio::spawn(async move { subscriber.consume(upstream).await });

        connector.shutdown(Duration::from_millis(50)).await;
        assert!(pending.await.unwrap().is_ok());
        drop(stream);

        assert!(
            reactive_messaging::testing::wait_until(Duration::from_secs(2), || {
                connector.health().bindings.iter().all(|b| b.state.is_terminal())
            })
            .await
        );
        assert!(connector.pool().is_none());
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_closed_bindings_are_forgotten() {
        let broker = InMemoryBroker::new();
        let connector = JmsConnector::new(beans(&[("a", broker)]));
        connector.start().await;

        for _ in 0..5 {
            let stream = connector
                .publisher(&view(Direction::Incoming, "in", MapConfig::new()))
                .await
                .unwrap();
            drop(stream);
            assert!(
                reactive_messaging::testing::wait_until(Duration::from_secs(2), || {
                    connector
                        .health()
                        .bindings
                        .iter()
                        .all(|b| b.state == BindingState::Closed)
                })
                .await
            );
        }
        assert_eq!(connector.health().bindings.len(), 1);
        connector.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_pool_config_from_global_keys() {
        let config = MapConfig::new().with("smallrye.jms.threads.max-pool-size", "3");
        let connector = JmsConnector::with_config(Arc::new(BeanRegistry::new()), &config).unwrap();
        connector.start().await;
        assert_eq!(connector.pool().unwrap().config().max_size, 3);

        let bad = MapConfig::new().with("smallrye.jms.threads.ttl", "soon");
        assert!(JmsConnector::with_config(Arc::new(BeanRegistry::new()), &bad).is_err());
    }
}
