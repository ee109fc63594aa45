//! End-to-end scenarios: a full runtime wired to an in-process broker.

#[cfg(test)]
mod scenario_tests {
    use crate::api::{BrokerMessage, Destination, SharedConnectionFactory};
    use crate::connector::{JmsConnector, JMS_CONNECTOR};
    use crate::memory::InMemoryBroker;
    use reactive_messaging::testing::wait_until;
    use reactive_messaging::{
        BeanRegistry, ConnectorError, DeploymentError, DeploymentProblem, FailureBus, FailureOrigin, MapConfig,
        Mediator, Message, MessagingBuilder, MessagingRuntime, MetadataValue,
    };
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn beans(factories: &[(&str, &InMemoryBroker)]) -> Arc<BeanRegistry> {
        let mut beans = BeanRegistry::new();
        for (name, broker) in factories {
            let factory: SharedConnectionFactory = Arc::new((*broker).clone());
            beans.register_named::<SharedConnectionFactory>(*name, factory);
        }
        Arc::new(beans)
    }

    fn incoming(config: MapConfig, channel: &str, destination: &str) -> MapConfig {
        config
            .with(format!("mp.messaging.incoming.{channel}.connector"), JMS_CONNECTOR)
            .with(format!("mp.messaging.incoming.{channel}.destination"), destination)
    }

    fn outgoing(config: MapConfig, channel: &str, destination: &str) -> MapConfig {
        config
            .with(format!("mp.messaging.outgoing.{channel}.connector"), JMS_CONNECTOR)
            .with(format!("mp.messaging.outgoing.{channel}.destination"), destination)
    }

    fn uppercase() -> Mediator {
        Mediator::builder("Shouter", "shout")
            .incoming("in")
            .outgoing("out")
            .process(|text: String| async move { Ok(text.to_uppercase()) })
    }

    fn texts(messages: Vec<BrokerMessage>) -> Vec<String> {
        messages
            .into_iter()
            .map(|m| match m.body {
                crate::api::Body::Text(text) => text,
                other => panic!("unexpected body {other:?}"),
            })
            .collect()
    }

    async fn start(
        broker: &InMemoryBroker,
        config: MapConfig,
        mediator: Mediator,
    ) -> (MessagingRuntime, Arc<JmsConnector>) {
        let connector = Arc::new(JmsConnector::new(beans(&[("default", broker)])));
        let runtime = MessagingBuilder::new()
            .config(config)
            .connector(connector.clone())
            .mediator(mediator)
            .shutdown_deadline(Duration::from_millis(500))
            .start()
            .await
            .unwrap();
        (runtime, connector)
    }

    async fn start_err(factories: &[(&str, &InMemoryBroker)], config: MapConfig) -> DeploymentError {
        MessagingBuilder::new()
            .config(config)
            .connector(Arc::new(JmsConnector::new(beans(factories))))
            .mediator(
                Mediator::builder("Reader", "read")
                    .incoming("bad")
                    .consume(|_: String| async { Ok(()) }),
            )
            .start()
            .await
            .unwrap_err()
    }

    fn connector_cause(error: &DeploymentError) -> &'static str {
        match error.problems() {
            [DeploymentProblem::ConnectorInit { cause, .. }] => cause.kind(),
            other => panic!("unexpected problems {other:?}"),
        }
    }

    // ==========================================================================
    // Pipelines
    // ==========================================================================

    #[tokio::test]
    async fn test_queue_to_queue_pipeline() {
        let broker = InMemoryBroker::new();
        let config = outgoing(incoming(MapConfig::new(), "in", "Q1"), "out", "Q2");
        let (runtime, _) = start(&broker, config, uppercase()).await;

        broker.send(&Destination::queue("Q1"), BrokerMessage::text("hello")).unwrap();

        assert!(wait_until(Duration::from_secs(1), || broker.queue_depth("Q2") >= 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(texts(broker.browse("Q2")), vec!["HELLO"]);
        assert_eq!(broker.queue_depth("Q1"), 0);
        runtime.shutdown().await;
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_transacted_input_commits_after_forward() {
        let broker = InMemoryBroker::new();
        let config = outgoing(incoming(MapConfig::new(), "in", "Q1"), "out", "Q2")
            .with("mp.messaging.incoming.in.session-mode", "SESSION_TRANSACTED");
        let (runtime, _) = start(&broker, config, uppercase()).await;

        for text in ["a", "b"] {
            broker.send(&Destination::queue("Q1"), BrokerMessage::text(text)).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || broker.queue_depth("Q2") == 2).await);
        runtime.shutdown().await;

        assert_eq!(texts(broker.browse("Q2")), vec!["A", "B"]);
        // "b" was only received once "a" had been committed.
        assert!(!texts(broker.browse("Q1")).contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_unacknowledged_client_messages_are_redelivered() {
        let broker = InMemoryBroker::new();
        let config = incoming(MapConfig::new(), "in", "Q1")
            .with("mp.messaging.incoming.in.session-mode", "CLIENT_ACKNOWLEDGE");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mediator = Mediator::builder("Forgetful", "read")
            .incoming("in")
            .consume_messages(move |message: Message| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(message.decode::<String>().unwrap());
                    Ok(())
                }
            });
        let (runtime, _) = start(&broker, config, mediator).await;

        broker.send(&Destination::queue("Q1"), BrokerMessage::text("keep")).unwrap();
        assert!(wait_until(Duration::from_secs(1), || seen.lock().unwrap().len() == 1).await);
        assert_eq!(broker.queue_depth("Q1"), 0);
        runtime.shutdown().await;

        assert!(wait_until(Duration::from_secs(1), || broker.queue_depth("Q1") == 1).await);
        let redelivered = broker.browse("Q1");
        assert!(redelivered[0].headers.redelivered);
        assert_eq!(texts(redelivered), vec!["keep"]);
    }

    #[tokio::test]
    async fn test_selector_filters_inbound() {
        let broker = InMemoryBroker::new();
        let config = incoming(MapConfig::new(), "in", "Q1")
            .with("mp.messaging.incoming.in.selector", "color = 'red'");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mediator = Mediator::builder("Picky", "read")
            .incoming("in")
            .consume(move |text: String| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(text);
                    Ok(())
                }
            });
        let (runtime, _) = start(&broker, config, mediator).await;

        let queue = Destination::queue("Q1");
        broker.send(&queue, BrokerMessage::text("apple").with_property("color", "red")).unwrap();
        broker.send(&queue, BrokerMessage::text("sky").with_property("color", "blue")).unwrap();
        broker.send(&queue, BrokerMessage::text("cherry").with_property("color", "red")).unwrap();

        assert!(wait_until(Duration::from_secs(1), || seen.lock().unwrap().len() == 2).await);
        assert_eq!(*seen.lock().unwrap(), vec!["apple", "cherry"]);
        assert_eq!(texts(broker.browse("Q1")), vec!["sky"]);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_headers_and_properties_survive_forwarding() {
        let broker = InMemoryBroker::new();
        let config = outgoing(incoming(MapConfig::new(), "in", "Q1"), "out", "Q2");
        let relay = Mediator::builder("Relay", "forward")
            .incoming("in")
            .outgoing("out")
            .process_messages(|message: Message| async move { Ok(message) });
        let (runtime, _) = start(&broker, config, relay).await;

        let mut original = BrokerMessage::text("order").with_property("region", "eu");
        original.headers.correlation_id = Some("order-7".into());
        original.headers.jms_type = Some("order".into());
        original.headers.priority = 7;
        original.headers.reply_to = Some(Destination::queue("replies"));
        broker.send(&Destination::queue("Q1"), original).unwrap();

        assert!(wait_until(Duration::from_secs(1), || broker.queue_depth("Q2") == 1).await);
        let forwarded = broker.browse("Q2").remove(0);
        assert_eq!(forwarded.headers.correlation_id.as_deref(), Some("order-7"));
        assert_eq!(forwarded.headers.jms_type.as_deref(), Some("order"));
        assert_eq!(forwarded.headers.priority, 7);
        assert_eq!(forwarded.headers.reply_to, Some(Destination::queue("replies")));
        assert_eq!(forwarded.headers.destination, Some(Destination::queue("Q2")));
        assert!(forwarded
            .headers
            .message_id
            .as_deref()
            .is_some_and(|id| id.starts_with("ID:")));
        assert_eq!(forwarded.properties["region"], MetadataValue::from("eu"));
        runtime.shutdown().await;
    }

    // ==========================================================================
    // Failures
    // ==========================================================================

    #[tokio::test]
    async fn test_failed_send_reaches_failure_bus() {
        let broker = InMemoryBroker::new();
        broker.fail_sends(true);
        let failures = FailureBus::new();
        let mut events = failures.subscribe();
        let connector = Arc::new(JmsConnector::new(beans(&[("default", &broker)])));
        let runtime = MessagingBuilder::new()
            .config(outgoing(incoming(MapConfig::new(), "in", "Q1"), "out", "Q2"))
            .connector(connector.clone())
            .mediator(uppercase())
            .failures(failures)
            .shutdown_deadline(Duration::from_millis(200))
            .start()
            .await
            .unwrap();

        broker.send(&Destination::queue("Q1"), BrokerMessage::text("lost")).unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.channel, "out");
        assert_eq!(failure.origin, FailureOrigin::Connector);
        assert_eq!(failure.error.kind(), "BROKER_IO");
        assert_eq!(broker.queue_depth("Q2"), 0);
        assert!(!connector.health().is_healthy());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_severed_connection_fails_every_inbound_binding() {
        let broker = InMemoryBroker::new();
        let failures = FailureBus::new();
        let mut events = failures.subscribe();
        let connector = Arc::new(JmsConnector::new(beans(&[("default", &broker)])));
        let runtime = MessagingBuilder::new()
            .config(incoming(MapConfig::new(), "in", "Q1"))
            .connector(connector.clone())
            .mediator(
                Mediator::builder("Reader", "read")
                    .incoming("in")
                    .consume(|_: String| async { Ok(()) }),
            )
            .failures(failures)
            .start()
            .await
            .unwrap();
        assert!(connector.health().is_healthy());

        broker.sever();

        assert!(wait_until(Duration::from_secs(2), || connector.health().all_inbound_failed()).await);
        let failure = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.channel, "in");
        assert_eq!(failure.error.kind(), "BROKER_IO");
        broker.restore();
        runtime.shutdown().await;
    }

    // ==========================================================================
    // Deployment
    // ==========================================================================

    #[tokio::test]
    async fn test_missing_factory_fails_deployment() {
        let error = start_err(&[], incoming(MapConfig::new(), "bad", "Q1")).await;
        assert_eq!(connector_cause(&error), "NO_FACTORY");
        assert_eq!(error.problems()[0].channel(), Some("bad"));
    }

    #[tokio::test]
    async fn test_configured_channel_without_mediator_still_needs_a_factory() {
        let error = MessagingBuilder::new()
            .config(incoming(MapConfig::new(), "orphan", "Q1"))
            .connector(Arc::new(JmsConnector::new(beans(&[]))))
            .start()
            .await
            .unwrap_err();

        assert_eq!(connector_cause(&error), "NO_FACTORY");
        assert_eq!(error.problems()[0].channel(), Some("orphan"));
    }

    #[tokio::test]
    async fn test_unknown_named_factory_fails_deployment() {
        let a = InMemoryBroker::new();
        let b = InMemoryBroker::new();
        let config = incoming(MapConfig::new(), "bad", "Q1")
            .with("mp.messaging.incoming.bad.connection-factory-name", "c");
        let error = start_err(&[("a", &a), ("b", &b)], config).await;

        assert_eq!(connector_cause(&error), "NAMED_FACTORY_NOT_FOUND");
        assert!(matches!(
            &error.problems()[0],
            DeploymentProblem::ConnectorInit { cause: ConnectorError::NamedFactoryNotFound(name), .. } if name == "c"
        ));
    }

    #[tokio::test]
    async fn test_bad_session_mode_fails_before_opening_a_session() {
        let broker = InMemoryBroker::new();
        let config = incoming(MapConfig::new(), "bad", "Q1")
            .with("mp.messaging.incoming.bad.session-mode", "BOGUS");
        let error = start_err(&[("default", &broker)], config).await;

        assert_eq!(connector_cause(&error), "UNKNOWN_SESSION_MODE");
        assert!(error.problems().iter().all(|p| p.channel() == Some("bad")));
        assert_eq!(broker.open_sessions(), 0);
    }
}
