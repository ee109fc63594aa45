//! Outbound path: message stream → broker producer.
//!
//! The async side pulls one message at a time, converts it and hands it to
//! the channel's pool worker, which performs the blocking send. The next
//! message is not pulled until the broker answered, so order is preserved
//! and a slow broker slows the upstream.

use std::sync::Arc;

use futures::StreamExt;
use reactive_messaging::{FlowError, Message, MessageStream, Payload, SharedCodec, CONTENT_TYPE};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::api::{Body, BrokerError, BrokerMessage, Headers, MessageProducer, SendOptions, SessionMode, DEFAULT_PRIORITY};
use crate::binding::Binding;
use crate::config::JmsChannelConfig;
use crate::metadata::{apply_header, is_header, JMS_DELIVERY_MODE, JMS_PRIORITY};

/// One send handed to the worker.
pub(crate) struct SendRequest {
    message: BrokerMessage,
    options: SendOptions,
    reply: oneshot::Sender<Result<(), BrokerError>>,
}

/// Everything the outbound worker thread owns.
pub(crate) struct OutboundWorker {
    pub(crate) binding: Arc<Binding>,
    pub(crate) producer: Box<dyn MessageProducer>,
    pub(crate) requests: mpsc::Receiver<SendRequest>,
    pub(crate) config: Arc<JmsChannelConfig>,
}

/// Convert a message for the broker. Structured payloads are encoded with
/// the codec and tagged with its content type; settable JMS headers in the
/// metadata override the channel configuration; everything else becomes a
/// property.
pub(crate) fn to_broker_message(
    message: &Message,
    config: &JmsChannelConfig,
    codec: &SharedCodec,
) -> Result<(BrokerMessage, SendOptions), FlowError> {
    let mut properties = reactive_messaging::Metadata::new();
    let body = match message.payload() {
        Payload::Empty => Body::Empty,
        Payload::Text(text) => Body::Text(text.clone()),
        Payload::Bytes(bytes) => Body::Bytes(bytes.clone()),
        Payload::Long(n) => Body::Long(*n),
        Payload::Double(n) => Body::Double(*n),
        Payload::Bool(b) => Body::Bool(*b),
        Payload::Json(value) => {
            properties.insert(CONTENT_TYPE.to_string(), codec.content_type().into());
            Body::Bytes(codec.encode(value)?)
        }
    };

    let mut headers = Headers {
        correlation_id: config.correlation_id.clone(),
        reply_to: config.reply_to.clone(),
        priority: config.priority.unwrap_or(DEFAULT_PRIORITY),
        delivery_mode: config.delivery_mode.unwrap_or_default(),
        ..Headers::default()
    };
    let mut options = config.send_options();

    for (name, value) in message.metadata() {
        if is_header(name) {
            if apply_header(&mut headers, name, value) {
                match name.as_str() {
                    JMS_DELIVERY_MODE => options.delivery_mode = Some(headers.delivery_mode),
                    JMS_PRIORITY => options.priority = Some(headers.priority),
                    _ => {}
                }
            }
        } else if name != CONTENT_TYPE || !properties.contains_key(CONTENT_TYPE) {
            properties.insert(name.clone(), value.clone());
        }
    }

    Ok((
        BrokerMessage {
            headers,
            properties,
            body,
        },
        options,
    ))
}

/// Worker thread body.
pub(crate) fn run_outbound(worker: OutboundWorker) {
    let OutboundWorker {
        binding,
        mut producer,
        mut requests,
        config,
    } = worker;
    let context = binding.context().clone();
    let transacted = context.session_mode() == SessionMode::SessionTransacted;

    while let Some(request) = requests.blocking_recv() {
        let mut result = producer.send(&config.destination, request.message, &request.options);
        if transacted {
            result = match result {
                Ok(()) => context.commit(),
                Err(error) => {
                    if let Err(rollback) = context.rollback() {
                        warn!(channel = %config.channel, error = %rollback, "rollback after failed send failed");
                    }
                    Err(error)
                }
            };
        }
        if let Err(error) = &result {
            binding.mark_failed(&error.to_string());
        }
        let failed = result.is_err();
        let _ = request.reply.send(result);
        if failed {
            break;
        }
    }

    producer.close();
    binding.mark_closed();
    debug!(channel = %config.channel, "outbound worker exited");
}

/// Async side: drive `stream` through the worker until it completes, fails
/// or the binding closes.
pub(crate) async fn consume(
    mut stream: MessageStream,
    binding: Arc<Binding>,
    requests: mpsc::Sender<SendRequest>,
    config: Arc<JmsChannelConfig>,
    codec: SharedCodec,
) -> Result<(), FlowError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = binding.closing() => None,
            item = stream.next() => item,
        };
        let Some(item) = next else {
            break;
        };
        let message = item?;

        let (broker_message, options) = match to_broker_message(&message, &config, &codec) {
            Ok(converted) => converted,
            Err(error) => return Err(nack(&message, error).await),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = SendRequest {
            message: broker_message,
            options,
            reply: reply_tx,
        };
        if requests.send(request).await.is_err() {
            let error = FlowError::BrokerIo(format!("outbound worker for {} stopped", config.channel));
            return Err(nack(&message, error).await);
        }
        match reply_rx.await {
            Ok(Ok(())) => {
                if let Err(e) = message.ack().await {
                    warn!(channel = %config.channel, error = %e, "ack after send failed");
                }
            }
            Ok(Err(broker)) => {
                return Err(nack(&message, FlowError::BrokerIo(broker.to_string())).await);
            }
            Err(_) => {
                let error = FlowError::BrokerIo(format!("outbound worker for {} stopped", config.channel));
                return Err(nack(&message, error).await);
            }
        }
    }
    debug!(channel = %config.channel, "outbound stream finished");
    Ok(())
}

async fn nack(message: &Message, error: FlowError) -> FlowError {
    if let Err(e) = message.nack(error.clone()).await {
        warn!(error = %e, "nack after failed send failed");
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ConnectionFactory, DeliveryMode, Destination};
    use crate::memory::InMemoryBroker;
    use reactive_messaging::{
        from_messages, AckState, ConnectorConfig, Direction, JsonCodec, MapConfig, MetadataValue,
    };

    fn channel_config(extra: &[(&str, &str)]) -> Arc<JmsChannelConfig> {
        let mut source = MapConfig::new().with("mp.messaging.outgoing.out.destination", "Q2");
        for (key, value) in extra {
            source.insert(format!("mp.messaging.outgoing.out.{key}"), *value);
        }
        let view = ConnectorConfig::new(Arc::new(source), Direction::Outgoing, "out");
        Arc::new(JmsChannelConfig::parse(&view).unwrap())
    }

    fn start(
        broker: &InMemoryBroker,
        config: Arc<JmsChannelConfig>,
    ) -> (Arc<Binding>, mpsc::Sender<SendRequest>) {
        let context = broker.create_context(config.session_mode).unwrap();
        let producer = context.create_producer().unwrap();
        let binding = Binding::new("out", Direction::Outgoing, config.destination.clone(), context);
        let (tx, rx) = mpsc::channel(1);
        let worker = OutboundWorker {
            binding: binding.clone(),
            producer,
            requests: rx,
            config,
        };
        std::thread::spawn(move || run_outbound(worker));
        (binding, tx)
    }

    #[test]
    fn test_json_payload_is_encoded_with_content_type() {
        let config = channel_config(&[]);
        let message = Message::new(serde_json::json!({"id": 7}));
        let codec: SharedCodec = Arc::new(JsonCodec);
        let (broker_message, _) = to_broker_message(&message, &config, &codec).unwrap();
        assert_eq!(broker_message.body, Body::Bytes(br#"{"id":7}"#.to_vec()));
        assert_eq!(
            broker_message.properties[CONTENT_TYPE],
            MetadataValue::from("application/json")
        );
    }

    #[test]
    fn test_metadata_overrides_configuration() {
        let config = channel_config(&[
            ("correlation-id", "from-config"),
            ("priority", "2"),
            ("delivery-mode", "PERSISTENT"),
        ]);
        let message = Message::new("x")
            .with_metadata("JMSCorrelationID", "from-message")
            .with_metadata("JMSPriority", 8i64)
            .with_metadata("JMSDeliveryMode", 1i64)
            .with_metadata("JMSMessageID", "ID:ignored")
            .with_metadata("color", "red");
        let codec: SharedCodec = Arc::new(JsonCodec);
        let (broker_message, options) = to_broker_message(&message, &config, &codec).unwrap();

        assert_eq!(broker_message.headers.correlation_id.as_deref(), Some("from-message"));
        assert_eq!(options.priority, Some(8));
        assert_eq!(options.delivery_mode, Some(DeliveryMode::NonPersistent));
        assert!(broker_message.headers.message_id.is_none());
        assert_eq!(broker_message.properties["color"], MetadataValue::from("red"));
        assert!(!broker_message.properties.contains_key("JMSMessageID"));
    }

    #[tokio::test]
    async fn test_sends_in_order_and_acks() {
        let broker = InMemoryBroker::new();
        let config = channel_config(&[]);
        let (binding, requests) = start(&broker, config.clone());
        let messages: Vec<Message> = (0..5i64).map(Message::new).collect();
        let probes = messages.clone();

        consume(from_messages(messages), binding.clone(), requests, config, Arc::new(JsonCodec))
            .await
            .unwrap();

        let bodies: Vec<Body> = broker.browse("Q2").into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, (0..5).map(Body::Long).collect::<Vec<_>>());
        assert!(probes.iter().all(|m| m.ack_state() == AckState::Acked));
        assert!(reactive_messaging::testing::wait_until(std::time::Duration::from_secs(1), || {
            binding.state().is_terminal()
        })
        .await);
    }

    #[tokio::test]
    async fn test_broker_error_nacks_and_terminates() {
        let broker = InMemoryBroker::new();
        broker.fail_sends(true);
        let config = channel_config(&[]);
        let (binding, requests) = start(&broker, config.clone());
        let first = Message::new("a");
        let second = Message::new("b");
        let probes = (first.clone(), second.clone());

        let err = consume(from_messages(vec![first, second]), binding.clone(), requests, config, Arc::new(JsonCodec))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BROKER_IO");
        assert_eq!(probes.0.ack_state(), AckState::Nacked);
        assert_eq!(probes.1.ack_state(), AckState::Pending);
        assert_eq!(binding.state(), crate::binding::BindingState::Failed);
    }

    #[tokio::test]
    async fn test_transacted_send_commits() {
        let broker = InMemoryBroker::new();
        let config = channel_config(&[("session-mode", "SESSION_TRANSACTED")]);
        let (binding, requests) = start(&broker, config.clone());

        consume(
            from_messages(vec![Message::new("committed")]),
            binding,
            requests,
            config,
            Arc::new(JsonCodec),
        )
        .await
        .unwrap();
        assert_eq!(broker.browse("Q2")[0].body, Body::Text("committed".into()));
    }

    #[tokio::test]
    async fn test_destination_from_config() {
        let broker = InMemoryBroker::new();
        let config = channel_config(&[("destination-type", "topic"), ("destination", "prices")]);
        assert_eq!(config.destination, Destination::topic("prices"));
        let listener = broker.create_context(SessionMode::AutoAcknowledge).unwrap();
        let mut consumer = listener.create_consumer(&config.destination, None).unwrap();
        let (binding, requests) = start(&broker, config.clone());

        consume(from_messages(vec![Message::new(1.5)]), binding, requests, config, Arc::new(JsonCodec))
            .await
            .unwrap();
        let received = consumer
            .receive(std::time::Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(received.body, Body::Double(1.5));
    }
}
