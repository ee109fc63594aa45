//! Stress tests for overflow, ordering and acknowledgement under load.
//!
//! These tests exercise whole graphs rather than single modules.

#[cfg(test)]
mod stress_tests {
    use crate::bus::{FailureBus, FailureOrigin};
    use crate::emitter::{EmitterSpec, OverflowSpec, DEFAULT_BUFFER_SIZE};
    use crate::error::FlowError;
    use crate::mediator::Mediator;
    use crate::message::{AckState, Message};
    use crate::runtime::MessagingBuilder;
    use crate::stream::{from_messages, Publisher};
    use crate::testing::{collect, wait_until};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // ==========================================================================
    // Overflow
    // ==========================================================================

    #[tokio::test]
    async fn test_default_overflow_under_slow_consumer() {
        let failures = FailureBus::new();
        let mut events = failures.subscribe();
        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();

        let runtime = MessagingBuilder::new()
            .failures(failures)
            .emitter(EmitterSpec::new("ticks"))
            .mediator(
                Mediator::builder("Slow", "consume")
                    .incoming("ticks")
                    .consume(move |_: i64| {
                        let seen = seen.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            seen.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
            )
            .start()
            .await
            .unwrap();

        let emitter = runtime.emitter("ticks").unwrap();
        let deliveries: Vec<_> = (0..1000i64).map(|i| emitter.send(i)).collect();
        let mut results = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            results.push(delivery.await);
        }

        assert!(results.contains(&Err(FlowError::Overflow)));
        let failure = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.channel, "ticks");
        assert_eq!(failure.origin, FailureOrigin::Mediator);
        assert_eq!(failure.error, FlowError::Overflow);
        assert!(delivered.load(Ordering::SeqCst) <= DEFAULT_BUFFER_SIZE);

        runtime.shutdown().await;
    }

    // ==========================================================================
    // Ordering
    // ==========================================================================

    #[tokio::test]
    async fn test_fifo_through_processor_chain() {
        let runtime = MessagingBuilder::new()
            .emitter(EmitterSpec::new("numbers").overflow(OverflowSpec::UnboundedBuffer))
            .mediator(
                Mediator::builder("Chain", "first")
                    .incoming("numbers")
                    .outgoing("middle")
                    .process(|n: i64| async move { Ok(n + 1) }),
            )
            .mediator(
                Mediator::builder("Chain", "second")
                    .incoming("middle")
                    .outgoing("out")
                    .process(|n: i64| async move {
                        if n % 7 == 0 {
                            tokio::task::yield_now().await;
                        }
                        Ok(n * 10)
                    }),
            )
            .inject_channel("out", "Test::out")
            .start()
            .await
            .unwrap();

        let emitter = runtime.emitter("numbers").unwrap();
        let stream = runtime.channel("out").unwrap();
        let deliveries: Vec<_> = (0..500i64).map(|i| emitter.send(i)).collect();

        let values: Vec<i64> = collect(stream, 500)
            .await
            .iter()
            .map(|m| m.decode().unwrap())
            .collect();
        let expected: Vec<i64> = (0..500i64).map(|i| (i + 1) * 10).collect();
        assert_eq!(values, expected);
        for delivery in deliveries {
            delivery.await.unwrap();
        }

        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_producer_order_across_threads() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 100;

        let runtime = MessagingBuilder::new()
            .emitter(EmitterSpec::new("events").overflow(OverflowSpec::UnboundedBuffer))
            .inject_channel("events", "Test::events")
            .start()
            .await
            .unwrap();

        let emitter = runtime.emitter("events").unwrap();
        let stream = runtime.channel("events").unwrap();

        let mut handles = Vec::new();
        for producer in 0..PRODUCERS {
            let emitter = emitter.clone();
            handles.push(tokio::spawn(async move {
                let deliveries: Vec<_> = (0..PER_PRODUCER)
                    .map(|seq| emitter.send(format!("{producer}:{seq}")))
                    .collect();
                for delivery in deliveries {
                    delivery.await.unwrap();
                }
            }));
        }

        let received = collect(stream, PRODUCERS * PER_PRODUCER).await;
        for handle in handles {
            handle.await.unwrap();
        }

        let mut last = vec![None::<usize>; PRODUCERS];
        for message in &received {
            let text: String = message.decode().unwrap();
            let (producer, seq) = text.split_once(':').unwrap();
            let producer: usize = producer.parse().unwrap();
            let seq: usize = seq.parse().unwrap();
            assert!(last[producer].map_or(true, |prev| prev < seq), "out of order: {text}");
            last[producer] = Some(seq);
        }
        assert!(last.iter().all(|seq| *seq == Some(PER_PRODUCER - 1)));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_stalls_to_slowest_consumer() {
        let fast = Arc::new(Mutex::new(Vec::new()));
        let slow = Arc::new(Mutex::new(Vec::new()));
        let (fast_sink, slow_sink) = (fast.clone(), slow.clone());

        let runtime = MessagingBuilder::new()
            .emitter(
                EmitterSpec::new("ticks")
                    .overflow(OverflowSpec::UnboundedBuffer)
                    .broadcast(true),
            )
            .mediator(
                Mediator::builder("Fast", "read")
                    .incoming("ticks")
                    .consume(move |n: i64| {
                        let sink = fast_sink.clone();
                        async move {
                            sink.lock().unwrap().push(n);
                            Ok(())
                        }
                    }),
            )
            .mediator(
                Mediator::builder("Slow", "read")
                    .incoming("ticks")
                    .consume(move |n: i64| {
                        let sink = slow_sink.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            sink.lock().unwrap().push(n);
                            Ok(())
                        }
                    }),
            )
            .start()
            .await
            .unwrap();

        let emitter = runtime.emitter("ticks").unwrap();
        for i in 0..20i64 {
            let _ = emitter.send(i);
        }

        assert!(wait_until(Duration::from_secs(2), || slow.lock().unwrap().len() == 20).await);
        let expected: Vec<i64> = (0..20).collect();
        assert_eq!(*fast.lock().unwrap(), expected);
        assert_eq!(*slow.lock().unwrap(), expected);

        runtime.shutdown().await;
    }

    // ==========================================================================
    // Acknowledgement
    // ==========================================================================

    #[tokio::test]
    async fn test_acked_never_exceeds_delivered() {
        const PRODUCED: usize = 100;
        let acked = Arc::new(AtomicUsize::new(0));
        let nacked = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));

        let messages: Vec<Message> = (0..PRODUCED as i64)
            .map(|i| {
                let (acked, nacked) = (acked.clone(), nacked.clone());
                Message::builder(i)
                    .on_ack(move || async move {
                        acked.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .on_nack(move |_| async move {
                        nacked.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .build()
            })
            .collect();

        let seen = delivered.clone();
        let runtime = MessagingBuilder::new()
            .publisher(Publisher::new("jobs", from_messages(messages)))
            .mediator(
                Mediator::builder("Picky", "handle")
                    .incoming("jobs")
                    .consume_messages(move |message: Message| {
                        let seen = seen.clone();
                        async move {
                            seen.fetch_add(1, Ordering::SeqCst);
                            let n: i64 = message.decode()?;
                            if n % 2 == 0 {
                                message.ack().await?;
                                message.nack(FlowError::processing("late")).await?;
                            } else if n % 3 == 0 {
                                message.nack(FlowError::processing("odd")).await?;
                                message.ack().await?;
                            }
                            Ok(())
                        }
                    }),
            )
            .start()
            .await
            .unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || delivered.load(Ordering::SeqCst) == PRODUCED)
                .await
        );
        let acked = acked.load(Ordering::SeqCst);
        let nacked = nacked.load(Ordering::SeqCst);
        assert_eq!(acked, 50);
        assert_eq!(nacked, 17);
        assert!(acked + nacked <= delivered.load(Ordering::SeqCst));

        runtime.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_ack_and_nack_settle_once() {
        for _ in 0..50 {
            let hooks = Arc::new(AtomicUsize::new(0));
            let (on_ack, on_nack) = (hooks.clone(), hooks.clone());
            let message = Message::builder("race")
                .on_ack(move || async move {
                    on_ack.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_nack(move |reason| async move {
                    on_nack.fetch_add(1, Ordering::SeqCst);
                    Err(reason)
                })
                .build();

            let mut handles = Vec::new();
            for i in 0..8 {
                let message = message.clone();
                handles.push(tokio::spawn(async move {
                    if i % 2 == 0 {
                        message.ack().await
                    } else {
                        message.nack(FlowError::processing("racer")).await
                    }
                }));
            }
            let mut outcomes = Vec::new();
            for handle in handles {
                outcomes.push(handle.await.unwrap());
            }

            assert_eq!(hooks.load(Ordering::SeqCst), 1);
            assert!(outcomes.windows(2).all(|pair| pair[0] == pair[1]));
            let expected = match message.ack_state() {
                AckState::Acked => Ok(()),
                AckState::Nacked => Err(FlowError::processing("racer")),
                AckState::Pending => panic!("message left pending"),
            };
            assert_eq!(outcomes[0], expected);
        }
    }
}
