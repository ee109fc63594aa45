//! Inbound path: broker consumer → pull-based message stream.
//!
//! A pool worker owns the broker consumer. Before each receive it reserves
//! the single slot of the handoff channel, so nothing is pulled from the
//! broker until the previous message was taken by the stream. In
//! transacted sessions the worker also waits for the message to be settled
//! (commit or rollback) before receiving again.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use reactive_messaging::{FlowError, Message, MessageStream, Payload, SharedCodec};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::api::{Body, BrokerError, BrokerMessage, MessageConsumer, SessionMode, SharedContext};
use crate::binding::Binding;
use crate::metadata::header_metadata;

/// How long a single broker receive blocks before the worker rechecks
/// its binding.
pub(crate) const RECEIVE_TIMEOUT: Duration = Duration::from_millis(250);

type Item = Result<Message, FlowError>;

/// Everything the inbound worker thread owns.
pub(crate) struct InboundWorker {
    pub(crate) binding: Arc<Binding>,
    pub(crate) consumer: Box<dyn MessageConsumer>,
    pub(crate) handoff: mpsc::Sender<Item>,
    pub(crate) codec: SharedCodec,
}

/// Create the handoff and the stream reading it.
pub(crate) fn handoff(binding: Arc<Binding>) -> (mpsc::Sender<Item>, MessageStream) {
    let (tx, rx) = mpsc::channel(1);
    (tx, Box::pin(InboundStream { rx, binding }))
}

/// Convert a broker body into a payload. Bodies stay raw; decoding to a
/// declared type happens lazily on the message.
pub(crate) fn body_payload(body: Body) -> Payload {
    match body {
        Body::Empty => Payload::Empty,
        Body::Text(text) => Payload::Text(text),
        Body::Bytes(bytes) => Payload::Bytes(bytes),
        Body::Long(n) => Payload::Long(n),
        Body::Double(n) => Payload::Double(n),
        Body::Bool(b) => Payload::Bool(b),
    }
}

fn broker_failure(error: BrokerError) -> FlowError {
    FlowError::BrokerIo(error.to_string())
}

async fn blocking<F>(context: SharedContext, op: F) -> Result<(), FlowError>
where
    F: FnOnce(&SharedContext) -> Result<(), BrokerError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&context))
        .await
        .map_err(|e| FlowError::BrokerIo(e.to_string()))?
        .map_err(broker_failure)
}

type Settle = Arc<Mutex<Option<oneshot::Sender<()>>>>;

fn signal(settle: &Settle) {
    if let Some(tx) = settle.lock().unwrap_or_else(|e| e.into_inner()).take() {
        let _ = tx.send(());
    }
}

/// Wrap a received broker message, attaching acknowledgement hooks that
/// match the session mode.
pub(crate) fn to_message(
    received: BrokerMessage,
    context: &SharedContext,
    codec: &SharedCodec,
    settle: Option<oneshot::Sender<()>>,
) -> Message {
    let BrokerMessage {
        headers,
        mut properties,
        body,
    } = received;
    properties.extend(header_metadata(&headers));
    let builder = Message::builder(body_payload(body))
        .codec(codec.clone())
        .metadata_map(properties);

    match context.session_mode() {
        SessionMode::AutoAcknowledge | SessionMode::DupsOkAcknowledge => builder.build(),
        SessionMode::ClientAcknowledge => {
            let context = context.clone();
            builder
                .on_ack(move || blocking(context, |c| c.acknowledge()))
                .build()
        }
        SessionMode::SessionTransacted => {
            let settle: Settle = Arc::new(Mutex::new(settle));
            let (commit_ctx, rollback_ctx) = (context.clone(), context.clone());
            let (on_commit, on_rollback) = (settle.clone(), settle);
            builder
                .on_ack(move || async move {
                    let result = blocking(commit_ctx, |c| c.commit()).await;
                    signal(&on_commit);
                    result
                })
                .on_nack(move |reason| async move {
                    debug!(reason = %reason, "rolling back inbound transaction");
                    let result = blocking(rollback_ctx, |c| c.rollback()).await;
                    signal(&on_rollback);
                    result
                })
                .build()
        }
    }
}

/// Worker thread body.
pub(crate) fn run_inbound(worker: InboundWorker) {
    let InboundWorker {
        binding,
        mut consumer,
        handoff,
        codec,
    } = worker;
    let context = binding.context().clone();
    let transacted = context.session_mode() == SessionMode::SessionTransacted;

    'outer: loop {
        // Wait for the stream to have room.
        let permit = futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = binding.closing() => None,
                permit = handoff.reserve() => permit.ok(),
            }
        });
        let Some(permit) = permit else {
            break;
        };

        let received = loop {
            if !binding.is_open() {
                break 'outer;
            }
            match consumer.receive(RECEIVE_TIMEOUT) {
                Ok(Some(message)) => break message,
                Ok(None) => continue,
                Err(BrokerError::Closed) if !binding.is_open() => break 'outer,
                Err(error) => {
                    binding.mark_failed(&error.to_string());
                    permit.send(Err(broker_failure(error)));
                    break 'outer;
                }
            }
        };

        trace!(channel = %binding.channel(), message_id = ?received.headers.message_id, "received");
        let (settle_tx, settle_rx) = if transacted {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        permit.send(Ok(to_message(received, &context, &codec, settle_tx)));

        if let Some(settled) = settle_rx {
            let settled = futures::executor::block_on(async {
                tokio::select! {
                    biased;
                    result = settled => result.is_ok(),
                    _ = binding.closing() => false,
                }
            });
            if !settled {
                break;
            }
        }
    }

    consumer.close();
    binding.mark_closed();
    debug!(channel = %binding.channel(), "inbound worker exited");
}

/// Stream half of the handoff. Dropping it cancels the binding.
struct InboundStream {
    rx: mpsc::Receiver<Item>,
    binding: Arc<Binding>,
}

impl Stream for InboundStream {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for InboundStream {
    fn drop(&mut self) {
        self.binding.drain();
        self.rx.close();
        while let Ok(item) = self.rx.try_recv() {
            let Ok(message) = item else {
                continue;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = message.nack(FlowError::StreamClosed).await {
                            warn!(error = %e, "nack of in-flight message failed");
                        }
                    });
                }
                Err(_) => trace!("no runtime to nack in-flight message; broker will redeliver"),
            }
        }
    }
}
