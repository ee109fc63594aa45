//! Messages flowing through channels.
//!
//! A [`Message`] carries a [`Payload`], a [`Metadata`] map and a shared
//! acknowledgement. Cloning a message (or deriving one with
//! [`Message::with_payload`]) keeps the same acknowledgement, so acking the
//! derived message acks the original.
//!
//! # Acknowledgement
//!
//! `ack` and `nack` are idempotent and mutually exclusive: the first call
//! runs its hook, every later call (of either kind) returns that first
//! outcome without running anything.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::{SharedCodec, CONTENT_TYPE};
use crate::error::FlowError;

// =============================================================================
// Payload
// =============================================================================

/// Body of a message.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// No body.
    #[default]
    Empty,
    /// UTF-8 text.
    Text(String),
    /// Raw bytes (undecoded transport bodies land here).
    Bytes(Vec<u8>),
    /// Integer.
    Long(i64),
    /// Floating point number.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Structured value, serialized by the transport's codec.
    Json(serde_json::Value),
}

impl Payload {
    /// Serialize a value into a [`Payload::Json`].
    pub fn json<T: Serialize>(value: &T) -> Result<Self, FlowError> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|e| FlowError::Encode(e.to_string()))
    }

    /// Convert into a typed value.
    pub fn decode<T: FromPayload>(self) -> Result<T, FlowError> {
        T::from_payload(self)
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Text(_) => "text",
            Payload::Bytes(_) => "bytes",
            Payload::Long(_) => "long",
            Payload::Double(_) => "double",
            Payload::Bool(_) => "bool",
            Payload::Json(_) => "json",
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Long(value)
    }
}

impl From<i32> for Payload {
    fn from(value: i32) -> Self {
        Payload::Long(i64::from(value))
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Payload::Double(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

// =============================================================================
// Typed Payload Access
// =============================================================================

/// Types a payload-mode mediator can receive.
pub trait FromPayload: Sized + Send + 'static {
    /// Whether transport bytes tagged with a codec content type should go
    /// through the codec before extraction.
    const STRUCTURED: bool = false;

    /// Extract `Self` from a payload.
    fn from_payload(payload: Payload) -> Result<Self, FlowError>;
}

/// Types a payload-mode mediator can produce.
pub trait IntoPayload: Send + 'static {
    /// Convert `self` into a payload.
    fn into_payload(self) -> Result<Payload, FlowError>;
}

/// Serde-typed payload ("declared type `T`").
///
/// Decodes from JSON bytes, JSON text or an already structured value;
/// encodes to [`Payload::Json`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    /// Unwrap the inner value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

fn mismatch(expected: &str, payload: &Payload) -> FlowError {
    FlowError::Decode(format!("expected {expected}, got {} payload", payload.kind()))
}

impl FromPayload for Payload {
    fn from_payload(payload: Payload) -> Result<Self, FlowError> {
        Ok(payload)
    }
}

impl FromPayload for String {
    fn from_payload(payload: Payload) -> Result<Self, FlowError> {
        match payload {
            Payload::Text(s) => Ok(s),
            Payload::Bytes(b) => String::from_utf8(b).map_err(|e| FlowError::Decode(e.to_string())),
            Payload::Json(serde_json::Value::String(s)) => Ok(s),
            Payload::Long(n) => Ok(n.to_string()),
            Payload::Double(n) => Ok(n.to_string()),
            Payload::Bool(b) => Ok(b.to_string()),
            other => Err(mismatch("text", &other)),
        }
    }
}

impl FromPayload for Vec<u8> {
    fn from_payload(payload: Payload) -> Result<Self, FlowError> {
        match payload {
            Payload::Bytes(b) => Ok(b),
            Payload::Text(s) => Ok(s.into_bytes()),
            Payload::Json(v) => serde_json::to_vec(&v).map_err(|e| FlowError::Decode(e.to_string())),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl FromPayload for i64 {
    fn from_payload(payload: Payload) -> Result<Self, FlowError> {
        match payload {
            Payload::Long(n) => Ok(n),
            Payload::Text(s) => s.trim().parse().map_err(|_| FlowError::Decode(format!("{s:?} is not an integer"))),
            Payload::Json(serde_json::Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| FlowError::Decode(format!("{n} is not an integer"))),
            other => Err(mismatch("long", &other)),
        }
    }
}

impl FromPayload for f64 {
    fn from_payload(payload: Payload) -> Result<Self, FlowError> {
        match payload {
            Payload::Double(n) => Ok(n),
            #[allow(clippy::cast_precision_loss)]
            Payload::Long(n) => Ok(n as f64),
            Payload::Text(s) => s.trim().parse().map_err(|_| FlowError::Decode(format!("{s:?} is not a number"))),
            Payload::Json(serde_json::Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| FlowError::Decode(format!("{n} is not a number"))),
            other => Err(mismatch("double", &other)),
        }
    }
}

impl FromPayload for bool {
    fn from_payload(payload: Payload) -> Result<Self, FlowError> {
        match payload {
            Payload::Bool(b) => Ok(b),
            Payload::Text(s) => s.trim().parse().map_err(|_| FlowError::Decode(format!("{s:?} is not a boolean"))),
            Payload::Json(serde_json::Value::Bool(b)) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl FromPayload for serde_json::Value {
    const STRUCTURED: bool = true;

    fn from_payload(payload: Payload) -> Result<Self, FlowError> {
        match payload {
            Payload::Json(v) => Ok(v),
            Payload::Bytes(b) => serde_json::from_slice(&b).map_err(|e| FlowError::Decode(e.to_string())),
            Payload::Text(s) => serde_json::from_str(&s).map_err(|e| FlowError::Decode(e.to_string())),
            Payload::Long(n) => Ok(n.into()),
            Payload::Double(n) => Ok(n.into()),
            Payload::Bool(b) => Ok(b.into()),
            Payload::Empty => Ok(serde_json::Value::Null),
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> FromPayload for Json<T> {
    const STRUCTURED: bool = true;

    fn from_payload(payload: Payload) -> Result<Self, FlowError> {
        let decoded = match payload {
            Payload::Bytes(b) => serde_json::from_slice(&b),
            Payload::Text(s) => serde_json::from_str(&s),
            Payload::Json(v) => serde_json::from_value(v),
            other => return Err(mismatch("json", &other)),
        };
        decoded
            .map(Json)
            .map_err(|e| FlowError::Decode(e.to_string()))
    }
}

macro_rules! into_payload_via_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoPayload for $ty {
                fn into_payload(self) -> Result<Payload, FlowError> {
                    Ok(Payload::from(self))
                }
            }
        )*
    };
}

into_payload_via_from!(String, &'static str, Vec<u8>, i64, i32, f64, bool, serde_json::Value);

impl IntoPayload for Payload {
    fn into_payload(self) -> Result<Payload, FlowError> {
        Ok(self)
    }
}

impl<T: Serialize + Send + 'static> IntoPayload for Json<T> {
    fn into_payload(self) -> Result<Payload, FlowError> {
        Payload::json(&self.0)
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// A single metadata entry value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// Text value.
    String(String),
    /// Integer value.
    Long(i64),
    /// Floating point value.
    Double(f64),
    /// Boolean value.
    Bool(bool),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl MetadataValue {
    /// Borrow as text when the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read as an integer when the value is a long.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Long(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Long(n) => write!(f, "{n}"),
            MetadataValue::Double(n) => write!(f, "{n}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Long(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Double(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        MetadataValue::Bytes(value)
    }
}

/// Name → value map attached to every message.
pub type Metadata = BTreeMap<String, MetadataValue>;

// =============================================================================
// Acknowledgement
// =============================================================================

/// Future returned by acknowledgement hooks.
pub type AckFuture = BoxFuture<'static, Result<(), FlowError>>;

type AckHook = Box<dyn FnOnce() -> AckFuture + Send>;
type NackHook = Box<dyn FnOnce(FlowError) -> AckFuture + Send>;

/// Observable acknowledgement state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Neither `ack` nor `nack` has completed.
    Pending,
    /// `ack` won.
    Acked,
    /// `nack` won.
    Nacked,
}

#[derive(Debug, Clone)]
struct AckOutcome {
    state: AckState,
    result: Result<(), FlowError>,
}

/// Hook run shared by every caller of `ack`/`nack`.
type Settlement = Shared<BoxFuture<'static, AckOutcome>>;

struct Acknowledgement {
    hooks: Mutex<Option<(Option<AckHook>, Option<NackHook>)>>,
    settlement: Mutex<Option<Settlement>>,
    outcome: Arc<OnceLock<AckOutcome>>,
}

impl Acknowledgement {
    fn new(ack: Option<AckHook>, nack: Option<NackHook>) -> Self {
        Self {
            hooks: Mutex::new(Some((ack, nack))),
            settlement: Mutex::new(None),
            outcome: Arc::new(OnceLock::new()),
        }
    }

    fn take_hooks(&self) -> (Option<AckHook>, Option<NackHook>) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or((None, None))
    }

    /// Starts the settlement on the first call and joins it on every call.
    ///
    /// The hook runs on its own task, so dropping the caller's future does
    /// not drop the broker-side ack or rollback.
    fn settle(
        &self,
        state: AckState,
        start: impl FnOnce(Option<AckHook>, Option<NackHook>) -> Option<AckFuture>,
    ) -> Settlement {
        let mut slot = self.settlement.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert_with(|| {
            let (ack, nack) = self.take_hooks();
            let hook = start(ack, nack);
            let cell = self.outcome.clone();
            let run = async move {
                let result = match hook {
                    Some(hook) => hook.await,
                    None => Ok(()),
                };
                cell.get_or_init(|| AckOutcome { state, result }).clone()
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let task = handle.spawn(run);
                    async move {
                        task.await.unwrap_or_else(|e| AckOutcome {
                            state,
                            result: Err(FlowError::processing(format!(
                                "acknowledgement hook aborted: {e}"
                            ))),
                        })
                    }
                    .boxed()
                    .shared()
                }
                Err(_) => run.boxed().shared(),
            }
        })
        .clone()
    }

    async fn ack(&self) -> Result<(), FlowError> {
        let outcome = self
            .settle(AckState::Acked, |ack, _| ack.map(|hook| hook()))
            .await;
        if outcome.state == AckState::Nacked {
            debug!("ack after nack ignored");
        }
        outcome.result
    }

    async fn nack(&self, reason: FlowError) -> Result<(), FlowError> {
        let outcome = self
            .settle(AckState::Nacked, |_, nack| nack.map(|hook| hook(reason)))
            .await;
        if outcome.state == AckState::Acked {
            debug!("nack after ack ignored");
        }
        outcome.result
    }

    fn state(&self) -> AckState {
        self.outcome
            .get()
            .map_or(AckState::Pending, |outcome| outcome.state)
    }
}

// =============================================================================
// Message
// =============================================================================

/// A payload with metadata and acknowledgement hooks.
#[derive(Clone)]
pub struct Message {
    payload: Payload,
    metadata: Metadata,
    acknowledgement: Arc<Acknowledgement>,
    codec: Option<SharedCodec>,
}

impl Message {
    /// Create a message whose `ack`/`nack` do nothing.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            metadata: Metadata::new(),
            acknowledgement: Arc::new(Acknowledgement::new(None, None)),
            codec: None,
        }
    }

    /// Start building a message with hooks and metadata.
    pub fn builder(payload: impl Into<Payload>) -> MessageBuilder {
        MessageBuilder {
            payload: payload.into(),
            metadata: Metadata::new(),
            ack: None,
            nack: None,
            codec: None,
        }
    }

    /// Borrow the payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Take the payload, dropping metadata and the acknowledgement handle.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Borrow the metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up one metadata entry.
    pub fn metadata_value(&self, name: &str) -> Option<&MetadataValue> {
        self.metadata.get(name)
    }

    /// The declared content type, if the transport recorded one.
    pub fn content_type(&self) -> Option<&str> {
        self.metadata.get(CONTENT_TYPE).and_then(MetadataValue::as_str)
    }

    /// Decode the payload into a typed value (the payload is cloned).
    ///
    /// Raw bytes whose content type matches the attached codec are run
    /// through the codec first when `T` is structured; anything else is
    /// extracted directly.
    pub fn decode<T: FromPayload>(&self) -> Result<T, FlowError> {
        if T::STRUCTURED {
            if let (Payload::Bytes(bytes), Some(codec)) = (&self.payload, &self.codec) {
                if self.content_type() == Some(codec.content_type()) {
                    return T::from_payload(Payload::Json(codec.decode(bytes)?));
                }
            }
        }
        T::from_payload(self.payload.clone())
    }

    /// Derive a message carrying a new payload, the same metadata and the
    /// same acknowledgement.
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Message {
        Message {
            payload: payload.into(),
            metadata: self.metadata.clone(),
            acknowledgement: self.acknowledgement.clone(),
            codec: self.codec.clone(),
        }
    }

    /// Add or replace a metadata entry.
    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Acknowledge the message. Idempotent; returns the first outcome.
    pub async fn ack(&self) -> Result<(), FlowError> {
        self.acknowledgement.ack().await
    }

    /// Negatively acknowledge the message. Idempotent; returns the first outcome.
    pub async fn nack(&self, reason: FlowError) -> Result<(), FlowError> {
        self.acknowledgement.nack(reason).await
    }

    /// Current acknowledgement state.
    pub fn ack_state(&self) -> AckState {
        self.acknowledgement.state()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload", &self.payload)
            .field("metadata", &self.metadata)
            .field("ack_state", &self.ack_state())
            .finish()
    }
}

/// Builder for messages with acknowledgement hooks.
pub struct MessageBuilder {
    payload: Payload,
    metadata: Metadata,
    ack: Option<AckHook>,
    nack: Option<NackHook>,
    codec: Option<SharedCodec>,
}

impl MessageBuilder {
    /// Codec used by [`Message::decode`] for structured payloads.
    pub fn codec(mut self, codec: SharedCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Add a metadata entry.
    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Replace the whole metadata map.
    pub fn metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Hook run by the first `ack`.
    pub fn on_ack<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
    {
        self.ack = Some(Box::new(move || hook().boxed()));
        self
    }

    /// Hook run by the first `nack`.
    pub fn on_nack<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(FlowError) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
    {
        self.nack = Some(Box::new(move |reason| hook(reason).boxed()));
        self
    }

    /// Finish the message.
    pub fn build(self) -> Message {
        Message {
            payload: self.payload,
            metadata: self.metadata,
            acknowledgement: Arc::new(Acknowledgement::new(self.ack, self.nack)),
            codec: self.codec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted() -> (Message, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let (a, n) = (acks.clone(), nacks.clone());
        let message = Message::builder("hello")
            .on_ack(move || async move {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_nack(move |_| async move {
                n.fetch_add(1, Ordering::SeqCst);
                Err(FlowError::BrokerIo("rollback failed".into()))
            })
            .build();
        (message, acks, nacks)
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let (message, acks, nacks) = counted();
        assert_eq!(message.ack_state(), AckState::Pending);

        assert!(message.ack().await.is_ok());
        assert!(message.ack().await.is_ok());

        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
        assert_eq!(message.ack_state(), AckState::Acked);
    }

    #[tokio::test]
    async fn test_nack_after_ack_returns_first_outcome() {
        let (message, acks, nacks) = counted();
        message.ack().await.unwrap();

        let result = message.nack(FlowError::processing("late")).await;
        assert!(result.is_ok());
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(message.ack_state(), AckState::Acked);
    }

    #[tokio::test]
    async fn test_ack_after_nack_returns_nack_result() {
        let (message, acks, nacks) = counted();
        let first = message.nack(FlowError::processing("bad")).await;
        assert_eq!(first, Err(FlowError::BrokerIo("rollback failed".into())));

        let second = message.ack().await;
        assert_eq!(second, first);
        assert_eq!(acks.load(Ordering::SeqCst), 0);
        assert_eq!(nacks.load(Ordering::SeqCst), 1);
        assert_eq!(message.ack_state(), AckState::Nacked);
    }

    #[tokio::test]
    async fn test_concurrent_acks_run_hook_once() {
        let (message, acks, _) = counted();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let m = message.clone();
            handles.push(tokio::spawn(async move { m.ack().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_ack_still_settles_first() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let (a, n) = (acks.clone(), nacks.clone());
        let message = Message::builder("slow")
            .on_ack(move || async move {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_nack(move |_| async move {
                n.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(10), message.ack()).await;
        assert!(cancelled.is_err());
        assert_eq!(message.ack_state(), AckState::Pending);

        assert!(message.nack(FlowError::processing("late")).await.is_ok());
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
        assert_eq!(message.ack_state(), AckState::Acked);
    }

    #[tokio::test]
    async fn test_with_payload_shares_acknowledgement() {
        let (message, acks, _) = counted();
        let derived = message.with_payload("HELLO");
        assert_eq!(derived.payload(), &Payload::Text("HELLO".into()));

        derived.ack().await.unwrap();
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(message.ack_state(), AckState::Acked);
    }

    #[test]
    fn test_metadata_and_content_type() {
        let message = Message::new(Payload::Bytes(b"{}".to_vec()))
            .with_metadata(CONTENT_TYPE, "application/json")
            .with_metadata("attempt", 2_i64);
        assert_eq!(message.content_type(), Some("application/json"));
        assert_eq!(message.metadata_value("attempt").and_then(MetadataValue::as_i64), Some(2));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
        age: u32,
    }

    #[test]
    fn test_json_decodes_from_bytes_text_and_value() {
        let bytes = Payload::Bytes(br#"{"name":"ada","age":36}"#.to_vec());
        let Json(person) = bytes.decode::<Json<Person>>().unwrap();
        assert_eq!(person.name, "ada");

        let text = Payload::Text(r#"{"name":"bob","age":7}"#.into());
        assert_eq!(text.decode::<Json<Person>>().unwrap().0.age, 7);

        let encoded = Json(Person { name: "cy".into(), age: 1 }).into_payload().unwrap();
        assert_eq!(encoded.decode::<Json<Person>>().unwrap().0.name, "cy");
    }

    #[test]
    fn test_decode_failures_are_decode_errors() {
        let err = Payload::Bytes(b"not json".to_vec())
            .decode::<Json<Person>>()
            .unwrap_err();
        assert_eq!(err.kind(), "DECODE");

        let err = Payload::Bool(true).decode::<Vec<u8>>().unwrap_err();
        assert!(err.to_string().contains("expected bytes"));
    }

    #[test]
    fn test_decode_uses_codec_only_for_structured_types() {
        let message = Message::builder(Payload::Bytes(br#"{"name":"ada","age":36}"#.to_vec()))
            .metadata(CONTENT_TYPE, crate::codec::APPLICATION_JSON)
            .codec(Arc::new(crate::codec::JsonCodec))
            .build();

        let Json(person) = message.decode::<Json<Person>>().unwrap();
        assert_eq!(person.age, 36);

        let raw = message.decode::<Vec<u8>>().unwrap();
        assert_eq!(raw, br#"{"name":"ada","age":36}"#.to_vec());
    }

    #[test]
    fn test_primitive_conversions() {
        assert_eq!(Payload::Text(" 42 ".into()).decode::<i64>().unwrap(), 42);
        assert_eq!(Payload::Long(3).decode::<f64>().unwrap(), 3.0);
        assert_eq!(Payload::Bytes(b"hi".to_vec()).decode::<String>().unwrap(), "hi");
        assert!(Payload::Text("true".into()).decode::<bool>().unwrap());
    }
}
