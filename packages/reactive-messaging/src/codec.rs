//! Payload codec seam.
//!
//! Transports carry bytes; mediators declare typed payloads. A
//! [`PayloadCodec`] converts structured payloads to bytes on the way out and
//! back on the way in. Connectors look a codec up in the
//! [`BeanRegistry`](crate::BeanRegistry) and fall back to [`JsonCodec`].

use std::sync::Arc;

use crate::beans::BeanRegistry;
use crate::error::FlowError;

/// Metadata / property name carrying the body's content type.
pub const CONTENT_TYPE: &str = "Content-Type";

/// Content type written by [`JsonCodec`].
pub const APPLICATION_JSON: &str = "application/json";

/// Converts structured payloads to and from transport bytes.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Content type this codec produces and understands.
    fn content_type(&self) -> &str;

    /// Encode a structured value.
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, FlowError>;

    /// Decode transport bytes into a structured value.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, FlowError>;
}

/// UTF-8 JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn content_type(&self) -> &str {
        APPLICATION_JSON
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, FlowError> {
        serde_json::to_vec(value).map_err(|e| FlowError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, FlowError> {
        serde_json::from_slice(bytes).map_err(|e| FlowError::Decode(e.to_string()))
    }
}

/// Shared codec handle.
pub type SharedCodec = Arc<dyn PayloadCodec>;

/// The codec registered as a bean, or [`JsonCodec`].
pub fn resolve_codec(beans: &BeanRegistry) -> SharedCodec {
    beans
        .select::<SharedCodec>()
        .map(|codec| (*codec).clone())
        .unwrap_or_else(|| Arc::new(JsonCodec))
}
