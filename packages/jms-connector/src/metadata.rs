//! JMS headers as message metadata.
//!
//! Inbound messages expose every header under its JMS name next to the
//! application properties. Outbound, the application-settable headers are
//! read back from metadata; broker-assigned ones are stamped by the broker
//! on send and ignored here.

use reactive_messaging::{Metadata, MetadataValue};

use crate::api::{DeliveryMode, Destination, Headers};

pub const JMS_MESSAGE_ID: &str = "JMSMessageID";
pub const JMS_CORRELATION_ID: &str = "JMSCorrelationID";
pub const JMS_DELIVERY_MODE: &str = "JMSDeliveryMode";
pub const JMS_DESTINATION: &str = "JMSDestination";
pub const JMS_EXPIRATION: &str = "JMSExpiration";
pub const JMS_PRIORITY: &str = "JMSPriority";
pub const JMS_REDELIVERED: &str = "JMSRedelivered";
pub const JMS_REPLY_TO: &str = "JMSReplyTo";
pub const JMS_TIMESTAMP: &str = "JMSTimestamp";
pub const JMS_TYPE: &str = "JMSType";
pub const JMS_DELIVERY_TIME: &str = "JMSDeliveryTime";

/// Every header name, in declaration order.
pub const HEADER_NAMES: [&str; 11] = [
    JMS_MESSAGE_ID,
    JMS_CORRELATION_ID,
    JMS_DELIVERY_MODE,
    JMS_DESTINATION,
    JMS_EXPIRATION,
    JMS_PRIORITY,
    JMS_REDELIVERED,
    JMS_REPLY_TO,
    JMS_TIMESTAMP,
    JMS_TYPE,
    JMS_DELIVERY_TIME,
];

/// Whether `name` is a JMS header rather than a property.
pub fn is_header(name: &str) -> bool {
    HEADER_NAMES.contains(&name)
}

/// Value of one header. `None` when the header is unset.
pub fn header_value(headers: &Headers, name: &str) -> Option<MetadataValue> {
    match name {
        JMS_MESSAGE_ID => headers.message_id.clone().map(MetadataValue::from),
        JMS_CORRELATION_ID => headers.correlation_id.clone().map(MetadataValue::from),
        JMS_DELIVERY_MODE => Some(headers.delivery_mode.code().into()),
        JMS_DESTINATION => headers.destination.as_ref().map(|d| d.to_string().into()),
        JMS_EXPIRATION => Some(headers.expiration.into()),
        JMS_PRIORITY => Some(i64::from(headers.priority).into()),
        JMS_REDELIVERED => Some(headers.redelivered.into()),
        JMS_REPLY_TO => headers.reply_to.as_ref().map(|d| d.to_string().into()),
        JMS_TIMESTAMP => Some(headers.timestamp.into()),
        JMS_TYPE => headers.jms_type.clone().map(MetadataValue::from),
        JMS_DELIVERY_TIME => Some(headers.delivery_time.into()),
        _ => None,
    }
}

/// Every set header as metadata.
pub fn header_metadata(headers: &Headers) -> Metadata {
    HEADER_NAMES
        .iter()
        .filter_map(|name| header_value(headers, name).map(|value| (name.to_string(), value)))
        .collect()
}

/// Apply an application-settable header found in metadata. Returns `false`
/// for broker-assigned headers and values of the wrong shape.
pub(crate) fn apply_header(headers: &mut Headers, name: &str, value: &MetadataValue) -> bool {
    match (name, value) {
        (JMS_CORRELATION_ID, MetadataValue::String(id)) => {
            headers.correlation_id = Some(id.clone());
            true
        }
        (JMS_TYPE, MetadataValue::String(kind)) => {
            headers.jms_type = Some(kind.clone());
            true
        }
        (JMS_REPLY_TO, MetadataValue::String(uri)) => match Destination::parse_uri(uri) {
            Some(destination) => {
                headers.reply_to = Some(destination);
                true
            }
            None => false,
        },
        (JMS_DELIVERY_MODE, MetadataValue::Long(code)) => match DeliveryMode::from_code(*code) {
            Some(mode) => {
                headers.delivery_mode = mode;
                true
            }
            None => false,
        },
        (JMS_PRIORITY, MetadataValue::Long(priority)) => match u8::try_from(*priority) {
            Ok(priority) if priority <= 9 => {
                headers.priority = priority;
                true
            }
            _ => false,
        },
        _ => false,
    }
}
