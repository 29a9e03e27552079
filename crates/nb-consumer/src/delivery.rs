//! Inbound delivery validation
//!
//! A delivery must carry `type`, `message_id` and `app_id` properties
//! (present and non-empty) and a JSON body. Anything else is dropped
//! with an acknowledgement; malformed envelopes are never retried.

use lapin::types::AMQPValue;
use lapin::BasicProperties;
use nb_common::Envelope;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("missing or empty type property")]
    MissingEventType,

    #[error("missing or empty message_id property")]
    MissingMessageId,

    #[error("missing or empty app_id property")]
    MissingProducerId,

    #[error("body is not valid UTF-8")]
    BodyNotUtf8,

    #[error("body is not valid JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

/// Validate an inbound delivery and build the envelope from its body
/// and properties. The `x-retry-count` header carries across attempts,
/// defaulting to 0 when absent.
pub fn parse_delivery(
    properties: &BasicProperties,
    data: &[u8],
) -> Result<Envelope, ValidationError> {
    let event_type = properties
        .kind()
        .as_ref()
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingEventType)?;

    let message_id = properties
        .message_id()
        .as_ref()
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingMessageId)?;

    let producer_id = properties
        .app_id()
        .as_ref()
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(ValidationError::MissingProducerId)?;

    let body = std::str::from_utf8(data).map_err(|_| ValidationError::BodyNotUtf8)?;
    let mut envelope = Envelope::from_json(body)?;

    envelope.set_id(message_id);
    envelope.set_event(event_type);
    envelope.set_producer(producer_id);
    envelope.set_retry_count(header_u32(properties, "x-retry-count").unwrap_or(0));

    Ok(envelope)
}

/// Read an integer header regardless of the AMQP integer width the
/// sender used.
pub fn header_u32(properties: &BasicProperties, name: &str) -> Option<u32> {
    let headers = properties.headers().as_ref()?;
    let value = headers.inner().get(name)?;
    match value {
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}
