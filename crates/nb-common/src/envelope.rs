//! Event Envelope
//!
//! The unit of communication on the bus. An envelope bundles:
//! - identity: `message_id`, `event_type`, `producer_id`
//! - the JSON body: `payload`, `meta`, `status`, `system`
//! - delivery bookkeeping: `retry_count`, `delay_ms`, `created_at`
//!
//! Identity fields travel as AMQP properties (`message_id`, `type`,
//! `app_id`), retry bookkeeping as the `x-retry-count` / `x-delay`
//! headers. Only the body is serialized as the message payload.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON object alias used for payload/meta/status data.
pub type Map = serde_json::Map<String, serde_json::Value>;

/// Timestamp format used on the wire: `YYYY-MM-DD HH:MM:SS.mmm`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Outcome code carried in the envelope status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    #[default]
    Unknown,
    Success,
    Error,
    Warning,
    Info,
    Debug,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Unknown => "unknown",
            StatusCode::Success => "success",
            StatusCode::Error => "error",
            StatusCode::Warning => "warning",
            StatusCode::Info => "info",
            StatusCode::Debug => "debug",
        }
    }
}

/// Higher-level outcome reporting block (`status` in the wire body).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeStatus {
    #[serde(default)]
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `system` block of the wire body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireSystem {
    #[serde(default)]
    is_debug: bool,
    #[serde(default)]
    consumer_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
}

/// The wire body shape:
/// `{"meta": .., "status": .., "payload": .., "system": ..}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireBody {
    #[serde(default)]
    meta: Map,
    #[serde(default)]
    status: EnvelopeStatus,
    #[serde(default)]
    payload: Map,
    #[serde(default)]
    system: WireSystem,
}

/// The full message value object.
#[derive(Debug, Clone)]
pub struct Envelope {
    message_id: String,
    event_type: String,
    producer_id: String,
    payload: Map,
    meta: Map,
    status: EnvelopeStatus,
    is_debug: bool,
    consumer_error: Option<String>,
    retry_count: u32,
    delay_ms: Option<i64>,
    created_at: DateTime<Utc>,
    /// Body handed in as a pre-serialized string, re-served verbatim
    /// until a body-affecting mutator runs.
    raw_body: Option<String>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    /// Fresh envelope: generated `message_id`, status `unknown`,
    /// `retry_count = 0`, `created_at` stamped now.
    pub fn new() -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            event_type: String::new(),
            producer_id: String::new(),
            payload: Map::new(),
            meta: Map::new(),
            status: EnvelopeStatus::default(),
            is_debug: false,
            consumer_error: None,
            retry_count: 0,
            delay_ms: None,
            created_at: Utc::now(),
            raw_body: None,
        }
    }

    /// Envelope around a structured payload mapping.
    pub fn from_payload(payload: Map) -> Self {
        let mut envelope = Self::new();
        envelope.payload = payload;
        envelope
    }

    /// Envelope from a pre-serialized JSON body. The original string is
    /// kept and re-served as-is by [`Envelope::body`].
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        let wire: WireBody = serde_json::from_str(body)?;
        let mut envelope = Self::new();
        envelope.meta = wire.meta;
        envelope.status = wire.status;
        envelope.payload = wire.payload;
        envelope.is_debug = wire.system.is_debug;
        envelope.consumer_error = wire.system.consumer_error;
        if let Some(ts) = wire.system.created_at.as_deref() {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT) {
                envelope.created_at = parsed.and_utc();
            }
        }
        envelope.raw_body = Some(body.to_string());
        Ok(envelope)
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    /// Body changed; any verbatim raw body no longer matches.
    fn invalidate_raw(&mut self) {
        self.raw_body = None;
    }

    /// Merge (or replace) the payload mapping.
    pub fn with_payload(mut self, payload: Map, replace: bool) -> Self {
        self.invalidate_raw();
        if replace {
            self.payload = payload;
        } else {
            self.payload.extend(payload);
        }
        self
    }

    /// Set a single payload attribute.
    pub fn with_payload_attribute(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.invalidate_raw();
        self.payload.insert(key.into(), value);
        self
    }

    /// Merge entries into the meta mapping.
    pub fn with_meta(mut self, meta: Map) -> Self {
        self.invalidate_raw();
        self.meta.extend(meta);
        self
    }

    pub fn set_id(&mut self, message_id: impl Into<String>) -> &mut Self {
        self.message_id = message_id.into();
        self
    }

    pub fn set_event(&mut self, event_type: impl Into<String>) -> &mut Self {
        self.event_type = event_type.into();
        self
    }

    pub fn set_producer(&mut self, producer_id: impl Into<String>) -> &mut Self {
        self.producer_id = producer_id.into();
        self
    }

    /// Ordered trace span ids, stored under `meta.trace_id`.
    pub fn set_trace_id(&mut self, trace_ids: Vec<String>) -> &mut Self {
        self.invalidate_raw();
        self.meta.insert(
            "trace_id".to_string(),
            serde_json::Value::Array(
                trace_ids.into_iter().map(serde_json::Value::String).collect(),
            ),
        );
        self
    }

    pub fn set_status(
        &mut self,
        code: StatusCode,
        data: Option<Map>,
        debug: Option<String>,
        error: Option<String>,
    ) -> &mut Self {
        self.invalidate_raw();
        self.status = EnvelopeStatus {
            code,
            data: data.unwrap_or_default(),
            debug,
            error,
        };
        self
    }

    pub fn set_consumer_error(&mut self, error: impl Into<String>) -> &mut Self {
        self.invalidate_raw();
        self.consumer_error = Some(error.into());
        self
    }

    pub fn set_debug(&mut self, is_debug: bool) -> &mut Self {
        self.invalidate_raw();
        self.is_debug = is_debug;
        self
    }

    pub fn set_created_at(&mut self, created_at: DateTime<Utc>) -> &mut Self {
        self.invalidate_raw();
        self.created_at = created_at;
        self
    }

    pub fn set_retry_count(&mut self, retry_count: u32) -> &mut Self {
        self.retry_count = retry_count;
        self
    }

    pub fn set_delay_ms(&mut self, delay_ms: i64) -> &mut Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn payload(&self) -> &Map {
        &self.payload
    }

    pub fn meta(&self) -> &Map {
        &self.meta
    }

    pub fn status(&self) -> &EnvelopeStatus {
        &self.status
    }

    pub fn is_debug(&self) -> bool {
        self.is_debug
    }

    pub fn consumer_error(&self) -> Option<&str> {
        self.consumer_error.as_deref()
    }

    /// Retry counter carried across attempts; 0 on a first delivery.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn delay_ms(&self) -> Option<i64> {
        self.delay_ms
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Ordered trace ids from `meta.trace_id`, empty when absent.
    pub fn trace_id(&self) -> Vec<String> {
        self.meta
            .get("trace_id")
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `created_at` in wire format.
    pub fn created_at_formatted(&self) -> String {
        self.created_at.format(TIMESTAMP_FORMAT).to_string()
    }

    /// The serialized JSON body. A body handed in via
    /// [`Envelope::from_json`] is returned verbatim until mutated.
    pub fn body(&self) -> String {
        if let Some(raw) = &self.raw_body {
            return raw.clone();
        }
        let wire = WireBody {
            meta: self.meta.clone(),
            status: self.status.clone(),
            payload: self.payload.clone(),
            system: WireSystem {
                is_debug: self.is_debug,
                consumer_error: self.consumer_error.clone(),
                created_at: Some(self.created_at_formatted()),
            },
        };
        serde_json::to_string(&wire).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_envelope_defaults() {
        let envelope = Envelope::new();
        assert!(!envelope.message_id().is_empty());
        assert_eq!(envelope.retry_count(), 0);
        assert_eq!(envelope.status().code, StatusCode::Unknown);
        assert!(!envelope.is_debug());
        assert!(envelope.consumer_error().is_none());
        assert!(envelope.delay_ms().is_none());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(Envelope::new().message_id(), Envelope::new().message_id());
    }

    #[test]
    fn test_payload_merge_and_replace() {
        let mut initial = Map::new();
        initial.insert("a".to_string(), json!(1));
        let mut extra = Map::new();
        extra.insert("b".to_string(), json!(2));

        let merged = Envelope::from_payload(initial.clone()).with_payload(extra.clone(), false);
        assert_eq!(merged.payload().len(), 2);

        let replaced = Envelope::from_payload(initial).with_payload(extra, true);
        assert_eq!(replaced.payload().len(), 1);
        assert_eq!(replaced.payload()["b"], json!(2));
    }

    #[test]
    fn test_body_round_trip() {
        let envelope = Envelope::from_payload(Map::new())
            .with_payload_attribute("user_id", json!(123))
            .with_meta({
                let mut m = Map::new();
                m.insert("tenant".to_string(), json!("acme"));
                m
            });

        let parsed = Envelope::from_json(&envelope.body()).unwrap();
        assert_eq!(parsed.payload(), envelope.payload());
        assert_eq!(parsed.meta(), envelope.meta());
        assert_eq!(parsed.status().code, StatusCode::Unknown);
        assert_eq!(parsed.is_debug(), envelope.is_debug());
    }

    #[test]
    fn test_raw_body_served_verbatim() {
        let raw = r#"{"meta":{},"status":{"code":"success"},"payload":{"k":1},"system":{"is_debug":false,"consumer_error":null}}"#;
        let envelope = Envelope::from_json(raw).unwrap();
        assert_eq!(envelope.body(), raw);
        assert_eq!(envelope.status().code, StatusCode::Success);
        assert_eq!(envelope.payload()["k"], json!(1));
    }

    #[test]
    fn test_mutation_invalidates_raw_body() {
        let raw = r#"{"meta":{},"status":{"code":"unknown"},"payload":{},"system":{"is_debug":false,"consumer_error":null}}"#;
        let mut envelope = Envelope::from_json(raw).unwrap();
        envelope.set_consumer_error("handler exploded");
        assert_ne!(envelope.body(), raw);
        let reparsed = Envelope::from_json(&envelope.body()).unwrap();
        assert_eq!(reparsed.consumer_error(), Some("handler exploded"));
    }

    #[test]
    fn test_timestamp_wire_format() {
        let envelope = Envelope::new();
        let formatted = envelope.created_at_formatted();
        // YYYY-MM-DD HH:MM:SS.mmm
        assert_eq!(formatted.len(), 23);
        assert_eq!(&formatted[4..5], "-");
        assert_eq!(&formatted[10..11], " ");
        assert_eq!(&formatted[19..20], ".");
        let parsed = NaiveDateTime::parse_from_str(&formatted, TIMESTAMP_FORMAT).unwrap();
        assert_eq!(
            parsed.and_utc().timestamp_millis(),
            envelope.created_at().timestamp_millis()
        );
    }

    #[test]
    fn test_trace_id_ordering_preserved() {
        let mut envelope = Envelope::new();
        envelope.set_trace_id(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(envelope.trace_id(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_set_id_keeps_raw_body() {
        let raw = r#"{"meta":{},"status":{"code":"unknown"},"payload":{"x":true},"system":{"is_debug":false,"consumer_error":null}}"#;
        let mut envelope = Envelope::from_json(raw).unwrap();
        envelope.set_id("550e8400-e29b-41d4-a716-446655440010");
        envelope.set_event("user.created");
        envelope.set_retry_count(2);
        assert_eq!(envelope.body(), raw);
    }

    #[test]
    fn test_status_block_serialization() {
        let mut envelope = Envelope::new();
        envelope.set_status(
            StatusCode::Error,
            None,
            None,
            Some("boom".to_string()),
        );
        let parsed = Envelope::from_json(&envelope.body()).unwrap();
        assert_eq!(parsed.status().code, StatusCode::Error);
        assert_eq!(parsed.status().error.as_deref(), Some("boom"));
    }
}
