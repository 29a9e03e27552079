//! Event Publisher
//!
//! `publish` is a store -> emit -> mark pipeline: the outbox row is the
//! durable record, written before any broker traffic. Broker failures
//! are absorbed into a `false` return (an offline relay may later emit
//! the persisted row) while store failures propagate to the caller.

use std::sync::Arc;

use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use metrics::counter;
use nb_amqp::ConnectionSupervisor;
use nb_common::Envelope;
use nb_config::{BrokerConfig, ConfigError};
use nb_store::{EventStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod category;

pub use category::{ErrorCategory, CATEGORY_MATCHERS};

/// Failures `publish` can surface. Broker trouble is not among them; it
/// resolves to `Ok(false)`.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outbox-backed event publisher.
pub struct Publisher {
    config: BrokerConfig,
    store: Arc<dyn EventStore>,
    supervisor: Arc<ConnectionSupervisor>,
}

impl Publisher {
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn EventStore>,
        supervisor: Arc<ConnectionSupervisor>,
    ) -> Self {
        Self {
            config,
            store,
            supervisor,
        }
    }

    /// Publish an envelope under the given event type.
    ///
    /// Returns `Ok(true)` when the event is durably recorded and (if the
    /// publisher is enabled) emitted; `Ok(false)` when the broker
    /// emission failed and the outbox row was marked `failed`. The
    /// caller's `message_id` is never rewritten.
    pub async fn publish(
        &self,
        envelope: &mut Envelope,
        event_type: &str,
    ) -> Result<bool, PublishError> {
        self.config.validate()?;

        envelope.set_producer(self.config.service_name());
        envelope.set_event(event_type);

        let inserted = self
            .store
            .insert_outbox(
                &self.config.service_name(),
                event_type,
                &envelope.body(),
                envelope.message_id(),
            )
            .await?;
        if !inserted {
            // Duplicate outbox row: the event is already recorded;
            // proceed to emission against the existing row.
            debug!(
                message_id = %envelope.message_id(),
                "Outbox row already present, re-emitting"
            );
        }

        if !self.config.publisher_enabled {
            debug!(
                message_id = %envelope.message_id(),
                event_type = %event_type,
                "Publisher disabled, emission suppressed"
            );
            return Ok(true);
        }

        match self.publish_to_broker(envelope, event_type).await {
            Ok(()) => {
                if !self.store.mark_outbox_published(envelope.message_id()).await {
                    warn!(
                        message_id = %envelope.message_id(),
                        "Outbox row not marked published"
                    );
                }
                info!(
                    message_id = %envelope.message_id(),
                    event_type = %event_type,
                    "Event published"
                );
                Ok(true)
            }
            Err(e) => {
                let category = ErrorCategory::of(&e.to_string());
                counter!("publisher_errors_total", "category" => category.as_str())
                    .increment(1);
                warn!(
                    message_id = %envelope.message_id(),
                    event_type = %event_type,
                    category = category.as_str(),
                    error = %e,
                    "Broker emission failed, outbox row retained"
                );
                if !self.store.mark_outbox_failed(envelope.message_id()).await {
                    warn!(
                        message_id = %envelope.message_id(),
                        "Outbox row not marked failed"
                    );
                }
                Ok(false)
            }
        }
    }

    /// Emit the envelope on the configured topic exchange with routing
    /// key = event type. Propagates broker errors, unlike
    /// [`Publisher::publish`] which absorbs them.
    pub async fn publish_to_broker(
        &self,
        envelope: &Envelope,
        event_type: &str,
    ) -> Result<(), lapin::Error> {
        let channel = self.supervisor.get_channel().await?;
        let body = envelope.body();

        channel
            .basic_publish(
                &self.config.exchange,
                event_type,
                BasicPublishOptions::default(),
                body.as_bytes(),
                basic_properties(envelope, event_type),
            )
            .await?
            .await?;

        debug!(
            message_id = %envelope.message_id(),
            exchange = %self.config.exchange,
            routing_key = %event_type,
            "Emitted envelope to broker"
        );
        Ok(())
    }
}

/// AMQP properties for an envelope: identity as properties
/// (`message_id`, `type`, `app_id`), retry bookkeeping as headers,
/// persistent delivery mode.
pub fn basic_properties(envelope: &Envelope, event_type: &str) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        "x-retry-count".into(),
        AMQPValue::LongInt(envelope.retry_count() as i32),
    );
    if let Some(delay_ms) = envelope.delay_ms() {
        headers.insert("x-delay".into(), AMQPValue::LongLongInt(delay_ms));
    }

    BasicProperties::default()
        .with_message_id(envelope.message_id().into())
        .with_kind(event_type.into())
        .with_app_id(envelope.producer_id().into())
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_headers(headers)
}
