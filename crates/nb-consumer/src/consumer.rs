//! Event Consumer
//!
//! Declares the service topology, deduplicates deliveries through the
//! inbox, dispatches to the registered handler, and on failure either
//! republishes through the delayed exchange with a bumped retry counter
//! or routes the envelope to the dead-letter queue.
//!
//! Propagation policy: handler errors never escape dispatch; they map
//! to retry or DLQ. Infrastructure errors (non-duplicate inserts,
//! redelivery/DLQ publish, ACK) escape into the consume loop, which
//! resets the connection and re-declares topology on the next pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use metrics::counter;
use nb_amqp::{topology, ConnectionSupervisor};
use nb_common::Envelope;
use nb_config::BrokerConfig;
use nb_publisher::basic_properties;
use nb_store::{EventStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::delivery::parse_delivery;
use crate::handler::EventHandler;
use crate::retry::{failure_action, Backoff, FailureAction, RetryStage};

type ErrorCallback = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

/// Infrastructure failures that escape dispatch into the consume loop.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("broker failure: {0}")]
    Broker(#[from] lapin::Error),

    #[error("ack failure: {0}")]
    Ack(lapin::Error),

    #[error("no message handler registered")]
    NoHandler,
}

/// Outcome of the inbox gate for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A prior delivery already processed this message; skip the
    /// handler and acknowledge.
    AlreadyProcessed,
    /// A concurrent admitter inserted the inbox row first; skip and
    /// acknowledge.
    LostRace,
    /// The delivery holds the inbox row and must be dispatched. Covers
    /// both first deliveries and retries whose prior attempt failed.
    Admitted,
}

/// Inbox gate: skip messages already processed, admit everything else
/// by upserting a `processing` row. Store errors propagate so the
/// delivery stays unacknowledged and the broker redelivers.
pub async fn admit(
    store: &dyn EventStore,
    consumer_id: &str,
    producer_id: &str,
    event_type: &str,
    body: &str,
    message_id: &str,
) -> Result<Admission, StoreError> {
    if store
        .exists_in_inbox_and_processed(message_id, consumer_id)
        .await
    {
        return Ok(Admission::AlreadyProcessed);
    }

    if !store.exists_in_inbox(message_id, consumer_id).await {
        let inserted = store
            .insert_inbox(consumer_id, producer_id, event_type, body, message_id)
            .await?;
        if !inserted {
            return Ok(Admission::LostRace);
        }
    }

    Ok(Admission::Admitted)
}

/// Inbox-gated AMQP consumer with bounded delayed retries.
pub struct Consumer {
    config: BrokerConfig,
    store: Arc<dyn EventStore>,
    supervisor: Arc<ConnectionSupervisor>,
    event_types: Vec<String>,
    tries: u32,
    backoff: Backoff,
    outage_sleep: Duration,
    handler: Option<Arc<dyn EventHandler>>,
    debug_handler: Option<Arc<dyn EventHandler>>,
    on_error: Option<ErrorCallback>,
    on_dead_letter: Option<ErrorCallback>,
    initialized: AtomicBool,
}

impl Consumer {
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn EventStore>,
        supervisor: Arc<ConnectionSupervisor>,
    ) -> Self {
        Self {
            config,
            store,
            supervisor,
            event_types: Vec::new(),
            tries: 3,
            backoff: Backoff::default(),
            outage_sleep: Duration::from_secs(30),
            handler: None,
            debug_handler: None,
            on_error: None,
            on_dead_letter: None,
            initialized: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Fluent configuration
    // ------------------------------------------------------------------

    /// Event types to bind the service queue to.
    pub fn events<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Maximum delivery attempts per event, including the first.
    /// Values below 1 are clamped to 1.
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sleep between reconnect probes while the broker is down.
    pub fn outage_sleep(mut self, sleep: Duration) -> Self {
        self.outage_sleep = sleep;
        self
    }

    /// Callback invoked with every failed attempt's error, terminal or
    /// not.
    pub fn on_error(mut self, callback: impl Fn(&anyhow::Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Callback invoked once an event transitions to the DLQ.
    pub fn on_dead_letter(
        mut self,
        callback: impl Fn(&anyhow::Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_dead_letter = Some(Arc::new(callback));
        self
    }

    /// The user message handler.
    pub fn handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Handler used when the envelope carries `is_debug`; falls back to
    /// the main handler when unset.
    pub fn debug_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.debug_handler = Some(Arc::new(handler));
        self
    }

    pub fn max_tries(&self) -> u32 {
        self.tries
    }

    pub fn backoff_policy(&self) -> &Backoff {
        &self.backoff
    }

    /// Service queue name, `<project>.<consumer_id>`.
    pub fn queue_name(&self) -> String {
        self.config.service_name()
    }

    /// Dead-letter queue name.
    pub fn failure_queue_name(&self) -> String {
        format!("{}.failed", self.config.service_name())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// Declare queues, the delayed exchange, and bindings. Idempotent:
    /// a no-op once the initialized flag is set.
    pub async fn init(&self) -> Result<(), lapin::Error> {
        if self.is_initialized() {
            return Ok(());
        }

        let channel = self.supervisor.get_channel().await?;
        let queue = self.queue_name();

        topology::declare_durable_queue(&channel, &queue).await?;
        topology::declare_durable_queue(&channel, &self.failure_queue_name()).await?;
        topology::declare_delayed_exchange(&channel, &self.config.delay_exchange).await?;

        // Requested event types plus the firehose fallback; the delayed
        // exchange binds back to the same queue so retried messages
        // return here after their delay.
        let mut routing_keys: Vec<&str> = self.event_types.iter().map(String::as_str).collect();
        routing_keys.push("#");
        for routing_key in routing_keys {
            topology::bind_queue(&channel, &queue, &self.config.exchange, routing_key).await?;
            topology::bind_queue(&channel, &queue, &self.config.delay_exchange, routing_key)
                .await?;
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            queue = %queue,
            events = ?self.event_types,
            tries = self.tries,
            "Consumer topology declared"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&self, delivery: Delivery) -> Result<(), ConsumeError> {
        let consumer_id = self.config.service_name();

        // Malformed envelopes are acknowledged and dropped, never
        // retried.
        let envelope = match parse_delivery(&delivery.properties, &delivery.data) {
            Ok(envelope) => envelope,
            Err(reason) => {
                warn!(%reason, "Dropping malformed delivery");
                return self.ack(&delivery).await;
            }
        };
        let message_id = envelope.message_id().to_string();
        let event_type = envelope.event_type().to_string();

        match admit(
            self.store.as_ref(),
            &consumer_id,
            envelope.producer_id(),
            &event_type,
            &envelope.body(),
            &message_id,
        )
        .await?
        {
            Admission::AlreadyProcessed => {
                debug!(message_id = %message_id, "Already processed, skipping");
                return self.ack(&delivery).await;
            }
            Admission::LostRace => {
                debug!(message_id = %message_id, "Lost admission race, skipping");
                return self.ack(&delivery).await;
            }
            Admission::Admitted => {}
        }

        let handler = match (envelope.is_debug(), &self.debug_handler, &self.handler) {
            (true, Some(debug_handler), _) => debug_handler.clone(),
            (_, _, Some(handler)) => handler.clone(),
            _ => return Err(ConsumeError::NoHandler),
        };

        let attempt = envelope.retry_count() + 1;
        debug!(
            message_id = %message_id,
            event_type = %event_type,
            attempt = attempt,
            stage = RetryStage::of(attempt, self.tries).as_str(),
            "Dispatching delivery"
        );

        match handler.handle(envelope.clone()).await {
            Ok(()) => {
                if !self
                    .store
                    .mark_inbox_processed(&message_id, &consumer_id)
                    .await
                {
                    warn!(message_id = %message_id, "Inbox row not marked processed");
                }
                self.ack(&delivery).await
            }
            Err(err) => self.handle_failure(&delivery, envelope, err).await,
        }
    }

    /// Failure branch: delayed redelivery while tries remain, DLQ once
    /// exhausted. Publish failures propagate without ACK.
    async fn handle_failure(
        &self,
        delivery: &Delivery,
        mut envelope: Envelope,
        err: anyhow::Error,
    ) -> Result<(), ConsumeError> {
        let consumer_id = self.config.service_name();
        let message_id = envelope.message_id().to_string();
        let event_type = envelope.event_type().to_string();

        match failure_action(envelope.retry_count(), self.tries, &self.backoff) {
            FailureAction::Redeliver {
                retry_count,
                delay_ms,
            } => {
                let mut redelivery = envelope.clone();
                redelivery.set_retry_count(retry_count);
                redelivery.set_delay_ms(delay_ms as i64);

                let channel = self.supervisor.get_channel().await?;
                channel
                    .basic_publish(
                        &self.config.delay_exchange,
                        &event_type,
                        BasicPublishOptions::default(),
                        redelivery.body().as_bytes(),
                        basic_properties(&redelivery, &event_type),
                    )
                    .await?
                    .await?;

                info!(
                    message_id = %message_id,
                    retry_count = retry_count,
                    delay_ms = delay_ms,
                    error = %err,
                    "Handler failed, scheduled delayed redelivery"
                );
                if let Some(on_error) = &self.on_error {
                    on_error(&err);
                }
                self.ack(delivery).await
            }
            FailureAction::DeadLetter => {
                envelope.set_consumer_error(err.to_string());

                let channel = self.supervisor.get_channel().await?;
                channel
                    .basic_publish(
                        "",
                        &self.failure_queue_name(),
                        BasicPublishOptions::default(),
                        envelope.body().as_bytes(),
                        basic_properties(&envelope, &event_type),
                    )
                    .await?
                    .await?;

                warn!(
                    message_id = %message_id,
                    tries = self.tries,
                    error = %err,
                    "Attempts exhausted, routed to dead-letter queue"
                );
                if let Some(on_error) = &self.on_error {
                    on_error(&err);
                }
                if let Some(on_dead_letter) = &self.on_dead_letter {
                    on_dead_letter(&err);
                }
                if !self
                    .store
                    .mark_inbox_failed(&message_id, &consumer_id, Some(&err.to_string()))
                    .await
                {
                    warn!(message_id = %message_id, "Inbox row not marked failed");
                }
                self.ack(delivery).await
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumeError> {
        delivery.ack(BasicAckOptions::default()).await.map_err(|e| {
            counter!("consumer_ack_failures_total").increment(1);
            ConsumeError::Ack(e)
        })
    }

    // ------------------------------------------------------------------
    // Consume loop
    // ------------------------------------------------------------------

    async fn consume(&self) -> Result<(), ConsumeError> {
        let channel = self.supervisor.get_channel().await?;
        let queue = self.queue_name();
        let consumer_tag = format!("{}-{}", queue, uuid::Uuid::new_v4());

        let mut consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery?;
            self.dispatch(delivery).await?;
        }

        Ok(())
    }

    /// Run the consumer until the task is cancelled. Requires a handler.
    ///
    /// Broker loss is cooperative: the supervisor sleeps between
    /// reconnect probes, and topology is re-declared on a fresh
    /// connection after every infrastructure error.
    pub async fn run(&self) -> Result<(), ConsumeError> {
        if self.handler.is_none() {
            return Err(ConsumeError::NoHandler);
        }

        loop {
            if !self.is_initialized() {
                if let Err(e) = self.init().await {
                    warn!(error = %e, "Topology declaration failed");
                    self.supervisor.reset().await;
                }
            }

            if !self
                .supervisor
                .ensure_connection_or_sleep(self.outage_sleep)
                .await
            {
                continue;
            }

            if !self.is_initialized() {
                // Connection is back; declare topology on the next pass.
                continue;
            }

            if let Err(e) = self.consume().await {
                warn!(error = %e, "Consume loop error, resetting connection");
                self.initialized.store(false, Ordering::SeqCst);
                self.supervisor.reset().await;
            }
        }
    }
}
