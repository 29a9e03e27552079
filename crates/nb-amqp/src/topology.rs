//! Broker topology declaration helpers
//!
//! Queues are durable; retries go through a delayed-message exchange of
//! type topic (`x-delayed-type = topic`), which defers delivery by the
//! `x-delay` header in milliseconds.

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};
use tracing::debug;

/// Declare a durable queue.
pub async fn declare_durable_queue(channel: &Channel, name: &str) -> Result<(), lapin::Error> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    debug!(queue = %name, "Declared durable queue");
    Ok(())
}

/// Declare the delayed-message exchange used for retries. Requires the
/// broker's delayed-message plugin.
pub async fn declare_delayed_exchange(channel: &Channel, name: &str) -> Result<(), lapin::Error> {
    let mut arguments = FieldTable::default();
    arguments.insert("x-delayed-type".into(), AMQPValue::LongString("topic".into()));

    channel
        .exchange_declare(
            name,
            ExchangeKind::Custom("x-delayed-message".to_string()),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            arguments,
        )
        .await?;
    debug!(exchange = %name, "Declared delayed exchange");
    Ok(())
}

/// Bind a queue to an exchange for one routing key.
pub async fn bind_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), lapin::Error> {
    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Bound queue");
    Ok(())
}
