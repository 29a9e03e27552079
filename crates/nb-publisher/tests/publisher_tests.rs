//! Publisher pipeline tests
//!
//! Exercise the store -> emit -> mark sequence against the in-memory
//! event store. Broker-failure paths point the supervisor at an
//! unroutable endpoint so no live broker is needed.

use std::sync::Arc;

use nb_amqp::ConnectionSupervisor;
use nb_common::Envelope;
use nb_config::BrokerConfig;
use nb_publisher::{PublishError, Publisher};
use nb_store::{MemoryEventStore, OutboxStatus};
use serde_json::json;

fn broker_config(publisher_enabled: bool) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        user: "guest".to_string(),
        pass: "guest".to_string(),
        project: "shop".to_string(),
        consumer_id: "billing".to_string(),
        publisher_enabled,
        ..Default::default()
    }
}

fn publisher_with_store(config: BrokerConfig) -> (Publisher, Arc<MemoryEventStore>) {
    let store = Arc::new(MemoryEventStore::new());
    let supervisor = Arc::new(ConnectionSupervisor::new(config.clone()));
    (Publisher::new(config, store.clone(), supervisor), store)
}

#[tokio::test]
async fn test_disabled_publisher_persists_without_emitting() {
    let (publisher, store) = publisher_with_store(broker_config(false));
    let mut envelope = Envelope::new().with_payload_attribute("user_id", json!(123));

    let published = publisher.publish(&mut envelope, "user.created").await.unwrap();

    assert!(published);
    let row = store.outbox_row(envelope.message_id()).expect("outbox row");
    assert_eq!(row.status, OutboxStatus::Processing);
    assert_eq!(row.producer_id, "shop.billing");
    assert_eq!(row.event_type, "user.created");
    assert_eq!(envelope.producer_id(), "shop.billing");
    assert_eq!(envelope.event_type(), "user.created");
}

#[tokio::test]
async fn test_duplicate_publish_keeps_single_row() {
    let (publisher, store) = publisher_with_store(broker_config(false));
    let message_id = "550e8400-e29b-41d4-a716-446655440013";

    let mut first = Envelope::new();
    first.set_id(message_id);
    assert!(publisher.publish(&mut first, "user.created").await.unwrap());

    let mut second = Envelope::new();
    second.set_id(message_id);
    assert!(publisher.publish(&mut second, "user.created").await.unwrap());

    assert_eq!(store.outbox_len(), 1);
}

#[tokio::test]
async fn test_broker_down_absorbed_into_false() {
    // Publisher enabled but the broker endpoint is unroutable: the
    // outbox row is the durable record, publish must not error.
    let (publisher, store) = publisher_with_store(broker_config(true));
    let mut envelope = Envelope::new();

    let published = publisher.publish(&mut envelope, "user.created").await.unwrap();

    assert!(!published);
    let row = store.outbox_row(envelope.message_id()).expect("outbox row");
    assert_eq!(row.status, OutboxStatus::Failed);
}

#[tokio::test]
async fn test_missing_config_lists_every_absent_key() {
    let config = BrokerConfig {
        publisher_enabled: false,
        ..Default::default()
    };
    let (publisher, store) = publisher_with_store(config);
    let mut envelope = Envelope::new();

    let err = publisher.publish(&mut envelope, "user.created").await.unwrap_err();
    let message = match err {
        PublishError::Config(e) => e.to_string(),
        other => panic!("expected config error, got {other:?}"),
    };
    for key in ["AMQP_HOST", "AMQP_USER", "AMQP_PASS", "AMQP_PROJECT", "AMQP_MICROSERVICE_NAME"] {
        assert!(message.contains(key), "missing {key} in: {message}");
    }
    // Validation failed before any store traffic.
    assert_eq!(store.outbox_len(), 0);
}

#[tokio::test]
async fn test_message_id_is_never_rewritten() {
    let (publisher, store) = publisher_with_store(broker_config(false));
    let message_id = "550e8400-e29b-41d4-a716-446655440010";

    let mut envelope = Envelope::new().with_payload_attribute("user_id", json!(123));
    envelope.set_id(message_id);

    publisher.publish(&mut envelope, "user.created").await.unwrap();

    assert_eq!(envelope.message_id(), message_id);
    assert!(store.outbox_row(message_id).is_some());
}
