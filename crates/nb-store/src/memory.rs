//! In-Memory Event Store
//!
//! Trait-faithful implementation over process memory, including the
//! duplicate-key returns and status-transition guards. Backs unit tests
//! and dry-run mode; rows are inspectable for assertions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::{EventStore, InboxStatus, OutboxStatus, StoreError};

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub message_id: String,
    pub producer_id: String,
    pub event_type: String,
    pub body: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InboxRow {
    pub message_id: String,
    pub consumer_id: String,
    pub producer_id: String,
    pub event_type: String,
    pub body: String,
    pub status: InboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// In-memory implementation of [`EventStore`].
#[derive(Default)]
pub struct MemoryEventStore {
    outbox: Mutex<HashMap<String, OutboxRow>>,
    inbox: Mutex<HashMap<(String, String), InboxRow>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox_row(&self, message_id: &str) -> Option<OutboxRow> {
        self.outbox.lock().get(message_id).cloned()
    }

    pub fn inbox_row(&self, message_id: &str, consumer_id: &str) -> Option<InboxRow> {
        self.inbox
            .lock()
            .get(&(message_id.to_string(), consumer_id.to_string()))
            .cloned()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }

    pub fn inbox_len(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Force an inbox row into a given status; test setup helper.
    pub fn set_inbox_status(&self, message_id: &str, consumer_id: &str, status: InboxStatus) {
        if let Some(row) = self
            .inbox
            .lock()
            .get_mut(&(message_id.to_string(), consumer_id.to_string()))
        {
            row.status = status;
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_outbox(
        &self,
        producer_id: &str,
        event_type: &str,
        body: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let mut outbox = self.outbox.lock();
        if outbox.contains_key(message_id) {
            return Ok(false);
        }
        outbox.insert(
            message_id.to_string(),
            OutboxRow {
                message_id: message_id.to_string(),
                producer_id: producer_id.to_string(),
                event_type: event_type.to_string(),
                body: body.to_string(),
                status: OutboxStatus::Processing,
                created_at: Utc::now(),
                published_at: None,
                error: None,
            },
        );
        Ok(true)
    }

    async fn mark_outbox_published(&self, message_id: &str) -> bool {
        let mut outbox = self.outbox.lock();
        match outbox.get_mut(message_id) {
            Some(row) if row.status == OutboxStatus::Processing => {
                row.status = OutboxStatus::Published;
                row.published_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    async fn mark_outbox_failed(&self, message_id: &str) -> bool {
        let mut outbox = self.outbox.lock();
        match outbox.get_mut(message_id) {
            Some(row) if row.status == OutboxStatus::Processing => {
                row.status = OutboxStatus::Failed;
                true
            }
            _ => false,
        }
    }

    async fn insert_inbox(
        &self,
        consumer_id: &str,
        producer_id: &str,
        event_type: &str,
        body: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let key = (message_id.to_string(), consumer_id.to_string());
        let mut inbox = self.inbox.lock();
        if inbox.contains_key(&key) {
            return Ok(false);
        }
        inbox.insert(
            key,
            InboxRow {
                message_id: message_id.to_string(),
                consumer_id: consumer_id.to_string(),
                producer_id: producer_id.to_string(),
                event_type: event_type.to_string(),
                body: body.to_string(),
                status: InboxStatus::Processing,
                created_at: Utc::now(),
                processed_at: None,
                error: None,
            },
        );
        Ok(true)
    }

    async fn exists_in_inbox(&self, message_id: &str, consumer_id: &str) -> bool {
        self.inbox
            .lock()
            .contains_key(&(message_id.to_string(), consumer_id.to_string()))
    }

    async fn exists_in_inbox_and_processed(&self, message_id: &str, consumer_id: &str) -> bool {
        self.inbox
            .lock()
            .get(&(message_id.to_string(), consumer_id.to_string()))
            .map(|row| row.status == InboxStatus::Processed)
            .unwrap_or(false)
    }

    async fn mark_inbox_processed(&self, message_id: &str, consumer_id: &str) -> bool {
        let mut inbox = self.inbox.lock();
        match inbox.get_mut(&(message_id.to_string(), consumer_id.to_string())) {
            Some(row) => {
                row.status = InboxStatus::Processed;
                row.processed_at = Some(Utc::now());
                row.error = None;
                true
            }
            None => false,
        }
    }

    async fn mark_inbox_failed(
        &self,
        message_id: &str,
        consumer_id: &str,
        error: Option<&str>,
    ) -> bool {
        let mut inbox = self.inbox.lock();
        match inbox.get_mut(&(message_id.to_string(), consumer_id.to_string())) {
            Some(row) if row.status != InboxStatus::Processed => {
                row.status = InboxStatus::Failed;
                row.error = error.map(str::to_string);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbox_duplicate_insert_returns_false() {
        let store = MemoryEventStore::new();
        let id = "550e8400-e29b-41d4-a716-446655440013";

        assert!(store.insert_outbox("shop.billing", "user.created", "{}", id).await.unwrap());
        assert!(!store.insert_outbox("shop.billing", "user.created", "{}", id).await.unwrap());
        assert_eq!(store.outbox_len(), 1);
    }

    #[tokio::test]
    async fn test_outbox_status_progresses_forward_only() {
        let store = MemoryEventStore::new();
        store.insert_outbox("p", "e", "{}", "m1").await.unwrap();

        assert!(store.mark_outbox_published("m1").await);
        let row = store.outbox_row("m1").unwrap();
        assert_eq!(row.status, OutboxStatus::Published);
        assert!(row.published_at.is_some());

        // Terminal; a later failure mark does not reverse it.
        assert!(!store.mark_outbox_failed("m1").await);
        assert_eq!(store.outbox_row("m1").unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn test_advisory_marks_return_false_for_unknown_rows() {
        let store = MemoryEventStore::new();
        assert!(!store.mark_outbox_published("nope").await);
        assert!(!store.mark_outbox_failed("nope").await);
        assert!(!store.mark_inbox_processed("nope", "c").await);
        assert!(!store.mark_inbox_failed("nope", "c", None).await);
    }

    #[tokio::test]
    async fn test_inbox_unique_per_consumer() {
        let store = MemoryEventStore::new();
        assert!(store.insert_inbox("svc-a", "p", "e", "{}", "m1").await.unwrap());
        assert!(!store.insert_inbox("svc-a", "p", "e", "{}", "m1").await.unwrap());
        // Same message for a different consumer is a distinct row.
        assert!(store.insert_inbox("svc-b", "p", "e", "{}", "m1").await.unwrap());
        assert_eq!(store.inbox_len(), 2);
    }

    #[tokio::test]
    async fn test_processed_gate_distinguishes_failed_rows() {
        let store = MemoryEventStore::new();
        store.insert_inbox("svc", "p", "e", "{}", "m1").await.unwrap();
        store.mark_inbox_failed("m1", "svc", Some("boom")).await;

        // Failed row: present in the inbox, but not processed, so a
        // retried delivery is reprocessed.
        assert!(store.exists_in_inbox("m1", "svc").await);
        assert!(!store.exists_in_inbox_and_processed("m1", "svc").await);

        // After a successful retry the gate closes.
        assert!(store.mark_inbox_processed("m1", "svc").await);
        assert!(store.exists_in_inbox_and_processed("m1", "svc").await);
    }

    #[tokio::test]
    async fn test_processed_row_never_regresses_to_failed() {
        let store = MemoryEventStore::new();
        store.insert_inbox("svc", "p", "e", "{}", "m1").await.unwrap();
        store.mark_inbox_processed("m1", "svc").await;

        assert!(!store.mark_inbox_failed("m1", "svc", Some("late failure")).await);
        assert_eq!(store.inbox_row("m1", "svc").unwrap().status, InboxStatus::Processed);
    }

    #[tokio::test]
    async fn test_mark_inbox_failed_records_error() {
        let store = MemoryEventStore::new();
        store.insert_inbox("svc", "p", "e", "{}", "m1").await.unwrap();
        store.mark_inbox_failed("m1", "svc", Some("handler exploded")).await;
        assert_eq!(
            store.inbox_row("m1", "svc").unwrap().error.as_deref(),
            Some("handler exploded")
        );
    }
}
