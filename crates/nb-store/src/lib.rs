//! Event Store
//!
//! Transactional outbox/inbox persistence behind the [`EventStore`]
//! trait, with a PostgreSQL implementation for production and an
//! in-memory implementation for tests and dry-run mode.
//!
//! Failure semantics:
//! - `insert_*` returns `Ok(false)` on a duplicate key and errors on any
//!   other store failure (the caller decides: retry, DLQ, or abort).
//! - `mark_*` never errors; a `false` return means status bookkeeping
//!   may be stale but message handling can proceed.
//! - `exists_*` queries fail open: on store error they answer `false`
//!   so a transiently unavailable inbox does not block traffic.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PostgresEventStore;

/// Store failure surfaced from construction and `insert_*` operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Config(#[from] nb_config::ConfigError),

    #[error("store failure: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outbox row lifecycle. Progresses `processing -> published` or
/// `processing -> failed`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Processing,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Processing => "processing",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(OutboxStatus::Processing),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// Inbox row lifecycle. Once `processed`, further deliveries of the
/// same `(message_id, consumer_id)` are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Processing => "processing",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(InboxStatus::Processing),
            "processed" => Some(InboxStatus::Processed),
            "failed" => Some(InboxStatus::Failed),
            _ => None,
        }
    }
}

/// True when the error is the backend's unique-violation, either by
/// SQLSTATE or by message content. The message match keeps the rule
/// portable across backends.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return true;
        }
    }
    is_unique_violation_message(&err.to_string())
}

/// Message-content half of the duplicate rule, case-insensitive.
pub fn is_unique_violation_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("duplicate key") || lower.contains("unique constraint")
}

/// Outbox/inbox persistence operations.
///
/// Constructed once at bootstrap and threaded through as
/// `Arc<dyn EventStore>`; no module-level state.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert an outbox row with status `processing`. `Ok(false)` when a
    /// row with this `message_id` already exists.
    async fn insert_outbox(
        &self,
        producer_id: &str,
        event_type: &str,
        body: &str,
        message_id: &str,
    ) -> Result<bool, StoreError>;

    /// Advisory: set the outbox row `published` with `published_at = now()`.
    async fn mark_outbox_published(&self, message_id: &str) -> bool;

    /// Advisory: set the outbox row `failed`.
    async fn mark_outbox_failed(&self, message_id: &str) -> bool;

    /// Insert an inbox row with status `processing`. `Ok(false)` when a
    /// row for `(message_id, consumer_id)` already exists.
    async fn insert_inbox(
        &self,
        consumer_id: &str,
        producer_id: &str,
        event_type: &str,
        body: &str,
        message_id: &str,
    ) -> Result<bool, StoreError>;

    /// Any inbox row exists for `(message_id, consumer_id)`. Fail-open.
    async fn exists_in_inbox(&self, message_id: &str, consumer_id: &str) -> bool;

    /// An inbox row exists AND its status is `processed`. Fail-open.
    /// Distinct from [`EventStore::exists_in_inbox`]: a retried delivery
    /// whose prior attempt failed must be reprocessed.
    async fn exists_in_inbox_and_processed(&self, message_id: &str, consumer_id: &str) -> bool;

    /// Advisory: set the inbox row `processed` with `processed_at = now()`.
    async fn mark_inbox_processed(&self, message_id: &str, consumer_id: &str) -> bool;

    /// Advisory: set the inbox row `failed`, recording the error.
    async fn mark_inbox_failed(
        &self,
        message_id: &str,
        consumer_id: &str,
        error: Option<&str>,
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            OutboxStatus::Processing,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            InboxStatus::Processing,
            InboxStatus::Processed,
            InboxStatus::Failed,
        ] {
            assert_eq!(InboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("bogus"), None);
    }

    #[test]
    fn test_unique_violation_message_matching() {
        assert!(is_unique_violation_message(
            "ERROR: duplicate key value violates unique constraint \"outbox_pkey\""
        ));
        assert!(is_unique_violation_message("UNIQUE constraint failed: inbox"));
        assert!(is_unique_violation_message("Duplicate Key detected"));
        assert!(!is_unique_violation_message("connection reset by peer"));
        assert!(!is_unique_violation_message("relation \"outbox\" does not exist"));
    }
}
