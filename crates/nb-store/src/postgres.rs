//! PostgreSQL Event Store Implementation
//!
//! Stores outbox/inbox rows in a configurable schema (default `public`).
//! Uniqueness is enforced by the table constraints; duplicate inserts
//! surface as `Ok(false)` through the error classification in the crate
//! root.

use async_trait::async_trait;
use nb_config::StoreConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use crate::{is_unique_violation, EventStore, InboxStatus, OutboxStatus, StoreError};

/// PostgreSQL implementation of [`EventStore`].
pub struct PostgresEventStore {
    pool: PgPool,
    schema: String,
}

impl PostgresEventStore {
    /// Build a store over a lazily-connecting pool. No round-trip is made
    /// until the first query. Incomplete configuration fails here with
    /// every absent option named, not with a connection error later.
    pub fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&config.url())?;
        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }

    /// Wrap an existing pool (shared with application code).
    pub fn with_pool(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn outbox_table(&self) -> String {
        format!("{}.outbox", self.schema)
    }

    fn inbox_table(&self) -> String {
        format!("{}.inbox", self.schema)
    }

    /// Create the outbox/inbox tables if absent.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let outbox_schema = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                message_id TEXT PRIMARY KEY,
                producer_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'processing',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                published_at TIMESTAMPTZ,
                error TEXT
            );
            "#,
            self.outbox_table(),
        );
        sqlx::query(&outbox_schema).execute(&self.pool).await?;

        let inbox_schema = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                message_id TEXT NOT NULL,
                consumer_id TEXT NOT NULL,
                producer_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'processing',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                processed_at TIMESTAMPTZ,
                error TEXT,
                PRIMARY KEY (message_id, consumer_id)
            );
            "#,
            self.inbox_table(),
        );
        sqlx::query(&inbox_schema).execute(&self.pool).await?;

        info!(schema = %self.schema, "Initialized event store schema");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn insert_outbox(
        &self,
        producer_id: &str,
        event_type: &str,
        body: &str,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let query = format!(
            "INSERT INTO {} (message_id, producer_id, event_type, body, status) \
             VALUES ($1, $2, $3, $4, $5)",
            self.outbox_table(),
        );

        let result = sqlx::query(&query)
            .bind(message_id)
            .bind(producer_id)
            .bind(event_type)
            .bind(body)
            .bind(OutboxStatus::Processing.as_str())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                debug!(message_id = %message_id, event_type = %event_type, "Inserted outbox row");
                Ok(true)
            }
            Err(e) if is_unique_violation(&e) => {
                debug!(message_id = %message_id, "Outbox row already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_outbox_published(&self, message_id: &str) -> bool {
        let query = format!(
            "UPDATE {} SET status = $1, published_at = now() \
             WHERE message_id = $2 AND status = $3",
            self.outbox_table(),
        );

        match sqlx::query(&query)
            .bind(OutboxStatus::Published.as_str())
            .bind(message_id)
            .bind(OutboxStatus::Processing.as_str())
            .execute(&self.pool)
            .await
        {
            Ok(result) => result.rows_affected() > 0,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Failed to mark outbox row published");
                false
            }
        }
    }

    async fn mark_outbox_failed(&self, message_id: &str) -> bool {
        let query = format!(
            "UPDATE {} SET status = $1 WHERE message_id = $2 AND status = $3",
            self.outbox_table(),
        );

        match sqlx::query(&query)
            .bind(OutboxStatus::Failed.as_str())
            .bind(message_id)
            .bind(OutboxStatus::Processing.as_str())
            .execute(&self.pool)
            .await
        {
            Ok(result) => result.rows_affected() > 0,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Failed to mark outbox row failed");
                false
            }
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
        let query = format!(
            "INSERT INTO {} (message_id, consumer_id, producer_id, event_type, body, status) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.inbox_table(),
        );

        let result = sqlx::query(&query)
            .bind(message_id)
            .bind(consumer_id)
            .bind(producer_id)
            .bind(event_type)
            .bind(body)
            .bind(InboxStatus::Processing.as_str())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                debug!(
                    message_id = %message_id,
                    consumer_id = %consumer_id,
                    "Inserted inbox row"
                );
                Ok(true)
            }
            Err(e) if is_unique_violation(&e) => {
                debug!(
                    message_id = %message_id,
                    consumer_id = %consumer_id,
                    "Inbox row already exists"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists_in_inbox(&self, message_id: &str, consumer_id: &str) -> bool {
        let query = format!(
            "SELECT 1 FROM {} WHERE message_id = $1 AND consumer_id = $2 LIMIT 1",
            self.inbox_table(),
        );

        match sqlx::query(&query)
            .bind(message_id)
            .bind(consumer_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row.is_some(),
            Err(e) => {
                // Fail open: a broken inbox must not block traffic.
                warn!(message_id = %message_id, error = %e, "Inbox existence check failed");
                false
            }
        }
    }

    async fn exists_in_inbox_and_processed(&self, message_id: &str, consumer_id: &str) -> bool {
        let query = format!(
            "SELECT status FROM {} WHERE message_id = $1 AND consumer_id = $2 LIMIT 1",
            self.inbox_table(),
        );

        match sqlx::query(&query)
            .bind(message_id)
            .bind(consumer_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(row)) => {
                let status: String = row.get("status");
                status == InboxStatus::Processed.as_str()
            }
            Ok(None) => false,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Inbox processed check failed");
                false
            }
        }
    }

    async fn mark_inbox_processed(&self, message_id: &str, consumer_id: &str) -> bool {
        let query = format!(
            "UPDATE {} SET status = $1, processed_at = now(), error = NULL \
             WHERE message_id = $2 AND consumer_id = $3",
            self.inbox_table(),
        );

        match sqlx::query(&query)
            .bind(InboxStatus::Processed.as_str())
            .bind(message_id)
            .bind(consumer_id)
            .execute(&self.pool)
            .await
        {
            Ok(result) => result.rows_affected() > 0,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Failed to mark inbox row processed");
                false
            }
        }
    }

    async fn mark_inbox_failed(
        &self,
        message_id: &str,
        consumer_id: &str,
        error: Option<&str>,
    ) -> bool {
        // A processed row never regresses to failed.
        let query = format!(
            "UPDATE {} SET status = $1, error = $2 \
             WHERE message_id = $3 AND consumer_id = $4 AND status <> $5",
            self.inbox_table(),
        );

        match sqlx::query(&query)
            .bind(InboxStatus::Failed.as_str())
            .bind(error)
            .bind(message_id)
            .bind(consumer_id)
            .bind(InboxStatus::Processed.as_str())
            .execute(&self.pool)
            .await
        {
            Ok(result) => result.rows_affected() > 0,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Failed to mark inbox row failed");
                false
            }
        }
    }
}
