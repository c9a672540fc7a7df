//! # PgQueue
//!
//! A durable message queue implemented on top of a PostgreSQL table.
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{instrument, warn};

use crate::error::{DispatchError, QueueError};
use crate::queue::{
    MessageQueue, MessageStatus, QueueConsumer, QueueMessage, ReceivedMessage, Release,
    MAX_DELIVERY_ATTEMPTS,
};
use crate::sinks::Attributes;

pub type PgQueueResult<T> = std::result::Result<T, QueueError>;

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    attempt: i32,
    max_attempts: i32,
    body: String,
    attributes: Json<Attributes>,
}

impl From<MessageRow> for ReceivedMessage {
    fn from(row: MessageRow) -> Self {
        ReceivedMessage {
            id: row.id,
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            message: QueueMessage {
                body: row.body,
                attributes: row.attributes.0,
            },
        }
    }
}

fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> QueueError {
    move |error| QueueError::Query {
        command,
        message: error.to_string(),
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// A queue implemented on top of a PostgreSQL table. Several named queues share the table.
#[derive(Clone)]
pub struct PgQueue {
    name: String,
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PgQueue {
    pub async fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        visibility_timeout: Duration,
    ) -> PgQueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| QueueError::Connection(error.to_string()))?;

        Ok(Self::new_from_pool(queue_name, pool, visibility_timeout))
    }

    pub fn new_from_pool(queue_name: &str, pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
            visibility_timeout,
        }
    }

    async fn finish(
        &self,
        message: &ReceivedMessage,
        status: MessageStatus,
        error: Option<&str>,
    ) -> PgQueueResult<()> {
        let base_query = r#"
UPDATE queue_messages
SET
    status = $2,
    finished_at = NOW(),
    last_error = COALESCE($3, last_error)
WHERE
    id = $1
    AND status = 'running'::message_status
RETURNING id
        "#;

        let updated: Option<i64> = sqlx::query_scalar(base_query)
            .bind(message.id)
            .bind(status)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("UPDATE"))?;

        updated.map(|_| ()).ok_or(QueueError::NotRunning(message.id))
    }
}

#[async_trait]
impl MessageQueue for PgQueue {
    #[instrument(skip_all, fields(queue = %self.name))]
    async fn enqueue(&self, message: QueueMessage) -> Result<(), DispatchError> {
        let base_query = r#"
INSERT INTO queue_messages
    (queue, body, attributes, status, attempt, max_attempts, created_at, scheduled_at)
VALUES
    ($1, $2, $3, 'available'::message_status, 0, $4, NOW(), NOW())
        "#;

        sqlx::query(base_query)
            .bind(&self.name)
            .bind(&message.body)
            .bind(Json(&message.attributes))
            .bind(MAX_DELIVERY_ATTEMPTS as i32)
            .execute(&self.pool)
            .await
            .map_err(|error| DispatchError::Queue(error.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for PgQueue {
    /// The dequeue query uses a FOR UPDATE SKIP LOCKED clause, so concurrent workers never
    /// receive the same message while it is visible to them.
    #[instrument(skip_all, fields(queue = %self.name, worker = worker))]
    async fn receive(&self, worker: &str, limit: u32) -> PgQueueResult<Vec<ReceivedMessage>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::Connection(error.to_string()))?;

        let expire_query = r#"
UPDATE queue_messages
SET
    status = 'dead_lettered'::message_status,
    finished_at = NOW(),
    last_error = 'visibility timeout expired on last attempt'
WHERE
    queue = $1
    AND status = 'running'::message_status
    AND attempted_at < NOW() - $2::float8 * INTERVAL '1 millisecond'
    AND attempt >= max_attempts
        "#;

        let expired = sqlx::query(expire_query)
            .bind(&self.name)
            .bind(millis(self.visibility_timeout))
            .execute(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;
        if expired.rows_affected() > 0 {
            warn!(
                count = expired.rows_affected(),
                "dead-lettered messages whose last attempt timed out"
            );
        }

        let dequeue_query = r#"
WITH visible AS (
    SELECT
        id
    FROM
        queue_messages
    WHERE
        queue = $1
        AND (
            (status = 'available'::message_status AND scheduled_at <= NOW())
            OR (
                status = 'running'::message_status
                AND attempted_at < NOW() - $3::float8 * INTERVAL '1 millisecond'
            )
        )
    ORDER BY
        id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    queue_messages
SET
    status = 'running'::message_status,
    attempted_at = NOW(),
    attempt = queue_messages.attempt + 1,
    attempted_by = array_append(queue_messages.attempted_by, $4::text)
FROM
    visible
WHERE
    queue_messages.id = visible.id
RETURNING
    queue_messages.id,
    queue_messages.attempt,
    queue_messages.max_attempts,
    queue_messages.body,
    queue_messages.attributes
        "#;

        let rows: Vec<MessageRow> = sqlx::query_as(dequeue_query)
            .bind(&self.name)
            .bind(i64::from(limit))
            .bind(millis(self.visibility_timeout))
            .bind(worker)
            .fetch_all(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;

        tx.commit()
            .await
            .map_err(|error| QueueError::Connection(error.to_string()))?;

        Ok(rows.into_iter().map(ReceivedMessage::from).collect())
    }

    async fn complete(&self, message: &ReceivedMessage) -> PgQueueResult<()> {
        self.finish(message, MessageStatus::Completed, None).await
    }

    async fn release(
        &self,
        message: &ReceivedMessage,
        error: &str,
        retry_in: Duration,
    ) -> PgQueueResult<Release> {
        let base_query = r#"
UPDATE queue_messages
SET
    status = CASE
        WHEN attempt >= max_attempts THEN 'dead_lettered'::message_status
        ELSE 'available'::message_status
    END,
    finished_at = CASE WHEN attempt >= max_attempts THEN NOW() ELSE NULL END,
    scheduled_at = NOW() + $2::float8 * INTERVAL '1 millisecond',
    last_error = $3
WHERE
    id = $1
    AND status = 'running'::message_status
RETURNING status
        "#;

        let status: Option<MessageStatus> = sqlx::query_scalar(base_query)
            .bind(message.id)
            .bind(millis(retry_in))
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("UPDATE"))?;

        match status {
            Some(MessageStatus::DeadLettered) => Ok(Release::DeadLettered),
            Some(_) => Ok(Release::Retried { retry_in }),
            None => Err(QueueError::NotRunning(message.id)),
        }
    }

    async fn dead_letter(&self, message: &ReceivedMessage, error: &str) -> PgQueueResult<()> {
        self.finish(message, MessageStatus::DeadLettered, Some(error))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> QueueMessage {
        QueueMessage {
            body: body.to_owned(),
            attributes: Attributes::from([("eventClass".to_owned(), "event".into())]),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_can_enqueue_and_receive_message(db: PgPool) {
        let queue = PgQueue::new_from_pool("inbound", db, Duration::from_secs(30));
        queue.enqueue(message("{}")).await.unwrap();

        let received = queue.receive("worker-1", 10).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].attempt, 1);
        assert_eq!(received[0].max_attempts, MAX_DELIVERY_ATTEMPTS);
        assert_eq!(received[0].message, message("{}"));

        assert!(queue.receive("worker-2", 10).await.unwrap().is_empty());
        queue.complete(&received[0]).await.unwrap();
        assert!(matches!(
            queue.complete(&received[0]).await,
            Err(QueueError::NotRunning(_))
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_release_dead_letters_on_last_attempt(db: PgPool) {
        let queue = PgQueue::new_from_pool("inbound", db, Duration::from_secs(30));
        queue.enqueue(message("{}")).await.unwrap();

        for _ in 1..MAX_DELIVERY_ATTEMPTS {
            let received = queue.receive("worker", 1).await.unwrap().remove(0);
            let release = queue
                .release(&received, "timeout", Duration::ZERO)
                .await
                .unwrap();
            assert!(matches!(release, Release::Retried { .. }));
        }

        let last = queue.receive("worker", 1).await.unwrap().remove(0);
        let release = queue.release(&last, "timeout", Duration::ZERO).await.unwrap();
        assert_eq!(release, Release::DeadLettered);
        assert!(queue.receive("worker", 1).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_queues_are_isolated_by_name(db: PgPool) {
        let outbound = PgQueue::new_from_pool("outbound", db.clone(), Duration::from_secs(30));
        let inbound = PgQueue::new_from_pool("inbound", db, Duration::from_secs(30));
        outbound.enqueue(message("{}")).await.unwrap();

        assert!(inbound.receive("worker", 1).await.unwrap().is_empty());
        assert_eq!(outbound.receive("worker", 1).await.unwrap().len(), 1);
    }
}
