//! Point-to-point durable queue.
//!
//! Producers enqueue the full envelope plus typed attributes. Consumers receive a message,
//! which hides it for the visibility timeout, and then complete, release or dead-letter it.
//! A message that was received `max_attempts` times without completing is dead-lettered.
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{DispatchError, QueueError};
use crate::sinks::{AttributeValue, Attributes};

/// Deliveries before a message is dead-lettered, for every event class.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Attribute naming the event class of the envelope in the body.
pub const EVENT_CLASS_ATTRIBUTE: &str = "eventClass";
pub const CORRELATION_ID_ATTRIBUTE: &str = "correlationId";

/// Enumeration of possible statuses for a queue message.
/// Available: waiting to be received, possibly not before its scheduled time.
/// Running: received by a worker and hidden until the visibility timeout elapses.
/// Completed: processed successfully.
/// DeadLettered: gave up after a non-retryable error or after too many attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "message_status")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageStatus {
    Available,
    Running,
    Completed,
    DeadLettered,
}

impl FromStr for MessageStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(MessageStatus::Available),
            "running" => Ok(MessageStatus::Running),
            "completed" => Ok(MessageStatus::Completed),
            "dead_lettered" => Ok(MessageStatus::DeadLettered),
            invalid => Err(QueueError::ParseMessageStatus(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub body: String,
    pub attributes: Attributes,
}

impl QueueMessage {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(AttributeValue::as_str)
    }
}

/// A message handed to a consumer. `attempt` counts this delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: i64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub message: QueueMessage,
}

impl ReceivedMessage {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Outcome of releasing a failed message back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Retried { retry_in: Duration },
    DeadLettered,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), DispatchError>;
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Receive up to `limit` visible messages, marking them running for `worker`.
    async fn receive(&self, worker: &str, limit: u32) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Make the message visible again after `retry_in`, or dead-letter it when this was the
    /// last attempt.
    async fn release(
        &self,
        message: &ReceivedMessage,
        error: &str,
        retry_in: Duration,
    ) -> Result<Release, QueueError>;

    async fn dead_letter(&self, message: &ReceivedMessage, error: &str) -> Result<(), QueueError>;
}

struct Entry {
    id: i64,
    message: QueueMessage,
    status: MessageStatus,
    attempt: u32,
    scheduled_at: Instant,
    attempted_at: Option<Instant>,
    last_error: Option<String>,
}

#[derive(Default)]
struct Entries {
    next_id: i64,
    entries: VecDeque<Entry>,
}

/// In-process queue with the same visibility and attempt semantics as `PgQueue`.
#[derive(Clone)]
pub struct MemoryQueue {
    entries: Arc<Mutex<Entries>>,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            visibility_timeout,
            max_attempts: MAX_DELIVERY_ATTEMPTS,
        }
    }

    /// Every message ever enqueued, in order.
    pub fn messages(&self) -> Vec<QueueMessage> {
        self.lock()
            .entries
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }

    pub fn with_status(&self, status: MessageStatus) -> Vec<QueueMessage> {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.message.clone())
            .collect()
    }

    pub fn last_error(&self, id: i64) -> Option<String> {
        self.lock()
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .and_then(|entry| entry.last_error.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().expect("poisoned MemoryQueue mutex")
    }

    fn finish(
        &self,
        id: i64,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut entries = self.lock();
        let entry = entries
            .entries
            .iter_mut()
            .find(|entry| entry.id == id && entry.status == MessageStatus::Running)
            .ok_or(QueueError::NotRunning(id))?;
        entry.status = status;
        if let Some(error) = error {
            entry.last_error = Some(error.to_owned());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), DispatchError> {
        let mut entries = self.lock();
        entries.next_id += 1;
        let id = entries.next_id;
        entries.entries.push_back(Entry {
            id,
            message,
            status: MessageStatus::Available,
            attempt: 0,
            scheduled_at: Instant::now(),
            attempted_at: None,
            last_error: None,
        });
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn receive(&self, _worker: &str, limit: u32) -> Result<Vec<ReceivedMessage>, QueueError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let mut received = Vec::new();

        for entry in entries.entries.iter_mut() {
            if received.len() >= limit as usize {
                break;
            }

            let visible = match entry.status {
                MessageStatus::Available => entry.scheduled_at <= now,
                MessageStatus::Running => entry
                    .attempted_at
                    .is_some_and(|at| now.duration_since(at) >= self.visibility_timeout),
                _ => false,
            };
            if !visible {
                continue;
            }

            if entry.attempt >= self.max_attempts {
                entry.status = MessageStatus::DeadLettered;
                entry.last_error = Some("visibility timeout expired on last attempt".to_owned());
                continue;
            }

            entry.status = MessageStatus::Running;
            entry.attempt += 1;
            entry.attempted_at = Some(now);
            received.push(ReceivedMessage {
                id: entry.id,
                attempt: entry.attempt,
                max_attempts: self.max_attempts,
                message: entry.message.clone(),
            });
        }

        Ok(received)
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.finish(message.id, MessageStatus::Completed, None)
    }

    async fn release(
        &self,
        message: &ReceivedMessage,
        error: &str,
        retry_in: Duration,
    ) -> Result<Release, QueueError> {
        if message.is_last_attempt() {
            self.finish(message.id, MessageStatus::DeadLettered, Some(error))?;
            return Ok(Release::DeadLettered);
        }

        let mut entries = self.lock();
        let entry = entries
            .entries
            .iter_mut()
            .find(|entry| entry.id == message.id && entry.status == MessageStatus::Running)
            .ok_or(QueueError::NotRunning(message.id))?;
        entry.status = MessageStatus::Available;
        entry.scheduled_at = Instant::now() + retry_in;
        entry.last_error = Some(error.to_owned());
        Ok(Release::Retried { retry_in })
    }

    async fn dead_letter(&self, message: &ReceivedMessage, error: &str) -> Result<(), QueueError> {
        self.finish(message.id, MessageStatus::DeadLettered, Some(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> QueueMessage {
        QueueMessage {
            body: body.to_owned(),
            attributes: Attributes::from([(EVENT_CLASS_ATTRIBUTE.to_owned(), "event".into())]),
        }
    }

    #[tokio::test]
    async fn receive_hides_running_messages() {
        let queue = MemoryQueue::default();
        queue.enqueue(message("a")).await.unwrap();
        queue.enqueue(message("b")).await.unwrap();

        let first = queue.receive("worker", 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message.body, "a");
        assert_eq!(first[0].attempt, 1);
        assert_eq!(first[0].message.attribute(EVENT_CLASS_ATTRIBUTE), Some("event"));

        let second = queue.receive("worker", 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message.body, "b");

        queue.complete(&first[0]).await.unwrap();
        assert_eq!(queue.with_status(MessageStatus::Completed).len(), 1);
        assert!(queue.complete(&first[0]).await.is_err());
    }

    #[tokio::test]
    async fn release_dead_letters_after_max_attempts() {
        let queue = MemoryQueue::default();
        queue.enqueue(message("a")).await.unwrap();

        for attempt in 1..MAX_DELIVERY_ATTEMPTS {
            let received = queue.receive("worker", 1).await.unwrap().remove(0);
            assert_eq!(received.attempt, attempt);
            let release = queue
                .release(&received, "store unavailable", Duration::ZERO)
                .await
                .unwrap();
            assert_eq!(release, Release::Retried { retry_in: Duration::ZERO });
        }

        let last = queue.receive("worker", 1).await.unwrap().remove(0);
        assert!(last.is_last_attempt());
        let release = queue
            .release(&last, "store unavailable", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(release, Release::DeadLettered);
        assert_eq!(queue.with_status(MessageStatus::DeadLettered).len(), 1);
        assert_eq!(queue.last_error(last.id).as_deref(), Some("store unavailable"));
        assert!(queue.receive("worker", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn released_messages_wait_for_their_schedule() {
        let queue = MemoryQueue::default();
        queue.enqueue(message("a")).await.unwrap();

        let received = queue.receive("worker", 1).await.unwrap().remove(0);
        queue
            .release(&received, "timeout", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(queue.receive("worker", 1).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_visibility_redelivers() {
        let queue = MemoryQueue::new(Duration::from_secs(5));
        queue.enqueue(message("a")).await.unwrap();

        let first = queue.receive("worker", 1).await.unwrap().remove(0);
        assert!(queue.receive("worker", 1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let second = queue.receive("worker", 1).await.unwrap().remove(0);
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
    }

    #[test]
    fn message_status_from_str() {
        assert_eq!(
            "dead_lettered".parse::<MessageStatus>(),
            Ok(MessageStatus::DeadLettered)
        );
        assert!("failed".parse::<MessageStatus>().is_err());
    }
}
