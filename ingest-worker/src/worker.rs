use std::sync::Arc;
use std::time;

use tokio::sync;
use tracing::{debug, error, info, instrument, warn};

use ingest_common::envelope::{EventClass, InvocationContext};
use ingest_common::pipeline::Pipelines;
use ingest_common::prometheus::report_worker_message;
use ingest_common::queue::{
    QueueConsumer, ReceivedMessage, Release, CORRELATION_ID_ATTRIBUTE, EVENT_CLASS_ATTRIBUTE,
};
use ingest_common::retry::RetryPolicy;

use crate::error::WorkerError;

/// What happened to a message after one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retried,
    DeadLettered,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Retried => "retried",
            Outcome::DeadLettered => "dead_lettered",
        }
    }
}

/// A worker to poll the inbound queue and run every message through the pipeline of its class.
pub struct IngestWorker {
    /// An identifier for this worker. Used to mark messages we have received.
    name: String,
    /// Name of the queue we consume, used as a metric label.
    queue_name: String,
    queue: Arc<dyn QueueConsumer>,
    pipelines: Pipelines,
    /// The interval for polling the queue.
    poll_interval: time::Duration,
    /// Maximum number of messages being processed at once.
    max_concurrent_jobs: usize,
    /// Backoff between redeliveries of messages that failed on a dependency.
    retry_policy: RetryPolicy,
}

impl IngestWorker {
    pub fn new(
        name: &str,
        queue_name: &str,
        queue: Arc<dyn QueueConsumer>,
        pipelines: Pipelines,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue_name: queue_name.to_owned(),
            queue,
            pipelines,
            poll_interval,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            retry_policy,
        }
    }

    /// Run this worker to continuously process any messages that become visible.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let mut interval = tokio::time::interval(self.poll_interval);
        info!(queue = %self.queue_name, "worker started");

        loop {
            interval.tick().await;
            metrics::gauge!("ingest_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64,
            );

            let available = semaphore.available_permits();
            if available == 0 {
                continue;
            }

            let messages = self.queue.receive(&self.name, available as u32).await?;
            for message in messages {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                };

                let queue = self.queue.clone();
                let pipelines = self.pipelines.clone();
                let queue_name = self.queue_name.clone();
                let retry_policy = self.retry_policy;

                tokio::spawn(async move {
                    let result =
                        process_message(queue.as_ref(), &pipelines, &retry_policy, &message).await;
                    drop(permit);
                    match result {
                        Ok(outcome) => report_worker_message(&queue_name, outcome.as_str()),
                        Err(error) => {
                            error!("failed to process message: {}", error);
                            report_worker_message(&queue_name, "error");
                        }
                    }
                });
            }
        }
    }
}

/// Run one message through its pipeline and settle it on the queue.
///
/// * Success completes the message.
/// * Validation failures, and messages without a valid `eventClass` attribute, are
///   dead-lettered at once: redelivering them would fail the same way.
/// * Dependency failures release the message for a later attempt, until the attempt budget is
///   spent and the queue dead-letters it.
#[instrument(skip_all, fields(message_id = message.id, attempt = message.attempt))]
pub async fn process_message(
    queue: &dyn QueueConsumer,
    pipelines: &Pipelines,
    retry_policy: &RetryPolicy,
    message: &ReceivedMessage,
) -> Result<Outcome, WorkerError> {
    let queue_error = |error| WorkerError::MessageError {
        id: message.id,
        error,
    };

    let class = match message
        .message
        .attribute(EVENT_CLASS_ATTRIBUTE)
        .and_then(|class| class.parse::<EventClass>().ok())
    {
        Some(class) => class,
        None => {
            warn!("message has no valid {} attribute", EVENT_CLASS_ATTRIBUTE);
            queue
                .dead_letter(message, "missing or invalid eventClass attribute")
                .await
                .map_err(queue_error)?;
            return Ok(Outcome::DeadLettered);
        }
    };

    let ctx = InvocationContext::new(
        Some(message.id.to_string()),
        message
            .message
            .attribute(CORRELATION_ID_ATTRIBUTE)
            .map(String::from),
    );
    let response = pipelines
        .run_bytes(class, message.message.body.as_bytes(), ctx)
        .await;

    if response.success {
        queue.complete(message).await.map_err(queue_error)?;
        return Ok(Outcome::Completed);
    }

    let error = response.error.as_deref().unwrap_or("unknown error");
    if !response.retryable {
        debug!("dead-lettering message that cannot succeed: {}", error);
        queue.dead_letter(message, error).await.map_err(queue_error)?;
        return Ok(Outcome::DeadLettered);
    }

    let retry_in = retry_policy.retry_interval(message.attempt);
    match queue
        .release(message, error, retry_in)
        .await
        .map_err(queue_error)?
    {
        Release::Retried { .. } => Ok(Outcome::Retried),
        Release::DeadLettered => Ok(Outcome::DeadLettered),
    }
}
