use ingest_common::error::{QueueError, StoreError};
use thiserror::Error;

/// Errors that stop a worker loop or fail the bookkeeping of one message.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred while handling message {id}: {error}")]
    MessageError { id: i64, error: QueueError },
    #[error("failed to receive messages: {0}")]
    ReceiveError(#[from] QueueError),
    #[error("failed to expire records: {0}")]
    ExpiryError(#[from] StoreError),
}
