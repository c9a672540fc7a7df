//! Chunked batch engine.
//!
//! Items are processed sequentially, in chunks, with a fixed pause between chunks. An item
//! failure is recorded with its index and never aborts the batch.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::envelope::{BatchBody, BatchOperation, Envelope, EventClass};
use crate::error::ItemError;
use crate::store::{DurableStore, Record, RecordKey, TtlPolicy};
use crate::time::{rfc3339, TimeSource};

pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_PACING: time::Duration = time::Duration::from_millis(100);

/// Table holding one record per processed batch item.
pub const BATCH_ITEMS_TABLE: &str = "batch_items";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub item_id: String,
    pub index: usize,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub processed_count: usize,
    pub error_count: usize,
    pub total_count: usize,
    pub success_rate: f64,
    pub results: Vec<ItemResult>,
    pub errors: Vec<ItemResult>,
}

/// Handles one item of a batch. The value returned is the item's `result`.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(
        &self,
        job: &Envelope<BatchBody>,
        item_id: &str,
        index: usize,
        item: &Value,
    ) -> Result<Value, ItemError>;
}

/// `item.id`, then `item.itemId`, then `{batchId}-{index}`.
pub fn item_id(batch_id: &str, index: usize, item: &Value) -> String {
    ["id", "itemId"]
        .iter()
        .find_map(|field| match item.get(*field) {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("{batch_id}-{index}"))
}

#[derive(Clone)]
pub struct BatchEngine {
    chunk_size: usize,
    pacing: time::Duration,
    handler: Arc<dyn ItemHandler>,
    time: Arc<dyn TimeSource>,
}

impl BatchEngine {
    pub fn new(handler: Arc<dyn ItemHandler>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pacing: DEFAULT_PACING,
            handler,
            time,
        }
    }

    pub fn with_chunking(mut self, chunk_size: usize, pacing: time::Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.pacing = pacing;
        self
    }

    #[instrument(skip_all, fields(batch_id = %job.body.batch_id, operation = %job.body.operation))]
    pub async fn run(&self, job: &Envelope<BatchBody>) -> BatchReport {
        let items = &job.body.items;
        let mut results = Vec::new();
        let mut errors = Vec::new();

        for (chunk_index, chunk) in items.chunks(self.chunk_size).enumerate() {
            if chunk_index > 0 {
                tokio::time::sleep(self.pacing).await;
            }
            debug!(chunk = chunk_index, size = chunk.len(), "processing chunk");

            for (offset, item) in chunk.iter().enumerate() {
                let index = chunk_index * self.chunk_size + offset;
                let item_id = item_id(&job.body.batch_id, index, item);

                match self.handler.handle(job, &item_id, index, item).await {
                    Ok(result) => results.push(ItemResult {
                        item_id,
                        index,
                        status: ItemStatus::Processed,
                        result: Some(result),
                        error: None,
                        timestamp: self.time.current_time(),
                    }),
                    Err(error) => {
                        debug!(index, "batch item failed: {}", error);
                        errors.push(ItemResult {
                            item_id,
                            index,
                            status: ItemStatus::Failed,
                            result: None,
                            error: Some(error.message),
                            timestamp: self.time.current_time(),
                        })
                    }
                }
            }
        }

        let operation = job.body.operation.as_str();
        counter!("ingest_batch_items_total", "operation" => operation, "outcome" => "processed")
            .increment(results.len() as u64);
        counter!("ingest_batch_items_total", "operation" => operation, "outcome" => "failed")
            .increment(errors.len() as u64);

        let total_count = items.len();
        BatchReport {
            processed_count: results.len(),
            error_count: errors.len(),
            total_count,
            success_rate: if total_count == 0 {
                0.0
            } else {
                results.len() as f64 / total_count as f64
            },
            results,
            errors,
        }
    }
}

/// Default handler: computes an operation-specific outcome and writes one `batch_items`
/// record per item.
pub struct StoreItemHandler {
    store: Arc<dyn DurableStore>,
    time: Arc<dyn TimeSource>,
    io_timeout: time::Duration,
}

impl StoreItemHandler {
    pub fn new(
        store: Arc<dyn DurableStore>,
        time: Arc<dyn TimeSource>,
        io_timeout: time::Duration,
    ) -> Self {
        Self {
            store,
            time,
            io_timeout,
        }
    }
}

fn outcome(
    operation: BatchOperation,
    index: usize,
    item: &Map<String, Value>,
) -> Result<Value, ItemError> {
    let size = || serde_json::to_vec(item).map(|bytes| bytes.len()).unwrap_or(0);

    let outcome = match operation {
        BatchOperation::DataExport => json!({"exportedBytes": size()}),
        BatchOperation::DataImport => json!({"importedFields": item.len()}),
        BatchOperation::DataCleanup => {
            let removed: Vec<&String> = item
                .iter()
                .filter(|(_, value)| value.is_null())
                .map(|(key, _)| key)
                .collect();
            json!({"removedKeys": removed})
        }
        BatchOperation::ReportGeneration => {
            let totals: Map<String, Value> = item
                .iter()
                .filter_map(|(key, value)| value.as_f64().map(|n| (key.clone(), json!(n))))
                .collect();
            let total: f64 = totals.values().filter_map(Value::as_f64).sum();
            json!({"totals": totals, "total": total})
        }
        BatchOperation::NotificationSend => match item.get("recipient").and_then(Value::as_str) {
            Some(recipient) if !recipient.is_empty() => json!({"recipient": recipient}),
            _ => return Err(ItemError::new(index, "missing recipient")),
        },
        BatchOperation::BackupCreation => json!({"backupBytes": size()}),
    };

    Ok(outcome)
}

#[async_trait]
impl ItemHandler for StoreItemHandler {
    async fn handle(
        &self,
        job: &Envelope<BatchBody>,
        item_id: &str,
        index: usize,
        item: &Value,
    ) -> Result<Value, ItemError> {
        let object = item
            .as_object()
            .ok_or_else(|| ItemError::new(index, "item must be a JSON object"))?;
        let outcome = outcome(job.body.operation, index, object)?;

        let now = self.time.now();
        let record = Record::new(
            BATCH_ITEMS_TABLE,
            RecordKey::composite(job.body.batch_id.as_str(), item_id),
            json!({
                "batchId": job.body.batch_id,
                "itemId": item_id,
                "index": index,
                "operation": job.body.operation,
                "correlationId": job.correlation_id,
                "processor": EventClass::Batch.unit_name(),
                "outcome": outcome,
                "processedAt": rfc3339(now),
            }),
            TtlPolicy::BATCH_JOBS,
            now,
        );

        match tokio::time::timeout(self.io_timeout, self.store.put(record)).await {
            Ok(Ok(())) => Ok(outcome),
            Ok(Err(error)) => Err(ItemError::new(index, error.to_string())),
            Err(_) => Err(ItemError::new(
                index,
                format!("store write timed out after {:?}", self.io_timeout),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::time::SystemTime;

    struct FailAt(usize);

    #[async_trait]
    impl ItemHandler for FailAt {
        async fn handle(
            &self,
            _job: &Envelope<BatchBody>,
            _item_id: &str,
            index: usize,
            item: &Value,
        ) -> Result<Value, ItemError> {
            if index == self.0 {
                return Err(ItemError::new(index, "boom"));
            }
            Ok(item.clone())
        }
    }

    fn job(operation: BatchOperation, items: Vec<Value>) -> Envelope<BatchBody> {
        Envelope {
            id: "evt-1".to_owned(),
            timestamp: "2024-05-01T12:00:00Z".to_owned(),
            correlation_id: "corr-1".to_owned(),
            environment: "test".to_owned(),
            region: "eu-west-1".to_owned(),
            metadata: Map::new(),
            body: BatchBody {
                batch_id: "batch-1".to_owned(),
                operation,
                items,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn isolates_item_failures() {
        let items = (0..25).map(|i| json!({"n": i})).collect();
        let engine = BatchEngine::new(Arc::new(FailAt(12)), Arc::new(SystemTime {}));

        let started = tokio::time::Instant::now();
        let report = engine.run(&job(BatchOperation::DataExport, items)).await;

        assert_eq!(report.total_count, 25);
        assert_eq!(report.processed_count, 24);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.processed_count + report.error_count, report.total_count);
        assert!((report.success_rate - 0.96).abs() < f64::EPSILON);
        assert_eq!(report.errors[0].index, 12);
        assert_eq!(report.errors[0].item_id, "batch-1-12");
        assert_eq!(report.errors[0].error.as_deref(), Some("boom"));

        // Three chunks, pacing between them only.
        let elapsed = started.elapsed();
        assert!(elapsed >= DEFAULT_PACING * 2, "{elapsed:?}");
        assert!(elapsed < DEFAULT_PACING * 3, "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn single_chunk_does_not_sleep() {
        let items = (0..10).map(|i| json!({"n": i})).collect();
        let engine = BatchEngine::new(Arc::new(FailAt(usize::MAX)), Arc::new(SystemTime {}));

        let started = tokio::time::Instant::now();
        let report = engine.run(&job(BatchOperation::DataImport, items)).await;

        assert_eq!(report.processed_count, 10);
        assert!(started.elapsed() < DEFAULT_PACING);
    }

    #[test]
    fn item_ids_prefer_item_identifiers() {
        assert_eq!(item_id("b", 0, &json!({"id": "x"})), "x");
        assert_eq!(item_id("b", 0, &json!({"itemId": 7})), "7");
        assert_eq!(item_id("b", 3, &json!({"id": ""})), "b-3");
        assert_eq!(item_id("b", 4, &json!("scalar")), "b-4");
    }

    #[tokio::test]
    async fn store_handler_writes_item_records() {
        let store = MemoryStore::new();
        let handler = StoreItemHandler::new(
            Arc::new(store.clone()),
            Arc::new(SystemTime {}),
            time::Duration::from_secs(1),
        );
        let engine = BatchEngine::new(Arc::new(handler), Arc::new(SystemTime {}))
            .with_chunking(10, time::Duration::ZERO);

        let report = engine
            .run(&job(
                BatchOperation::ReportGeneration,
                vec![
                    json!({"id": "a", "clicks": 3, "views": 7}),
                    json!("not an object"),
                ],
            ))
            .await;

        assert_eq!(report.processed_count, 1);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.results[0].result.as_ref().unwrap()["total"], json!(10.0));

        let items = store.items(BATCH_ITEMS_TABLE);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["itemId"], "a");
        assert_eq!(items[0]["correlationId"], "corr-1");
    }

    #[test]
    fn notification_items_need_a_recipient() {
        let item = json!({"recipient": "ops@example.com"});
        assert_eq!(
            outcome(BatchOperation::NotificationSend, 0, item.as_object().unwrap()),
            Ok(json!({"recipient": "ops@example.com"}))
        );

        let item = json!({"subject": "hi"});
        assert_eq!(
            outcome(BatchOperation::NotificationSend, 1, item.as_object().unwrap()),
            Err(ItemError::new(1, "missing recipient"))
        );
    }

    #[test]
    fn cleanup_reports_null_keys() {
        let item = json!({"a": null, "b": 1});
        assert_eq!(
            outcome(BatchOperation::DataCleanup, 0, item.as_object().unwrap()),
            Ok(json!({"removedKeys": ["a"]}))
        );
    }
}
