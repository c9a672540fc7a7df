use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::status::ProcessingStatus;
use crate::store::{DurableStore, Record, RecordKey, StatusUpdate, TTL_FIELD};

type TableKey = (String, RecordKey);

#[derive(Default)]
struct Tables {
    items: BTreeMap<TableKey, Value>,
    statuses: HashMap<TableKey, Vec<ProcessingStatus>>,
}

/// Process-local store, used in print mode and in tests.
///
/// Besides the items, it keeps every status a record went through, so tests can observe the
/// status sequence the way a stream reader of the table would.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    calls: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of put/update calls received, successful or not.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All items of one table, ordered by key.
    pub fn items(&self, table: &str) -> Vec<Value> {
        self.lock()
            .items
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, item)| item.clone())
            .collect()
    }

    pub fn status_history(&self, table: &str, key: &RecordKey) -> Vec<ProcessingStatus> {
        self.lock()
            .statuses
            .get(&(table.to_owned(), key.clone()))
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("poisoned MemoryStore mutex")
    }
}

fn status_of(item: &Value) -> Option<ProcessingStatus> {
    item.get("status")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = (record.table, record.key);
        let mut tables = self.lock();
        if let Some(status) = status_of(&record.item) {
            tables.statuses.entry(key.clone()).or_default().push(status);
        }
        tables.items.insert(key, record.item);
        Ok(())
    }

    async fn update_status(
        &self,
        table: &str,
        key: &RecordKey,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let table_key = (table.to_owned(), key.clone());
        let mut tables = self.lock();

        let condition_failed = || StoreError::ConditionFailed {
            table: table.to_owned(),
            key: key.to_string(),
            expected: update.transition.source(),
        };

        let item = tables
            .items
            .get_mut(&table_key)
            .ok_or_else(condition_failed)?;
        if status_of(item) != Some(update.transition.source()) {
            return Err(condition_failed());
        }

        let object = item.as_object_mut().ok_or_else(condition_failed)?;
        object.insert(
            "status".to_owned(),
            Value::from(update.transition.target().as_str()),
        );
        object.insert("lastUpdate".to_owned(), Value::from(update.updated_at));
        if let Some(result) = update.result {
            object.insert("result".to_owned(), result);
        }

        tables
            .statuses
            .entry(table_key)
            .or_default()
            .push(update.transition.target());
        Ok(())
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, StoreError> {
        Ok(self
            .lock()
            .items
            .get(&(table.to_owned(), key.clone()))
            .cloned())
    }

    async fn expire(&self, now_epoch_seconds: i64) -> Result<u64, StoreError> {
        let mut tables = self.lock();
        let before = tables.items.len();
        tables.items.retain(|_, item| {
            item.get(TTL_FIELD)
                .and_then(Value::as_i64)
                .map_or(true, |ttl| ttl >= now_epoch_seconds)
        });
        Ok((before - tables.items.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TtlPolicy;
    use chrono::Utc;
    use serde_json::json;

    fn record(key: &str, item: Value) -> Record {
        Record::new(
            "ml_models",
            RecordKey::composite(key, "v1"),
            item,
            TtlPolicy::ML_MODELS,
            Utc::now(),
        )
    }

    fn update(to: ProcessingStatus) -> StatusUpdate {
        StatusUpdate {
            transition: ProcessingStatus::Processing.transition(to).unwrap(),
            result: Some(json!({"score": 0.9})),
            updated_at: "2024-01-01T00:00:00Z".to_owned(),
        }
    }

    #[tokio::test]
    async fn put_is_last_write_wins() {
        let store = MemoryStore::new();
        store
            .put(record("m1", json!({"payload": {"a": 1}, "keep": true})))
            .await
            .unwrap();
        store
            .put(record("m1", json!({"payload": {"b": 2}})))
            .await
            .unwrap();

        let item = store
            .get("ml_models", &RecordKey::composite("m1", "v1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item["payload"], json!({"b": 2}));
        assert!(item.get("keep").is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_requires_source_status() {
        let store = MemoryStore::new();
        let key = RecordKey::composite("m1", "v1");
        store
            .put(record("m1", json!({"status": "processing", "inputData": {"x": 1}})))
            .await
            .unwrap();

        store
            .update_status("ml_models", &key, update(ProcessingStatus::Completed))
            .await
            .unwrap();

        let item = store.get("ml_models", &key).await.unwrap().unwrap();
        assert_eq!(item["status"], "completed");
        assert_eq!(item["result"], json!({"score": 0.9}));
        assert_eq!(item["inputData"], json!({"x": 1}));
        assert_eq!(item["lastUpdate"], "2024-01-01T00:00:00Z");

        let err = store
            .update_status("ml_models", &key, update(ProcessingStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));
        assert_eq!(
            store.status_history("ml_models", &key),
            vec![ProcessingStatus::Processing, ProcessingStatus::Completed]
        );
    }

    #[tokio::test]
    async fn update_of_missing_record_fails() {
        let store = MemoryStore::new();
        let err = store
            .update_status(
                "ml_models",
                &RecordKey::new("nope"),
                update(ProcessingStatus::Failed),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));
        assert_eq!(store.call_count(), 1);
    }

    #[tokio::test]
    async fn expire_removes_only_stale_records() {
        let store = MemoryStore::new();
        let fresh = record("fresh", json!({}));
        let mut stale = record("stale", json!({}));
        stale.item[TTL_FIELD] = json!(10);
        store.put(fresh).await.unwrap();
        store.put(stale).await.unwrap();

        let removed = store.expire(Utc::now().timestamp()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }
}
