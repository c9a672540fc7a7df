use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::instrument;

use crate::error::StoreError;
use crate::store::{DurableStore, Record, RecordKey, StatusUpdate};

/// `DurableStore` on a single PostgreSQL table keyed by (table_name, partition_key, sort_key).
/// See `migrations/` for the schema.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::Connection(error.to_string()))?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |error| StoreError::Query {
        command,
        message: error.to_string(),
    }
}

#[async_trait]
impl DurableStore for PgStore {
    #[instrument(skip_all, fields(table = %record.table, key = %record.key))]
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        let query = r#"
INSERT INTO records
    (table_name, partition_key, sort_key, item, ttl_epoch_seconds, updated_at)
VALUES
    ($1, $2, $3, $4, $5, NOW())
ON CONFLICT (table_name, partition_key, sort_key) DO UPDATE SET
    item = EXCLUDED.item,
    ttl_epoch_seconds = EXCLUDED.ttl_epoch_seconds,
    updated_at = NOW()
        "#;

        sqlx::query(query)
            .bind(&record.table)
            .bind(&record.key.partition)
            .bind(record.key.sort_or_empty())
            .bind(Json(&record.item))
            .bind(record.ttl_epoch_seconds)
            .execute(&self.pool)
            .await
            .map_err(query_error("INSERT"))?;

        Ok(())
    }

    #[instrument(skip_all, fields(table = table, key = %key))]
    async fn update_status(
        &self,
        table: &str,
        key: &RecordKey,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let query = r#"
UPDATE records
SET
    item = item
        || jsonb_build_object('status', $4::text, 'lastUpdate', $5::text)
        || CASE
            WHEN $6::jsonb IS NULL THEN '{}'::jsonb
            ELSE jsonb_build_object('result', $6::jsonb)
        END,
    updated_at = NOW()
WHERE
    table_name = $1
    AND partition_key = $2
    AND sort_key = $3
    AND item->>'status' = $7
        "#;

        let result = sqlx::query(query)
            .bind(table)
            .bind(&key.partition)
            .bind(key.sort_or_empty())
            .bind(update.transition.target().as_str())
            .bind(&update.updated_at)
            .bind(update.result.map(Json))
            .bind(update.transition.source().as_str())
            .execute(&self.pool)
            .await
            .map_err(query_error("UPDATE"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed {
                table: table.to_owned(),
                key: key.to_string(),
                expected: update.transition.source(),
            });
        }

        Ok(())
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, StoreError> {
        let query = r#"
SELECT item FROM records
WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
        "#;

        let row: Option<(Json<Value>,)> = sqlx::query_as(query)
            .bind(table)
            .bind(&key.partition)
            .bind(key.sort_or_empty())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;

        Ok(row.map(|(item,)| item.0))
    }

    async fn expire(&self, now_epoch_seconds: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE ttl_epoch_seconds < $1")
            .bind(now_epoch_seconds)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE"))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ProcessingStatus;
    use crate::store::TtlPolicy;
    use chrono::Utc;
    use serde_json::json;

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn round_trips_records_and_statuses(db: PgPool) {
        let store = PgStore::new_from_pool(db);
        let key = RecordKey::composite("model-1", "v1");
        let record = Record::new(
            "ml_models",
            key.clone(),
            json!({"modelId": "model-1", "status": "processing"}),
            TtlPolicy::ML_MODELS,
            Utc::now(),
        );
        store.put(record).await.expect("failed to put record");

        store
            .update_status(
                "ml_models",
                &key,
                StatusUpdate {
                    transition: ProcessingStatus::Processing
                        .transition(ProcessingStatus::Completed)
                        .unwrap(),
                    result: Some(json!({"label": "cat"})),
                    updated_at: "2024-01-01T00:00:00Z".to_owned(),
                },
            )
            .await
            .expect("failed to update status");

        let item = store.get("ml_models", &key).await.unwrap().unwrap();
        assert_eq!(item["status"], "completed");
        assert_eq!(item["result"], json!({"label": "cat"}));

        let err = store
            .update_status(
                "ml_models",
                &key,
                StatusUpdate {
                    transition: ProcessingStatus::Processing
                        .transition(ProcessingStatus::Failed)
                        .unwrap(),
                    result: None,
                    updated_at: "2024-01-01T00:00:01Z".to_owned(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));
    }
}
