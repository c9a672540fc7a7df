//! Removes records whose TTL has passed. Postgres has no native TTL, so the worker sweeps.
use std::sync::Arc;
use std::time;

use tracing::{error, info};

use ingest_common::store::DurableStore;
use ingest_common::time::TimeSource;

use crate::error::WorkerError;

pub struct ExpirySweeper {
    store: Arc<dyn DurableStore>,
    time: Arc<dyn TimeSource>,
    interval: time::Duration,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn DurableStore>,
        time: Arc<dyn TimeSource>,
        interval: time::Duration,
    ) -> Self {
        Self {
            store,
            time,
            interval,
        }
    }

    pub async fn sweep(&self) -> Result<u64, WorkerError> {
        let now = self.time.now().timestamp();
        let removed = self.store.expire(now).await?;

        metrics::counter!("ingest_expired_records_total").increment(removed);
        if removed > 0 {
            info!(removed, "expired records");
        }
        Ok(removed)
    }

    /// Sweep on every tick. A failed sweep is logged and retried on the next one.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;
            if let Err(e) = self.sweep().await {
                error!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use ingest_common::store::{MemoryStore, Record, RecordKey, TtlPolicy};
    use ingest_common::time::FixedTime;
    use serde_json::json;

    #[tokio::test]
    async fn removes_only_expired_records() {
        let store = MemoryStore::new();
        let written = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (key, ttl) in [
            ("short", TtlPolicy::GENERIC_EVENTS),
            ("long", TtlPolicy::USER_EVENTS),
        ] {
            let record = Record::new("events", RecordKey::new(key), json!({}), ttl, written);
            store.put(record).await.unwrap();
        }

        let sweeper = ExpirySweeper::new(
            Arc::new(store.clone()),
            Arc::new(FixedTime {
                time: written + Duration::days(31),
            }),
            time::Duration::from_secs(60),
        );

        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(sweeper.sweep().await.unwrap(), 0);
    }
}
