//! Keyed, TTL-governed persistence.
//!
//! One logical table per event class, each with its own key shape. Writes are unconditional
//! upserts (last write wins); status updates are conditional on the current status and touch
//! nothing but `status`, `lastUpdate` and `result`. No retries happen at this layer.
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::StoreError;
use crate::status::StatusTransition;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Field holding the expiry instant on every stored item.
pub const TTL_FIELD: &str = "ttlEpochSeconds";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub partition: String,
    pub sort: Option<String>,
}

impl RecordKey {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: None,
        }
    }

    pub fn composite(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: Some(sort.into()),
        }
    }

    pub fn sort_or_empty(&self) -> &str {
        self.sort.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sort {
            Some(sort) => write!(f, "{}#{}", self.partition, sort),
            None => f.write_str(&self.partition),
        }
    }
}

/// Retention window of a logical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub retention_days: i64,
}

impl TtlPolicy {
    pub const GENERIC_EVENTS: TtlPolicy = TtlPolicy::days(30);
    pub const USER_EVENTS: TtlPolicy = TtlPolicy::days(365);
    pub const ANALYTICS: TtlPolicy = TtlPolicy::days(90);
    pub const ML_MODELS: TtlPolicy = TtlPolicy::days(365);
    pub const FEATURES: TtlPolicy = TtlPolicy::days(365);
    pub const BATCH_JOBS: TtlPolicy = TtlPolicy::days(30);

    pub const fn days(retention_days: i64) -> Self {
        Self { retention_days }
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> i64 {
        (now + Duration::days(self.retention_days)).timestamp()
    }
}

/// An item ready to be written. The item is a JSON object already carrying `ttlEpochSeconds`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub table: String,
    pub key: RecordKey,
    pub item: Value,
    pub ttl_epoch_seconds: i64,
}

impl Record {
    pub fn new(
        table: impl Into<String>,
        key: RecordKey,
        mut item: Value,
        ttl: TtlPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let ttl_epoch_seconds = ttl.expires_at(now);
        if let Some(object) = item.as_object_mut() {
            object.insert(TTL_FIELD.to_owned(), Value::from(ttl_epoch_seconds));
        }
        Self {
            table: table.into(),
            key,
            item,
            ttl_epoch_seconds,
        }
    }
}

/// The only mutation allowed on an existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub transition: StatusTransition,
    pub result: Option<Value>,
    pub updated_at: String,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Unconditional upsert.
    async fn put(&self, record: Record) -> Result<(), StoreError>;

    /// Apply a status transition. Fails with `StoreError::ConditionFailed` when the stored
    /// status is not the transition's source status, or the record does not exist.
    async fn update_status(
        &self,
        table: &str,
        key: &RecordKey,
        update: StatusUpdate,
    ) -> Result<(), StoreError>;

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, StoreError>;

    /// Remove every record whose TTL is before `now_epoch_seconds`. Returns the number removed.
    async fn expire(&self, now_epoch_seconds: i64) -> Result<u64, StoreError>;
}
