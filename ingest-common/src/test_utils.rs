//! Test doubles for the pipeline's outbound ports.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::batch::{BatchEngine, StoreItemHandler};
use crate::enrich::Enricher;
use crate::envelope::{InferenceBody, ModelType};
use crate::error::{BackendError, DispatchError, NotificationError, StoreError};
use crate::model_router::{ModelBackend, ModelRouter};
use crate::notify::{Notification, Notifier};
use crate::pipeline::{Dependencies, Pipelines};
use crate::queue::{MemoryQueue, MessageQueue, QueueMessage};
use crate::sinks::{BusMessage, RoutingBus};
use crate::store::{DurableStore, MemoryStore, Record, RecordKey, StatusUpdate};
use crate::time::FixedTime;

/// Keeps every published message. `failing()` rejects all of them.
#[derive(Clone, Default)]
pub struct RecordingBus {
    messages: Arc<Mutex<Vec<BusMessage>>>,
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<BusMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutingBus for RecordingBus {
    async fn publish(&self, message: BusMessage) -> Result<(), DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DispatchError::Bus("bus unavailable".to_owned()));
        }
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

pub struct FailingQueue {}

#[async_trait]
impl MessageQueue for FailingQueue {
    async fn enqueue(&self, _message: QueueMessage) -> Result<(), DispatchError> {
        Err(DispatchError::Queue("queue unavailable".to_owned()))
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .map(|n| n.subject)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.notifications
            .lock()
            .unwrap()
            .push(notification.clone());
        Ok(())
    }
}

pub struct FailingNotifier {}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn publish(&self, _notification: &Notification) -> Result<(), NotificationError> {
        Err(NotificationError::Status(500))
    }
}

/// Answers every request with the same response.
pub struct StaticBackend {
    response: Result<Value, BackendError>,
    calls: AtomicUsize,
}

impl StaticBackend {
    pub fn ok(output: Value) -> Self {
        Self {
            response: Ok(output),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(model_type: ModelType) -> Self {
        Self {
            response: Err(BackendError::Status {
                model_type,
                status: 503,
                body: "model unavailable".to_owned(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for StaticBackend {
    async fn invoke(&self, _request: &InferenceBody) -> Result<Value, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }
}

/// Never answers. Only a timeout gets the caller out.
pub struct HangingBackend {}

#[async_trait]
impl ModelBackend for HangingBackend {
    async fn invoke(&self, _request: &InferenceBody) -> Result<Value, BackendError> {
        std::future::pending().await
    }
}

/// A `MemoryStore` that rejects writes to one table, or every status update.
pub struct FaultyStore {
    inner: MemoryStore,
    fail_puts_to: Option<&'static str>,
    fail_status_updates: bool,
}

impl FaultyStore {
    pub fn failing_puts_to(inner: MemoryStore, table: &'static str) -> Self {
        Self {
            inner,
            fail_puts_to: Some(table),
            fail_status_updates: false,
        }
    }

    pub fn failing_status_updates(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_puts_to: None,
            fail_status_updates: true,
        }
    }
}

#[async_trait]
impl DurableStore for FaultyStore {
    async fn put(&self, record: Record) -> Result<(), StoreError> {
        if self.fail_puts_to == Some(record.table.as_str()) {
            return Err(StoreError::Connection(format!("{} unavailable", record.table)));
        }
        self.inner.put(record).await
    }

    async fn update_status(
        &self,
        table: &str,
        key: &RecordKey,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        if self.fail_status_updates {
            return Err(StoreError::Connection(format!("{table} unavailable")));
        }
        self.inner.update_status(table, key, update).await
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, StoreError> {
        self.inner.get(table, key).await
    }

    async fn expire(&self, now_epoch_seconds: i64) -> Result<u64, StoreError> {
        self.inner.expire(now_epoch_seconds).await
    }
}

/// In-memory wiring of every outbound port, with handles kept for assertions.
#[derive(Clone)]
pub struct TestContext {
    pub store: MemoryStore,
    pub bus: RecordingBus,
    pub queue: MemoryQueue,
    pub notifier: RecordingNotifier,
    pub time: FixedTime,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            bus: RecordingBus::new(),
            queue: MemoryQueue::default(),
            notifier: RecordingNotifier::new(),
            time: FixedTime {
                time: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            },
        }
    }

    pub fn dependencies(&self) -> Dependencies {
        Dependencies {
            store: Arc::new(self.store.clone()),
            bus: Arc::new(self.bus.clone()),
            queue: Arc::new(self.queue.clone()),
            notifier: Arc::new(self.notifier.clone()),
            time: Arc::new(self.time.clone()),
            io_timeout: time::Duration::from_secs(5),
        }
    }

    pub fn enricher(&self) -> Enricher {
        Enricher::new("test", "eu-west-1")
    }

    pub fn pipelines(&self, router: ModelRouter) -> Pipelines {
        self.pipelines_with(self.dependencies(), router)
    }

    /// Like `pipelines`, over dependencies the caller may have swapped out.
    pub fn pipelines_with(&self, deps: Dependencies, router: ModelRouter) -> Pipelines {
        let handler = StoreItemHandler::new(deps.store.clone(), deps.time.clone(), deps.io_timeout);
        let engine = BatchEngine::new(Arc::new(handler), deps.time.clone());
        Pipelines::new(deps, self.enricher(), router, engine)
    }
}
